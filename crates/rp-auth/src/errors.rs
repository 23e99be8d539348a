use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// Session manager error types
#[derive(Error, Debug)]
pub enum AuthError {
    /// Nothing usable is persisted. This is the normal signed-out state.
    #[error("No active session - sign in required")]
    NoSession,

    #[error("Persisted record '{key}' is corrupted: {reason}")]
    CorruptedRecord { key: String, reason: String },

    #[error("Session refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    /// Terminal: the caller should prompt the user to sign in again.
    #[error("Session expired and could not be refreshed - please sign in again")]
    OperationExpired,

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Identity provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Credential store error: {0}")]
    Storage(#[from] StoreError),

    #[error("Backend request failed: {0}")]
    Api(#[from] crate::retry::ApiError),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid configuration at {path}: {source}")]
    Config {
        path: PathBuf,
        source: anyhow::Error,
    },
}

impl AuthError {
    /// Maps a provider failure, folding transport problems into `NetworkUnavailable`.
    pub fn from_provider(err: ProviderError) -> Self {
        if err.is_transport() {
            Self::NetworkUnavailable(err.to_string())
        } else {
            Self::Provider(err)
        }
    }
}

/// Failures of the remote identity provider surface
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request to identity provider timed out")]
    Timeout,

    #[error("HTTP error {status}: {message}")]
    Rejected {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl ProviderError {
    /// True when the request never produced an HTTP response.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Network(e) => !e.is_status() && !e.is_decode(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::Network(e) => e.status(),
            _ => None,
        }
    }
}

/// Reasons a refresh token could not be exchanged for a new session
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Missing refresh token - cannot refresh session")]
    NoRefreshToken,

    #[error("Identity provider rejected the refresh ({status}): {message}")]
    ProviderRejected { status: StatusCode, message: String },

    #[error("Access token claims could not be decoded: {0}")]
    MalformedToken(String),

    #[error("Refresh request failed: {0}")]
    Transport(#[source] ProviderError),

    #[error("Refreshed session could not be persisted: {0}")]
    Storage(#[from] StoreError),
}

impl From<ProviderError> for RefreshError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Rejected {
                status, message, ..
            } => Self::ProviderRejected { status, message },
            ProviderError::InvalidResponse(message) => Self::ProviderRejected {
                status: StatusCode::OK,
                message,
            },
            other => Self::Transport(other),
        }
    }
}

/// Credential store error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out acquiring the store lock")]
    LockTimeout,

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Stored record could not be decrypted or is truncated")]
    Corrupted,

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Could not determine a storage directory for this platform")]
    StorageDirUnavailable,

    #[error("Failed to prepare storage at {path}: {source}")]
    Setup {
        path: PathBuf,
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_provider_error_maps_to_provider_rejected() {
        let err = ProviderError::Rejected {
            status: StatusCode::BAD_REQUEST,
            code: Some("refresh_token_not_found".to_string()),
            message: "Invalid Refresh Token".to_string(),
        };

        match RefreshError::from(err) {
            RefreshError::ProviderRejected { status, message } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(message, "Invalid Refresh Token");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_is_transport_and_maps_to_network_unavailable() {
        assert!(ProviderError::Timeout.is_transport());
        assert!(matches!(
            AuthError::from_provider(ProviderError::Timeout),
            AuthError::NetworkUnavailable(_)
        ));
        assert!(matches!(
            RefreshError::from(ProviderError::Timeout),
            RefreshError::Transport(ProviderError::Timeout)
        ));
    }
}
