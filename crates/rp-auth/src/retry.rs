use std::future::Future;
use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::codec::SessionCodec;
use crate::errors::{AuthError, ProviderError, RefreshError};
use crate::refresher::TokenRefresher;

/// Error codes identity providers and data APIs use for a dead access token
pub const EXPIRED_TOKEN_CODES: &[&str] = &[
    "token_expired",
    "session_expired",
    "session_not_found",
    "bad_jwt",
    "invalid_jwt",
    "PGRST301",
    "PGRST303",
];

/// Message fragments used when the transport supplies no code
const EXPIRED_TOKEN_PHRASES: &[&str] = &[
    "token expired",
    "token is expired",
    "token has expired",
    "jwt expired",
    "invalid jwt",
];

pub fn is_expired_token_code(code: &str) -> bool {
    EXPIRED_TOKEN_CODES
        .iter()
        .any(|known| known.eq_ignore_ascii_case(code))
}

pub fn message_indicates_expiry(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    EXPIRED_TOKEN_PHRASES
        .iter()
        .any(|phrase| message.contains(phrase))
}

/// Errors that can tell whether they were caused by an expired access token
pub trait ExpiryAware: std::fmt::Display {
    /// Structured verdict, when the error carries a code or status
    fn token_expired(&self) -> Option<bool> {
        None
    }

    /// Structured verdict first, message text only as a last resort
    fn is_token_expired(&self) -> bool {
        self.token_expired()
            .unwrap_or_else(|| message_indicates_expiry(&self.to_string()))
    }
}

/// Failure of an authenticated call against the application backend
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access token expired")]
    TokenExpired,

    #[error("HTTP error {status}: {message}")]
    Http {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// The backend could not be reached or is failing, as opposed to refusing the request
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Network(e) => !e.is_status() && !e.is_decode(),
            Self::Http { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

impl ExpiryAware for ApiError {
    fn token_expired(&self) -> Option<bool> {
        match self {
            Self::TokenExpired => Some(true),
            Self::Http { code: Some(code), .. } => Some(is_expired_token_code(code)),
            Self::Http { status, .. } if *status == StatusCode::UNAUTHORIZED => Some(true),
            Self::Http { .. } => None,
            Self::Network(_) => Some(false),
            Self::Other(_) => None,
        }
    }
}

impl ExpiryAware for ProviderError {
    fn token_expired(&self) -> Option<bool> {
        match self {
            Self::Rejected {
                code: Some(code), ..
            } => Some(is_expired_token_code(code)),
            Self::Rejected { status, .. } if *status == StatusCode::UNAUTHORIZED => Some(true),
            Self::Rejected { .. } => None,
            _ => Some(false),
        }
    }
}

/// Outcome of a wrapped operation that did not succeed
#[derive(Error, Debug)]
pub enum RequestError<E> {
    /// The operation itself failed; show its error
    #[error(transparent)]
    Operation(E),

    /// The access token expired and could not be renewed; prompt for sign-in
    #[error("Session expired and could not be refreshed - please sign in again")]
    SessionExpired(#[source] Option<RefreshError>),
}

impl<E> RequestError<E> {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::SessionExpired(_) => None,
        }
    }
}

impl<E: Into<AuthError>> From<RequestError<E>> for AuthError {
    fn from(err: RequestError<E>) -> Self {
        match err {
            RequestError::Operation(e) => e.into(),
            RequestError::SessionExpired(_) => AuthError::OperationExpired,
        }
    }
}

/// Runs authenticated operations, renewing the session once when the token
/// expired mid-flight.
///
/// At most one refresh and one replay per call; other failures pass through.
#[derive(Clone)]
pub struct RetryingRequestExecutor {
    codec: SessionCodec,
    refresher: Arc<TokenRefresher>,
}

impl RetryingRequestExecutor {
    pub fn new(codec: SessionCodec, refresher: Arc<TokenRefresher>) -> Self {
        Self { codec, refresher }
    }

    #[instrument(skip_all)]
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, RequestError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ExpiryAware,
    {
        let first = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !first.is_token_expired() {
            return Err(RequestError::Operation(first));
        }

        info!("Operation hit an expired token, refreshing the session once");

        let Some(session) = self.codec.load_session().await else {
            warn!("No persisted session to refresh");
            return Err(RequestError::SessionExpired(None));
        };

        if let Err(e) = self.refresher.refresh(&session).await {
            warn!("Refresh after expired token failed: {}", e);
            return Err(RequestError::SessionExpired(Some(e)));
        }

        match op().await {
            Ok(value) => Ok(value),
            Err(e) if e.is_token_expired() => {
                warn!("Replayed operation still sees an expired token: {}", e);
                Err(RequestError::SessionExpired(None))
            }
            Err(e) => Err(RequestError::Operation(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::clock::ManualClock;
    use crate::refresher::persist_session;
    use crate::store::MemoryCredentialStore;
    use crate::testing::{FakeProvider, RefreshBehavior, session_expiring_at};

    const NOW: i64 = 1_750_000_000_000;

    struct Fixture {
        provider: Arc<FakeProvider>,
        executor: RetryingRequestExecutor,
        calls: AtomicUsize,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryCredentialStore::new());
        let provider = Arc::new(FakeProvider::new("u1", "a@b.com"));
        persist_session(store.as_ref(), &session_expiring_at("u1", NOW + 3_600_000))
            .await
            .unwrap();

        let refresher = Arc::new(TokenRefresher::new(
            store.clone(),
            provider.clone(),
            Arc::new(ManualClock::new(NOW)),
            Duration::from_secs(600),
        ));
        let codec = SessionCodec::new(store, provider.clone());

        Fixture {
            provider,
            executor: RetryingRequestExecutor::new(codec, refresher),
            calls: AtomicUsize::new(0),
        }
    }

    fn conflict() -> ApiError {
        ApiError::Http {
            status: StatusCode::CONFLICT,
            code: Some("match_full".to_string()),
            message: "Match already has four players".to_string(),
        }
    }

    #[tokio::test]
    async fn test_expired_once_then_success() {
        let fx = fixture().await;

        let result = fx
            .executor
            .execute(|| {
                let attempt = fx.calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(ApiError::TokenExpired)
                    } else {
                        Ok("joined")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "joined");
        assert_eq!(fx.provider.refresh_count(), 1);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_expiry_error_is_returned_unchanged() {
        let fx = fixture().await;

        let result: Result<(), _> = fx
            .executor
            .execute(|| {
                fx.calls.fetch_add(1, Ordering::SeqCst);
                async { Err(conflict()) }
            })
            .await;

        match result.unwrap_err().into_operation() {
            Some(ApiError::Http { status, code, .. }) => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(code.as_deref(), Some("match_full"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fx.provider.refresh_count(), 0);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_is_session_expired() {
        let fx = fixture().await;
        fx.provider.set_refresh(RefreshBehavior::Reject {
            status: StatusCode::BAD_REQUEST,
            message: "Invalid Refresh Token".to_string(),
        });

        let result: Result<(), _> = fx
            .executor
            .execute(|| {
                fx.calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::TokenExpired) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_session_expired());
        assert!(matches!(
            err,
            RequestError::SessionExpired(Some(RefreshError::ProviderRejected { .. }))
        ));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replay_is_attempted_only_once() {
        let fx = fixture().await;

        let result: Result<(), _> = fx
            .executor
            .execute(|| {
                fx.calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ApiError::TokenExpired) }
            })
            .await;

        assert!(result.unwrap_err().is_session_expired());
        assert_eq!(fx.provider.refresh_count(), 1);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_replay_failure_is_returned_as_operation_error() {
        let fx = fixture().await;

        let result: Result<(), _> = fx
            .executor
            .execute(|| {
                let attempt = fx.calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(ApiError::TokenExpired)
                    } else {
                        Err(conflict())
                    }
                }
            })
            .await;

        assert!(matches!(
            result.unwrap_err(),
            RequestError::Operation(ApiError::Http { .. })
        ));
        assert_eq!(fx.provider.refresh_count(), 1);
    }

    #[test]
    fn test_expiry_classification_prefers_codes() {
        // a code that is not an expiry code wins over an alarming message
        let coded = ApiError::Http {
            status: StatusCode::BAD_REQUEST,
            code: Some("validation_failed".to_string()),
            message: "token expired date must be in the future".to_string(),
        };
        assert!(!coded.is_token_expired());

        let uncoded = ApiError::Http {
            status: StatusCode::BAD_REQUEST,
            code: None,
            message: "JWT expired".to_string(),
        };
        assert!(uncoded.is_token_expired());

        let unauthorized = ApiError::Http {
            status: StatusCode::UNAUTHORIZED,
            code: None,
            message: "nope".to_string(),
        };
        assert!(unauthorized.is_token_expired());

        assert!(ApiError::Other("Token is expired".to_string()).is_token_expired());
        assert!(!ApiError::Other("court unavailable".to_string()).is_token_expired());
        assert!(is_expired_token_code("pgrst301"));
    }
}
