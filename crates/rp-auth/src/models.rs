use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::{MAX_EXPIRES_AT_MILLIS, User};

/// Token grant response (password and refresh_token grants)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, relative to the response
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Absolute expiry in epoch seconds, when the provider sends one
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub user: Option<User>,
}

/// Assumed access token lifetime when the provider sends neither expiry field
pub const FALLBACK_EXPIRES_IN_SECS: u64 = 3600;

impl TokenResponse {
    /// Absolute expiry in epoch milliseconds, capped at [`MAX_EXPIRES_AT_MILLIS`]
    pub fn expires_at_millis(&self, now_millis: i64) -> i64 {
        let millis = match (self.expires_at, self.expires_in) {
            (Some(at_secs), _) => at_secs.saturating_mul(1000),
            (None, Some(secs)) => now_millis.saturating_add(secs_to_millis(secs)),
            (None, None) => now_millis.saturating_add(secs_to_millis(FALLBACK_EXPIRES_IN_SECS)),
        };
        millis.min(MAX_EXPIRES_AT_MILLIS)
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000)
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// `POST /token?grant_type=refresh_token` body
#[derive(Serialize)]
pub struct RefreshTokenRequest<'a> {
    pub refresh_token: &'a str,
}

/// `POST /token?grant_type=password` body
#[derive(Serialize)]
pub struct PasswordGrantRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// `POST /signup` body
#[derive(Serialize)]
pub struct SignUpRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
    pub data: &'a Map<String, Value>,
}

/// Sign-up returns a full session when no confirmation is required, a bare user otherwise
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SignUpResponse {
    Session(TokenResponse),
    User(User),
}

/// Error body returned by the identity provider on non-2xx responses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    /// Some providers send the HTTP status here as a number
    #[serde(default)]
    pub code: Option<Value>,
}

impl ProviderErrorBody {
    pub fn message(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.msg.clone())
            .or_else(|| self.error_description.clone())
            .or_else(|| self.error.clone())
    }

    pub fn code(&self) -> Option<String> {
        self.error_code.clone().or_else(|| match &self.code {
            Some(Value::String(code)) => Some(code.clone()),
            _ => None,
        })
    }
}
