use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity-provider user record. Identity is keyed by `id` only; `email` can change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Opaque identity-provider subject
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub app_metadata: Map<String, Value>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            email_confirmed_at: None,
            app_metadata: Map::new(),
            user_metadata: Map::new(),
        }
    }

    pub fn is_email_confirmed(&self) -> bool {
        self.email_confirmed_at.is_some()
    }
}

/// Token half of a session, persisted under `session.tokens`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    /// Absolute expiry in epoch milliseconds
    pub expires_at: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Latest expiry a token record may carry: 9999-12-31T23:59:59.999Z
pub const MAX_EXPIRES_AT_MILLIS: i64 = 253_402_300_799_999;

impl StoredTokens {
    /// Whether `expires_at` is a positive epoch time before year 10000
    pub fn has_plausible_expiry(&self) -> bool {
        (1..=MAX_EXPIRES_AT_MILLIS).contains(&self.expires_at)
    }
}

/// Access/refresh token pair plus expiry and the user it belongs to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry in epoch milliseconds, never a relative duration
    pub expires_at: i64,
    pub token_type: String,
    pub user: User,
}

impl Session {
    pub fn from_parts(tokens: StoredTokens, user: User) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            token_type: tokens.token_type,
            user,
        }
    }

    pub fn tokens(&self) -> StoredTokens {
        StoredTokens {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
            token_type: self.token_type.clone(),
        }
    }

    /// Milliseconds until the access token expires (negative once expired)
    pub fn millis_until_expiry(&self, now_millis: i64) -> i64 {
        self.expires_at.saturating_sub(now_millis)
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.millis_until_expiry(now_millis) <= 0
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

/// Registration data kept under `session.temp_user` until the email is verified
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingRegistration {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
    pub created_at_millis: i64,
}

/// Outcome of a sign-up request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The provider issued a session immediately
    SignedIn(User),
    /// The provider wants the email verified first
    PendingVerification(PendingRegistration),
}

/// What the store currently says about the signed-in user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserState {
    Authenticated(User),
    /// No reliable local identity, but not signed out either: profile-level
    /// lookups are authoritative.
    Degraded,
    SignedOut,
}

impl UserState {
    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn into_user(self) -> Option<User> {
        match self {
            Self::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_signed_out(&self) -> bool {
        matches!(self, Self::SignedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_decodes_with_only_id() {
        let user: User = serde_json::from_str(r#"{"id":"u1"}"#).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.email, "");
        assert!(!user.is_email_confirmed());
    }

    #[test]
    fn test_session_splits_into_tokens_and_back() {
        let session = Session {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: 1_700_000_000_000,
            token_type: "bearer".to_string(),
            user: User::new("u1", "a@b.com"),
        };

        let rebuilt = Session::from_parts(session.tokens(), session.user.clone());
        assert_eq!(rebuilt, session);
        assert_eq!(session.millis_until_expiry(1_699_999_999_000), 1_000);
        assert!(session.is_expired(1_700_000_000_000));
    }

    #[test]
    fn test_extreme_expiry_saturates_instead_of_overflowing() {
        let mut session = Session {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: i64::MIN,
            token_type: "bearer".to_string(),
            user: User::new("u1", "a@b.com"),
        };
        assert_eq!(session.millis_until_expiry(1_750_000_000_000), i64::MIN);
        assert!(session.is_expired(1_750_000_000_000));

        session.expires_at = i64::MAX;
        assert_eq!(session.millis_until_expiry(-1), i64::MAX);
        assert!(!session.is_expired(-1));
    }
}
