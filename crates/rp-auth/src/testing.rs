//! Shared fixtures for unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::StatusCode;
use serde_json::{Map, Value, json};

use crate::client::IdentityProvider;
use crate::errors::ProviderError;
use crate::models::{SignUpResponse, TokenResponse};
use crate::session::{Session, StoredTokens, User};

/// Route `tracing` output through the test harness
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Unsigned JWT carrying `claims`
pub(crate) fn jwt(claims: &Value) -> String {
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

pub(crate) fn access_token_for(user_id: &str, email: &str) -> String {
    jwt(&json!({"sub": user_id, "email": email, "email_verified": true, "iat": 1_700_000_000}))
}

pub(crate) fn session_expiring_at(user_id: &str, expires_at: i64) -> Session {
    Session {
        access_token: access_token_for(user_id, "player@club.test"),
        refresh_token: "rt-0".to_string(),
        expires_at,
        token_type: "bearer".to_string(),
        user: User::new(user_id, "player@club.test"),
    }
}

pub(crate) fn tokens_json(session: &Session) -> Vec<u8> {
    serde_json::to_vec::<StoredTokens>(&session.tokens()).unwrap()
}

#[derive(Debug, Clone)]
pub(crate) enum RefreshBehavior {
    Grant { expires_in: u64 },
    /// New access token, refresh token omitted from the response
    GrantWithoutRotation,
    Reject { status: StatusCode, message: String },
    Timeout,
    OpaqueToken,
}

/// Scriptable identity provider that counts calls
#[derive(Debug)]
pub(crate) struct FakeProvider {
    pub user_id: String,
    pub email: String,
    pub refresh_calls: AtomicUsize,
    pub fetch_user_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
    refresh: Mutex<RefreshBehavior>,
    refresh_delay: Mutex<Option<Duration>>,
    fetch_user_ok: Mutex<bool>,
    sign_in_expires_in: Mutex<u64>,
    sign_up_session: Mutex<bool>,
}

impl FakeProvider {
    pub fn new(user_id: &str, email: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: email.to_string(),
            refresh_calls: AtomicUsize::new(0),
            fetch_user_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            refresh: Mutex::new(RefreshBehavior::Grant { expires_in: 3600 }),
            refresh_delay: Mutex::new(None),
            fetch_user_ok: Mutex::new(true),
            sign_in_expires_in: Mutex::new(3600),
            sign_up_session: Mutex::new(false),
        }
    }

    pub fn set_refresh(&self, behavior: RefreshBehavior) {
        *self.refresh.lock().unwrap() = behavior;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_fetch_user_ok(&self, ok: bool) {
        *self.fetch_user_ok.lock().unwrap() = ok;
    }

    pub fn set_sign_in_expires_in(&self, secs: u64) {
        *self.sign_in_expires_in.lock().unwrap() = secs;
    }

    pub fn set_sign_up_returns_session(&self, session: bool) {
        *self.sign_up_session.lock().unwrap() = session;
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_user_count(&self) -> usize {
        self.fetch_user_calls.load(Ordering::SeqCst)
    }

    fn grant(&self, n: usize, expires_in: u64) -> TokenResponse {
        TokenResponse {
            access_token: access_token_for(&self.user_id, &self.email),
            refresh_token: Some(format!("rt-{n}")),
            expires_in: Some(expires_in),
            expires_at: None,
            token_type: "bearer".to_string(),
            user: None,
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for FakeProvider {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.refresh_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let behavior = self.refresh.lock().unwrap().clone();
        match behavior {
            RefreshBehavior::Grant { expires_in } => Ok(self.grant(n, expires_in)),
            RefreshBehavior::GrantWithoutRotation => {
                let mut grant = self.grant(n, 3600);
                grant.access_token = jwt(&json!({
                    "sub": self.user_id,
                    "email": self.email,
                    "jti": format!("at-{n}"),
                }));
                grant.refresh_token = None;
                Ok(grant)
            }
            RefreshBehavior::Reject { status, message } => Err(ProviderError::Rejected {
                status,
                code: None,
                message,
            }),
            RefreshBehavior::Timeout => Err(ProviderError::Timeout),
            RefreshBehavior::OpaqueToken => {
                let mut grant = self.grant(n, 3600);
                grant.access_token = "opaque-token".to_string();
                Ok(grant)
            }
        }
    }

    async fn fetch_user(&self, _access_token: &str) -> Result<User, ProviderError> {
        self.fetch_user_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fetch_user_ok.lock().unwrap() {
            Ok(User::new(&self.user_id, &self.email))
        } else {
            Err(ProviderError::Timeout)
        }
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, ProviderError> {
        if email != self.email || password != "correct-horse" {
            return Err(ProviderError::Rejected {
                status: StatusCode::BAD_REQUEST,
                code: Some("invalid_credentials".to_string()),
                message: "Invalid login credentials".to_string(),
            });
        }
        let expires_in = *self.sign_in_expires_in.lock().unwrap();
        let mut grant = self.grant(0, expires_in);
        grant.user = Some(User::new(&self.user_id, &self.email));
        Ok(grant)
    }

    async fn sign_up(
        &self,
        email: &str,
        _password: &str,
        metadata: &Map<String, Value>,
    ) -> Result<SignUpResponse, ProviderError> {
        let mut user = User::new(&self.user_id, email);
        user.user_metadata = metadata.clone();

        if *self.sign_up_session.lock().unwrap() {
            let mut grant = self.grant(0, 3600);
            grant.user = Some(user);
            Ok(SignUpResponse::Session(grant))
        } else {
            Ok(SignUpResponse::User(user))
        }
    }

    async fn sign_out(&self, _access_token: &str) -> Result<(), ProviderError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
