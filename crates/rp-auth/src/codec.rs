use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::claims;
use crate::client::IdentityProvider;
use crate::config::keys;
use crate::errors::StoreError;
use crate::session::{Session, StoredTokens, User, UserState};
use crate::store::{CredentialStore, put_json};

/// Shapes found under `session.user`, tried in declaration order
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredUserRecord {
    /// The expected bare user
    Bare(User),
    /// The provider's whole response envelope was persisted
    Envelope { data: UserEnvelope },
    /// An envelope without a user
    EmptyEnvelope { data: EmptyEnvelope },
    Unknown(Value),
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: User,
}

#[derive(Debug, Deserialize)]
struct EmptyEnvelope {
    // only `null` (or absence) deserializes into unit
    #[serde(default)]
    #[allow(dead_code)]
    user: (),
}

/// Decodes persisted session records and repairs the ones it cannot use.
///
/// Never fails: every path resolves to a usable value, the degraded marker or
/// nothing, and records it could not parse are removed from the store.
#[derive(Clone)]
pub struct SessionCodec {
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
}

impl SessionCodec {
    pub fn new(store: Arc<dyn CredentialStore>, provider: Arc<dyn IdentityProvider>) -> Self {
        Self { store, provider }
    }

    /// Decode `session.user`, recovering from known corruption shapes
    pub async fn decode_user(&self) -> UserState {
        let raw = match self.read(keys::SESSION_USER).await {
            RawRecord::Present(raw) => raw,
            RawRecord::Missing => return UserState::SignedOut,
            RawRecord::Corrupted => return self.recover_with_live_user().await,
        };

        let record = match serde_json::from_slice::<StoredUserRecord>(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Stored user record is not valid JSON ({}), discarding it", e);
                self.discard(keys::SESSION_USER).await;
                return self.recover_with_live_user().await;
            }
        };

        match record {
            StoredUserRecord::Bare(user) if !user.id.is_empty() => UserState::Authenticated(user),
            StoredUserRecord::Envelope { data } if !data.user.id.is_empty() => {
                info!("Unwrapping user record stored inside a response envelope");
                if let Err(e) = put_json(self.store.as_ref(), keys::SESSION_USER, &data.user).await
                {
                    warn!("Failed to rewrite unwrapped user record: {}", e);
                }
                UserState::Authenticated(data.user)
            }
            StoredUserRecord::EmptyEnvelope { .. } => {
                debug!("Stored user envelope has no user, asking the identity provider");
                match self.fetch_live_user().await {
                    Some(user) => UserState::Authenticated(user),
                    None => UserState::Degraded,
                }
            }
            other => {
                warn!("Unrecognized user record shape, discarding it: {:?}", other);
                self.discard(keys::SESSION_USER).await;
                UserState::SignedOut
            }
        }
    }

    /// Decode `session.tokens`, discarding it if it is unusable
    pub async fn decode_tokens(&self) -> Option<StoredTokens> {
        let raw = match self.read(keys::SESSION_TOKENS).await {
            RawRecord::Present(raw) => raw,
            RawRecord::Missing | RawRecord::Corrupted => return None,
        };

        match serde_json::from_slice::<StoredTokens>(&raw) {
            Ok(tokens) if tokens.access_token.is_empty() => {
                warn!("Stored tokens have an empty access token, discarding them");
                self.discard(keys::SESSION_TOKENS).await;
                None
            }
            Ok(tokens) if !tokens.has_plausible_expiry() => {
                warn!(
                    "Stored tokens expire at {}, which is not a valid time, discarding them",
                    tokens.expires_at
                );
                self.discard(keys::SESSION_TOKENS).await;
                None
            }
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!("Stored tokens are corrupted ({}), discarding them", e);
                self.discard(keys::SESSION_TOKENS).await;
                None
            }
        }
    }

    /// Assemble the persisted session without any network recovery.
    ///
    /// The user comes from the stored record when it decodes cleanly, otherwise
    /// from the access token claims.
    pub async fn load_session(&self) -> Option<Session> {
        let tokens = self.decode_tokens().await?;

        let stored_user = match self.read(keys::SESSION_USER).await {
            RawRecord::Present(raw) => peek_user(&raw),
            _ => None,
        };

        let user = match stored_user {
            Some(user) => user,
            None => match claims::user_from_access_token(&tokens.access_token, None) {
                Ok(user) => user,
                Err(e) => {
                    warn!("Session has no decodable user: {}", e);
                    return None;
                }
            },
        };

        Some(Session::from_parts(tokens, user))
    }

    /// One live fetch of the current user, persisted on success
    pub async fn fetch_live_user(&self) -> Option<User> {
        let tokens = self.decode_tokens().await?;

        match self.provider.fetch_user(&tokens.access_token).await {
            Ok(user) => {
                if let Err(e) = put_json(self.store.as_ref(), keys::SESSION_USER, &user).await {
                    warn!("Failed to persist recovered user: {}", e);
                }
                Some(user)
            }
            Err(e) => {
                warn!("Live user fetch failed: {}", e);
                None
            }
        }
    }

    async fn recover_with_live_user(&self) -> UserState {
        match self.fetch_live_user().await {
            Some(user) => UserState::Authenticated(user),
            None => UserState::SignedOut,
        }
    }

    async fn read(&self, key: &str) -> RawRecord {
        match self.store.get(key).await {
            Ok(Some(raw)) => RawRecord::Present(raw),
            Ok(None) => RawRecord::Missing,
            Err(StoreError::Corrupted) => {
                warn!("Record {} could not be decrypted, discarding it", key);
                self.discard(key).await;
                RawRecord::Corrupted
            }
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                RawRecord::Missing
            }
        }
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.store.remove(key).await {
            warn!("Failed to remove corrupted record {}: {}", key, e);
        }
    }
}

enum RawRecord {
    Present(Vec<u8>),
    Missing,
    Corrupted,
}

/// Side-effect free decode of the two usable user shapes
fn peek_user(raw: &[u8]) -> Option<User> {
    match serde_json::from_slice::<StoredUserRecord>(raw).ok()? {
        StoredUserRecord::Bare(user) if !user.id.is_empty() => Some(user),
        StoredUserRecord::Envelope { data } if !data.user.id.is_empty() => Some(data.user),
        _ => None,
    }
}
