use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::claims;
use crate::client::IdentityProvider;
use crate::clock::{Clock, duration_millis};
use crate::codec::SessionCodec;
use crate::config::keys;
use crate::errors::{RefreshError, StoreError};
use crate::session::Session;
use crate::store::CredentialStore;

/// Exchanges refresh tokens for new sessions.
///
/// This is the only place a session is minted from a refresh token. Concurrent
/// callers are serialized; a caller that waited behind another refresh gets the
/// session that refresh produced instead of spending the (rotated) token again.
pub struct TokenRefresher {
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    codec: SessionCodec,
    clock: Arc<dyn Clock>,
    refresh_margin: Duration,
    in_flight: Mutex<()>,
}

impl TokenRefresher {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            codec: SessionCodec::new(store.clone(), provider.clone()),
            store,
            provider,
            clock,
            refresh_margin,
            in_flight: Mutex::new(()),
        }
    }

    #[instrument(skip_all, fields(user_id = %session.user.id))]
    pub async fn refresh(&self, session: &Session) -> Result<Session, RefreshError> {
        if !session.has_refresh_token() {
            return Err(RefreshError::NoRefreshToken);
        }

        let _flight = self.in_flight.lock().await;

        if let Some(current) = self.codec.load_session().await
            && (current.access_token != session.access_token
                || current.refresh_token != session.refresh_token)
            && current.millis_until_expiry(self.clock.now_millis())
                >= duration_millis(self.refresh_margin)
        {
            debug!("Session was already rotated by a concurrent refresh");
            return Ok(current);
        }

        let grant = self
            .provider
            .refresh(&session.refresh_token)
            .await
            .map_err(|e| {
                warn!("Refresh request failed: {}", e);
                RefreshError::from(e)
            })?;

        let user = claims::user_from_access_token(&grant.access_token, Some(&session.user))
            .map_err(RefreshError::MalformedToken)?;

        let refreshed = Session {
            expires_at: grant.expires_at_millis(self.clock.now_millis()),
            refresh_token: grant
                .refresh_token
                .filter(|token| !token.is_empty())
                .unwrap_or_else(|| session.refresh_token.clone()),
            access_token: grant.access_token,
            token_type: grant.token_type,
            user,
        };

        persist_session(self.store.as_ref(), &refreshed).await?;

        info!(
            "Session refreshed, valid for another {}s",
            refreshed.millis_until_expiry(self.clock.now_millis()) / 1000
        );
        Ok(refreshed)
    }
}

/// Write tokens and user as one logical update
pub(crate) async fn persist_session(
    store: &dyn CredentialStore,
    session: &Session,
) -> Result<(), StoreError> {
    let tokens = serde_json::to_vec(&session.tokens()).map_err(std::io::Error::from)?;
    let user = serde_json::to_vec(&session.user).map_err(std::io::Error::from)?;

    store
        .set_many(&[(keys::SESSION_TOKENS, tokens), (keys::SESSION_USER, user)])
        .await
}
