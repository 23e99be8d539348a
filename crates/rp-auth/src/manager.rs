use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::broadcaster::{AuthSnapshot, AuthStateBroadcaster, AuthStateSource, Subscription};
use crate::claims;
use crate::client::{HttpIdentityProvider, IdentityProvider};
use crate::clock::{Clock, SystemClock};
use crate::codec::SessionCodec;
use crate::config::{SessionConfig, SessionPolicy, keys};
use crate::errors::{AuthError, ProviderError, Result};
use crate::guard::{Freshness, SessionGuard, SessionMonitor};
use crate::models::{SignUpResponse, TokenResponse};
use crate::profile::{Profile, ProfileCache, ProfileSource};
use crate::refresher::{TokenRefresher, persist_session};
use crate::retry::{ExpiryAware, RequestError, RetryingRequestExecutor};
use crate::session::{PendingRegistration, Session, SignUpOutcome, User, UserState};
use crate::store::{CredentialStore, put_json};

/// Read side of the session shared with the auth state poller
struct SessionCore {
    clock: Arc<dyn Clock>,
    profile_source: Arc<dyn ProfileSource>,
    codec: SessionCodec,
    guard: Arc<SessionGuard>,
    profiles: ProfileCache,
}

impl SessionCore {
    async fn current_user(&self) -> UserState {
        if let Some(session) = self.codec.load_session().await
            && let Err(e) = self.guard.ensure_fresh(&session).await
        {
            warn!("Proactive refresh failed, continuing with the stored session: {}", e);
        }

        self.codec.decode_user().await
    }

    async fn access_token(&self) -> Result<String> {
        let session = self.codec.load_session().await.ok_or(AuthError::NoSession)?;

        match self.guard.ensure_fresh(&session).await {
            Ok(Freshness::Fresh) => Ok(session.access_token),
            Ok(Freshness::Refreshed(refreshed)) => Ok(refreshed.access_token),
            Err(e) if session.is_expired(self.clock.now_millis()) => {
                Err(AuthError::RefreshFailed(e))
            }
            Err(e) => {
                warn!("Refresh failed, token is still valid for now: {}", e);
                Ok(session.access_token)
            }
        }
    }

    async fn profile(&self, user: &User) -> Result<Option<Profile>> {
        let token = self.access_token().await?;
        self.profiles
            .resolve(self.profile_source.as_ref(), user, &token)
            .await
    }
}

#[async_trait::async_trait]
impl AuthStateSource for SessionCore {
    async fn current_state(&self) -> Result<AuthSnapshot> {
        match self.current_user().await {
            UserState::Authenticated(user) => {
                let profile = self.profile(&user).await?;
                Ok(AuthSnapshot {
                    user: Some(user),
                    profile,
                })
            }
            UserState::Degraded => Err(AuthError::CorruptedRecord {
                key: keys::SESSION_USER.to_string(),
                reason: "stored user could not be recovered".to_string(),
            }),
            UserState::SignedOut => Ok(AuthSnapshot::signed_out()),
        }
    }
}

/// Owns the whole session lifecycle for one signed-in device.
///
/// Create one per application and share it; there is no global state. The
/// background monitor and the auth state poller live as long as the manager.
///
/// ```no_run
/// use std::sync::Arc;
///
/// use rp_auth::{
///     ApiError, FileCredentialStore, Profile, ProfileSource, SessionConfig, SessionManager, User,
/// };
///
/// struct NoProfiles;
///
/// #[async_trait::async_trait]
/// impl ProfileSource for NoProfiles {
///     async fn fetch_profile(&self, _: &User, _: &str) -> Result<Option<Profile>, ApiError> {
///         Ok(None)
///     }
/// }
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = SessionConfig::new("https://auth.example.com/auth/v1/".parse()?);
/// let store = FileCredentialStore::open(FileCredentialStore::default_storage_dir()?).await?;
/// let manager = SessionManager::with_http(config, Arc::new(store), Arc::new(NoProfiles))?;
///
/// let user = manager.sign_in_with_password("ana@club.test", "hunter2").await?;
/// println!("Signed in as {}", user.email);
/// # Ok(())
/// # }
/// ```
pub struct SessionManager {
    core: Arc<SessionCore>,
    store: Arc<dyn CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    monitor: SessionMonitor,
    broadcaster: AuthStateBroadcaster,
    executor: RetryingRequestExecutor,
}

impl SessionManager {
    pub fn new(
        policy: SessionPolicy,
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        profile_source: Arc<dyn ProfileSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let codec = SessionCodec::new(store.clone(), provider.clone());
        let refresher = Arc::new(TokenRefresher::new(
            store.clone(),
            provider.clone(),
            clock.clone(),
            policy.refresh_margin,
        ));
        let guard = Arc::new(SessionGuard::new(
            refresher.clone(),
            clock.clone(),
            policy.refresh_margin,
        ));

        let core = Arc::new(SessionCore {
            clock: clock.clone(),
            profile_source,
            codec: codec.clone(),
            guard: guard.clone(),
            profiles: ProfileCache::new(store.clone(), clock.clone(), policy.profile_cache_ttl),
        });

        Self {
            monitor: SessionMonitor::new(guard, codec.clone(), policy.monitor_interval),
            broadcaster: AuthStateBroadcaster::new(
                core.clone(),
                policy.poll_interval,
                policy.sign_out_after_failures,
            ),
            executor: RetryingRequestExecutor::new(codec, refresher),
            core,
            store,
            provider,
            clock,
        }
    }

    /// Manager backed by the HTTP identity provider and the system clock
    pub fn with_http(
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
        profile_source: Arc<dyn ProfileSource>,
    ) -> Result<Self> {
        let policy = config.policy.clone();
        let provider = HttpIdentityProvider::new(config).map_err(AuthError::from_provider)?;

        Ok(Self::new(
            policy,
            store,
            Arc::new(provider),
            profile_source,
            Arc::new(SystemClock),
        ))
    }

    #[instrument(skip(self, password))]
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<User> {
        let grant = self
            .provider
            .sign_in_with_password(email, password)
            .await
            .map_err(AuthError::from_provider)?;

        let session = self.establish(grant).await?;
        self.clear_pending_registration().await?;

        info!("Signed in as {}", session.user.id);
        Ok(session.user)
    }

    #[instrument(skip(self, password, metadata))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Map<String, Value>,
    ) -> Result<SignUpOutcome> {
        let response = self
            .provider
            .sign_up(email, password, &metadata)
            .await
            .map_err(AuthError::from_provider)?;

        match response {
            SignUpResponse::Session(grant) => {
                let session = self.establish(grant).await?;
                info!("Signed up and signed in as {}", session.user.id);
                Ok(SignUpOutcome::SignedIn(session.user))
            }
            SignUpResponse::User(user) => {
                let pending = PendingRegistration {
                    email: email.to_string(),
                    user_id: Some(user.id).filter(|id| !id.is_empty()),
                    user_metadata: metadata,
                    created_at_millis: self.clock.now_millis(),
                };
                put_json(self.store.as_ref(), keys::SESSION_TEMP_USER, &pending).await?;

                info!("Sign-up pending email verification");
                Ok(SignUpOutcome::PendingVerification(pending))
            }
        }
    }

    /// Registration data waiting for email verification, if any
    pub async fn pending_registration(&self) -> Result<Option<PendingRegistration>> {
        let Some(raw) = self.store.get(keys::SESSION_TEMP_USER).await? else {
            return Ok(None);
        };

        match serde_json::from_slice(&raw) {
            Ok(pending) => Ok(Some(pending)),
            Err(e) => {
                warn!("Pending registration is corrupted ({}), discarding it", e);
                self.clear_pending_registration().await?;
                Ok(None)
            }
        }
    }

    pub async fn clear_pending_registration(&self) -> Result<()> {
        self.store.remove(keys::SESSION_TEMP_USER).await?;
        Ok(())
    }

    /// Drop the local session. Provider logout is best effort; local state always goes.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<()> {
        self.monitor.stop();

        let session = self.core.codec.load_session().await;
        if let Some(session) = &session
            && let Err(e) = self.provider.sign_out(&session.access_token).await
        {
            warn!("Provider logout failed, clearing local session anyway: {}", e);
        }

        let mut doomed = vec![
            keys::SESSION_TOKENS.to_string(),
            keys::SESSION_USER.to_string(),
            keys::SESSION_TEMP_USER.to_string(),
        ];
        if let Some(session) = &session {
            doomed.push(keys::profile_cache(&session.user.id));
            doomed.push(keys::profile_cache_timestamp(&session.user.id));
        }
        let doomed: Vec<&str> = doomed.iter().map(String::as_str).collect();
        self.store.remove_many(&doomed).await?;

        info!("Signed out");
        self.broadcaster.tick().await;
        Ok(())
    }

    /// The signed-in user, refreshing the session first when it is close to expiry
    #[instrument(skip(self))]
    pub async fn get_current_user(&self) -> UserState {
        self.core.current_user().await
    }

    /// Like [`get_current_user`](Self::get_current_user), but a degraded record falls back to token claims
    pub async fn get_valid_user(&self) -> Result<User> {
        match self.get_current_user().await {
            UserState::Authenticated(user) => Ok(user),
            UserState::Degraded => self
                .core
                .codec
                .load_session()
                .await
                .map(|session| session.user)
                .ok_or(AuthError::NoSession),
            UserState::SignedOut => Err(AuthError::NoSession),
        }
    }

    /// A usable access token, refreshed first when it is close to expiry
    #[instrument(skip(self))]
    pub async fn get_access_token(&self) -> Result<String> {
        self.core.access_token().await
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn get_profile(&self, user: &User) -> Result<Option<Profile>> {
        self.core.profile(user).await
    }

    /// Run an authenticated operation, renewing the session once if its token expired
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> std::result::Result<T, RequestError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: ExpiryAware,
    {
        self.executor.execute(op).await
    }

    /// See [`AuthStateBroadcaster::subscribe`]
    pub async fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AuthSnapshot) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(listener).await
    }

    pub fn start_monitoring(&self) {
        self.monitor.start();
    }

    pub fn stop_monitoring(&self) {
        self.monitor.stop();
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    /// Turn a token grant into the persisted session and start keeping it fresh
    async fn establish(&self, grant: TokenResponse) -> Result<Session> {
        let user = match grant.user.clone().filter(|user| !user.id.is_empty()) {
            Some(user) => user,
            None => claims::user_from_access_token(&grant.access_token, None)
                .map_err(|reason| AuthError::Provider(ProviderError::InvalidResponse(reason)))?,
        };

        let session = Session {
            expires_at: grant.expires_at_millis(self.clock.now_millis()),
            refresh_token: grant.refresh_token.unwrap_or_default(),
            access_token: grant.access_token,
            token_type: grant.token_type,
            user,
        };
        persist_session(self.store.as_ref(), &session).await?;
        debug!(
            "Session persisted, expires in {}s",
            session.millis_until_expiry(self.clock.now_millis()) / 1000
        );

        self.monitor.start();
        self.broadcaster.tick().await;
        Ok(session)
    }
}
