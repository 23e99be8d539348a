//! Client-side session lifecycle for the rallypoint match app
//!
//! This crate keeps a signed-in player signed in: it persists the session,
//! refreshes it before the access token expires, repairs damaged records and
//! tells the UI when the signed-in user or their profile changes.
//!
//! # Components
//!
//! 1. [`CredentialStore`]: key-value persistence (in memory, or encrypted files)
//! 2. [`SessionCodec`]: decodes persisted records and recovers from known corruption
//! 3. [`TokenRefresher`]: exchanges the refresh token for a new session, one at a time
//! 4. [`SessionGuard`] and [`SessionMonitor`]: proactive refresh before expiry
//! 5. [`RetryingRequestExecutor`]: refresh-and-replay once when an operation hits an expired token
//! 6. [`AuthStateBroadcaster`]: polls the auth state and notifies subscribers of changes
//!
//! [`SessionManager`] wires them together.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use rp_auth::{
//!     ApiError, FileCredentialStore, Profile, ProfileSource, SessionConfig, SessionManager,
//!     User, UserState,
//! };
//!
//! struct Profiles;
//!
//! #[async_trait::async_trait]
//! impl ProfileSource for Profiles {
//!     async fn fetch_profile(&self, user: &User, _token: &str) -> Result<Option<Profile>, ApiError> {
//!         Ok(Some(Profile::new(user.id.clone())))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::load(Path::new("rallypoint.toml")).await?;
//!     let store = FileCredentialStore::open(FileCredentialStore::default_storage_dir()?).await?;
//!     let manager = SessionManager::with_http(config, Arc::new(store), Arc::new(Profiles))?;
//!
//!     let _subscription = manager
//!         .subscribe(|snapshot| println!("Signed in: {}", !snapshot.is_signed_out()))
//!         .await;
//!
//!     if let UserState::SignedOut = manager.get_current_user().await {
//!         manager.sign_in_with_password("ana@club.test", "hunter2").await?;
//!     }
//!     manager.start_monitoring();
//!
//!     // Authenticated backend calls are replayed once after a refresh
//!     let token_len = manager.get_access_token().await?.len();
//!     let matches = manager
//!         .execute(|| async move { Ok::<_, ApiError>(vec![token_len]) })
//!         .await?;
//!     println!("{} open matches", matches.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Storage
//!
//! Records live under fixed keys (`session.user`, `session.tokens`,
//! `session.temp_user`, `profile.cache.<id>`) as JSON.
//!
//! ```
//! use rp_auth::{CredentialStore, MemoryCredentialStore, keys};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = MemoryCredentialStore::new();
//! store.set(keys::SESSION_USER, br#"{"id":"u1","email":"ana@club.test"}"#).await?;
//!
//! assert!(store.get(keys::SESSION_USER).await?.is_some());
//! store.remove_many(&[keys::SESSION_USER, keys::SESSION_TOKENS]).await?;
//! assert!(store.keys().is_empty());
//! # Ok(())
//! # }
//! # tokio_test::block_on(example()).unwrap();
//! ```
//!
//! [`FileCredentialStore`] seals every record with AES-256-GCM. The key is
//! generated on first use and kept next to the records unless the host
//! supplies one with [`FileCredentialStore::with_key`].
//!
//! # Important Notes
//!
//! - Tokens and passwords are never logged
//! - A failed refresh keeps the stored session so the user stays signed in offline
//! - Listeners only see a sign-out after `sign_out_after_failures` failed checks in a row

pub mod broadcaster;
pub mod claims;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod file_store;
pub mod guard;
pub mod manager;
pub mod models;
pub mod profile;
pub mod refresher;
pub mod retry;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export main types
pub use broadcaster::{AuthSnapshot, AuthStateBroadcaster, AuthStateSource, Subscription, TickOutcome};
pub use client::{HttpIdentityProvider, IdentityProvider};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::SessionCodec;
pub use config::{HttpTimeouts, SessionConfig, SessionPolicy, keys};
pub use crypto::EncryptionKey;
pub use errors::{AuthError, ProviderError, RefreshError, Result, StoreError};
pub use file_store::FileCredentialStore;
pub use guard::{Freshness, MonitorState, SessionGuard, SessionMonitor};
pub use manager::SessionManager;
pub use models::TokenResponse;
pub use profile::{CachedProfile, Profile, ProfileCache, ProfileSource};
pub use refresher::TokenRefresher;
pub use retry::{ApiError, ExpiryAware, RequestError, RetryingRequestExecutor};
pub use session::{
    MAX_EXPIRES_AT_MILLIS, PendingRegistration, Session, SignUpOutcome, StoredTokens, User,
    UserState,
};
pub use store::{CredentialStore, MemoryCredentialStore};
