use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::clock::{Clock, duration_millis};
use crate::config::keys;
use crate::errors::{AuthError, StoreError};
use crate::retry::ApiError;
use crate::session::User;
use crate::store::CredentialStore;

/// Application player profile. Only `id` matters to the session layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_level: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Profile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: None,
            skill_level: None,
            avatar_url: None,
            extra: Map::new(),
        }
    }
}

/// Where live profiles come from, implemented by the host application
#[async_trait::async_trait]
pub trait ProfileSource: Send + Sync {
    /// `Ok(None)` means the user has no profile yet
    async fn fetch_profile(
        &self,
        user: &User,
        access_token: &str,
    ) -> Result<Option<Profile>, ApiError>;
}

/// A cached profile and when it was written
#[derive(Debug, Clone, PartialEq)]
pub struct CachedProfile {
    pub profile: Profile,
    pub cached_at_millis: i64,
}

impl CachedProfile {
    pub fn is_fresh(&self, now_millis: i64, ttl: Duration) -> bool {
        now_millis.saturating_sub(self.cached_at_millis) < duration_millis(ttl)
    }
}

/// Per-user profile cache on top of the credential store
pub struct ProfileCache {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ProfileCache {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// The cached entry for `user_id`, fresh or not
    pub async fn cached(&self, user_id: &str) -> Option<CachedProfile> {
        let profile_key = keys::profile_cache(user_id);
        let timestamp_key = keys::profile_cache_timestamp(user_id);

        let profile = self.store.get(&profile_key).await.ok()??;
        let timestamp = self.store.get(&timestamp_key).await.ok()??;

        match (
            serde_json::from_slice::<Profile>(&profile),
            serde_json::from_slice::<i64>(&timestamp),
        ) {
            (Ok(profile), Ok(cached_at_millis)) => Some(CachedProfile {
                profile,
                cached_at_millis,
            }),
            _ => {
                warn!("Cached profile for {} is unreadable, dropping it", user_id);
                if let Err(e) = self.clear(user_id).await {
                    warn!("Failed to drop unreadable profile cache: {}", e);
                }
                None
            }
        }
    }

    pub async fn put(&self, user_id: &str, profile: &Profile) -> Result<(), AuthError> {
        let profile = serde_json::to_vec(profile)?;
        let timestamp = serde_json::to_vec(&self.clock.now_millis())?;

        self.store
            .set_many(&[
                (keys::profile_cache(user_id).as_str(), profile),
                (keys::profile_cache_timestamp(user_id).as_str(), timestamp),
            ])
            .await?;
        Ok(())
    }

    pub async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        let profile_key = keys::profile_cache(user_id);
        let timestamp_key = keys::profile_cache_timestamp(user_id);
        self.store
            .remove_many(&[profile_key.as_str(), timestamp_key.as_str()])
            .await
    }

    /// Fresh cache, else a live fetch; a stale entry covers for an unreachable backend
    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn resolve(
        &self,
        source: &dyn ProfileSource,
        user: &User,
        access_token: &str,
    ) -> Result<Option<Profile>, AuthError> {
        let cached = self.cached(&user.id).await;

        if let Some(entry) = &cached
            && entry.is_fresh(self.clock.now_millis(), self.ttl)
        {
            debug!("Using cached profile");
            return Ok(Some(entry.profile.clone()));
        }

        match source.fetch_profile(user, access_token).await {
            Ok(Some(profile)) => {
                if let Err(e) = self.put(&user.id, &profile).await {
                    warn!("Failed to cache profile: {}", e);
                }
                Ok(Some(profile))
            }
            Ok(None) => {
                debug!("User has no profile, clearing the cache");
                self.clear(&user.id).await?;
                Ok(None)
            }
            Err(e) if e.is_unavailable() => match cached {
                Some(entry) => {
                    warn!("Profile backend unavailable ({}), serving stale cache", e);
                    Ok(Some(entry.profile))
                }
                None => Err(AuthError::NetworkUnavailable(e.to_string())),
            },
            Err(e) => Err(AuthError::Api(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reqwest::StatusCode;

    use crate::clock::ManualClock;
    use crate::store::MemoryCredentialStore;

    const NOW: i64 = 1_750_000_000_000;
    const HOUR: Duration = Duration::from_secs(3600);

    enum Scripted {
        Found(Profile),
        Missing,
        Unavailable,
        Forbidden,
    }

    struct ScriptedSource {
        next: Mutex<Scripted>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(next: Scripted) -> Self {
            Self {
                next: Mutex::new(next),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ProfileSource for ScriptedSource {
        async fn fetch_profile(
            &self,
            _user: &User,
            _access_token: &str,
        ) -> Result<Option<Profile>, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &*self.next.lock().unwrap() {
                Scripted::Found(profile) => Ok(Some(profile.clone())),
                Scripted::Missing => Ok(None),
                Scripted::Unavailable => Err(ApiError::Http {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    code: None,
                    message: "upstream down".to_string(),
                }),
                Scripted::Forbidden => Err(ApiError::Http {
                    status: StatusCode::FORBIDDEN,
                    code: Some("42501".to_string()),
                    message: "permission denied".to_string(),
                }),
            }
        }
    }

    fn named(name: &str) -> Profile {
        let mut profile = Profile::new("u1");
        profile.full_name = Some(name.to_string());
        profile
    }

    fn cache() -> (Arc<MemoryCredentialStore>, ManualClock, ProfileCache) {
        let store = Arc::new(MemoryCredentialStore::new());
        let clock = ManualClock::new(NOW);
        let cache = ProfileCache::new(store.clone(), Arc::new(clock.clone()), HOUR);
        (store, clock, cache)
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_live_fetch() {
        let (_store, clock, cache) = cache();
        cache.put("u1", &named("Cached")).await.unwrap();
        clock.advance(Duration::from_secs(59 * 60));

        let source = ScriptedSource::new(Scripted::Found(named("Live")));
        let profile = cache
            .resolve(&source, &User::new("u1", "a@b.com"), "at")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(profile.full_name.as_deref(), Some("Cached"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_is_replaced_by_live_profile() {
        let (_store, clock, cache) = cache();
        cache.put("u1", &named("Cached")).await.unwrap();
        clock.advance(HOUR);

        let source = ScriptedSource::new(Scripted::Found(named("Live")));
        let profile = cache
            .resolve(&source, &User::new("u1", "a@b.com"), "at")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(profile.full_name.as_deref(), Some("Live"));
        let entry = cache.cached("u1").await.unwrap();
        assert_eq!(entry.profile, profile);
        assert_eq!(entry.cached_at_millis, NOW + 3_600_000);
    }

    #[tokio::test]
    async fn test_stale_cache_covers_unavailable_backend() {
        let (_store, clock, cache) = cache();
        cache.put("u1", &named("Cached")).await.unwrap();
        clock.advance(3 * HOUR);

        let source = ScriptedSource::new(Scripted::Unavailable);
        let profile = cache
            .resolve(&source, &User::new("u1", "a@b.com"), "at")
            .await
            .unwrap();

        assert_eq!(profile, Some(named("Cached")));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_without_cache_is_network_error() {
        let (_store, _clock, cache) = cache();
        let source = ScriptedSource::new(Scripted::Unavailable);

        let result = cache.resolve(&source, &User::new("u1", "a@b.com"), "at").await;
        assert!(matches!(result, Err(AuthError::NetworkUnavailable(_))));
    }

    #[tokio::test]
    async fn test_rejections_are_not_masked_by_cache() {
        let (_store, clock, cache) = cache();
        cache.put("u1", &named("Cached")).await.unwrap();
        clock.advance(2 * HOUR);

        let source = ScriptedSource::new(Scripted::Forbidden);
        let result = cache.resolve(&source, &User::new("u1", "a@b.com"), "at").await;
        assert!(matches!(result, Err(AuthError::Api(ApiError::Http { .. }))));
    }

    #[tokio::test]
    async fn test_missing_profile_clears_cache() {
        let (store, clock, cache) = cache();
        cache.put("u1", &named("Cached")).await.unwrap();
        clock.advance(2 * HOUR);

        let source = ScriptedSource::new(Scripted::Missing);
        let profile = cache
            .resolve(&source, &User::new("u1", "a@b.com"), "at")
            .await
            .unwrap();

        assert_eq!(profile, None);
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_extra_fields_survive_a_round_trip() {
        let raw = r#"{"id":"u1","full_name":"Ana","skill_level":3.5,"home_club":"Padel Norte"}"#;
        let profile: Profile = serde_json::from_str(raw).unwrap();

        assert_eq!(profile.skill_level, Some(3.5));
        assert_eq!(profile.extra["home_club"], "Padel Norte");
        assert_eq!(
            serde_json::to_value(&profile).unwrap()["home_club"],
            "Padel Norte"
        );
    }
}
