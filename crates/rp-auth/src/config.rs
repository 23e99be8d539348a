use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::errors::{AuthError, Result};

/// Identity provider endpoints, relative to `SessionConfig::provider_url`
pub mod endpoints {
    pub const TOKEN: &str = "token";
    pub const USER: &str = "user";
    pub const SIGNUP: &str = "signup";
    pub const LOGOUT: &str = "logout";
}

/// Persisted storage keys
pub mod keys {
    pub const SESSION_USER: &str = "session.user";
    pub const SESSION_TOKENS: &str = "session.tokens";
    pub const SESSION_TEMP_USER: &str = "session.temp_user";

    pub fn profile_cache(user_id: &str) -> String {
        format!("profile.cache.{user_id}")
    }

    pub fn profile_cache_timestamp(user_id: &str) -> String {
        format!("profile.cache.{user_id}.timestamp")
    }
}

pub const DEFAULT_USER_AGENT: &str = "rallypoint";

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTimeouts {
    #[serde(rename = "connect_secs", with = "duration_secs")]
    pub connect: Duration,
    #[serde(rename = "request_secs", with = "duration_secs")]
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(15),
        }
    }
}

/// Timing and tolerance knobs for the session lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Refresh proactively when the access token expires within this window
    #[serde(rename = "refresh_margin_secs", with = "duration_secs")]
    pub refresh_margin: Duration,

    /// Period of the background session monitor
    #[serde(rename = "monitor_interval_secs", with = "duration_secs")]
    pub monitor_interval: Duration,

    /// Period of the auth state poller
    #[serde(rename = "poll_interval_secs", with = "duration_secs")]
    pub poll_interval: Duration,

    /// Consecutive failed auth state checks before listeners see a sign-out
    pub sign_out_after_failures: u32,

    /// How long a cached profile is preferred over a live fetch
    #[serde(rename = "profile_cache_ttl_secs", with = "duration_secs")]
    pub profile_cache_ttl: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(10 * 60),
            monitor_interval: Duration::from_secs(3 * 60),
            poll_interval: Duration::from_secs(10 * 60),
            sign_out_after_failures: 10,
            profile_cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for the session manager and its HTTP identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base URL of the identity provider's auth API (e.g. `https://auth.example.com/auth/v1/`)
    pub provider_url: Url,

    /// Public API key sent as the `apikey` header (optional)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub policy: SessionPolicy,
}

impl SessionConfig {
    pub fn new(provider_url: Url) -> Self {
        Self {
            provider_url: normalize_base(provider_url),
            api_key: None,
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            policy: SessionPolicy::default(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let mut config: SessionConfig =
            toml::from_str(content).context("Failed to parse session configuration")?;
        config.provider_url = normalize_base(config.provider_url);
        anyhow::ensure!(
            config.policy.sign_out_after_failures > 0,
            "sign_out_after_failures must be at least 1"
        );
        anyhow::ensure!(
            !config.policy.poll_interval.is_zero() && !config.policy.monitor_interval.is_zero(),
            "poll and monitor intervals must be non-zero"
        );
        Ok(config)
    }

    /// Load a configuration file from disk
    #[instrument(level = "debug")]
    pub async fn load(path: &Path) -> Result<Self> {
        debug!("Loading session configuration from {}", path.display());

        let config = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read session configuration")
            .and_then(|content| Self::from_toml_str(&content))
            .map_err(|source| AuthError::Config {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(config)
    }

    /// Resolve an endpoint relative to the provider base URL
    pub fn endpoint(&self, path: &str) -> std::result::Result<Url, url::ParseError> {
        self.provider_url.join(path)
    }
}

/// `Url::join` replaces the last path segment unless the base ends in `/`
fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_lifecycle_constants() {
        let config = SessionConfig::new(Url::parse("https://auth.example.com/auth/v1").unwrap());

        assert_eq!(config.policy.refresh_margin, Duration::from_secs(600));
        assert_eq!(config.policy.monitor_interval, Duration::from_secs(180));
        assert_eq!(config.policy.poll_interval, Duration::from_secs(600));
        assert_eq!(config.policy.sign_out_after_failures, 10);
        assert_eq!(config.http_timeouts.request, Duration::from_secs(15));
        assert_eq!(
            config.endpoint(endpoints::TOKEN).unwrap().as_str(),
            "https://auth.example.com/auth/v1/token"
        );
    }

    #[test]
    fn test_toml_overrides_policy_in_seconds() {
        let config = SessionConfig::from_toml_str(
            r#"
            provider_url = "https://auth.example.com/auth/v1/"
            api_key = "anon"

            [policy]
            refresh_margin_secs = 120
            sign_out_after_failures = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.api_key.as_deref(), Some("anon"));
        assert_eq!(config.policy.refresh_margin, Duration::from_secs(120));
        assert_eq!(config.policy.sign_out_after_failures, 3);
        // untouched fields keep their defaults
        assert_eq!(config.policy.poll_interval, Duration::from_secs(600));
        assert_eq!(config.http_timeouts, HttpTimeouts::default());
    }

    #[test]
    fn test_toml_rejects_zero_failure_threshold() {
        let err = SessionConfig::from_toml_str(
            r#"
            provider_url = "https://auth.example.com/"
            [policy]
            sign_out_after_failures = 0
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("sign_out_after_failures"));
    }

    #[tokio::test]
    async fn test_load_reports_path_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        match SessionConfig::load(&path).await {
            Err(AuthError::Config { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
