use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::config::{DEFAULT_USER_AGENT, SessionConfig, endpoints};
use crate::errors::ProviderError;
use crate::models::*;
use crate::session::User;

/// Remote identity provider surface consumed by the session manager
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange a refresh token for a new token pair
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError>;

    /// Fetch the user the access token belongs to
    async fn fetch_user(&self, access_token: &str) -> Result<User, ProviderError>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, ProviderError>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &Map<String, Value>,
    ) -> Result<SignUpResponse, ProviderError>;

    /// Revoke the session server-side
    async fn sign_out(&self, access_token: &str) -> Result<(), ProviderError>;
}

/// HTTP client for the identity provider's auth API
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    config: SessionConfig,
    http: Client,
}

impl HttpIdentityProvider {
    pub fn new(config: SessionConfig) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
            .build()?;

        Ok(Self { config, http })
    }

    fn with_api_key(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header("apikey", key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        let response = self
            .with_api_key(request)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(map_transport)?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed: ProviderErrorBody = serde_json::from_str(&body).unwrap_or_default();

        let message = parsed
            .message()
            .unwrap_or_else(|| body.chars().take(200).collect());
        debug!("Identity provider returned {}: {}", status, message);

        Err(ProviderError::Rejected {
            status,
            code: parsed.code(),
            message,
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ProviderError> {
        let response = self.send(request).await?;
        let body = response.bytes().await.map_err(map_transport)?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: &impl serde::Serialize,
    ) -> Result<TokenResponse, ProviderError> {
        let mut url = self.config.endpoint(endpoints::TOKEN)?;
        url.query_pairs_mut().append_pair("grant_type", grant_type);

        self.json(self.http.post(url).json(body)).await
    }
}

fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(err)
    }
}

#[async_trait::async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[instrument(skip(self, refresh_token))]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        debug!("Refreshing access token");
        self.token_grant("refresh_token", &RefreshTokenRequest { refresh_token })
            .await
    }

    #[instrument(skip(self, access_token))]
    async fn fetch_user(&self, access_token: &str) -> Result<User, ProviderError> {
        debug!("Fetching current user");
        let url = self.config.endpoint(endpoints::USER)?;

        self.json(self.http.get(url).bearer_auth(access_token)).await
    }

    #[instrument(skip(self, password))]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<TokenResponse, ProviderError> {
        debug!("Signing in with password");
        self.token_grant("password", &PasswordGrantRequest { email, password })
            .await
    }

    #[instrument(skip(self, password, metadata))]
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &Map<String, Value>,
    ) -> Result<SignUpResponse, ProviderError> {
        debug!("Registering new account");
        let url = self.config.endpoint(endpoints::SIGNUP)?;
        let body = SignUpRequest {
            email,
            password,
            data: metadata,
        };

        self.json(self.http.post(url).json(&body)).await
    }

    #[instrument(skip(self, access_token))]
    async fn sign_out(&self, access_token: &str) -> Result<(), ProviderError> {
        let url = self.config.endpoint(endpoints::LOGOUT)?;

        match self.send(self.http.post(url).bearer_auth(access_token)).await {
            Ok(_) => Ok(()),
            Err(ProviderError::Rejected { status, .. }) if status.as_u16() == 401 => {
                // the token is already dead server-side
                warn!("Logout rejected with 401, treating session as revoked");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
