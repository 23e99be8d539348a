//! Access token claim decoding.
//!
//! The access token is a JWT signed by the identity provider. The client never
//! verifies the signature (the provider does that on every request); it only
//! reads the payload to rebuild the [`User`] after a refresh without another
//! round trip.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::session::User;

#[derive(Debug, Clone, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub app_metadata: Map<String, Value>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
    /// Expiry in epoch seconds
    #[serde(default)]
    pub exp: Option<i64>,
    /// Issued-at in epoch seconds
    #[serde(default)]
    pub iat: Option<i64>,
}

impl AccessClaims {
    /// Verification flag from the top-level claim or `user_metadata.email_verified`
    pub fn email_verified(&self) -> bool {
        self.email_verified.unwrap_or_else(|| {
            self.user_metadata
                .get("email_verified")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
    }

    fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }
}

/// Decode the payload segment of a JWT without verifying it
pub fn decode_claims(token: &str) -> Result<AccessClaims, String> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err("access token is not a three-part JWT".to_string()),
    };

    // some issuers pad their segments
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| format!("invalid claim encoding: {e}"))?;

    let claims: AccessClaims =
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid claim payload: {e}"))?;
    if claims.sub.is_empty() {
        return Err("access token has an empty subject".to_string());
    }

    Ok(claims)
}

/// Rebuild the user from access token claims.
///
/// The token carries only a verification flag, so the confirmation timestamp
/// is carried over from `previous` when it describes the same subject.
pub fn user_from_access_token(token: &str, previous: Option<&User>) -> Result<User, String> {
    let claims = decode_claims(token)?;
    let previous = previous.filter(|user| user.id == claims.sub);

    let email_confirmed_at = if claims.email_verified() {
        previous
            .and_then(|user| user.email_confirmed_at)
            .or_else(|| claims.issued_at())
            .or_else(|| Some(Utc::now()))
    } else {
        None
    };

    let email = claims
        .email
        .clone()
        .or_else(|| previous.map(|user| user.email.clone()))
        .unwrap_or_default();

    Ok(User {
        id: claims.sub,
        email,
        email_confirmed_at,
        app_metadata: claims.app_metadata,
        user_metadata: claims.user_metadata,
    })
}
