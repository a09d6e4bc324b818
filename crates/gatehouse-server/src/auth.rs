//! Token validation and session ownership
//!
//! Tokens are validated against an external identity service and the result
//! is TTL-cached. Session ids encode the owning user id as an integer prefix;
//! a non-integer prefix is a legacy session, allowed with a warning.

use gatehouse_core::cache::BoundedCache;
use gatehouse_core::error::{GatehouseError, Result};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

const AUTH_CACHE_TTL: Duration = Duration::from_secs(300);
const AUTH_CACHE_CAPACITY: usize = 4096;

/// Validated caller identity.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthInfo {
    pub valid: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub userid: i64,
}

/// Client for the external token-validation service.
pub struct AuthClient {
    http_client: reqwest::Client,
    url: String,
    cache: BoundedCache<String, AuthInfo>,
}

impl AuthClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(GatehouseError::Http)?;
        Ok(Self {
            http_client,
            url: url.into(),
            cache: BoundedCache::with_capacity_and_ttl(AUTH_CACHE_CAPACITY, AUTH_CACHE_TTL),
        })
    }

    /// Validate a bearer token. An empty service URL disables auth and maps
    /// every caller to the anonymous user.
    pub async fn validate(&self, token: &str) -> Result<AuthInfo> {
        if self.url.is_empty() {
            return Ok(AuthInfo {
                valid: true,
                username: "anonymous".to_string(),
                userid: 0,
            });
        }

        if let Some(cached) = self.cache.get(&token.to_string()) {
            return Ok(cached);
        }

        let response = self
            .http_client
            .post(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(GatehouseError::Http)?;
        if !response.status().is_success() {
            return Err(GatehouseError::SessionForbidden(format!(
                "token validation failed (HTTP {})",
                response.status()
            )));
        }

        let info: AuthInfo = response.json().await.map_err(GatehouseError::Http)?;
        if !info.valid {
            return Err(GatehouseError::SessionForbidden(
                "token rejected by identity service".to_string(),
            ));
        }

        self.cache.set(token.to_string(), info.clone());
        Ok(info)
    }
}

/// Mint a fresh session id owned by the user.
pub fn mint_session_id(user_id: i64) -> String {
    format!("{user_id}_{}", Uuid::new_v4())
}

/// Enforce session ownership. An integer prefix must equal the caller's user
/// id; a non-integer prefix is treated as a legacy session and allowed.
pub fn check_session_ownership(session_id: &str, user_id: i64) -> Result<()> {
    let prefix = session_id.split('_').next().unwrap_or_default();
    match prefix.parse::<i64>() {
        Ok(owner) if owner == user_id => Ok(()),
        Ok(owner) => Err(GatehouseError::SessionForbidden(format!(
            "session belongs to user {owner}, caller is {user_id}"
        ))),
        Err(_) => {
            tracing::warn!(session_id, "legacy session id without integer prefix");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_sessions_pass_ownership() {
        let session = mint_session_id(1001);
        assert!(check_session_ownership(&session, 1001).is_ok());
        assert!(check_session_ownership(&session, 2002).is_err());
    }

    #[test]
    fn legacy_prefix_is_allowed() {
        assert!(check_session_ownership("legacy_abc123", 1001).is_ok());
    }

    #[test]
    fn foreign_integer_prefix_is_denied() {
        let err = check_session_ownership("42_deadbeef", 1001).unwrap_err();
        assert!(matches!(err, GatehouseError::SessionForbidden(_)));
    }

    #[tokio::test]
    async fn empty_url_disables_auth() {
        let client = AuthClient::new("").unwrap();
        let info = client.validate("any-token").await.unwrap();
        assert!(info.valid);
        assert_eq!(info.userid, 0);
    }
}
