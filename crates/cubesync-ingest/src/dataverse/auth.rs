//! Bearer token acquisition
//!
//! The token protocol itself is somebody else's problem: client credentials
//! is a single form POST, and a pre-issued token can be supplied directly.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::endpoints;
use crate::error::{snippet, IngestError, Result};

/// Tokens expiring within this window are refreshed before the next wave
pub const TOKEN_REFRESH_SKEW: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_in: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            expires_at: expires_in.map(|d| Instant::now() + d),
        }
    }

    /// True when the token has less than `skew` left to live.
    pub fn expires_within(&self, skew: Duration) -> bool {
        match self.expires_at {
            Some(at) => at.saturating_duration_since(Instant::now()) <= skew,
            None => false,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire(&self) -> Result<AccessToken>;
}

/// A token obtained out of band. Never expires from our point of view.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn acquire(&self) -> Result<AccessToken> {
        Ok(AccessToken::new(self.token.clone(), None))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 client-credentials grant against the identity platform
pub struct ClientCredentials {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
}

impl ClientCredentials {
    pub fn new(
        http: Client,
        authority: &str,
        tenant_id: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        environment_url: &str,
    ) -> Self {
        Self {
            http,
            token_url: endpoints::token_url(authority, tenant_id),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: endpoints::default_scope(environment_url),
        }
    }
}

#[async_trait]
impl TokenProvider for ClientCredentials {
    async fn acquire(&self) -> Result<AccessToken> {
        debug!(url = %self.token_url, scope = %self.scope, "Requesting access token");

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(IngestError::auth(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                snippet(&body, 300)
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| IngestError::auth(format!("unreadable token response: {}", e)))?;

        Ok(AccessToken::new(
            token.access_token,
            token.expires_in.map(Duration::from_secs),
        ))
    }
}
