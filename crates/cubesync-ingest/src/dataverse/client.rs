//! HTTP implementation of [`WebApi`]
//!
//! One pooled `reqwest::Client` is shared by every in-flight batch. The
//! bearer token sits behind an `RwLock`: batches only read it, and it is
//! replaced from `refresh_auth` between dispatch waves.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::auth::{AccessToken, TokenProvider, TOKEN_REFRESH_SKEW};
use super::batch::BatchRequest;
use super::{endpoints, BatchResponse, WebApi};
use crate::config::DataverseConfig;
use crate::error::{IngestError, Result};

#[derive(Deserialize)]
struct IdPage {
    #[serde(default)]
    value: Vec<serde_json::Map<String, Value>>,
}

pub struct DataverseClient {
    http: Client,
    api_base: String,
    tokens: Arc<dyn TokenProvider>,
    token: RwLock<Option<AccessToken>>,
}

impl DataverseClient {
    pub fn new(config: &DataverseConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(config.pool_size)
            .build()?;
        Ok(Self::with_http(http, &config.url, tokens))
    }

    pub fn with_http(http: Client, environment_url: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            api_base: endpoints::api_base(environment_url),
            tokens,
            token: RwLock::new(None),
        }
    }

    async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.value.clone());
        }
        self.refresh_auth(true).await?;
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| t.value.clone())
            .ok_or_else(|| IngestError::auth("no access token available"))
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl WebApi for DataverseClient {
    fn api_base(&self) -> &str {
        &self.api_base
    }

    async fn send_batch(&self, batch: &BatchRequest) -> Result<BatchResponse> {
        let token = self.bearer().await?;
        let response = self
            .http
            .post(endpoints::batch_url(&self.api_base))
            .bearer_auth(token)
            .header(CONTENT_TYPE, batch.content_type())
            .header(ACCEPT, "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Prefer", "odata.continue-on-error")
            .body(batch.body().to_string())
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(&response);
        let body = response.text().await?;

        Ok(BatchResponse {
            status,
            retry_after,
            body,
        })
    }

    async fn fetch_ids(&self, table: &str, id_field: &str, top: usize) -> Result<Vec<String>> {
        let token = self.bearer().await?;
        let url = endpoints::id_page_url(&self.api_base, table, id_field, top);
        debug!(url = %url, "Fetching id page");

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json")
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(IngestError::http(status.as_u16(), &body));
        }

        let page: IdPage = serde_json::from_str(&body)?;
        Ok(page
            .value
            .iter()
            .filter_map(|row| row.get(id_field).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn refresh_auth(&self, force: bool) -> Result<()> {
        let stale = match self.token.read().await.as_ref() {
            Some(token) => force || token.expires_within(TOKEN_REFRESH_SKEW),
            None => true,
        };
        if !stale {
            return Ok(());
        }

        let token = self.tokens.acquire().await?;
        info!(expires_at = ?token.expires_at, "Acquired Dataverse access token");
        *self.token.write().await = Some(token);
        Ok(())
    }
}
