//! Dataverse Web API access
//!
//! [`WebApi`] is the seam between the batch engines and the transport.
//! [`DataverseClient`] implements it over HTTP; tests implement it with an
//! in-memory store.

pub mod auth;
pub mod batch;
pub mod client;
pub mod delete;
pub mod endpoints;
pub mod retry;
pub mod upsert;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub use auth::{AccessToken, ClientCredentials, StaticToken, TokenProvider};
pub use batch::{BatchOperation, BatchOutcome, BatchRequest, SubResponse};
pub use client::DataverseClient;
pub use delete::{DeleteEngine, DeleteOptions, DeleteSummary};
pub use retry::{Delivery, RetryPolicy};
pub use upsert::{UpsertEngine, UpsertOptions, UpsertSummary};

/// Raw answer to a `$batch` POST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    pub status: u16,
    /// Parsed `Retry-After` header, when present
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl BatchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait WebApi: Send + Sync {
    /// Web API root that sub-request URLs are built against
    fn api_base(&self) -> &str;

    /// POST one `$batch` request.
    ///
    /// Any HTTP status comes back as `Ok`; only transport failures are `Err`.
    async fn send_batch(&self, batch: &BatchRequest) -> Result<BatchResponse>;

    /// Fetch up to `top` primary ids from `table`.
    async fn fetch_ids(&self, table: &str, id_field: &str, top: usize) -> Result<Vec<String>>;

    /// Make sure the bearer token is usable for the next wave.
    ///
    /// Called only while no requests are in flight. `force` discards the
    /// current token even if it has not expired.
    async fn refresh_auth(&self, _force: bool) -> Result<()> {
        Ok(())
    }
}
