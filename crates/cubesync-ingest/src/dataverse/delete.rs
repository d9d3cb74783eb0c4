//! Bulk delete engine
//!
//! Empties a table page by page: fetch a page of primary ids, delete them in
//! concurrent `$batch` requests, fetch again until a page comes back empty.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::batch::{parse_batch_response, BatchOutcome, BatchRequest};
use super::retry::{deliver, Delivery, RetryPolicy};
use super::WebApi;
use crate::error::{IngestError, Result};

// ============================================================================
// Delete Defaults
// ============================================================================

/// Ids fetched per page
pub const DEFAULT_DELETE_PAGE_SIZE: usize = 5000;

/// Deletes per `$batch` request
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 100;

/// Concurrent delete batches in flight
pub const DEFAULT_DELETE_CONCURRENCY: usize = 8;

/// Cap on the wait between failed page fetches
pub const MAX_FETCH_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub page_size: usize,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Base of the exponential wait between failed page fetches
    pub fetch_backoff_base: Duration,
    pub fetch_backoff_cap: Duration,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_DELETE_PAGE_SIZE,
            batch_size: DEFAULT_DELETE_BATCH_SIZE,
            max_concurrency: DEFAULT_DELETE_CONCURRENCY,
            retry: RetryPolicy::default(),
            fetch_backoff_base: Duration::from_secs(1),
            fetch_backoff_cap: Duration::from_secs(MAX_FETCH_BACKOFF_SECS),
        }
    }
}

impl DeleteOptions {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Use `retry` for delete batches and zero the fetch backoff when the
    /// policy itself never waits.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        if retry.error_backoff.is_zero() {
            self.fetch_backoff_base = Duration::ZERO;
        }
        self.retry = retry;
        self
    }

    fn fetch_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.fetch_backoff_base
            .saturating_mul(factor)
            .min(self.fetch_backoff_cap)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteSummary {
    pub deleted: usize,
    pub failed_batches: usize,
    pub pages: usize,
    pub elapsed: Duration,
    /// The pass stopped on a page where nothing could be deleted
    pub stalled: bool,
}

impl DeleteSummary {
    /// Fail when the pass stalled with rows still in `table`.
    pub fn ensure_complete(&self, table: &str) -> Result<()> {
        if self.stalled {
            return Err(IngestError::config(format!(
                "purge of {} stalled after deleting {} rows; rerun the purge",
                table, self.deleted
            )));
        }
        Ok(())
    }
}

pub struct DeleteEngine<A: WebApi + ?Sized> {
    api: Arc<A>,
    options: DeleteOptions,
}

impl<A: WebApi + ?Sized> DeleteEngine<A> {
    pub fn new(api: Arc<A>, options: DeleteOptions) -> Self {
        Self { api, options }
    }

    pub fn options(&self) -> &DeleteOptions {
        &self.options
    }

    /// Delete every row of `table`, addressing rows by `id_field`.
    pub async fn delete_all(&self, table: &str, id_field: &str) -> Result<DeleteSummary> {
        let started = Instant::now();
        let mut summary = DeleteSummary::default();
        let batch_size = self.options.batch_size.max(1);
        let concurrency = self.options.max_concurrency.max(1);

        info!(
            table,
            id_field,
            page_size = self.options.page_size,
            batch_size,
            concurrency,
            "Starting bulk delete"
        );

        loop {
            self.api.refresh_auth(false).await?;
            let ids = self.fetch_page(table, id_field).await?;
            if ids.is_empty() {
                break;
            }
            summary.pages += 1;

            let mut in_flight = stream::iter(ids.chunks(batch_size).enumerate())
                .map(|(index, chunk)| self.delete_batch(table, index, chunk))
                .buffer_unordered(concurrency);

            let mut page_deleted = 0;
            while let Some(result) = in_flight.next().await {
                match result {
                    Some(outcome) => page_deleted += outcome.succeeded(),
                    None => summary.failed_batches += 1,
                }
            }
            summary.deleted += page_deleted;

            info!(
                table,
                page = summary.pages,
                fetched = ids.len(),
                deleted = page_deleted,
                total_deleted = summary.deleted,
                "Delete page complete"
            );

            if page_deleted == 0 {
                warn!(
                    table,
                    page = summary.pages,
                    remaining = ids.len(),
                    "No rows deleted on this page; stopping so the same ids are not refetched"
                );
                summary.stalled = true;
                break;
            }
        }

        summary.elapsed = started.elapsed();
        info!(
            table,
            deleted = summary.deleted,
            failed_batches = summary.failed_batches,
            pages = summary.pages,
            elapsed_secs = format!("{:.1}", summary.elapsed.as_secs_f64()),
            "Bulk delete complete"
        );

        Ok(summary)
    }

    async fn fetch_page(&self, table: &str, id_field: &str) -> Result<Vec<String>> {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.api.fetch_ids(table, id_field, self.options.page_size).await {
                Ok(ids) => return Ok(ids),
                Err(e) => {
                    warn!(table, attempt, max_attempts, error = %e, "Id page fetch failed");
                    if matches!(e, IngestError::Http { status: 401 | 403, .. }) {
                        self.api.refresh_auth(true).await?;
                    }
                    last_error = Some(e);
                },
            }

            if attempt < max_attempts {
                let wait = self.options.fetch_backoff(attempt);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| IngestError::malformed("id page fetch never attempted")))
    }

    /// `None` when the batch could not be delivered at all.
    async fn delete_batch(&self, table: &str, index: usize, ids: &[String]) -> Option<BatchOutcome> {
        let request = match BatchRequest::delete(self.api.api_base(), table, ids) {
            Ok(request) => request,
            Err(e) => {
                warn!(batch = index, error = %e, "Could not build delete batch");
                return None;
            },
        };

        match deliver(self.api.as_ref(), &request, &self.options.retry, index).await {
            Delivery::Accepted { response, .. } => {
                let parts = parse_batch_response(&response.body);
                let outcome = BatchOutcome::reconcile_deletes(ids.len(), &parts);
                let already_gone = parts
                    .iter()
                    .take(ids.len())
                    .filter(|part| part.status == 404)
                    .count();
                if already_gone > 0 {
                    debug!(batch = index, already_gone, "Rows were already deleted");
                }
                if outcome.errors > 0 {
                    warn!(batch = index, errors = outcome.errors, "Some deletes failed");
                }
                Some(outcome)
            },
            Delivery::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(
                    batch = index,
                    attempts,
                    ids = ids.len(),
                    error = %last_error,
                    "Delete batch failed after retries; skipping"
                );
                None
            },
        }
    }
}
