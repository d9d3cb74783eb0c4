//! Batched upsert engine
//!
//! Records are cut into fixed-size batches and sent as `$batch` requests,
//! at most `max_concurrency` in flight. Batches are dispatched in waves; the
//! bearer token is only refreshed between waves.
//!
//! A failing batch never stops its siblings. Counts are reconciled per batch
//! and summed in whatever order batches complete.

use cubesync_common::types::Record;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::batch::{parse_batch_response, BatchOutcome, BatchRequest};
use super::retry::{deliver, Delivery, RetryPolicy};
use super::WebApi;
use crate::error::Result;
use crate::progress::{create_record_progress, throughput};

// ============================================================================
// Upsert Defaults
// ============================================================================

/// Records per `$batch` request
pub const DEFAULT_UPSERT_BATCH_SIZE: usize = 400;

/// Concurrent batches in flight
pub const DEFAULT_UPSERT_CONCURRENCY: usize = 6;

/// Batches per wave, as a multiple of the concurrency limit
pub const WAVE_BATCHES_PER_WORKER: usize = 25;

/// Failing sub-operations logged per batch
pub const MAX_ERROR_SNIPPETS: usize = 2;

#[derive(Debug, Clone)]
pub struct UpsertOptions {
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// Ask for the written row back so creates answer 201 and updates 200
    pub return_representation: bool,
    pub retry: RetryPolicy,
    pub show_progress: bool,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_UPSERT_BATCH_SIZE,
            max_concurrency: DEFAULT_UPSERT_CONCURRENCY,
            return_representation: true,
            retry: RetryPolicy::default(),
            show_progress: false,
        }
    }
}

impl UpsertOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }
}

/// Totals for one upsert run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertSummary {
    pub created: usize,
    pub updated: usize,
    pub errors: usize,
    /// Records rejected before dispatch for lacking a business key
    pub skipped: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

impl UpsertSummary {
    pub fn outcome(&self) -> BatchOutcome {
        BatchOutcome {
            created: self.created,
            updated: self.updated,
            errors: self.errors,
        }
    }

    /// Successful records per second
    pub fn throughput(&self) -> f64 {
        throughput(self.created + self.updated, self.elapsed)
    }
}

pub struct UpsertEngine<A: WebApi + ?Sized> {
    api: Arc<A>,
    options: UpsertOptions,
}

impl<A: WebApi + ?Sized> UpsertEngine<A> {
    pub fn new(api: Arc<A>, options: UpsertOptions) -> Self {
        Self { api, options }
    }

    pub fn options(&self) -> &UpsertOptions {
        &self.options
    }

    /// Upsert `records` into `table`.
    ///
    /// Only an authentication failure aborts the run. Batch failures are
    /// counted as errors.
    pub async fn upsert(&self, table: &str, records: &[Record]) -> Result<UpsertSummary> {
        let started = Instant::now();
        let mut summary = UpsertSummary::default();

        let keyed: Vec<&Record> = records.iter().filter(|r| r.has_key()).collect();
        summary.skipped = records.len() - keyed.len();
        if summary.skipped > 0 {
            warn!(table, skipped = summary.skipped, "Skipping records without a business key");
        }
        if keyed.is_empty() {
            info!(table, "Nothing to upsert");
            return Ok(summary);
        }

        let batch_size = self.options.batch_size.max(1);
        let concurrency = self.options.max_concurrency.max(1);
        let batches: Vec<Vec<Record>> = keyed
            .chunks(batch_size)
            .map(|chunk| chunk.iter().map(|r| (*r).clone()).collect())
            .collect();
        summary.batches = batches.len();
        let total = keyed.len();

        info!(
            table,
            records = total,
            batches = batches.len(),
            batch_size,
            concurrency,
            "Starting upsert"
        );
        debug!(table, payload = %keyed[0].payload(), "First upsert payload");

        let progress = create_record_progress(
            total as u64,
            &format!("Upserting into {}", table),
            self.options.show_progress,
        );
        let mut totals = BatchOutcome::default();
        let indexed: Vec<(usize, &Vec<Record>)> = batches.iter().enumerate().collect();

        for wave in indexed.chunks(concurrency * WAVE_BATCHES_PER_WORKER) {
            self.api.refresh_auth(false).await?;

            let mut in_flight = stream::iter(wave.iter().copied())
                .map(|(index, batch)| async move {
                    (batch.len(), self.upsert_batch(table, index, batch).await)
                })
                .buffer_unordered(concurrency);

            while let Some((len, outcome)) = in_flight.next().await {
                totals += outcome;
                progress.inc(len as u64);

                let rate = throughput(totals.succeeded(), started.elapsed());
                info!(
                    table,
                    processed = totals.total(),
                    total,
                    created = totals.created,
                    updated = totals.updated,
                    errors = totals.errors,
                    rows_per_sec = format!("{:.1}", rate),
                    "Upsert progress"
                );
            }
        }
        progress.finish_and_clear();

        summary.created = totals.created;
        summary.updated = totals.updated;
        summary.errors = totals.errors;
        summary.elapsed = started.elapsed();

        info!(
            table,
            created = summary.created,
            updated = summary.updated,
            errors = summary.errors,
            elapsed_secs = format!("{:.1}", summary.elapsed.as_secs_f64()),
            rows_per_sec = format!("{:.1}", summary.throughput()),
            "Upsert complete"
        );

        Ok(summary)
    }

    async fn upsert_batch(&self, table: &str, index: usize, records: &[Record]) -> BatchOutcome {
        let request = match BatchRequest::upsert(
            self.api.api_base(),
            table,
            records,
            self.options.return_representation,
        ) {
            Ok(request) => request,
            Err(e) => {
                warn!(batch = index, error = %e, "Could not build batch request");
                return BatchOutcome::all_errors(records.len());
            },
        };

        match deliver(self.api.as_ref(), &request, &self.options.retry, index).await {
            Delivery::Accepted { response, attempts } => {
                let parts = parse_batch_response(&response.body);
                let outcome = BatchOutcome::reconcile(records.len(), &parts);

                if outcome.errors > 0 {
                    for (part, record) in parts
                        .iter()
                        .zip(records)
                        .filter(|(part, _)| part.is_error())
                        .take(MAX_ERROR_SNIPPETS)
                    {
                        warn!(
                            batch = index,
                            key = %record.business_key,
                            status = part.status,
                            message = part.error_message.as_deref().unwrap_or("<no message>"),
                            "Upsert sub-operation failed"
                        );
                    }
                }
                debug!(
                    batch = index,
                    attempts,
                    created = outcome.created,
                    updated = outcome.updated,
                    errors = outcome.errors,
                    "Batch reconciled"
                );
                outcome
            },
            Delivery::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(
                    batch = index,
                    attempts,
                    records = records.len(),
                    error = %last_error,
                    "Batch failed after retries; counting all records as errors"
                );
                BatchOutcome::all_errors(records.len())
            },
        }
    }
}
