//! Batch delivery with bounded retries
//!
//! Shared by the upsert and delete engines. A 429 waits for the server's
//! `Retry-After` (or a default); any other failure waits a fixed short
//! backoff. After `max_attempts` the batch is given up on and the caller
//! counts it as failed.

use std::time::Duration;
use tracing::{debug, warn};

use super::batch::BatchRequest;
use super::{BatchResponse, WebApi};
use crate::error::snippet;

// ============================================================================
// Retry Defaults
// ============================================================================

/// Attempts per batch, including the first
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Wait after a 429 that carries no `Retry-After`
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Wait after a non-429 failure or transport error
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub default_retry_after: Duration,
    pub error_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_retry_after: Duration::from_secs(DEFAULT_RETRY_AFTER_SECS),
            error_backoff: Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            default_retry_after: Duration::ZERO,
            error_backoff: Duration::ZERO,
        }
    }
}

/// Result of trying to get one batch accepted
#[derive(Debug)]
pub enum Delivery {
    /// The server accepted the batch with a 2xx
    Accepted { response: BatchResponse, attempts: u32 },
    /// Every attempt failed
    Exhausted { attempts: u32, last_error: String },
}

/// Send `batch` until it is accepted or the policy's attempts run out.
pub async fn deliver<A>(
    api: &A,
    batch: &BatchRequest,
    policy: &RetryPolicy,
    index: usize,
) -> Delivery
where
    A: WebApi + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let wait = match api.send_batch(batch).await {
            Ok(response) if (200..300).contains(&response.status) => {
                debug!(batch = index, attempt, status = response.status, "Batch accepted");
                return Delivery::Accepted { response, attempts: attempt };
            },
            Ok(response) if response.status == 429 => {
                let wait = response.retry_after.unwrap_or(policy.default_retry_after);
                warn!(
                    batch = index,
                    attempt,
                    max_attempts,
                    wait_secs = wait.as_secs_f64(),
                    "Batch rate limited"
                );
                last_error = "HTTP 429 Too Many Requests".to_string();
                wait
            },
            Ok(response) => {
                last_error = format!("HTTP {}: {}", response.status, snippet(&response.body, 300));
                warn!(
                    batch = index,
                    attempt,
                    max_attempts,
                    status = response.status,
                    body = %snippet(&response.body, 300),
                    "Batch rejected"
                );
                policy.error_backoff
            },
            Err(e) => {
                last_error = e.to_string();
                warn!(batch = index, attempt, max_attempts, error = %e, "Batch request failed");
                policy.error_backoff
            },
        };

        if attempt < max_attempts && !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    Delivery::Exhausted {
        attempts: max_attempts,
        last_error,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{IngestError, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed script of responses, then keeps answering 500.
    struct Scripted {
        script: Mutex<VecDeque<Result<BatchResponse>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<BatchResponse>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl WebApi for Scripted {
        fn api_base(&self) -> &str {
            "https://org.crm.dynamics.com/api/data/v9.2"
        }

        async fn send_batch(&self, _batch: &BatchRequest) -> Result<BatchResponse> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(BatchResponse::new(500, "server busy")))
        }

        async fn fetch_ids(&self, _: &str, _: &str, _: usize) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn batch() -> BatchRequest {
        BatchRequest::delete(
            "https://org.crm.dynamics.com/api/data/v9.2",
            "crf63_oarsbidatas",
            &["a-1".to_string()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_accepted_first_try() {
        let api = Scripted::new(vec![Ok(BatchResponse::new(200, "ok"))]);
        let delivery = deliver(&api, &batch(), &RetryPolicy::immediate(5), 0).await;

        match delivery {
            Delivery::Accepted { response, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(response.body, "ok");
            },
            other => panic!("expected acceptance, got {:?}", other),
        }
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_throttle_and_transport_error() {
        let mut throttled = BatchResponse::new(429, "");
        throttled.retry_after = Some(Duration::from_secs(1));
        let api = Scripted::new(vec![
            Ok(throttled),
            Err(IngestError::auth("connection reset")),
            Ok(BatchResponse::new(200, "ok")),
        ]);

        let delivery = deliver(&api, &batch(), &RetryPolicy::immediate(5), 3).await;
        assert!(matches!(delivery, Delivery::Accepted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let api = Scripted::new(Vec::new());
        let delivery = deliver(&api, &batch(), &RetryPolicy::immediate(5), 0).await;

        match delivery {
            Delivery::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("500"));
            },
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(api.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_retry_after_on_429() {
        let mut throttled = BatchResponse::new(429, "");
        throttled.retry_after = Some(Duration::from_secs(7));
        let api = Scripted::new(vec![Ok(throttled), Ok(BatchResponse::new(204, ""))]);

        let started = tokio::time::Instant::now();
        let delivery = deliver(&api, &batch(), &RetryPolicy::default(), 0).await;

        assert!(matches!(delivery, Delivery::Accepted { attempts: 2, .. }));
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_last_attempt() {
        let api = Scripted::new(Vec::new());
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };

        let started = tokio::time::Instant::now();
        let delivery = deliver(&api, &batch(), &policy, 0).await;

        assert!(matches!(delivery, Delivery::Exhausted { attempts: 2, .. }));
        let backoff = Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS);
        assert!(started.elapsed() >= backoff);
        assert!(started.elapsed() < backoff * 2);
    }
}
