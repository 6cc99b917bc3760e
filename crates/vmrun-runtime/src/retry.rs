use std::time::Duration;

use tracing::{error, warn};
use uuid::Uuid;
use vmrun_config::ReconcileSettings;
use vmrun_reconcile::{ReconcileError, ReconcileSummary};

use crate::LedgerBackend;

/// How hard to try before giving up on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always >= 1.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff` before the next try.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(s: &ReconcileSettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            backoff: Duration::from_millis(s.retry_backoff_ms),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Final result of reconciling one instance under a retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted {
    pub instance_id: Uuid,
    pub attempts: u32,
    pub result: Result<ReconcileSummary, ReconcileError>,
}

/// Call `backend.reconcile` until it succeeds, fails permanently, or the
/// attempt budget is spent. Only `TransientStore` errors are retried.
pub async fn reconcile_with_retry(
    backend: &dyn LedgerBackend,
    instance_id: Uuid,
    policy: RetryPolicy,
) -> Attempted {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match backend.reconcile(instance_id).await {
            Ok(summary) => {
                return Attempted {
                    instance_id,
                    attempts: attempt,
                    result: Ok(summary),
                }
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    %instance_id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "reconcile failed; retrying"
                );
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => {
                error!(%instance_id, attempts = attempt, error = %e, "reconcile gave up");
                return Attempted {
                    instance_id,
                    attempts: attempt,
                    result: Err(e),
                };
            }
        }
    }
}
