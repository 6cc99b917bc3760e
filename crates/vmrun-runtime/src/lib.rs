//! vmrun-runtime
//!
//! Ingestion wiring: appending events and making sure every affected instance
//! is reconciled, either inline or through a per-instance work queue.

mod backend;
mod queue;
mod retry;
mod trigger;

pub use backend::{LedgerBackend, PgLedger};
pub use queue::{FailedReconcile, QueueSettings, QueueStats, ReconcileQueue};
pub use retry::{reconcile_with_retry, Attempted, RetryPolicy};
pub use trigger::{Dispatched, IngestionTrigger};
