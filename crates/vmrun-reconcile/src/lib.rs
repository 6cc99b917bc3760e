//! vmrun-reconcile
//!
//! Run reconciliation engine: replays an instance's lifecycle events and
//! derives its complete, non-overlapping set of runs.
//!
//! Architectural decisions:
//! - Every pass replays the full event history; there is no incremental patching
//! - Replay is ordered by `(occurred_at, event_seq)` regardless of input order
//! - Inconsistent sequences (double power_on, stray power_off) degrade to no-ops
//! - Unknown hardware profiles leave memory/vcpu empty; the interval is kept
//! - Replay output is checked against the run-set invariants before it is
//!   handed to a store
//!
//! Deterministic, pure logic. No IO. Persistence lives in `vmrun-db`.

mod catalog;
mod engine;
mod invariants;
mod types;

pub use catalog::{referenced_profiles, CatalogLookup, CatalogSnapshot, ProfileSpec};
pub use engine::{replay, replay_checked, run_id_for};
pub use invariants::{check_run_set, RunSetViolation};
pub use types::*;
