use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use vmrun_schemas::Run;

use crate::invariants::RunSetViolation;

// ---------------------------------------------------------------------------
// Soft conditions
// ---------------------------------------------------------------------------

/// Something odd seen during replay that did not stop it.
///
/// Event sources (provider polling, webhooks, backfills) can deliver
/// duplicates or drop events, so none of these abort a pass. Callers log them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayNotice {
    /// `power_on` while a run was already open.
    PowerOnWhileRunning {
        event_seq: i64,
        occurred_at: DateTime<Utc>,
    },
    /// `power_off` with no open run.
    PowerOffWhileStopped {
        event_seq: i64,
        occurred_at: DateTime<Utc>,
    },
    /// `attribute_change` while stopped, after a run already existed.
    /// The profile is remembered for the next profile-less `power_on`.
    AttributeChangeWhileStopped {
        event_seq: i64,
        occurred_at: DateTime<Utc>,
    },
    /// A run was opened with no profile known at all.
    MissingProfile {
        event_seq: i64,
        occurred_at: DateTime<Utc>,
    },
    /// The catalog has no entry for this profile; memory/vcpu stay empty.
    ProfileNotFound { profile_id: String },
}

impl ReplayNotice {
    /// True for the notices that describe an inconsistent event sequence
    /// (as opposed to missing catalog data).
    pub fn is_inconsistent_sequence(&self) -> bool {
        !matches!(self, ReplayNotice::ProfileNotFound { .. })
    }
}

impl fmt::Display for ReplayNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayNotice::PowerOnWhileRunning {
                event_seq,
                occurred_at,
            } => write!(
                f,
                "inconsistent event sequence: power_on seq={event_seq} at {occurred_at} while already running (ignored)"
            ),
            ReplayNotice::PowerOffWhileStopped {
                event_seq,
                occurred_at,
            } => write!(
                f,
                "inconsistent event sequence: power_off seq={event_seq} at {occurred_at} while already stopped (ignored)"
            ),
            ReplayNotice::AttributeChangeWhileStopped {
                event_seq,
                occurred_at,
            } => write!(
                f,
                "attribute_change seq={event_seq} at {occurred_at} while stopped (profile remembered, no run opened)"
            ),
            ReplayNotice::MissingProfile {
                event_seq,
                occurred_at,
            } => write!(
                f,
                "run opened by seq={event_seq} at {occurred_at} with no known hardware profile"
            ),
            ReplayNotice::ProfileNotFound { profile_id } => {
                write!(f, "hardware profile '{profile_id}' not found in catalog")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Replay output
// ---------------------------------------------------------------------------

/// Result of replaying one instance's history.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayOutcome {
    pub instance_id: Uuid,
    /// Complete run set, ordered by `start_time`.
    pub runs: Vec<Run>,
    /// Soft conditions, in stable (sorted, de-duplicated) order.
    pub notices: Vec<ReplayNotice>,
}

impl ReplayOutcome {
    pub fn has_open_run(&self) -> bool {
        self.runs.last().map(Run::is_open).unwrap_or(false)
    }
}

/// What a completed reconciliation pass reports back to its caller.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileSummary {
    pub instance_id: Uuid,
    pub runs: usize,
    pub open_run: bool,
    /// False when the freshly derived set equals the one already stored.
    pub changed: bool,
    pub notices: Vec<ReplayNotice>,
}

impl ReconcileSummary {
    pub fn from_outcome(outcome: &ReplayOutcome, changed: bool) -> Self {
        Self {
            instance_id: outcome.instance_id,
            runs: outcome.runs.len(),
            open_run: outcome.has_open_run(),
            changed,
            notices: outcome.notices.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Hard failures
// ---------------------------------------------------------------------------

/// Failure of a reconciliation pass. No run data is mutated when one of these
/// is returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileError {
    /// Event or run store temporarily unavailable. Retry the same call.
    TransientStore(String),
    /// Anything else that went wrong while reading, replaying or writing.
    ReconciliationFailed { instance_id: Uuid, reason: String },
    /// The instance is not registered.
    InstanceNotFound(Uuid),
}

impl ReconcileError {
    pub fn failed(instance_id: Uuid, reason: impl Into<String>) -> Self {
        ReconcileError::ReconciliationFailed {
            instance_id,
            reason: reason.into(),
        }
    }

    /// Only transient store errors are worth retrying; the others would fail
    /// the same way on an unchanged event log.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::TransientStore(_))
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::TransientStore(msg) => write!(f, "transient store error: {msg}"),
            ReconcileError::ReconciliationFailed {
                instance_id,
                reason,
            } => write!(f, "reconciliation failed for instance {instance_id}: {reason}"),
            ReconcileError::InstanceNotFound(id) => write!(f, "instance {id} not found"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<(Uuid, RunSetViolation)> for ReconcileError {
    fn from((instance_id, v): (Uuid, RunSetViolation)) -> Self {
        ReconcileError::failed(instance_id, format!("derived run set rejected: {v}"))
    }
}
