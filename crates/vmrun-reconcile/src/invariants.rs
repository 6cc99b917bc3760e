//! Run-set invariants.
//!
//! For one instance:
//! - every run has `end_time >= start_time` when closed
//! - runs are ordered by `start_time`
//! - consecutive runs do not overlap (`[start, end)`, open end = +infinity)
//! - at most one run is open, and it is the last one
//! - all runs belong to the same instance

use std::fmt;
use uuid::Uuid;
use vmrun_schemas::Run;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunSetViolation {
    NegativeSpan { index: usize },
    OutOfOrder { index: usize },
    Overlap { index: usize },
    OpenRunNotLast { index: usize },
    ForeignInstance { index: usize, instance_id: Uuid },
}

impl fmt::Display for RunSetViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunSetViolation::NegativeSpan { index } => {
                write!(f, "run #{index} ends before it starts")
            }
            RunSetViolation::OutOfOrder { index } => {
                write!(f, "run #{index} starts before its predecessor")
            }
            RunSetViolation::Overlap { index } => {
                write!(f, "run #{index} overlaps its predecessor")
            }
            RunSetViolation::OpenRunNotLast { index } => {
                write!(f, "run #{index} is open but is not the last run")
            }
            RunSetViolation::ForeignInstance { index, instance_id } => {
                write!(f, "run #{index} belongs to another instance ({instance_id})")
            }
        }
    }
}

impl std::error::Error for RunSetViolation {}

/// Validate a complete run set for `instance_id`. Returns the first violation.
pub fn check_run_set(instance_id: Uuid, runs: &[Run]) -> Result<(), RunSetViolation> {
    for (index, run) in runs.iter().enumerate() {
        if run.instance_id != instance_id {
            return Err(RunSetViolation::ForeignInstance {
                index,
                instance_id: run.instance_id,
            });
        }
        if let Some(end) = run.end_time {
            if end < run.start_time {
                return Err(RunSetViolation::NegativeSpan { index });
            }
        }
    }

    for (i, pair) in runs.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        let index = i + 1;
        if next.start_time < prev.start_time {
            return Err(RunSetViolation::OutOfOrder { index });
        }
        match prev.end_time {
            None => return Err(RunSetViolation::OpenRunNotLast { index: i }),
            Some(end) if end > next.start_time => {
                return Err(RunSetViolation::Overlap { index })
            }
            Some(_) => {}
        }
    }

    Ok(())
}
