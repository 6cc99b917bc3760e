use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;
use vmrun_schemas::{Event, EventType, Run};

use crate::catalog::CatalogLookup;
use crate::invariants::check_run_set;
use crate::{ReconcileError, ReplayNotice, ReplayOutcome};

/// Run currently open during replay.
#[derive(Debug)]
struct OpenRun {
    start: DateTime<Utc>,
    profile: Option<String>,
    /// Opened by a profile change that closed the previous span at `start`.
    split: bool,
}

/// Completed run span before catalog enrichment.
#[derive(Debug)]
struct RunSpan {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    profile: Option<String>,
    split: bool,
}

impl RunSpan {
    fn close(run: OpenRun, end: Option<DateTime<Utc>>) -> Self {
        Self {
            start: run.start,
            end,
            profile: run.profile,
            split: run.split,
        }
    }
}

fn push_notice_once(notices: &mut Vec<ReplayNotice>, n: ReplayNotice) {
    if !notices.contains(&n) {
        notices.push(n);
    }
}

/// Deterministic run identifier: same instance, same start, same position in
/// the replay => same id across passes.
pub fn run_id_for(instance_id: Uuid, ordinal: usize, start: DateTime<Utc>) -> Uuid {
    let name = format!(
        "run:{ordinal}:{}",
        start.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    Uuid::new_v5(&instance_id, name.as_bytes())
}

/// Replay an instance's event history into its complete run set.
///
/// Transition table (state = whether a run is open):
///
/// | state  | event              | action                                        |
/// |--------|--------------------|-----------------------------------------------|
/// | closed | power_on           | open run with event profile (or last known)   |
/// | closed | power_off          | no-op, notice                                 |
/// | closed | attribute_change   | open run if no run has been opened yet;       |
/// |        |                    | otherwise remember profile, notice            |
/// | open   | power_on           | no-op, notice                                 |
/// | open   | power_off          | close run at `occurred_at`                    |
/// | open   | attribute_change   | same profile: no-op; different: close and     |
/// |        |                    | reopen at the same instant with new profile   |
///
/// An open run left at the end of history is emitted with `end_time = None`.
///
/// `events` need not be sorted; replay always follows
/// `(occurred_at ASC, event_seq ASC)`. Events for other instances are ignored.
pub fn replay(instance_id: Uuid, events: &[Event], catalog: &dyn CatalogLookup) -> ReplayOutcome {
    let mut ordered: Vec<&Event> = events
        .iter()
        .filter(|e| e.instance_id == instance_id)
        .collect();
    ordered.sort_by_key(|e| e.replay_key());

    let mut notices: Vec<ReplayNotice> = Vec::new();
    let mut spans: Vec<RunSpan> = Vec::new();
    let mut open: Option<OpenRun> = None;
    let mut ever_opened = false;
    let mut last_profile: Option<String> = None;

    for ev in ordered {
        let at = ev.occurred_at;
        let seq = ev.event_seq;

        match (open.take(), ev.event_type) {
            (None, EventType::PowerOn) => {
                let profile = ev.profile_id.clone().or_else(|| last_profile.clone());
                if profile.is_none() {
                    push_notice_once(
                        &mut notices,
                        ReplayNotice::MissingProfile {
                            event_seq: seq,
                            occurred_at: at,
                        },
                    );
                }
                open = Some(OpenRun {
                    start: at,
                    profile,
                    split: false,
                });
                ever_opened = true;
            }
            (None, EventType::PowerOff) => {
                push_notice_once(
                    &mut notices,
                    ReplayNotice::PowerOffWhileStopped {
                        event_seq: seq,
                        occurred_at: at,
                    },
                );
            }
            (None, EventType::AttributeChange) => {
                if ever_opened {
                    push_notice_once(
                        &mut notices,
                        ReplayNotice::AttributeChangeWhileStopped {
                            event_seq: seq,
                            occurred_at: at,
                        },
                    );
                } else {
                    // First thing we ever learn about the instance is its profile:
                    // treat it as running from here.
                    open = Some(OpenRun {
                        start: at,
                        profile: ev.profile_id.clone(),
                        split: false,
                    });
                    ever_opened = true;
                }
            }
            (Some(run), EventType::PowerOn) => {
                push_notice_once(
                    &mut notices,
                    ReplayNotice::PowerOnWhileRunning {
                        event_seq: seq,
                        occurred_at: at,
                    },
                );
                open = Some(run);
            }
            (Some(run), EventType::PowerOff) => {
                spans.push(RunSpan::close(run, Some(at)));
            }
            (Some(mut run), EventType::AttributeChange) => {
                match ev.profile_id.as_ref() {
                    None => {}
                    Some(p) if run.profile.as_ref() == Some(p) => {}
                    Some(p) if run.start == at => {
                        // Change lands on the run's first instant: nothing ran
                        // under the old profile. If that restores the profile
                        // of the span the split just closed, the split never
                        // happened and that span continues.
                        let rejoin = run.split
                            && spans.last().is_some_and(|prev| {
                                prev.end == Some(at) && prev.profile.as_ref() == Some(p)
                            });
                        match spans.pop() {
                            Some(prev) if rejoin => {
                                run = OpenRun {
                                    start: prev.start,
                                    profile: prev.profile,
                                    split: prev.split,
                                };
                            }
                            Some(prev) => {
                                spans.push(prev);
                                run.profile = Some(p.clone());
                            }
                            None => run.profile = Some(p.clone()),
                        }
                    }
                    Some(p) => {
                        spans.push(RunSpan::close(run, Some(at)));
                        run = OpenRun {
                            start: at,
                            profile: Some(p.clone()),
                            split: true,
                        };
                    }
                }
                open = Some(run);
            }
        }

        if let Some(p) = ev.profile_id.as_ref() {
            last_profile = Some(p.clone());
        }
    }

    if let Some(run) = open {
        spans.push(RunSpan::close(run, None));
    }

    let mut runs = Vec::with_capacity(spans.len());
    for (ordinal, span) in spans.into_iter().enumerate() {
        let spec = match span.profile.as_deref() {
            Some(pid) => {
                let spec = catalog.lookup(pid);
                if spec.is_none() {
                    push_notice_once(
                        &mut notices,
                        ReplayNotice::ProfileNotFound {
                            profile_id: pid.to_string(),
                        },
                    );
                }
                spec
            }
            None => None,
        };

        runs.push(Run {
            run_id: run_id_for(instance_id, ordinal, span.start),
            instance_id,
            start_time: span.start,
            end_time: span.end,
            instance_type: span.profile,
            memory_gib: spec.map(|s| s.memory_gib),
            vcpu: spec.map(|s| s.vcpu),
        });
    }

    // Stable ordering for notices (deterministic output).
    notices.sort();

    ReplayOutcome {
        instance_id,
        runs,
        notices,
    }
}

/// [`replay`] followed by [`check_run_set`]. A violation means the derived
/// set must not be persisted.
pub fn replay_checked(
    instance_id: Uuid,
    events: &[Event],
    catalog: &dyn CatalogLookup,
) -> Result<ReplayOutcome, ReconcileError> {
    let outcome = replay(instance_id, events, catalog);
    check_run_set(instance_id, &outcome.runs).map_err(|v| ReconcileError::from((instance_id, v)))?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CatalogSnapshot, ProfileSpec};
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap()
    }

    fn ev(id: Uuid, seq: i64, t: EventType, h: u32, profile: Option<&str>) -> Event {
        Event {
            event_seq: seq,
            instance_id: id,
            event_type: t,
            occurred_at: ts(h),
            profile_id: profile.map(str::to_string),
            provider_fields: None,
            created_at: ts(0),
        }
    }

    fn catalog() -> CatalogSnapshot {
        let mut c = CatalogSnapshot::new();
        c.insert(
            "m5.large",
            ProfileSpec {
                memory_gib: 8.0,
                vcpu: 2,
            },
        );
        c
    }

    #[test]
    fn run_id_is_stable_and_position_sensitive() {
        let id = Uuid::new_v4();
        assert_eq!(run_id_for(id, 0, ts(1)), run_id_for(id, 0, ts(1)));
        assert_ne!(run_id_for(id, 0, ts(1)), run_id_for(id, 1, ts(1)));
        assert_ne!(run_id_for(id, 0, ts(1)), run_id_for(Uuid::new_v4(), 0, ts(1)));
    }

    #[test]
    fn equal_timestamps_follow_insertion_sequence() {
        let id = Uuid::new_v4();
        // power_off inserted after power_on at the same instant: zero-width run.
        let events = vec![
            ev(id, 2, EventType::PowerOff, 3, None),
            ev(id, 1, EventType::PowerOn, 3, Some("m5.large")),
        ];
        let out = replay(id, &events, &catalog());
        assert_eq!(out.runs.len(), 1);
        assert_eq!(out.runs[0].start_time, ts(3));
        assert_eq!(out.runs[0].end_time, Some(ts(3)));
        assert!(out.notices.is_empty());
    }

    #[test]
    fn attribute_change_at_run_start_replaces_profile_in_place() {
        let id = Uuid::new_v4();
        let events = vec![
            ev(id, 1, EventType::PowerOn, 1, Some("t3.micro")),
            ev(id, 2, EventType::AttributeChange, 1, Some("m5.large")),
            ev(id, 3, EventType::PowerOff, 4, None),
        ];
        let out = replay(id, &events, &catalog());
        assert_eq!(out.runs.len(), 1);
        assert_eq!(out.runs[0].instance_type.as_deref(), Some("m5.large"));
        assert_eq!(out.runs[0].memory_gib, Some(8.0));
    }

    #[test]
    fn events_of_other_instances_are_ignored() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let events = vec![
            ev(id, 1, EventType::PowerOn, 1, Some("m5.large")),
            ev(other, 2, EventType::PowerOff, 2, None),
        ];
        let out = replay(id, &events, &catalog());
        assert_eq!(out.runs.len(), 1);
        assert!(out.runs[0].is_open());
    }
}
