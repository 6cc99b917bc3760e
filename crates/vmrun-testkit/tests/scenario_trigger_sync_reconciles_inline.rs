//! Scenario: ingestion trigger in sync mode
//!
//! # Invariants under test
//!
//! - `record_event` returns the stored event and the reconciled summary; runs
//!   are visible as soon as the call returns.
//! - `record_batch` appends atomically and reconciles each affected instance
//!   exactly once.
//! - A backfilled earlier event is absorbed on the next append.
//! - Transient failures are retried; permanent ones surface as `Failed` while
//!   the appended events stay in the log.
//! - A failed pass leaves the previously stored run set untouched.
//! - `power_off_account` closes only instances whose last event is not
//!   already `power_off`.

use std::sync::Arc;
use std::time::Duration;

use vmrun_reconcile::ReconcileError;
use vmrun_runtime::{Dispatched, IngestionTrigger, LedgerBackend, RetryPolicy};
use vmrun_schemas::{EventType, NewEvent};
use vmrun_testkit::{aws_instance, standard_catalog, ts, MemoryLedger};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Duration::ZERO,
    }
}

async fn ledger() -> Arc<MemoryLedger> {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.seed_catalog(&standard_catalog()).await;
    ledger
}

// ---------------------------------------------------------------------------
// Single event
// ---------------------------------------------------------------------------

#[tokio::test]
async fn record_event_reconciles_before_returning() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let inst = aws_instance("acct-1");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(1));

    let (ev, dispatched) = trigger
        .record_event(NewEvent::power_on(id, ts(0), "m5.large"))
        .await?;
    assert_eq!(ev.event_type, EventType::PowerOn);
    assert_eq!(ev.event_seq, 1);

    let Dispatched::Reconciled(summary) = dispatched else {
        panic!("expected inline reconcile, got {dispatched:?}");
    };
    assert_eq!(summary.runs, 1);
    assert!(summary.open_run);
    assert!(summary.changed);

    let runs = ledger.runs(id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].memory_gib, Some(8.0));
    assert!(runs[0].is_open());
    Ok(())
}

#[tokio::test]
async fn invalid_event_is_rejected_before_append() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let inst = aws_instance("acct-1");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(1));
    let mut bad = NewEvent::power_off(id, ts(1));
    bad.profile_id = Some("m5.large".to_string());

    assert!(trigger.record_event(bad).await.is_err());
    assert!(ledger.events(id).await.is_empty());
    assert_eq!(ledger.reconcile_calls(id).await, 0);
    Ok(())
}

// ---------------------------------------------------------------------------
// Batch + backfill
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_reconciles_each_instance_once() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let a = aws_instance("acct-1");
    let b = aws_instance("acct-1");
    let (ida, idb) = (a.instance_id, b.instance_id);
    ledger.add_instance(a).await?;
    ledger.add_instance(b).await?;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(1));
    let out = trigger
        .record_batch(&[
            NewEvent::power_on(ida, ts(0), "t3.micro"),
            NewEvent::power_on(idb, ts(0), "m5.large"),
            NewEvent::attribute_change(ida, ts(2), "m5.xlarge"),
            NewEvent::power_off(ida, ts(3)),
            NewEvent::power_off(idb, ts(4)),
        ])
        .await?;

    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|d| matches!(d, Dispatched::Reconciled(_))));
    assert_eq!(ledger.reconcile_calls(ida).await, 1);
    assert_eq!(ledger.reconcile_calls(idb).await, 1);

    let runs_a = ledger.runs(ida).await;
    assert_eq!(runs_a.len(), 2);
    assert_eq!(runs_a[0].end_time, Some(ts(2)));
    assert_eq!(runs_a[1].start_time, ts(2));
    assert_eq!(runs_a[1].vcpu, Some(4));
    assert_eq!(ledger.runs(idb).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn batch_with_unknown_instance_appends_nothing() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let a = aws_instance("acct-1");
    let ida = a.instance_id;
    ledger.add_instance(a).await?;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(1));
    let res = trigger
        .record_batch(&[
            NewEvent::power_on(ida, ts(0), "t3.micro"),
            NewEvent::power_on(uuid::Uuid::new_v4(), ts(0), "t3.micro"),
        ])
        .await;

    assert!(res.is_err());
    assert!(ledger.events(ida).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn backfilled_power_on_is_absorbed() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let inst = aws_instance("acct-1");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;
    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(1));

    let (_, d) = trigger.record_event(NewEvent::power_off(id, ts(5))).await?;
    let Dispatched::Reconciled(s) = d else {
        panic!("expected inline reconcile");
    };
    assert_eq!(s.runs, 0);
    assert_eq!(s.notices.len(), 1);

    trigger
        .record_event(NewEvent::power_on(id, ts(1), "m5.large"))
        .await?;

    let runs = ledger.runs(id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].start_time, ts(1));
    assert_eq!(runs[0].end_time, Some(ts(5)));
    Ok(())
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_are_retried_inline() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let inst = aws_instance("acct-1");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;
    ledger.fail_next_reconciles(2).await;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(3));
    let (_, d) = trigger
        .record_event(NewEvent::power_on(id, ts(0), "m5.large"))
        .await?;

    assert!(matches!(d, Dispatched::Reconciled(_)), "got {d:?}");
    assert_eq!(ledger.reconcile_calls(id).await, 3);
    assert_eq!(ledger.runs(id).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn permanent_failure_keeps_events_and_reports() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let inst = aws_instance("acct-1");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;
    ledger.fail_instance(id, "derived run set rejected").await;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(5));
    let (_, d) = trigger
        .record_event(NewEvent::power_on(id, ts(0), "m5.large"))
        .await?;

    let Dispatched::Failed { instance_id, error } = d else {
        panic!("expected failure, got {d:?}");
    };
    assert_eq!(instance_id, id);
    assert!(matches!(error, ReconcileError::ReconciliationFailed { .. }));
    // Not retried: a permanent failure would fail the same way again.
    assert_eq!(ledger.reconcile_calls(id).await, 1);
    assert_eq!(ledger.events(id).await.len(), 1);
    assert!(ledger.runs(id).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_pass_leaves_prior_runs_untouched() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let inst = aws_instance("acct-1");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(2));
    let (_, d) = trigger
        .record_event(NewEvent::power_on(id, ts(0), "m5.large"))
        .await?;
    assert!(matches!(d, Dispatched::Reconciled(_)), "got {d:?}");
    let before = ledger.runs(id).await;
    assert_eq!(before.len(), 1);
    assert!(before[0].is_open());

    // Permanent failure on the next pass.
    ledger.fail_instance(id, "derived run set rejected").await;
    let (_, d) = trigger.record_event(NewEvent::power_off(id, ts(3))).await?;
    assert!(d.is_failed(), "got {d:?}");
    assert_eq!(ledger.events(id).await.len(), 2);
    assert_eq!(ledger.runs(id).await, before);

    // Transient failures outlasting the retry budget.
    let other = aws_instance("acct-1");
    let other_id = other.instance_id;
    ledger.add_instance(other).await?;
    trigger
        .record_event(NewEvent::power_on(other_id, ts(0), "t3.micro"))
        .await?;
    let other_before = ledger.runs(other_id).await;
    assert_eq!(other_before.len(), 1);

    ledger.fail_next_reconciles(2).await;
    let (_, d) = trigger
        .record_event(NewEvent::attribute_change(other_id, ts(2), "m5.xlarge"))
        .await?;
    let Dispatched::Failed { error, .. } = d else {
        panic!("expected failure, got {d:?}");
    };
    assert!(error.is_retryable());
    assert_eq!(ledger.runs(other_id).await, other_before);
    Ok(())
}

// ---------------------------------------------------------------------------
// Account power-off + sweep
// ---------------------------------------------------------------------------

#[tokio::test]
async fn power_off_account_closes_running_instances_only() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let running = aws_instance("acct-off");
    let stopped = aws_instance("acct-off");
    let silent = aws_instance("acct-off");
    let other = aws_instance("acct-other");
    let (r, s, q, o) = (
        running.instance_id,
        stopped.instance_id,
        silent.instance_id,
        other.instance_id,
    );
    for i in [running, stopped, silent, other] {
        ledger.add_instance(i).await?;
    }

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(1));
    trigger
        .record_batch(&[
            NewEvent::power_on(r, ts(0), "m5.large"),
            NewEvent::power_on(s, ts(0), "m5.large"),
            NewEvent::power_off(s, ts(1)),
            NewEvent::power_on(o, ts(0), "m5.large"),
        ])
        .await?;

    let out = trigger.power_off_account("acct-off", ts(6)).await?;
    let touched: Vec<_> = out.iter().map(Dispatched::instance_id).collect();
    assert_eq!(touched, vec![r]);

    let runs = ledger.runs(r).await;
    assert_eq!(runs[0].end_time, Some(ts(6)));
    assert_eq!(ledger.events(s).await.len(), 2);
    assert!(ledger.events(q).await.is_empty());
    assert!(ledger.runs(o).await[0].is_open());

    // Second call finds nothing left to power off.
    assert!(trigger.power_off_account("acct-off", ts(7)).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn reconcile_all_visits_every_instance() -> anyhow::Result<()> {
    let ledger = ledger().await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        let i = aws_instance("acct-sweep");
        ids.push(i.instance_id);
        ledger.add_instance(i).await?;
    }
    // Appended behind the trigger's back (e.g. a raw backfill).
    ledger
        .append_events(&[NewEvent::power_on(ids[0], ts(0), "t3.micro")])
        .await?;

    let trigger = IngestionTrigger::sync(ledger.clone(), fast_retry(1));
    let out = trigger.reconcile_all().await?;
    assert_eq!(out.len(), 3);
    for id in &ids {
        assert_eq!(ledger.reconcile_calls(*id).await, 1);
    }
    assert_eq!(ledger.runs(ids[0]).await.len(), 1);

    // Nothing new: second sweep reports no change.
    for d in trigger.reconcile_all().await? {
        let Dispatched::Reconciled(s) = d else {
            panic!("expected inline reconcile");
        };
        assert!(!s.changed);
    }
    Ok(())
}

#[tokio::test]
async fn unknown_instance_reconcile_is_not_found() {
    let ledger = ledger().await;
    let trigger = IngestionTrigger::sync(ledger, fast_retry(3));
    let id = uuid::Uuid::new_v4();
    let d = trigger.reconcile(id).await;
    assert_eq!(
        d,
        Dispatched::Failed {
            instance_id: id,
            error: ReconcileError::InstanceNotFound(id)
        }
    );
}
