//! Scenario: queued reconciliation
//!
//! # Invariants under test
//!
//! - At most one pass per instance runs at a time, even with many workers and
//!   a backend that does not lock on its own.
//! - Repeated enqueues of one instance coalesce: one pending pass, plus at
//!   most one rerun scheduled while a pass is in flight.
//! - An event appended while a pass is in flight is still reflected once the
//!   queue goes idle (at-least-once).
//! - Transient failures are retried; exhausted ones are retained.
//! - A pass that panics is retained as a failure; the queue still goes idle
//!   and keeps serving other instances.

use std::sync::Arc;
use std::time::Duration;

use vmrun_reconcile::ReconcileError;
use vmrun_runtime::{
    Dispatched, IngestionTrigger, LedgerBackend, QueueSettings, ReconcileQueue, RetryPolicy,
};
use vmrun_schemas::NewEvent;
use vmrun_testkit::{aws_instance, standard_catalog, ts, MemoryLedger};

fn settings(workers: usize, max_attempts: u32) -> QueueSettings {
    QueueSettings {
        workers,
        retry: RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passes_for_one_instance_never_overlap() -> anyhow::Result<()> {
    let ledger = Arc::new(MemoryLedger::without_instance_locks());
    ledger.seed_catalog(&standard_catalog()).await;
    ledger.set_reconcile_delay(Duration::from_millis(20)).await;

    let inst = aws_instance("acct-q");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;
    ledger
        .append_events(&[NewEvent::power_on(id, ts(0), "m5.large")])
        .await?;

    let queue = ReconcileQueue::start(ledger.clone(), settings(4, 1));
    for _ in 0..10 {
        assert!(queue.enqueue(id).await);
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    queue.wait_idle().await;

    assert_eq!(ledger.max_concurrent_reconciles(id).await, 1);
    let calls = ledger.reconcile_calls(id).await;
    assert!(
        (1..=10).contains(&calls),
        "enqueues must coalesce, got {calls} passes"
    );
    assert_eq!(ledger.runs(id).await.len(), 1);

    let stats = queue.stats().await;
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.completed, calls as u64);

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_enqueues_coalesces_to_at_most_two_passes() -> anyhow::Result<()> {
    let ledger = Arc::new(MemoryLedger::without_instance_locks());
    ledger.set_reconcile_delay(Duration::from_millis(50)).await;
    let inst = aws_instance("acct-q");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;

    let queue = ReconcileQueue::start(ledger.clone(), settings(2, 1));
    // No awaits between enqueues that could let a pass finish.
    for _ in 0..20 {
        queue.enqueue(id).await;
    }
    queue.wait_idle().await;

    let calls = ledger.reconcile_calls(id).await;
    assert!((1..=2).contains(&calls), "got {calls} passes");
    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_appended_mid_pass_is_picked_up() -> anyhow::Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.seed_catalog(&standard_catalog()).await;
    ledger.set_reconcile_delay(Duration::from_millis(40)).await;

    let inst = aws_instance("acct-q");
    let id = inst.instance_id;
    ledger.add_instance(inst).await?;

    let trigger = IngestionTrigger::queued(ledger.clone(), settings(2, 1));
    let (_, d) = trigger
        .record_event(NewEvent::power_on(id, ts(0), "m5.large"))
        .await?;
    assert_eq!(d, Dispatched::Queued(id));

    tokio::time::sleep(Duration::from_millis(10)).await;
    trigger
        .record_event(NewEvent::power_off(id, ts(2)))
        .await?;

    let queue = trigger.queue().expect("queued mode exposes its queue");
    queue.wait_idle().await;

    let runs = ledger.runs(id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].end_time, Some(ts(2)));

    trigger.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn transient_errors_are_retried_then_retained() -> anyhow::Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let ok = aws_instance("acct-q");
    let id = ok.instance_id;
    ledger.add_instance(ok).await?;

    let queue = ReconcileQueue::start(ledger.clone(), settings(1, 3));

    ledger.fail_next_reconciles(2).await;
    queue.enqueue(id).await;
    queue.wait_idle().await;
    assert_eq!(ledger.reconcile_calls(id).await, 3);
    assert!(queue.drain_failures().await.is_empty());

    ledger.fail_next_reconciles(100).await;
    queue.enqueue(id).await;
    queue.wait_idle().await;

    let failures = queue.drain_failures().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].instance_id, id);
    assert_eq!(failures[0].attempts, 3);
    assert!(matches!(failures[0].error, ReconcileError::TransientStore(_)));
    // Drained.
    assert!(queue.drain_failures().await.is_empty());

    queue.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_pass_is_retained_and_queue_goes_idle() -> anyhow::Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.seed_catalog(&standard_catalog()).await;

    let broken = aws_instance("acct-q");
    let healthy = aws_instance("acct-q");
    let (broken_id, healthy_id) = (broken.instance_id, healthy.instance_id);
    ledger.add_instance(broken).await?;
    ledger.add_instance(healthy).await?;
    ledger
        .append_events(&[
            NewEvent::power_on(broken_id, ts(0), "m5.large"),
            NewEvent::power_on(healthy_id, ts(0), "t3.micro"),
        ])
        .await?;
    ledger.panic_on_reconcile(broken_id).await;

    let queue = ReconcileQueue::start(ledger.clone(), settings(1, 3));
    queue.enqueue(broken_id).await;
    queue.enqueue(healthy_id).await;
    tokio::time::timeout(Duration::from_secs(5), queue.wait_idle()).await?;

    let failures = queue.drain_failures().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].instance_id, broken_id);
    assert!(matches!(
        &failures[0].error,
        ReconcileError::ReconciliationFailed { reason, .. } if reason.contains("aborted")
    ));
    assert!(ledger.runs(broken_id).await.is_empty());
    assert_eq!(ledger.runs(healthy_id).await.len(), 1);

    // The single worker survived the panic.
    ledger
        .append_events(&[NewEvent::power_off(healthy_id, ts(2))])
        .await?;
    queue.enqueue(healthy_id).await;
    tokio::time::timeout(Duration::from_secs(5), queue.wait_idle()).await?;
    assert_eq!(ledger.runs(healthy_id).await[0].end_time, Some(ts(2)));

    queue.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn enqueue_after_shutdown_is_refused() -> anyhow::Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let queue = ReconcileQueue::start(ledger, settings(2, 1));
    queue.shutdown().await;
    assert!(!queue.enqueue(uuid::Uuid::new_v4()).await);
    Ok(())
}
