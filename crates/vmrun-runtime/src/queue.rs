//! Per-instance reconcile work queue.
//!
//! - At most one pass per instance is in flight at any time.
//! - Enqueueing an instance that is already queued is a no-op; enqueueing one
//!   that is in flight schedules exactly one more pass after the current one.
//! - Different instances run in parallel across `workers` tokio tasks.
//! - Transient failures are retried per `RetryPolicy`; final failures are kept
//!   until `drain_failures` is called. A pass that panics counts as a failure.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;
use vmrun_config::ReconcileSettings;
use vmrun_reconcile::ReconcileError;

use crate::retry::{reconcile_with_retry, Attempted, RetryPolicy};
use crate::LedgerBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl QueueSettings {
    pub fn from_settings(s: &ReconcileSettings) -> Self {
        Self {
            workers: s.workers.max(1),
            retry: RetryPolicy::from_settings(s),
        }
    }
}

/// A pass that did not succeed within its attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedReconcile {
    pub instance_id: Uuid,
    pub attempts: u32,
    pub error: ReconcileError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: usize,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    queued: HashSet<Uuid>,
    in_flight: HashSet<Uuid>,
    rerun: HashSet<Uuid>,
    failures: Vec<FailedReconcile>,
    completed: u64,
    shutdown: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

struct Shared {
    backend: Arc<dyn LedgerBackend>,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
    work: Notify,
    idle: Notify,
}

pub struct ReconcileQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReconcileQueue {
    /// Spawn the worker tasks. Must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn LedgerBackend>, settings: QueueSettings) -> Self {
        let shared = Arc::new(Shared {
            backend,
            retry: settings.retry,
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            idle: Notify::new(),
        });

        let handles = (0..settings.workers.max(1))
            .map(|worker| {
                let shared = Arc::clone(&shared);
                tokio::spawn(worker_loop(shared, worker))
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Schedule a pass for `instance_id`. Returns false after shutdown.
    pub async fn enqueue(&self, instance_id: Uuid) -> bool {
        let mut st = self.shared.state.lock().await;
        if st.shutdown {
            return false;
        }
        if st.in_flight.contains(&instance_id) {
            st.rerun.insert(instance_id);
            debug!(%instance_id, "in flight; rerun scheduled");
        } else if st.queued.insert(instance_id) {
            st.pending.push_back(instance_id);
            self.shared.work.notify_one();
        }
        true
    }

    /// Resolve once nothing is pending or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.state.lock().await.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub async fn stats(&self) -> QueueStats {
        let st = self.shared.state.lock().await;
        QueueStats {
            pending: st.pending.len(),
            in_flight: st.in_flight.len(),
            completed: st.completed,
            failed: st.failures.len(),
        }
    }

    /// Take the retained failures, oldest first.
    pub async fn drain_failures(&self) -> Vec<FailedReconcile> {
        std::mem::take(&mut self.shared.state.lock().await.failures)
    }

    /// Stop accepting work, let workers finish what is queued, join them.
    pub async fn shutdown(&self) {
        self.shared.state.lock().await.shutdown = true;
        self.shared.work.notify_waiters();

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for (worker, h) in handles.into_iter().enumerate() {
            if let Err(e) = h.await {
                error!(worker, error = %e, "reconcile queue worker did not exit cleanly");
            }
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    loop {
        // Register before looking at the queue so an enqueue in between is
        // not missed.
        let mut notified = Box::pin(shared.work.notified());
        notified.as_mut().enable();

        let next = {
            let mut st = shared.state.lock().await;
            match st.pending.pop_front() {
                Some(id) => {
                    st.queued.remove(&id);
                    st.in_flight.insert(id);
                    Some(id)
                }
                None if st.shutdown => return,
                None => None,
            }
        };

        let Some(instance_id) = next else {
            notified.await;
            continue;
        };
        drop(notified);

        // Own task so a panicking pass still clears `in_flight`.
        let pass = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                reconcile_with_retry(shared.backend.as_ref(), instance_id, shared.retry).await
            }
        });
        let attempted = match pass.await {
            Ok(attempted) => attempted,
            Err(e) => {
                error!(worker, %instance_id, error = %e, "reconcile pass aborted");
                Attempted {
                    instance_id,
                    attempts: 1,
                    result: Err(ReconcileError::failed(
                        instance_id,
                        format!("reconcile pass aborted: {e}"),
                    )),
                }
            }
        };

        let mut st = shared.state.lock().await;
        st.in_flight.remove(&instance_id);
        match attempted.result {
            Ok(summary) => {
                st.completed += 1;
                debug!(worker, %instance_id, runs = summary.runs, "queued reconcile done");
            }
            Err(error) => st.failures.push(FailedReconcile {
                instance_id,
                attempts: attempted.attempts,
                error,
            }),
        }

        if st.rerun.remove(&instance_id) && st.queued.insert(instance_id) {
            st.pending.push_back(instance_id);
            shared.work.notify_one();
        }

        if st.is_idle() {
            debug!(completed = st.completed, failed = st.failures.len(), "reconcile queue idle");
            shared.idle.notify_waiters();
        }
    }
}
