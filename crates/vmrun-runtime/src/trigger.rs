use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;
use vmrun_config::{ReconcileMode, ReconcileSettings};
use vmrun_reconcile::{ReconcileError, ReconcileSummary};
use vmrun_schemas::{Event, EventType, NewEvent};

use crate::queue::{QueueSettings, ReconcileQueue};
use crate::retry::{reconcile_with_retry, RetryPolicy};
use crate::LedgerBackend;

/// What happened to one affected instance after an append.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Reconciled inline before returning.
    Reconciled(ReconcileSummary),
    /// Handed to the background queue.
    Queued(Uuid),
    /// Inline reconcile failed after retries. The appended events are kept;
    /// a later pass picks them up.
    Failed {
        instance_id: Uuid,
        error: ReconcileError,
    },
}

impl Dispatched {
    pub fn instance_id(&self) -> Uuid {
        match self {
            Dispatched::Reconciled(s) => s.instance_id,
            Dispatched::Queued(id) => *id,
            Dispatched::Failed { instance_id, .. } => *instance_id,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Dispatched::Failed { .. })
    }
}

enum Mode {
    Sync(RetryPolicy),
    Queued(ReconcileQueue),
}

/// Appends events and makes sure every affected instance gets reconciled.
///
/// `Sync` reconciles before returning. `Queued` hands the instance ids to a
/// [`ReconcileQueue`] (at-least-once, coalesced per instance).
pub struct IngestionTrigger {
    backend: Arc<dyn LedgerBackend>,
    mode: Mode,
}

impl IngestionTrigger {
    pub fn sync(backend: Arc<dyn LedgerBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            mode: Mode::Sync(retry),
        }
    }

    /// Starts queue workers; must be called inside a tokio runtime.
    pub fn queued(backend: Arc<dyn LedgerBackend>, settings: QueueSettings) -> Self {
        let queue = ReconcileQueue::start(Arc::clone(&backend), settings);
        Self {
            backend,
            mode: Mode::Queued(queue),
        }
    }

    pub fn from_settings(backend: Arc<dyn LedgerBackend>, s: &ReconcileSettings) -> Self {
        match s.mode {
            ReconcileMode::Sync => Self::sync(backend, RetryPolicy::from_settings(s)),
            ReconcileMode::Queued => Self::queued(backend, QueueSettings::from_settings(s)),
        }
    }

    pub fn queue(&self) -> Option<&ReconcileQueue> {
        match &self.mode {
            Mode::Queued(q) => Some(q),
            Mode::Sync(_) => None,
        }
    }

    /// Append one event and reconcile its instance.
    pub async fn record_event(&self, ev: NewEvent) -> Result<(Event, Dispatched)> {
        let mut stored = self
            .backend
            .append_events(std::slice::from_ref(&ev))
            .await
            .context("record_event append failed")?;
        let event = stored
            .pop()
            .context("record_event: backend returned no stored row")?;
        let dispatched = self.dispatch(event.instance_id).await;
        Ok((event, dispatched))
    }

    /// Append a batch atomically, then reconcile each affected instance once
    /// (ascending instance id).
    pub async fn record_batch(&self, events: &[NewEvent]) -> Result<Vec<Dispatched>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.backend
            .append_events(events)
            .await
            .with_context(|| format!("record_batch append of {} events failed", events.len()))?;

        let affected: BTreeSet<Uuid> = events.iter().map(|e| e.instance_id).collect();
        info!(events = events.len(), instances = affected.len(), "batch appended");
        self.dispatch_all(affected).await
    }

    /// Append `power_off` at `at` for every instance of the account whose
    /// latest event is not already a `power_off`. Instances with no events are
    /// left alone. Returns the dispatch result per powered-off instance.
    pub async fn power_off_account(
        &self,
        account_ref: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Dispatched>> {
        let ids = self.backend.instance_ids_for_account(account_ref).await?;

        let mut batch = Vec::new();
        for id in ids {
            match self.backend.latest_event(id).await? {
                Some(last) if last.event_type != EventType::PowerOff => {
                    batch.push(NewEvent::power_off(id, at));
                }
                _ => {}
            }
        }

        info!(account_ref, instances = batch.len(), "powering off account instances");
        self.record_batch(&batch).await
    }

    /// Reconcile one instance without appending anything.
    pub async fn reconcile(&self, instance_id: Uuid) -> Dispatched {
        self.dispatch(instance_id).await
    }

    /// Reconcile every registered instance.
    pub async fn reconcile_all(&self) -> Result<Vec<Dispatched>> {
        let ids = self.backend.list_instance_ids().await?;
        self.dispatch_all(ids).await
    }

    /// Stop queue workers after they drain. No-op in sync mode.
    pub async fn shutdown(&self) {
        if let Mode::Queued(q) = &self.mode {
            q.shutdown().await;
        }
    }

    async fn dispatch_all(&self, ids: impl IntoIterator<Item = Uuid>) -> Result<Vec<Dispatched>> {
        let mut out = Vec::new();
        for id in ids {
            out.push(self.dispatch(id).await);
        }
        Ok(out)
    }

    async fn dispatch(&self, instance_id: Uuid) -> Dispatched {
        match &self.mode {
            Mode::Sync(policy) => {
                let attempted =
                    reconcile_with_retry(self.backend.as_ref(), instance_id, *policy).await;
                match attempted.result {
                    Ok(summary) => Dispatched::Reconciled(summary),
                    Err(error) => Dispatched::Failed { instance_id, error },
                }
            }
            Mode::Queued(q) => {
                if !q.enqueue(instance_id).await {
                    warn!(%instance_id, "reconcile queue is shut down; instance not scheduled");
                    return Dispatched::Failed {
                        instance_id,
                        error: ReconcileError::failed(instance_id, "reconcile queue is shut down"),
                    };
                }
                Dispatched::Queued(instance_id)
            }
        }
    }
}
