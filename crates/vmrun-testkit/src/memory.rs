use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vmrun_reconcile::{
    replay_checked, CatalogLookup, CatalogSnapshot, ProfileSpec, ReconcileError, ReconcileSummary,
};
use vmrun_runtime::LedgerBackend;
use vmrun_schemas::{Event, HardwareProfile, Instance, NewEvent, Run};

#[derive(Default)]
struct MemState {
    instances: BTreeMap<Uuid, Instance>,
    events: Vec<Event>,
    next_seq: i64,
    runs: HashMap<Uuid, Vec<Run>>,
    catalog: CatalogSnapshot,

    transient_failures: u32,
    permanent_failures: HashMap<Uuid, String>,
    panicking: HashSet<Uuid>,
    reconcile_delay: Duration,

    reconcile_calls: HashMap<Uuid, u32>,
    active: HashMap<Uuid, u32>,
    max_active: HashMap<Uuid, u32>,
}

/// In-process ledger with the same contract as the Postgres backend.
///
/// Extras for tests: fault injection (`fail_next_reconciles`,
/// `fail_instance`, `panic_on_reconcile`), a delay to widen race windows, and
/// counters that expose how often and how concurrently each instance was
/// reconciled.
pub struct MemoryLedger {
    state: Mutex<MemState>,
    /// Per-instance pass lock, the in-memory stand-in for
    /// `select ... for no key update`.
    instance_locks: Option<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            instance_locks: Some(Mutex::new(HashMap::new())),
        }
    }

    /// No per-instance lock: overlapping passes for one instance really
    /// overlap. Used to check that callers serialize on their own.
    pub fn without_instance_locks() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            instance_locks: None,
        }
    }

    pub async fn add_instance(&self, inst: Instance) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.instances.contains_key(&inst.instance_id) {
            return Err(anyhow!("instance {} already exists", inst.instance_id));
        }
        st.instances.insert(inst.instance_id, inst);
        Ok(())
    }

    /// Cascade: events and runs go with the instance.
    pub async fn delete_instance(&self, instance_id: Uuid) -> bool {
        let mut st = self.state.lock().await;
        let existed = st.instances.remove(&instance_id).is_some();
        st.events.retain(|e| e.instance_id != instance_id);
        st.runs.remove(&instance_id);
        existed
    }

    /// Insert-missing semantics: existing profiles are kept as they are.
    pub async fn seed_catalog(&self, profiles: &[HardwareProfile]) -> usize {
        let mut st = self.state.lock().await;
        let mut inserted = 0;
        for p in profiles {
            if st.catalog.lookup(&p.profile_id).is_none() {
                st.catalog.insert(
                    p.profile_id.clone(),
                    ProfileSpec {
                        memory_gib: p.memory_gib,
                        vcpu: p.vcpu,
                    },
                );
                inserted += 1;
            }
        }
        inserted
    }

    pub async fn runs(&self, instance_id: Uuid) -> Vec<Run> {
        let st = self.state.lock().await;
        st.runs.get(&instance_id).cloned().unwrap_or_default()
    }

    pub async fn events(&self, instance_id: Uuid) -> Vec<Event> {
        let st = self.state.lock().await;
        st.events
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect()
    }

    /// The next `n` reconcile calls (any instance) fail with `TransientStore`.
    pub async fn fail_next_reconciles(&self, n: u32) {
        self.state.lock().await.transient_failures = n;
    }

    /// Every reconcile of `instance_id` fails permanently with `reason`.
    pub async fn fail_instance(&self, instance_id: Uuid, reason: &str) {
        self.state
            .lock()
            .await
            .permanent_failures
            .insert(instance_id, reason.to_string());
    }

    /// Every reconcile of `instance_id` panics.
    pub async fn panic_on_reconcile(&self, instance_id: Uuid) {
        self.state.lock().await.panicking.insert(instance_id);
    }

    pub async fn set_reconcile_delay(&self, delay: Duration) {
        self.state.lock().await.reconcile_delay = delay;
    }

    pub async fn reconcile_calls(&self, instance_id: Uuid) -> u32 {
        let st = self.state.lock().await;
        st.reconcile_calls.get(&instance_id).copied().unwrap_or(0)
    }

    /// Highest number of overlapping reconcile passes seen for one instance.
    pub async fn max_concurrent_reconciles(&self, instance_id: Uuid) -> u32 {
        let st = self.state.lock().await;
        st.max_active.get(&instance_id).copied().unwrap_or(0)
    }

    async fn finish(&self, instance_id: Uuid) {
        let mut st = self.state.lock().await;
        if let Some(n) = st.active.get_mut(&instance_id) {
            *n = n.saturating_sub(1);
        }
    }
}

#[async_trait::async_trait]
impl LedgerBackend for MemoryLedger {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn append_events(&self, events: &[NewEvent]) -> Result<Vec<Event>> {
        let mut st = self.state.lock().await;

        // Validate the whole batch before touching anything.
        for (i, ev) in events.iter().enumerate() {
            ev.validate()
                .map_err(|e| anyhow!("event batch row {i} rejected: {e}"))?;
            if !st.instances.contains_key(&ev.instance_id) {
                return Err(anyhow!(
                    "event batch row {i} rejected: unknown instance {}",
                    ev.instance_id
                ));
            }
        }

        let now = Utc::now();
        let mut stored = Vec::with_capacity(events.len());
        for ev in events {
            st.next_seq += 1;
            let row = Event {
                event_seq: st.next_seq,
                instance_id: ev.instance_id,
                event_type: ev.event_type,
                occurred_at: ev.occurred_at,
                profile_id: ev.profile_id.clone(),
                provider_fields: ev.provider_fields.clone(),
                created_at: now,
            };
            st.events.push(row.clone());
            stored.push(row);
        }
        Ok(stored)
    }

    async fn reconcile(&self, instance_id: Uuid) -> Result<ReconcileSummary, ReconcileError> {
        let lock = match &self.instance_locks {
            Some(locks) => Some(Arc::clone(
                locks.lock().await.entry(instance_id).or_default(),
            )),
            None => None,
        };
        let _guard = match &lock {
            Some(l) => Some(l.lock().await),
            None => None,
        };

        let (history, catalog, delay) = {
            let mut st = self.state.lock().await;
            *st.reconcile_calls.entry(instance_id).or_default() += 1;

            if st.transient_failures > 0 {
                st.transient_failures -= 1;
                return Err(ReconcileError::TransientStore(
                    "injected: connection reset".to_string(),
                ));
            }
            if st.panicking.contains(&instance_id) {
                panic!("injected panic reconciling {instance_id}");
            }
            if let Some(reason) = st.permanent_failures.get(&instance_id) {
                return Err(ReconcileError::failed(instance_id, reason.clone()));
            }
            if !st.instances.contains_key(&instance_id) {
                return Err(ReconcileError::InstanceNotFound(instance_id));
            }

            let active = st.active.entry(instance_id).or_default();
            *active += 1;
            let now_active = *active;
            let max = st.max_active.entry(instance_id).or_default();
            *max = (*max).max(now_active);

            let history: Vec<Event> = st
                .events
                .iter()
                .filter(|e| e.instance_id == instance_id)
                .cloned()
                .collect();
            (history, st.catalog.clone(), st.reconcile_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let outcome = match replay_checked(instance_id, &history, &catalog) {
            Ok(o) => o,
            Err(e) => {
                self.finish(instance_id).await;
                return Err(e);
            }
        };

        let changed = {
            let mut st = self.state.lock().await;
            let slot = st.runs.entry(instance_id).or_default();
            let changed = *slot != outcome.runs;
            if changed {
                *slot = outcome.runs.clone();
            }
            changed
        };
        self.finish(instance_id).await;

        Ok(ReconcileSummary::from_outcome(&outcome, changed))
    }

    async fn latest_event(&self, instance_id: Uuid) -> Result<Option<Event>> {
        let st = self.state.lock().await;
        Ok(st
            .events
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .max_by_key(|e| e.replay_key())
            .cloned())
    }

    async fn instance_ids_for_account(&self, account_ref: &str) -> Result<Vec<Uuid>> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .values()
            .filter(|i| i.account_ref == account_ref)
            .map(|i| i.instance_id)
            .collect())
    }

    async fn list_instance_ids(&self) -> Result<Vec<Uuid>> {
        let st = self.state.lock().await;
        Ok(st.instances.keys().copied().collect())
    }
}
