use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;
use vmrun_reconcile::{ReconcileError, ReconcileSummary};
use vmrun_schemas::{Event, NewEvent};

/// Storage seam for the ingestion side.
///
/// `reconcile` must be atomic per instance and safe to call concurrently for
/// the same instance (the store serializes it).
#[async_trait::async_trait]
pub trait LedgerBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Append all events or none. Returns the stored rows in input order.
    async fn append_events(&self, events: &[NewEvent]) -> Result<Vec<Event>>;

    async fn reconcile(&self, instance_id: Uuid) -> Result<ReconcileSummary, ReconcileError>;

    async fn latest_event(&self, instance_id: Uuid) -> Result<Option<Event>>;

    async fn instance_ids_for_account(&self, account_ref: &str) -> Result<Vec<Uuid>>;

    async fn list_instance_ids(&self) -> Result<Vec<Uuid>>;
}

/// Postgres-backed ledger.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl LedgerBackend for PgLedger {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn append_events(&self, events: &[NewEvent]) -> Result<Vec<Event>> {
        vmrun_db::insert_events_batch(&self.pool, events).await
    }

    async fn reconcile(&self, instance_id: Uuid) -> Result<ReconcileSummary, ReconcileError> {
        vmrun_db::reconcile_instance(&self.pool, instance_id).await
    }

    async fn latest_event(&self, instance_id: Uuid) -> Result<Option<Event>> {
        vmrun_db::latest_event(&self.pool, instance_id).await
    }

    async fn instance_ids_for_account(&self, account_ref: &str) -> Result<Vec<Uuid>> {
        vmrun_db::instance_ids_for_account(&self.pool, account_ref).await
    }

    async fn list_instance_ids(&self) -> Result<Vec<Uuid>> {
        vmrun_db::list_instance_ids(&self.pool).await
    }
}
