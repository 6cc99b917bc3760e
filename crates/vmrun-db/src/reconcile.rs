use std::time::Instant;

use anyhow::Context;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;
use vmrun_reconcile::{
    referenced_profiles, replay_checked, CatalogSnapshot, ReconcileError, ReconcileSummary,
};
use vmrun_schemas::Run;

use crate::catalog::catalog_lookup_many_in;
use crate::error::store_failure;
use crate::events::fetch_event_history_in;
use crate::instances::list_instance_ids;
use crate::runs::{fetch_runs_in, replace_runs_in};

/// Rebuild the run set of one instance from its full event history.
///
/// One transaction: lock the instance row, read history and catalog, replay,
/// validate, replace runs, commit. Any error rolls back and leaves the
/// previously stored runs untouched.
#[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
pub async fn reconcile_instance(
    pool: &PgPool,
    instance_id: Uuid,
) -> Result<ReconcileSummary, ReconcileError> {
    let started = Instant::now();

    let mut tx = pool
        .begin()
        .await
        .context("begin reconcile tx failed")
        .map_err(|e| store_failure(instance_id, e))?;

    if !lock_instance(&mut tx, instance_id)
        .await
        .map_err(|e| store_failure(instance_id, e))?
    {
        return Err(ReconcileError::InstanceNotFound(instance_id));
    }

    let events = fetch_event_history_in(&mut tx, instance_id)
        .await
        .map_err(|e| store_failure(instance_id, e))?;

    let profiles = catalog_lookup_many_in(&mut tx, &referenced_profiles(&events))
        .await
        .map_err(|e| store_failure(instance_id, e))?;
    let catalog = CatalogSnapshot::from_profiles(&profiles);

    let outcome = replay_checked(instance_id, &events, &catalog)?;

    let stored = fetch_runs_in(&mut tx, instance_id)
        .await
        .map_err(|e| store_failure(instance_id, e))?;
    let changed = !same_run_set(&stored, &outcome.runs);

    if changed {
        replace_runs_in(&mut tx, instance_id, &outcome.runs)
            .await
            .map_err(|e| store_failure(instance_id, e))?;
    }

    tx.commit()
        .await
        .context("commit reconcile tx failed")
        .map_err(|e| store_failure(instance_id, e))?;

    for notice in &outcome.notices {
        warn!(%instance_id, notice = %notice, "replay notice");
    }

    let summary = ReconcileSummary::from_outcome(&outcome, changed);
    info!(
        %instance_id,
        events = events.len(),
        runs = summary.runs,
        open_run = summary.open_run,
        changed = summary.changed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "reconciled"
    );
    Ok(summary)
}

/// Reconcile every registered instance, one at a time.
///
/// Failures do not stop the sweep; each instance's result is returned.
pub async fn reconcile_all(
    pool: &PgPool,
) -> anyhow::Result<Vec<(Uuid, Result<ReconcileSummary, ReconcileError>)>> {
    let ids = list_instance_ids(pool).await?;
    let mut results = Vec::with_capacity(ids.len());
    for id in ids {
        let res = reconcile_instance(pool, id).await;
        results.push((id, res));
    }
    Ok(results)
}

/// `select ... for no key update` on the instance row. Serializes concurrent
/// passes for the same instance until the surrounding transaction ends.
/// Event inserts only take `for key share` through the foreign key, so
/// ingestion is not blocked by a pass in flight.
async fn lock_instance(conn: &mut PgConnection, instance_id: Uuid) -> anyhow::Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select instance_id
        from instances
        where instance_id = $1
        for no key update
        "#,
    )
    .bind(instance_id)
    .fetch_optional(&mut *conn)
    .await
    .context("lock instance row failed")?;
    Ok(row.is_some())
}

/// Order-insensitive comparison of two run sets.
fn same_run_set(a: &[Run], b: &[Run]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<&Run> = a.iter().collect();
    let mut b: Vec<&Run> = b.iter().collect();
    a.sort_by_key(|r| (r.start_time, r.end_time, r.run_id));
    b.sort_by_key(|r| (r.start_time, r.end_time, r.run_id));
    a == b
}
