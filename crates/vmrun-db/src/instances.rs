use anyhow::{anyhow, Context, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;
use vmrun_schemas::{Instance, ProviderRef};

/// Register an instance. Fails if the id already exists.
pub async fn insert_instance(pool: &PgPool, inst: &Instance) -> Result<()> {
    let provider =
        serde_json::to_value(&inst.provider).context("serialize provider ref failed")?;

    sqlx::query(
        r#"
        insert into instances (instance_id, account_ref, provider, created_at)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(inst.instance_id)
    .bind(&inst.account_ref)
    .bind(provider)
    .bind(inst.created_at)
    .execute(pool)
    .await
    .context("insert_instance failed")?;

    Ok(())
}

pub async fn fetch_instance(pool: &PgPool, instance_id: Uuid) -> Result<Option<Instance>> {
    let row = sqlx::query(
        r#"
        select instance_id, account_ref, provider, created_at
        from instances
        where instance_id = $1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await
    .context("fetch_instance failed")?;

    let Some(row) = row else {
        return Ok(None);
    };

    let provider: serde_json::Value = row.try_get("provider")?;
    let provider: ProviderRef = serde_json::from_value(provider)
        .map_err(|e| anyhow!("instance {instance_id} has malformed provider ref: {e}"))?;

    Ok(Some(Instance {
        instance_id: row.try_get("instance_id")?,
        account_ref: row.try_get("account_ref")?,
        provider,
        created_at: row.try_get("created_at")?,
    }))
}

/// Every registered instance id, ascending.
pub async fn list_instance_ids(pool: &PgPool) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("select instance_id from instances order by instance_id asc")
            .fetch_all(pool)
            .await
            .context("list_instance_ids failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn instance_ids_for_account(pool: &PgPool, account_ref: &str) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        select instance_id
        from instances
        where account_ref = $1
        order by instance_id asc
        "#,
    )
    .bind(account_ref)
    .fetch_all(pool)
    .await
    .context("instance_ids_for_account failed")?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete an instance; its events and runs go with it (FK cascade).
/// Returns false when nothing was deleted.
pub async fn delete_instance(pool: &PgPool, instance_id: Uuid) -> Result<bool> {
    let res = sqlx::query("delete from instances where instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await
        .context("delete_instance failed")?;
    Ok(res.rows_affected() > 0)
}
