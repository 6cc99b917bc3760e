use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool, Row};
use vmrun_reconcile::CatalogSnapshot;
use vmrun_schemas::HardwareProfile;

/// Insert profile definitions that are not present yet. Existing rows are
/// never overwritten. Returns how many rows were inserted.
pub async fn catalog_insert_missing(pool: &PgPool, profiles: &[HardwareProfile]) -> Result<u64> {
    let mut tx = pool.begin().await.context("begin catalog insert failed")?;
    let mut inserted = 0u64;
    for p in profiles {
        let res = sqlx::query(
            r#"
            insert into hardware_profiles (profile_id, memory_gib, vcpu, provider)
            values ($1, $2, $3, $4)
            on conflict (profile_id) do nothing
            "#,
        )
        .bind(&p.profile_id)
        .bind(p.memory_gib)
        .bind(p.vcpu)
        .bind(&p.provider)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("catalog_insert_missing failed for {}", p.profile_id))?;
        inserted += res.rows_affected();
    }
    tx.commit().await.context("commit catalog insert failed")?;
    Ok(inserted)
}

/// Catalog rows for the given ids, sorted by `profile_id`. Unknown ids are
/// simply absent from the result.
pub async fn catalog_lookup_many(
    pool: &PgPool,
    profile_ids: &[String],
) -> Result<Vec<HardwareProfile>> {
    let mut conn = pool.acquire().await.context("acquire connection failed")?;
    catalog_lookup_many_in(&mut conn, profile_ids).await
}

pub(crate) async fn catalog_lookup_many_in(
    conn: &mut PgConnection,
    profile_ids: &[String],
) -> Result<Vec<HardwareProfile>> {
    if profile_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        select profile_id, memory_gib, vcpu, provider
        from hardware_profiles
        where profile_id = any($1)
        order by profile_id asc
        "#,
    )
    .bind(profile_ids)
    .fetch_all(&mut *conn)
    .await
    .context("catalog_lookup_many failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(HardwareProfile {
            profile_id: row.try_get("profile_id")?,
            memory_gib: row.try_get("memory_gib")?,
            vcpu: row.try_get("vcpu")?,
            provider: row.try_get("provider")?,
        });
    }
    Ok(out)
}

/// Snapshot holding only the entries in `profile_ids`.
pub async fn catalog_snapshot(pool: &PgPool, profile_ids: &[String]) -> Result<CatalogSnapshot> {
    let rows = catalog_lookup_many(pool, profile_ids).await?;
    Ok(CatalogSnapshot::from_profiles(&rows))
}
