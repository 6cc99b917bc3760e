use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;
use vmrun_schemas::Run;

const RUN_COLUMNS: &str =
    "run_id, instance_id, start_time, end_time, instance_type, memory_gib, vcpu";

/// Stored runs of one instance, ordered by `start_time`.
pub async fn fetch_runs(pool: &PgPool, instance_id: Uuid) -> Result<Vec<Run>> {
    let mut conn = pool.acquire().await.context("acquire connection failed")?;
    fetch_runs_in(&mut conn, instance_id).await
}

pub(crate) async fn fetch_runs_in(conn: &mut PgConnection, instance_id: Uuid) -> Result<Vec<Run>> {
    let sql = format!(
        "select {RUN_COLUMNS} from instance_runs where instance_id = $1 order by start_time asc, end_time asc nulls last"
    );
    let rows = sqlx::query(&sql)
        .bind(instance_id)
        .fetch_all(&mut *conn)
        .await
        .context("fetch_runs failed")?;

    rows.iter().map(run_from_row).collect()
}

/// Runs intersecting `[start, end)` across all instances. Open runs count as
/// unbounded on the right.
pub async fn fetch_runs_overlapping(
    pool: &PgPool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Run>> {
    let sql = format!(
        r#"
        select {RUN_COLUMNS}
        from instance_runs
        where start_time < $2
          and (end_time is null or end_time > $1)
        order by instance_id asc, start_time asc
        "#
    );
    let rows = sqlx::query(&sql)
        .bind(start)
        .bind(end)
        .fetch_all(pool)
        .await
        .context("fetch_runs_overlapping failed")?;

    rows.iter().map(run_from_row).collect()
}

/// Instances with an open run that started at or before `since`.
pub async fn instances_running_since(pool: &PgPool, since: DateTime<Utc>) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        select instance_id
        from instance_runs
        where end_time is null
          and start_time <= $1
        order by instance_id asc
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await
    .context("instances_running_since failed")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Replace the stored run set of one instance. Caller owns the transaction.
pub(crate) async fn replace_runs_in(
    conn: &mut PgConnection,
    instance_id: Uuid,
    runs: &[Run],
) -> Result<()> {
    sqlx::query("delete from instance_runs where instance_id = $1")
        .bind(instance_id)
        .execute(&mut *conn)
        .await
        .context("delete stale runs failed")?;

    for r in runs {
        sqlx::query(
            r#"
            insert into instance_runs (
              run_id, instance_id, start_time, end_time, instance_type, memory_gib, vcpu
            ) values (
              $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(r.run_id)
        .bind(r.instance_id)
        .bind(r.start_time)
        .bind(r.end_time)
        .bind(&r.instance_type)
        .bind(r.memory_gib)
        .bind(r.vcpu)
        .execute(&mut *conn)
        .await
        .context("insert run failed")?;
    }

    Ok(())
}

fn run_from_row(row: &PgRow) -> Result<Run> {
    Ok(Run {
        run_id: row.try_get("run_id")?,
        instance_id: row.try_get("instance_id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        instance_type: row.try_get("instance_type")?,
        memory_gib: row.try_get("memory_gib")?,
        vcpu: row.try_get("vcpu")?,
    })
}
