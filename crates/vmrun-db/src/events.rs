use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;
use vmrun_schemas::{Event, EventType, NewEvent};

/// Append one event. Returns the stored row (with `event_seq`).
pub async fn insert_event(pool: &PgPool, ev: &NewEvent) -> Result<Event> {
    let mut conn = pool.acquire().await.context("acquire connection failed")?;
    insert_event_in(&mut conn, ev).await
}

/// Append a batch in one transaction: all events land or none do.
/// Returns the stored rows in input order.
pub async fn insert_events_batch(pool: &PgPool, events: &[NewEvent]) -> Result<Vec<Event>> {
    let mut tx = pool.begin().await.context("begin event batch failed")?;
    let mut stored = Vec::with_capacity(events.len());
    for (i, ev) in events.iter().enumerate() {
        let row = insert_event_in(&mut tx, ev)
            .await
            .with_context(|| format!("event batch row {i} rejected"))?;
        stored.push(row);
    }
    tx.commit().await.context("commit event batch failed")?;
    Ok(stored)
}

async fn insert_event_in(conn: &mut PgConnection, ev: &NewEvent) -> Result<Event> {
    ev.validate()
        .with_context(|| format!("invalid {} event for {}", ev.event_type, ev.instance_id))?;

    let row = sqlx::query(
        r#"
        insert into instance_events (
          instance_id, event_type, occurred_at, profile_id, provider_fields
        ) values (
          $1, $2, $3, $4, $5
        )
        returning event_seq, instance_id, event_type, occurred_at, profile_id,
                  provider_fields, created_at
        "#,
    )
    .bind(ev.instance_id)
    .bind(ev.event_type.as_str())
    .bind(ev.occurred_at)
    .bind(&ev.profile_id)
    .bind(&ev.provider_fields)
    .fetch_one(&mut *conn)
    .await
    .context("insert_event failed")?;

    event_from_row(&row)
}

/// Full history of one instance in replay order `(occurred_at, event_seq)`.
pub async fn fetch_event_history(pool: &PgPool, instance_id: Uuid) -> Result<Vec<Event>> {
    let mut conn = pool.acquire().await.context("acquire connection failed")?;
    fetch_event_history_in(&mut conn, instance_id).await
}

pub(crate) async fn fetch_event_history_in(
    conn: &mut PgConnection,
    instance_id: Uuid,
) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        r#"
        select event_seq, instance_id, event_type, occurred_at, profile_id,
               provider_fields, created_at
        from instance_events
        where instance_id = $1
        order by occurred_at asc, event_seq asc
        "#,
    )
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await
    .context("fetch_event_history failed")?;

    rows.iter().map(event_from_row).collect()
}

/// Most recent event in replay order, if any.
pub async fn latest_event(pool: &PgPool, instance_id: Uuid) -> Result<Option<Event>> {
    let row = sqlx::query(
        r#"
        select event_seq, instance_id, event_type, occurred_at, profile_id,
               provider_fields, created_at
        from instance_events
        where instance_id = $1
        order by occurred_at desc, event_seq desc
        limit 1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await
    .context("latest_event failed")?;

    row.as_ref().map(event_from_row).transpose()
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    let event_type: String = row.try_get("event_type")?;
    Ok(Event {
        event_seq: row.try_get("event_seq")?,
        instance_id: row.try_get("instance_id")?,
        event_type: EventType::parse(&event_type)?,
        occurred_at: row.try_get("occurred_at")?,
        profile_id: row.try_get("profile_id")?,
        provider_fields: row.try_get("provider_fields")?,
        created_at: row.try_get("created_at")?,
    })
}
