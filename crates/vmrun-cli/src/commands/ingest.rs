//! Ingestion command handlers: `event record`, `event import`,
//! `account power-off` and `reconcile`.
//!
//! Every path appends first, then hands the affected instances to the
//! trigger built from config (`reconcile.mode`).

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use vmrun_config::LedgerConfig;
use vmrun_schemas::{EventType, NewEvent};

use super::{build_trigger, finish_trigger, parse_ts, parse_uuid, print_dispatched};

// ---------------------------------------------------------------------------
// event record
// ---------------------------------------------------------------------------

/// Validated before any connection is opened.
pub fn build_event(
    instance_id: &str,
    event_type: &str,
    at: &str,
    profile: Option<String>,
) -> Result<NewEvent> {
    let ev = NewEvent {
        instance_id: parse_uuid(instance_id, "--instance-id")?,
        event_type: EventType::parse(event_type).context("invalid --type")?,
        occurred_at: parse_ts(at, "--at")?,
        profile_id: profile,
        provider_fields: None,
    };
    ev.validate().context("event rejected")?;
    Ok(ev)
}

pub async fn event_record(cfg: &LedgerConfig, ev: NewEvent) -> Result<()> {
    let trigger = build_trigger(cfg).await?;
    let (stored, dispatched) = trigger.record_event(ev).await?;

    println!("event_seq={}", stored.event_seq);
    println!("instance_id={}", stored.instance_id);
    println!("event_type={}", stored.event_type);
    println!("occurred_at={}", stored.occurred_at.to_rfc3339());
    print_dispatched(&dispatched);

    finish_trigger(trigger, std::slice::from_ref(&dispatched)).await
}

// ---------------------------------------------------------------------------
// event import
// ---------------------------------------------------------------------------

pub async fn event_import(cfg: &LedgerConfig, csv_path: &Path) -> Result<()> {
    // Parse the whole file first; a bad row aborts before anything is stored.
    let events = vmrun_db::read_events_csv(csv_path)?;
    println!("rows_read={}", events.len());

    let trigger = build_trigger(cfg).await?;
    let dispatched = trigger.record_batch(&events).await?;

    println!("events_appended={}", events.len());
    println!("instances_affected={}", dispatched.len());
    for d in &dispatched {
        print_dispatched(d);
    }

    finish_trigger(trigger, &dispatched).await
}

// ---------------------------------------------------------------------------
// account power-off
// ---------------------------------------------------------------------------

pub async fn account_power_off(cfg: &LedgerConfig, account: &str, at: Option<String>) -> Result<()> {
    let at = match at {
        Some(raw) => parse_ts(&raw, "--at")?,
        None => Utc::now(),
    };

    let trigger = build_trigger(cfg).await?;
    let dispatched = trigger.power_off_account(account, at).await?;

    println!("account_ref={}", account);
    println!("powered_off={}", dispatched.len());
    println!("at={}", at.to_rfc3339());
    for d in &dispatched {
        print_dispatched(d);
    }

    finish_trigger(trigger, &dispatched).await
}

// ---------------------------------------------------------------------------
// reconcile
// ---------------------------------------------------------------------------

pub async fn reconcile(cfg: &LedgerConfig, instance_id: Option<String>, all: bool) -> Result<()> {
    let target = match instance_id {
        Some(raw) if !all => Some(parse_uuid(&raw, "--instance-id")?),
        _ => None,
    };

    let trigger = build_trigger(cfg).await?;
    let dispatched = match target {
        Some(id) => vec![trigger.reconcile(id).await],
        None => trigger.reconcile_all().await?,
    };

    println!("instances={}", dispatched.len());
    for d in &dispatched {
        print_dispatched(d);
    }

    finish_trigger(trigger, &dispatched).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "5f0c7d8e-3b1a-4c39-9d1e-2a7b6c5d4e3f";

    #[test]
    fn build_event_accepts_power_on_with_profile() {
        let ev = build_event(ID, "power_on", "2024-06-01T00:00:00Z", Some("m5.large".into())).unwrap();
        assert_eq!(ev.event_type, EventType::PowerOn);
        assert_eq!(ev.profile_id.as_deref(), Some("m5.large"));
    }

    #[test]
    fn build_event_rejects_power_off_with_profile() {
        let err =
            build_event(ID, "power_off", "2024-06-01T00:00:00Z", Some("m5.large".into())).unwrap_err();
        assert!(format!("{err:#}").contains("must not carry a hardware profile"));
    }

    #[test]
    fn build_event_rejects_attribute_change_without_profile() {
        let err = build_event(ID, "attribute_change", "2024-06-01T00:00:00Z", None).unwrap_err();
        assert!(format!("{err:#}").contains("require a hardware profile"));
    }

    #[test]
    fn build_event_rejects_unknown_type() {
        let err = build_event(ID, "reboot", "2024-06-01T00:00:00Z", None).unwrap_err();
        assert!(format!("{err:#}").contains("unknown event type 'reboot'"));
    }
}
