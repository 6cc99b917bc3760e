//! CSV backfill formats.
//!
//! events:  `instance_id,event_type,occurred_at,profile_id`
//!          (`occurred_at` RFC 3339, `profile_id` may be empty)
//! catalog: `profile_id,memory_gib,vcpu,provider`
//!          (`provider` may be empty)
//!
//! Parsing is all-or-nothing: the first bad row aborts with its line number,
//! so a backfill never lands half-applied.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;
use vmrun_schemas::{EventType, HardwareProfile, NewEvent};

use crate::catalog::catalog_insert_missing;

#[derive(Debug, Deserialize)]
struct CsvEventRow {
    instance_id: String,
    event_type: String,
    occurred_at: String,
    #[serde(default)]
    profile_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CsvProfileRow {
    profile_id: String,
    memory_gib: f64,
    vcpu: i32,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImportReport {
    pub rows_read: usize,
    /// Rows that were new. Existing definitions are left as they are.
    pub rows_inserted: u64,
}

pub fn parse_events_csv<R: Read>(reader: R) -> Result<Vec<NewEvent>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut out = Vec::new();

    for (i, rec) in rdr.deserialize::<CsvEventRow>().enumerate() {
        // Header is line 1.
        let line = i + 2;
        let row = rec.with_context(|| format!("events csv line {line}: malformed row"))?;

        let instance_id = Uuid::parse_str(row.instance_id.trim())
            .with_context(|| format!("events csv line {line}: bad instance_id"))?;
        let event_type = EventType::parse(&row.event_type)
            .with_context(|| format!("events csv line {line}"))?;
        let occurred_at = DateTime::parse_from_rfc3339(row.occurred_at.trim())
            .with_context(|| format!("events csv line {line}: bad occurred_at"))?
            .with_timezone(&Utc);
        let profile_id = row
            .profile_id
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let ev = NewEvent {
            instance_id,
            event_type,
            occurred_at,
            profile_id,
            provider_fields: None,
        };
        ev.validate()
            .with_context(|| format!("events csv line {line}"))?;
        out.push(ev);
    }

    Ok(out)
}

pub fn parse_catalog_csv<R: Read>(reader: R) -> Result<Vec<HardwareProfile>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut out = Vec::new();

    for (i, rec) in rdr.deserialize::<CsvProfileRow>().enumerate() {
        let line = i + 2;
        let row = rec.with_context(|| format!("catalog csv line {line}: malformed row"))?;

        let profile_id = row.profile_id.trim().to_string();
        if profile_id.is_empty() {
            return Err(anyhow!("catalog csv line {line}: empty profile_id"));
        }
        if !row.memory_gib.is_finite() || row.memory_gib < 0.0 {
            return Err(anyhow!("catalog csv line {line}: bad memory_gib"));
        }
        if row.vcpu < 0 {
            return Err(anyhow!("catalog csv line {line}: bad vcpu"));
        }

        out.push(HardwareProfile {
            profile_id,
            memory_gib: row.memory_gib,
            vcpu: row.vcpu,
            provider: row
                .provider
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
        });
    }

    Ok(out)
}

pub fn read_events_csv(path: &Path) -> Result<Vec<NewEvent>> {
    let file = File::open(path)
        .with_context(|| format!("open csv path failed: {}", path.display()))?;
    parse_events_csv(file)
}

pub fn read_catalog_csv(path: &Path) -> Result<Vec<HardwareProfile>> {
    let file = File::open(path)
        .with_context(|| format!("open csv path failed: {}", path.display()))?;
    parse_catalog_csv(file)
}

/// Load a catalog CSV and insert the definitions that are missing.
pub async fn import_catalog_csv(pool: &PgPool, path: &Path) -> Result<CatalogImportReport> {
    let profiles = read_catalog_csv(path)?;
    let rows_inserted = catalog_insert_missing(pool, &profiles).await?;
    Ok(CatalogImportReport {
        rows_read: profiles.len(),
        rows_inserted,
    })
}
