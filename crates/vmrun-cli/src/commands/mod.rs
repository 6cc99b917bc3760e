//! Command handler modules for vmrun-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod ingest;
pub mod ledger;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use vmrun_config::{report_unused_keys, LedgerConfig, UnusedKeyPolicy};
use vmrun_runtime::{Dispatched, IngestionTrigger, PgLedger};

// ---------------------------------------------------------------------------
// Config + connections
// ---------------------------------------------------------------------------

/// Load `--config` layers into the typed ledger view. No paths means defaults.
pub fn load_ledger_config(paths: &[String], strict: bool) -> Result<LedgerConfig> {
    if paths.is_empty() {
        return Ok(LedgerConfig::default());
    }

    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = vmrun_config::load_layered_yaml(&path_refs)?;

    let policy = if strict {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let report = report_unused_keys(&loaded.config_json, policy)?;
    if !report.is_clean() {
        eprintln!(
            "WARN: CONFIG_UNUSED_KEYS unused_leaf_keys={}",
            report.unused_leaf_pointers.len()
        );
        for p in report.unused_leaf_pointers.iter().take(50) {
            eprintln!("  unused={}", p);
        }
        let extra = report.unused_leaf_pointers.len().saturating_sub(50);
        if extra > 0 {
            eprintln!("  ... and {} more", extra);
        }
    }

    loaded.ledger()
}

/// Connect using the env var named by `database.url_env`.
pub async fn connect(cfg: &LedgerConfig) -> Result<PgPool> {
    let url = vmrun_config::resolve_database_url(cfg)?;
    tracing::debug!(env_var = %url.env_var, "connecting to Postgres");
    vmrun_db::connect(url.expose(), cfg.database.max_connections).await
}

/// Postgres-backed trigger in the dispatch mode the config selects.
pub async fn build_trigger(cfg: &LedgerConfig) -> Result<IngestionTrigger> {
    let pool = connect(cfg).await?;
    let backend = Arc::new(PgLedger::new(pool));
    Ok(IngestionTrigger::from_settings(backend, &cfg.reconcile))
}

/// Wait out queued work, stop the trigger and fail if any instance could not
/// be reconciled.
pub async fn finish_trigger(trigger: IngestionTrigger, dispatched: &[Dispatched]) -> Result<()> {
    let mut failed = 0usize;
    for d in dispatched {
        if let Dispatched::Failed { instance_id, error } = d {
            println!("reconcile_failed=true instance_id={} error={}", instance_id, error);
            failed += 1;
        }
    }

    if let Some(q) = trigger.queue() {
        q.wait_idle().await;
        let stats = q.stats().await;
        println!("queue_completed={}", stats.completed);
        for f in q.drain_failures().await {
            println!(
                "reconcile_failed=true instance_id={} attempts={} error={}",
                f.instance_id, f.attempts, f.error
            );
            failed += 1;
        }
    }
    trigger.shutdown().await;

    if failed > 0 {
        anyhow::bail!(
            "{} instance(s) failed to reconcile; their events are stored, re-run `vmrun reconcile` once fixed",
            failed
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub fn print_dispatched(d: &Dispatched) {
    match d {
        Dispatched::Reconciled(s) => {
            println!(
                "reconciled=true instance_id={} runs={} open_run={} changed={} notices={}",
                s.instance_id,
                s.runs,
                s.open_run,
                s.changed,
                s.notices.len()
            );
            for n in &s.notices {
                println!("  notice={}", n);
            }
        }
        Dispatched::Queued(id) => println!("queued=true instance_id={}", id),
        // Reported by finish_trigger.
        Dispatched::Failed { .. } => {}
    }
}

pub fn opt_dt(dt: &Option<DateTime<Utc>>) -> String {
    dt.as_ref()
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| "".to_string())
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

pub fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid {} uuid: '{}'", what, raw))
}

/// RFC 3339 timestamp, normalized to UTC.
pub fn parse_ts(raw: &str, what: &str) -> Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("invalid {} timestamp '{}': expected RFC 3339", what, raw))?;
    Ok(dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ts_normalizes_offsets_to_utc() {
        let t = parse_ts("2024-06-01T02:00:00+02:00", "--at").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-06-01T00:00:00+00:00");
    }

    #[test]
    fn parse_ts_rejects_naive_times() {
        let err = parse_ts("2024-06-01 00:00:00", "--at").unwrap_err();
        assert!(err.to_string().contains("RFC 3339"));
    }

    #[test]
    fn empty_config_paths_mean_defaults() {
        let cfg = load_ledger_config(&[], true).unwrap();
        assert_eq!(cfg, LedgerConfig::default());
    }
}
