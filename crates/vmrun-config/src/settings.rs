//! Typed view over the merged config JSON.
//!
//! Every field has a default so an empty config is valid. Pointers read here
//! must be listed in `CONSUMED_POINTERS`.

use anyhow::{bail, Result};
use serde_json::Value;

pub const DEFAULT_URL_ENV: &str = "VMRUN_DATABASE_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Reconcile inline, before the ingestion call returns.
    Sync,
    /// Hand off to background workers.
    Queued,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileMode::Sync => "sync",
            ReconcileMode::Queued => "queued",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "sync" => Ok(ReconcileMode::Sync),
            "queued" => Ok(ReconcileMode::Queued),
            other => bail!("invalid reconcile.mode '{other}': expected sync | queued"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    /// Name of the env var holding the connection URL. Never the URL itself.
    pub url_env: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub mode: ReconcileMode,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub database: DatabaseSettings,
    pub reconcile: ReconcileSettings,
    pub logging: LoggingSettings,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseSettings {
                url_env: DEFAULT_URL_ENV.to_string(),
                max_connections: 10,
            },
            reconcile: ReconcileSettings {
                mode: ReconcileMode::Sync,
                workers: 4,
                max_attempts: 5,
                retry_backoff_ms: 200,
            },
            logging: LoggingSettings {
                filter: "info".to_string(),
            },
        }
    }
}

impl LedgerConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let mut cfg = LedgerConfig::default();

        if let Some(s) = read_str(v, "/database/url_env")? {
            if s.trim().is_empty() {
                bail!("database.url_env must not be empty");
            }
            cfg.database.url_env = s.trim().to_string();
        }
        if let Some(n) = read_u64(v, "/database/max_connections")? {
            if n == 0 {
                bail!("database.max_connections must be >= 1");
            }
            cfg.database.max_connections = n as u32;
        }

        if let Some(s) = read_str(v, "/reconcile/mode")? {
            cfg.reconcile.mode = ReconcileMode::parse(&s)?;
        }
        if let Some(n) = read_u64(v, "/reconcile/workers")? {
            if n == 0 {
                bail!("reconcile.workers must be >= 1");
            }
            cfg.reconcile.workers = n as usize;
        }
        if let Some(n) = read_u64(v, "/reconcile/max_attempts")? {
            if n == 0 {
                bail!("reconcile.max_attempts must be >= 1");
            }
            cfg.reconcile.max_attempts = n as u32;
        }
        if let Some(n) = read_u64(v, "/reconcile/retry_backoff_ms")? {
            cfg.reconcile.retry_backoff_ms = n;
        }

        if let Some(s) = read_str(v, "/logging/filter")? {
            cfg.logging.filter = s;
        }

        Ok(cfg)
    }
}

fn read_str(v: &Value, ptr: &str) -> Result<Option<String>> {
    match v.pointer(ptr) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => bail!("config {ptr} must be a string, got {other}"),
    }
}

fn read_u64(v: &Value, ptr: &str) -> Result<Option<u64>> {
    match v.pointer(ptr) {
        None | Some(Value::Null) => Ok(None),
        Some(x) => match x.as_u64() {
            Some(n) if n <= u32::MAX as u64 => Ok(Some(n)),
            _ => bail!("config {ptr} must be a non-negative integer, got {x}"),
        },
    }
}
