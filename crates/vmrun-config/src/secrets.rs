//! Runtime secret resolution.
//!
//! Config YAML stores env var NAMES only (`database.url_env`). The value is
//! read from the process environment at call time and never logged.

use std::fmt;

use anyhow::{bail, Result};

use crate::LedgerConfig;

/// Resolved database URL. `Debug` redacts the value.
#[derive(Clone)]
pub struct DatabaseUrl {
    /// Name of the env var the URL came from (safe to log).
    pub env_var: String,
    value: String,
}

impl DatabaseUrl {
    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseUrl")
            .field("env_var", &self.env_var)
            .field("value", &"<REDACTED>")
            .finish()
    }
}

/// Read the URL from the env var named by `database.url_env`.
///
/// Errors name the variable, never its content.
pub fn resolve_database_url(cfg: &LedgerConfig) -> Result<DatabaseUrl> {
    let var = cfg.database.url_env.as_str();
    match resolve_env(var) {
        Some(value) => Ok(DatabaseUrl {
            env_var: var.to_string(),
            value,
        }),
        None => bail!("missing required env var {var} (database.url_env)"),
    }
}

/// Non-empty env var value, if set.
fn resolve_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}
