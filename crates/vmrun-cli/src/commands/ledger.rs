//! Registry, catalog and run-store command handlers.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;
use vmrun_config::LedgerConfig;
use vmrun_schemas::{Instance, ProviderRef, Run};

use super::{connect, opt_dt, parse_ts, parse_uuid};

// ---------------------------------------------------------------------------
// instance add / delete
// ---------------------------------------------------------------------------

/// Build the provider reference from `--provider` plus its two identifiers.
///
/// `location` is the AWS region, Azure resource group or GCP zone.
pub fn build_provider(provider: &str, provider_id: &str, location: &str) -> Result<ProviderRef> {
    let provider_id = provider_id.trim().to_string();
    let location = location.trim().to_string();
    if provider_id.is_empty() || location.is_empty() {
        anyhow::bail!("--provider-id and --location must not be blank");
    }

    match provider.trim().to_lowercase().as_str() {
        "aws" => Ok(ProviderRef::Aws {
            instance_id: provider_id,
            region: location,
        }),
        "azure" => Ok(ProviderRef::Azure {
            vm_id: provider_id,
            resource_group: location,
        }),
        "gcp" => Ok(ProviderRef::Gcp {
            instance_id: provider_id,
            zone: location,
        }),
        other => anyhow::bail!(
            "invalid --provider '{}'. expected one of: aws | azure | gcp",
            other
        ),
    }
}

pub async fn instance_add(
    cfg: &LedgerConfig,
    account: String,
    provider: ProviderRef,
    instance_id: Option<String>,
) -> Result<()> {
    let instance_id = match instance_id {
        Some(raw) => parse_uuid(&raw, "--instance-id")?,
        None => Uuid::new_v4(),
    };
    let inst = Instance {
        instance_id,
        account_ref: account,
        provider,
        created_at: Utc::now(),
    };

    let pool = connect(cfg).await?;
    vmrun_db::insert_instance(&pool, &inst).await?;

    println!("instance_id={}", inst.instance_id);
    println!("account_ref={}", inst.account_ref);
    println!("cloud_type={}", inst.provider.cloud_type());
    println!("provider_instance_id={}", inst.provider.provider_instance_id());
    Ok(())
}

pub async fn instance_delete(cfg: &LedgerConfig, instance_id: &str) -> Result<()> {
    let id = parse_uuid(instance_id, "--instance-id")?;
    let pool = connect(cfg).await?;
    let deleted = vmrun_db::delete_instance(&pool, id).await?;
    if !deleted {
        anyhow::bail!("instance not found: {}", id);
    }
    println!("deleted=true instance_id={}", id);
    Ok(())
}

// ---------------------------------------------------------------------------
// catalog import
// ---------------------------------------------------------------------------

pub async fn catalog_import(cfg: &LedgerConfig, csv_path: &Path) -> Result<()> {
    let pool = connect(cfg).await?;
    let report = vmrun_db::import_catalog_csv(&pool, csv_path)
        .await
        .with_context(|| format!("catalog import failed: {}", csv_path.display()))?;
    println!("rows_read={}", report.rows_read);
    println!("rows_inserted={}", report.rows_inserted);
    println!(
        "rows_skipped={}",
        (report.rows_read as u64).saturating_sub(report.rows_inserted)
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

pub async fn runs_list(cfg: &LedgerConfig, instance_id: &str) -> Result<()> {
    let id = parse_uuid(instance_id, "--instance-id")?;
    let pool = connect(cfg).await?;
    if vmrun_db::fetch_instance(&pool, id).await?.is_none() {
        anyhow::bail!("instance not found: {}", id);
    }
    let runs = vmrun_db::fetch_runs(&pool, id).await?;
    println!("instance_id={} runs={}", id, runs.len());
    for r in &runs {
        print_run(r);
    }
    Ok(())
}

pub async fn runs_running_since(cfg: &LedgerConfig, at: &str) -> Result<()> {
    let since = parse_ts(at, "--at")?;
    let pool = connect(cfg).await?;
    let ids = vmrun_db::instances_running_since(&pool, since).await?;
    println!("running_since={} instances={}", since.to_rfc3339(), ids.len());
    for id in ids {
        println!("instance_id={}", id);
    }
    Ok(())
}

pub async fn runs_window(cfg: &LedgerConfig, from: &str, to: &str) -> Result<()> {
    let start = parse_ts(from, "--from")?;
    let end = parse_ts(to, "--to")?;
    if end <= start {
        anyhow::bail!("--to must be after --from");
    }
    let pool = connect(cfg).await?;
    let runs = vmrun_db::fetch_runs_overlapping(&pool, start, end).await?;
    println!(
        "window_start={} window_end={} runs={}",
        start.to_rfc3339(),
        end.to_rfc3339(),
        runs.len()
    );
    for r in &runs {
        print_run(r);
    }
    Ok(())
}

fn print_run(r: &Run) {
    println!(
        "run_id={} instance_id={} start_time={} end_time={} instance_type={} memory_gib={} vcpu={}",
        r.run_id,
        r.instance_id,
        r.start_time.to_rfc3339(),
        opt_dt(&r.end_time),
        r.instance_type.as_deref().unwrap_or(""),
        r.memory_gib.map(|m| m.to_string()).unwrap_or_default(),
        r.vcpu.map(|v| v.to_string()).unwrap_or_default(),
    );
}
