use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ingest, ledger};

#[derive(Parser)]
#[command(name = "vmrun")]
#[command(about = "VM run ledger CLI", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> env -> local...)
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    /// Fail instead of warn when the config carries keys nothing reads
    #[arg(long, global = true, default_value_t = false)]
    strict_config: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Instance registry
    Instance {
        #[command(subcommand)]
        cmd: InstanceCmd,
    },

    /// Append lifecycle events and reconcile the affected instances
    Event {
        #[command(subcommand)]
        cmd: EventCmd,
    },

    /// Hardware-profile catalog
    Catalog {
        #[command(subcommand)]
        cmd: CatalogCmd,
    },

    /// Rebuild stored runs from the event history
    Reconcile(ReconcileArgs),

    /// Query derived runs
    Runs {
        #[command(subcommand)]
        cmd: RunsCmd,
    },

    /// Account-wide operations
    Account {
        #[command(subcommand)]
        cmd: AccountCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply SQL migrations
    Migrate,
}

#[derive(Subcommand)]
enum InstanceCmd {
    /// Register an instance and print its id
    Add {
        /// Owning account reference
        #[arg(long)]
        account: String,

        /// Cloud provider (aws | azure | gcp)
        #[arg(long)]
        provider: String,

        /// Provider's own id for the instance (EC2 instance id, Azure VM id, GCE instance id)
        #[arg(long)]
        provider_id: String,

        /// Region (aws), resource group (azure) or zone (gcp)
        #[arg(long)]
        location: String,

        /// Use this id instead of generating one
        #[arg(long)]
        instance_id: Option<String>,
    },

    /// Delete an instance together with its events and runs
    Delete {
        #[arg(long)]
        instance_id: String,
    },
}

#[derive(Subcommand)]
enum EventCmd {
    /// Append one event
    Record {
        #[arg(long)]
        instance_id: String,

        /// power_on | power_off | attribute_change
        #[arg(long = "type")]
        event_type: String,

        /// RFC 3339 occurrence time
        #[arg(long)]
        at: String,

        /// Hardware profile id (instance type)
        #[arg(long)]
        profile: Option<String>,
    },

    /// Bulk backfill from CSV (instance_id,event_type,occurred_at,profile_id)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
}

#[derive(Subcommand)]
enum CatalogCmd {
    /// Insert missing profiles from CSV (profile_id,memory_gib,vcpu,provider)
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct ReconcileArgs {
    /// Reconcile one instance
    #[arg(long)]
    instance_id: Option<String>,

    /// Reconcile every registered instance
    #[arg(long)]
    all: bool,
}

#[derive(Subcommand)]
enum RunsCmd {
    /// Stored runs of one instance
    List {
        #[arg(long)]
        instance_id: String,
    },

    /// Instances with an open run that started at or before --at
    RunningSince {
        #[arg(long)]
        at: String,
    },

    /// Runs intersecting [--from, --to) across all instances
    Window {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },
}

#[derive(Subcommand)]
enum AccountCmd {
    /// Append power_off for every running instance of the account
    PowerOff {
        #[arg(long)]
        account: String,

        /// RFC 3339 time; defaults to now
        #[arg(long)]
        at: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // dev-time convenience; missing file is fine
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    if let Commands::ConfigHash { paths } = &cli.cmd {
        let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
        let loaded = vmrun_config::load_layered_yaml(&path_refs)?;
        println!("config_hash={}", loaded.config_hash);
        println!("{}", loaded.canonical_json);
        return Ok(());
    }

    let cfg = commands::load_ledger_config(&cli.config_paths, cli.strict_config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.logging.filter.as_str())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.cmd {
        Commands::ConfigHash { .. } => {}

        Commands::Db { cmd } => {
            let pool = commands::connect(&cfg).await?;
            match cmd {
                DbCmd::Status => {
                    let s = vmrun_db::status(&pool).await?;
                    println!("db_ok={} has_runs_table={}", s.ok, s.has_runs_table);
                }
                DbCmd::Migrate => {
                    vmrun_db::migrate(&pool).await?;
                    println!("migrated=true");
                }
            }
        }

        Commands::Instance { cmd } => match cmd {
            InstanceCmd::Add {
                account,
                provider,
                provider_id,
                location,
                instance_id,
            } => {
                let provider = ledger::build_provider(&provider, &provider_id, &location)?;
                ledger::instance_add(&cfg, account, provider, instance_id).await?;
            }
            InstanceCmd::Delete { instance_id } => {
                ledger::instance_delete(&cfg, &instance_id).await?;
            }
        },

        Commands::Event { cmd } => match cmd {
            EventCmd::Record {
                instance_id,
                event_type,
                at,
                profile,
            } => {
                let ev = ingest::build_event(&instance_id, &event_type, &at, profile)?;
                ingest::event_record(&cfg, ev).await?;
            }
            EventCmd::Import { csv } => ingest::event_import(&cfg, &csv).await?,
        },

        Commands::Catalog { cmd } => match cmd {
            CatalogCmd::Import { csv } => ledger::catalog_import(&cfg, &csv).await?,
        },

        Commands::Reconcile(args) => ingest::reconcile(&cfg, args.instance_id, args.all).await?,

        Commands::Runs { cmd } => match cmd {
            RunsCmd::List { instance_id } => ledger::runs_list(&cfg, &instance_id).await?,
            RunsCmd::RunningSince { at } => ledger::runs_running_since(&cfg, &at).await?,
            RunsCmd::Window { from, to } => ledger::runs_window(&cfg, &from, &to).await?,
        },

        Commands::Account { cmd } => match cmd {
            AccountCmd::PowerOff { account, at } => {
                ingest::account_power_off(&cfg, &account, at).await?
            }
        },
    }

    Ok(())
}
