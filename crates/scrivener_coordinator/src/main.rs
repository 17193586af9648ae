//! Scrivener worker
//!
//! Runs the execution coordinator against the SQLite job queue, and offers a few
//! operator commands for inspecting and feeding it.
//!
//! Usage:
//!     scrivener-worker --config ~/.scrivener/config.toml run
//!     scrivener-worker submit payload.json --credits 3 --fan-out
//!     scrivener-worker dead-letters --limit 20

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scrivener_coordinator::config::{default_config_path, load_config, ScrivenerConfig};
use scrivener_coordinator::{
    submit_run, Collaborators, ConfigProviderGateway, ExecutionCoordinator, FsOutputSink,
    NotificationHub, ShutdownToken, SubmitMode, TemplateAssembler, WorkerPool, WorkerSettings,
};
use scrivener_db::ScrivenerDb;
use scrivener_logging::{init_logging, LogConfig};
use scrivener_protocol::JobPayload;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "scrivener-worker", about = "Scrivener workflow execution worker")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Config file (defaults to $SCRIVENER_HOME/config.toml)
    #[arg(long, global = true, env = "SCRIVENER_CONFIG")]
    config: Option<PathBuf>,

    /// State store URL, overriding the config file
    #[arg(long, global = true, env = "SCRIVENER_STATE_STORE")]
    state_store: Option<String>,

    /// Maximum in-flight jobs, overriding the config file
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Debug-level console logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process queued jobs until interrupted (default)
    Run,

    /// Submit a job payload (JSON file) as a new run
    Submit {
        payload: PathBuf,

        /// Credit cost debited from the tenant at submission
        #[arg(long, default_value_t = 1)]
        credits: i64,

        /// One job per subject file instead of a single job
        #[arg(long)]
        fan_out: bool,
    },

    /// Create a tenant with credit balances
    CreateTenant {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value_t = 0)]
        monthly_allowance: i64,

        #[arg(long, default_value_t = 0)]
        purchased: i64,
    },

    /// Show a run record
    ShowRun {
        tenant_id: String,
        run_id: String,
    },

    /// Show queue counts
    Stats,

    /// List recent dead-lettered jobs
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let _guard = init_logging(LogConfig {
        app_name: "scrivener-worker",
        verbose: cli.global.verbose,
        quiet: !matches!(command, Command::Run),
    })?;

    let config = resolve_config(&cli.global)?;
    let db = ScrivenerDb::open_url(&config.state_store)
        .await
        .with_context(|| format!("Failed to open state store {}", config.state_store))?;

    match command {
        Command::Run => run_worker(db, config).await,
        Command::Submit {
            payload,
            credits,
            fan_out,
        } => {
            let text = std::fs::read_to_string(&payload)
                .with_context(|| format!("Failed to read {}", payload.display()))?;
            let payload: JobPayload =
                serde_json::from_str(&text).context("Failed to parse job payload")?;
            let mode = if fan_out {
                SubmitMode::FanOut
            } else {
                SubmitMode::Single
            };
            let submitted =
                submit_run(&db, &payload, mode, credits, config.worker.max_attempts).await?;
            println!("{}", submitted.target_id);
            for job_id in submitted.job_ids {
                println!("  {}", job_id);
            }
            Ok(())
        }
        Command::CreateTenant {
            id,
            name,
            monthly_allowance,
            purchased,
        } => {
            let name = name.unwrap_or_else(|| id.clone());
            db.create_tenant(&id, &name, monthly_allowance, purchased)
                .await
                .context("Failed to create tenant")?;
            println!("Created tenant {}", id);
            Ok(())
        }
        Command::ShowRun { tenant_id, run_id } => {
            let run = db
                .get_run(&tenant_id, &run_id)
                .await?
                .with_context(|| format!("Run {} not found for tenant {}", run_id, tenant_id))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        Command::Stats => {
            let stats = db.queue_stats().await?;
            println!(
                "total={} queued={} active={} completed={} failed={}",
                stats.total, stats.queued, stats.active, stats.completed, stats.failed
            );
            Ok(())
        }
        Command::DeadLetters { limit } => {
            for record in db.list_dead_letters(limit).await? {
                let entry = &record.entry;
                println!(
                    "#{} {} run={} attempts={} at={}: {}",
                    record.id,
                    entry.original_job_id,
                    entry.run_id.as_deref().unwrap_or("-"),
                    entry.attempts_made,
                    ScrivenerDb::millis_to_datetime(entry.failed_at).to_rfc3339(),
                    entry.error_message
                );
            }
            Ok(())
        }
    }
}

fn resolve_config(args: &GlobalArgs) -> Result<ScrivenerConfig> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config =
        load_config(&path).with_context(|| format!("Failed to load config {}", path.display()))?;

    if let Some(url) = &args.state_store {
        config.state_store = url.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_worker(db: ScrivenerDb, config: ScrivenerConfig) -> Result<()> {
    let gateway = ConfigProviderGateway::from_config(&config.providers)
        .context("Failed to configure providers")?;
    info!(
        models = gateway.model_count(),
        state_store = %config.state_store,
        concurrency = config.worker.concurrency,
        "Starting Scrivener worker"
    );

    let collaborators = Collaborators {
        assembler: Arc::new(TemplateAssembler::new(&config.assembler.files_root)),
        gateway: Arc::new(gateway),
        sink: Arc::new(FsOutputSink::new(&config.output.root)),
        dead_letters: Arc::new(db.clone()),
        notifier: Arc::new(NotificationHub::new()),
        knowledge: None,
    };
    let coordinator = Arc::new(ExecutionCoordinator::new(
        db.clone(),
        collaborators,
        config.generation.settings(),
    ));

    let shutdown = ShutdownToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; draining in-flight jobs");
            signal_token.request();
        }
    });

    let pool = WorkerPool::new(
        db.clone(),
        coordinator,
        WorkerSettings::from(&config.worker),
        shutdown,
    );
    pool.run().await;

    db.close().await;
    Ok(())
}
