//! spindle - job queue administration and worker process.

mod commands;
mod settings;
mod tasks;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spindle_core::impls::{InMemoryJobStore, PgJobStore};
use spindle_core::{App, JobId, JobStore};

use commands::{
    CancelArgs, DeferArgs, ListCommands, PurgeArgs, SchemaCommands, StalledArgs, WorkerArgs,
};
use settings::Settings;

#[derive(Parser)]
#[command(
    name = "spindle",
    version,
    about = "Durable job queue backed by PostgreSQL",
    propagate_version = true
)]
struct Cli {
    /// Settings file (default: ./spindle.toml when present)
    #[arg(short, long, global = true, env = "SPINDLE_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL URL, overrides `database.url`
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Process-local store instead of PostgreSQL, for trying things out
    #[arg(long, global = true)]
    in_memory: bool,

    /// JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Database schema management
    #[command(subcommand)]
    Schema(SchemaCommands),

    /// Check that the store is reachable and the schema is installed
    Healthcheck,

    /// Defer a job
    Defer(DeferArgs),

    /// List jobs, or job counts per queue / task / lock
    #[command(subcommand)]
    List(ListCommands),

    /// Cancel a pending job, or request abortion of a running one
    Cancel(CancelArgs),

    /// Put a failed (or stalled running) job back to pending
    Requeue { id: JobId },

    /// List jobs running for longer than a threshold
    Stalled(StalledArgs),

    /// Delete old finished jobs
    Purge(PurgeArgs),

    /// Run a worker with the built-in tasks
    Worker(WorkerArgs),
}

async fn connect(settings: &Settings) -> Result<PgJobStore> {
    let url = settings
        .database
        .url
        .as_deref()
        .context("no database URL, set SPINDLE__DATABASE__URL or --database-url")?;
    let store = PgJobStore::connect(url, settings.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(store)
}

async fn open_store(cli: &Cli, settings: &Settings) -> Result<Arc<dyn JobStore>> {
    if cli.in_memory {
        return Ok(Arc::new(InMemoryJobStore::new()));
    }
    Ok(Arc::new(connect(settings).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(url) = &cli.database_url {
        settings.database.url = Some(url.clone());
    }
    telemetry::init(cli.json_logs || settings.log.json);

    if let Command::Schema(SchemaCommands::Apply) = &cli.command {
        connect(&settings).await?.apply_schema().await?;
        println!("Schema applied");
        return Ok(());
    }

    let store = open_store(&cli, &settings).await?;
    let heartbeat = match &cli.command {
        Command::Worker(args) => !args.no_heartbeat,
        _ => false,
    };
    let app = tasks::register(App::builder(store), heartbeat)?.build()?;

    match cli.command {
        // store を開く前に処理済み
        Command::Schema(_) => Ok(()),
        Command::Healthcheck => commands::healthcheck(&app).await,
        Command::Defer(args) => commands::defer(&app, args).await,
        Command::List(command) => commands::list(&app, command).await,
        Command::Cancel(args) => commands::cancel(&app, args).await,
        Command::Requeue { id } => commands::requeue(&app, id).await,
        Command::Stalled(args) => commands::stalled(&app, args).await,
        Command::Purge(args) => commands::purge(&app, args).await,
        Command::Worker(args) => {
            let config = args.apply(settings.worker.clone());
            commands::worker(&app, config).await
        }
    }
}
