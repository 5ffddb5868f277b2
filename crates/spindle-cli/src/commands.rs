//! Subcommand implementations.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde_json::Value;
use spindle_core::app::ShutdownCoordinator;
use spindle_core::domain::JobArgs;
use spindle_core::ports::{GroupBy, GroupStats, JobFilter};
use spindle_core::{App, DeleteJobCondition, Job, JobId, JobStatus, NewJob, WorkerConfig};

#[derive(Subcommand)]
pub enum SchemaCommands {
    /// Create tables, indexes and the notify trigger (idempotent)
    Apply,
}

#[derive(Args)]
pub struct DeferArgs {
    /// Task name
    pub task: String,

    /// Arguments as a JSON object
    #[arg(long, default_value = "{}")]
    pub args: String,

    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long, allow_hyphen_values = true)]
    pub priority: Option<i32>,

    #[arg(long)]
    pub lock: Option<String>,

    #[arg(long)]
    pub queueing_lock: Option<String>,

    /// Do not run before this time (RFC 3339)
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Args)]
pub struct FilterArgs {
    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long)]
    pub task: Option<String>,

    #[arg(long)]
    pub lock: Option<String>,

    #[arg(long)]
    pub status: Option<JobStatus>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

impl FilterArgs {
    fn filter(&self) -> JobFilter {
        JobFilter {
            id: None,
            queue: self.queue.clone(),
            task: self.task.clone(),
            lock: self.lock.clone(),
            status: self.status,
        }
    }
}

#[derive(Subcommand)]
pub enum ListCommands {
    Jobs(FilterArgs),
    Queues(FilterArgs),
    Tasks(FilterArgs),
    Locks(FilterArgs),
}

#[derive(Args)]
pub struct CancelArgs {
    pub id: JobId,

    /// Also request abortion of a running job
    #[arg(long)]
    pub abort: bool,

    /// Delete the job instead of marking it cancelled
    #[arg(long)]
    pub delete: bool,
}

#[derive(Args)]
pub struct StalledArgs {
    /// Running for longer than this many seconds
    #[arg(long, default_value_t = 1800)]
    pub seconds: u64,

    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long)]
    pub task: Option<String>,

    /// Put the stalled jobs back to `pending`
    #[arg(long)]
    pub requeue: bool,
}

#[derive(Args)]
pub struct PurgeArgs {
    /// Keep jobs younger than this many hours
    #[arg(long)]
    pub hours: u64,

    #[arg(long)]
    pub queue: Option<String>,

    /// Final statuses to delete (default: succeeded)
    #[arg(long = "status")]
    pub statuses: Vec<JobStatus>,
}

#[derive(Args)]
pub struct WorkerArgs {
    #[arg(long)]
    pub name: Option<String>,

    /// Queues to listen on (comma separated); all queues when omitted
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,

    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Exit once no job is left instead of waiting for new ones
    #[arg(long)]
    pub one_shot: bool,

    #[arg(long, value_enum)]
    pub delete_jobs: Option<DeleteJobs>,

    /// Do not schedule the built-in heartbeat task
    #[arg(long)]
    pub no_heartbeat: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum DeleteJobs {
    Never,
    Successful,
    Always,
}

impl From<DeleteJobs> for DeleteJobCondition {
    fn from(value: DeleteJobs) -> Self {
        match value {
            DeleteJobs::Never => DeleteJobCondition::Never,
            DeleteJobs::Successful => DeleteJobCondition::Successful,
            DeleteJobs::Always => DeleteJobCondition::Always,
        }
    }
}

impl WorkerArgs {
    /// CLI flags override the `[worker]` settings section.
    pub fn apply(&self, mut config: WorkerConfig) -> WorkerConfig {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if !self.queues.is_empty() {
            config.queues = Some(self.queues.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config = config.concurrency(concurrency);
        }
        if self.one_shot {
            config.wait = false;
        }
        if let Some(delete_jobs) = self.delete_jobs {
            config.delete_jobs = delete_jobs.into();
        }
        config
    }
}

pub async fn healthcheck(app: &App) -> Result<()> {
    if !app.store().check_connection().await? {
        bail!("store is reachable but the schema is missing, run `spindle schema apply`");
    }
    println!("ok");
    Ok(())
}

fn parse_args(raw: &str) -> Result<JobArgs> {
    match serde_json::from_str::<Value>(raw).context("--args is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--args must be a JSON object, got {other}"),
    }
}

pub async fn defer(app: &App, args: DeferArgs) -> Result<()> {
    let mut job = NewJob::new(args.task).args(parse_args(&args.args)?);
    if let Some(queue) = args.queue {
        job = job.queue(queue);
    }
    if let Some(priority) = args.priority {
        job = job.priority(priority);
    }
    if let Some(lock) = args.lock {
        job = job.lock(lock);
    }
    if let Some(queueing_lock) = args.queueing_lock {
        job = job.queueing_lock(queueing_lock);
    }
    if let Some(at) = args.at {
        job = job.scheduled_at(at);
    }
    let id = app.defer_job(job).await?;
    println!("Deferred job {id}");
    Ok(())
}

pub async fn list(app: &App, command: ListCommands) -> Result<()> {
    let (args, group_by) = match command {
        ListCommands::Jobs(args) => {
            let jobs = app.list_jobs(&args.filter()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in &jobs {
                    println!("{}", job_line(job));
                }
            }
            return Ok(());
        }
        ListCommands::Queues(args) => (args, GroupBy::Queue),
        ListCommands::Tasks(args) => (args, GroupBy::Task),
        ListCommands::Locks(args) => (args, GroupBy::Lock),
    };

    let groups = app.stats(&args.filter(), group_by).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
    } else {
        for group in &groups {
            println!("{}", group_line(group));
        }
    }
    Ok(())
}

fn job_line(job: &Job) -> String {
    let mut line = format!(
        "{} {} on {} - [{}] attempts={}",
        job.id, job.task_name, job.queue_name, job.status, job.attempts
    );
    if let Some(lock) = &job.lock {
        line.push_str(&format!(" lock={lock}"));
    }
    if let Some(at) = job.scheduled_at {
        line.push_str(&format!(" scheduled_at={}", at.to_rfc3339()));
    }
    line
}

fn group_line(group: &GroupStats) -> String {
    let counts: Vec<String> = group
        .stats
        .iter()
        .map(|(status, count)| format!("{status}: {count}"))
        .collect();
    format!(
        "{}: {} jobs ({})",
        group.name.as_deref().unwrap_or("<none>"),
        group.jobs_count,
        counts.join(", ")
    )
}

pub async fn cancel(app: &App, args: CancelArgs) -> Result<()> {
    match app.cancel(args.id, args.abort, args.delete).await? {
        Some(id) if args.delete => println!("Deleted job {id}"),
        Some(id) => println!("Cancelled job {id}"),
        None => bail!("job {} was not found or could not be cancelled", args.id),
    }
    Ok(())
}

pub async fn requeue(app: &App, id: JobId) -> Result<()> {
    app.requeue(id).await?;
    println!("Requeued job {id}");
    Ok(())
}

pub async fn stalled(app: &App, args: StalledArgs) -> Result<()> {
    let jobs = app
        .stalled(
            Duration::from_secs(args.seconds),
            args.queue.as_deref(),
            args.task.as_deref(),
        )
        .await?;
    for job in &jobs {
        println!("{}", job_line(job));
        if args.requeue {
            app.requeue(job.id).await?;
        }
    }
    if args.requeue {
        println!("Requeued {} stalled jobs", jobs.len());
    }
    Ok(())
}

pub async fn purge(app: &App, args: PurgeArgs) -> Result<()> {
    if let Some(status) = args.statuses.iter().find(|status| !status.is_terminal()) {
        bail!("refusing to purge jobs in non-final status {status}");
    }
    let statuses = if args.statuses.is_empty() {
        vec![JobStatus::Succeeded]
    } else {
        args.statuses
    };
    let deleted = app
        .purge(
            Duration::from_secs(args.hours.saturating_mul(3600)),
            args.queue.as_deref(),
            &statuses,
        )
        .await?;
    println!("Deleted {deleted} jobs");
    Ok(())
}

pub async fn worker(app: &App, config: WorkerConfig) -> Result<()> {
    let shutdown = ShutdownCoordinator::install();
    app.worker(config)
        .run_with_shutdown(&shutdown)
        .await
        .context("worker stopped with an error")
}
