//! Built-in tasks served by `spindle worker`.
//!
//! - `echo`: 引数の message をそのまま返す（疎通確認用）
//! - `sleep`: 指定秒数待つ。abort 要求に応答する
//! - `heartbeat`: periodic で定期実行され、tick をログに出す

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use spindle_core::app::{AppBuilder, BuildError, PeriodicTask};
use spindle_core::{ContextHandler, Handler, JobContext, Task, TaskError};

pub const HEARTBEAT_CRON: &str = "*/5 * * * *";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl Task for Echo {
    const NAME: &'static str = "echo";
    type Output = String;
}

pub struct EchoHandler;

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, task: Echo) -> Result<String, TaskError> {
        Ok(task.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sleep {
    pub seconds: f64,
}

impl Task for Sleep {
    const NAME: &'static str = "sleep";
    type Output = f64;
}

pub struct SleepHandler;

#[async_trait]
impl ContextHandler<Sleep> for SleepHandler {
    async fn handle(&self, ctx: &JobContext, task: Sleep) -> Result<f64, TaskError> {
        let duration = Duration::try_from_secs_f64(task.seconds).map_err(TaskError::fault)?;
        tokio::select! {
            _ = ctx.aborted() => Err(TaskError::Aborted),
            _ = tokio::time::sleep(duration) => Ok(task.seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Tick (unix seconds), injected by the periodic deferrer.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Task for Heartbeat {
    const NAME: &'static str = "heartbeat";
    type Output = ();

    fn queue() -> &'static str {
        "spindle"
    }
}

pub struct HeartbeatHandler;

#[async_trait]
impl ContextHandler<Heartbeat> for HeartbeatHandler {
    async fn handle(&self, ctx: &JobContext, task: Heartbeat) -> Result<(), TaskError> {
        tracing::info!(
            action = "heartbeat",
            worker = %ctx.worker_name,
            worker_id = %ctx.worker_id,
            tick = task.timestamp,
            "Heartbeat"
        );
        Ok(())
    }
}

pub fn register(builder: AppBuilder, heartbeat: bool) -> Result<AppBuilder, BuildError> {
    let builder = builder
        .register::<Echo, _>(EchoHandler)?
        .register_with_context::<Sleep, _>(SleepHandler)?
        .register_with_context::<Heartbeat, _>(HeartbeatHandler)?;
    if !heartbeat {
        return Ok(builder);
    }
    let schedule = PeriodicTask::for_task(HEARTBEAT_CRON, &Heartbeat { timestamp: None })?
        .queueing_lock("heartbeat")
        .pass_timestamp();
    builder.periodic(schedule)
}
