//! Periodic deferrer - cron スケジュールで job を defer する side task
//!
//! # 学習ポイント
//! - `tick(now)` を純粋なステップとして切り出し、`run` は「寝て tick」を繰り返すだけ
//! - 重複防止は store 側の `(task_name, periodic_id, tick)` 一意性に任せる
//!   （複数 worker プロセスが同じ tick を defer しても 1 件になる）
//! - 失敗はログに残して次の tick へ（deferrer 自体は止めない）

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{JobId, JobStatus, NewJob};
use crate::ports::job_store::to_chrono;
use crate::ports::{Clock, EventSink, JobStore, StatusTransition, TracingEventSink};
use crate::typed::task::new_job;
use crate::typed::{Task, TaskArgsError};

/// 起動直後に拾う取りこぼし tick の範囲
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10 * 60);

/// Registry が空のときに stop を待つ以外やることがないので、その間の sleep 上限
const IDLE_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error("periodic task '{task_name}' with id '{periodic_id}' is already registered")]
    Duplicate {
        task_name: String,
        periodic_id: String,
    },

    #[error(transparent)]
    Args(#[from] TaskArgsError),
}

/// 5 フィールドの標準 cron は秒フィールドを補う
fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|err| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        message: err.to_string(),
    })
}

/// One scheduled entry: a cron expression plus the job to defer on each tick.
///
/// ```ignore
/// let heartbeat = PeriodicTask::new("ops.heartbeat", "*/5 * * * *")?
///     .queue("ops")
///     .queueing_lock("heartbeat")
///     .pass_timestamp();
/// ```
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    expression: String,
    schedule: Schedule,
    template: NewJob,
    periodic_id: String,
    pass_timestamp: bool,
}

impl PeriodicTask {
    pub fn new(task_name: impl Into<String>, cron: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            expression: cron.to_string(),
            schedule: parse_cron(cron)?,
            template: NewJob::new(task_name),
            periodic_id: String::new(),
            pass_timestamp: false,
        })
    }

    /// Typed entry; queue and priority come from `T`.
    pub fn for_task<T: Task>(cron: &str, task: &T) -> Result<Self, ScheduleError> {
        Ok(Self {
            expression: cron.to_string(),
            schedule: parse_cron(cron)?,
            template: new_job(task)?,
            periodic_id: String::new(),
            pass_timestamp: false,
        })
    }

    /// Distinguishes several schedules of the same task.
    pub fn periodic_id(mut self, periodic_id: impl Into<String>) -> Self {
        self.periodic_id = periodic_id.into();
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.template = self.template.queue(queue);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.template = self.template.priority(priority);
        self
    }

    pub fn lock(mut self, lock: impl Into<String>) -> Self {
        self.template = self.template.lock(lock);
        self
    }

    pub fn queueing_lock(mut self, queueing_lock: impl Into<String>) -> Self {
        self.template = self.template.queueing_lock(queueing_lock);
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.template = self.template.arg(name, value);
        self
    }

    /// Inject the tick (unix seconds) as the `timestamp` argument.
    pub fn pass_timestamp(mut self) -> Self {
        self.pass_timestamp = true;
        self
    }

    pub fn task_name(&self) -> &str {
        &self.template.task_name
    }

    pub fn id(&self) -> &str {
        &self.periodic_id
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn key(&self) -> (String, String) {
        (self.template.task_name.clone(), self.periodic_id.clone())
    }

    /// Boundaries in `(after, until]`.
    pub fn ticks_between(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take_while(|tick| *tick <= until)
            .collect()
    }

    pub fn next_tick(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn job_for_tick(&self, tick_timestamp: i64) -> NewJob {
        let job = self.template.clone();
        if self.pass_timestamp {
            job.arg("timestamp", tick_timestamp)
        } else {
            job
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeriodicRegistry {
    tasks: Vec<PeriodicTask>,
}

impl PeriodicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: PeriodicTask) -> Result<(), ScheduleError> {
        if self.tasks.iter().any(|existing| existing.key() == task.key()) {
            return Err(ScheduleError::Duplicate {
                task_name: task.task_name().to_string(),
                periodic_id: task.periodic_id,
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeriodicTask> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub struct PeriodicDeferrer {
    registry: Arc<PeriodicRegistry>,
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    max_delay: Duration,
    /// (task_name, periodic_id) → 最後に評価した時刻
    checked_until: HashMap<(String, String), DateTime<Utc>>,
}

impl PeriodicDeferrer {
    pub fn new(
        registry: Arc<PeriodicRegistry>,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            event_sink: Arc::new(TracingEventSink),
            max_delay: DEFAULT_MAX_DELAY,
            checked_until: HashMap::new(),
        }
    }

    pub fn with_event_sink(mut self, event_sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = event_sink;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// 期限が来た (entry index, tick) の一覧。評価済みの範囲も進める。
    fn due_ticks(&mut self, now: DateTime<Utc>) -> Vec<(usize, DateTime<Utc>)> {
        let mut due = Vec::new();
        for (index, task) in self.registry.iter().enumerate() {
            let ticks = match self.checked_until.get(&task.key()) {
                Some(last) => task.ticks_between(*last, now),
                // 初回は max_delay 以内の直近 1 件だけ
                None => task
                    .ticks_between(now - to_chrono(self.max_delay), now)
                    .pop()
                    .into_iter()
                    .collect(),
            };
            self.checked_until.insert(task.key(), now);
            due.extend(ticks.into_iter().map(|tick| (index, tick)));
        }
        due
    }

    /// Defer every tick due at `now`. Returns the ids of newly created jobs.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let registry = Arc::clone(&self.registry);
        let tasks: Vec<&PeriodicTask> = registry.iter().collect();
        let mut deferred = Vec::new();

        for (index, tick) in self.due_ticks(now) {
            let task = tasks[index];
            let timestamp = tick.timestamp();
            let job = task.job_for_tick(timestamp);
            let queue = job.queue_name.clone();
            match self.store.defer_periodic(job, task.id(), timestamp).await {
                Ok(Some(job_id)) => {
                    self.event_sink.on_transition(&StatusTransition {
                        job_id,
                        queue,
                        task: task.task_name().to_string(),
                        status: JobStatus::Pending,
                        attempts: 0,
                        duration: None,
                    });
                    info!(
                        action = "periodic_deferred",
                        task = task.task_name(),
                        periodic_id = task.id(),
                        job_id = job_id.get(),
                        tick = timestamp,
                        "Periodic job deferred"
                    );
                    deferred.push(job_id);
                }
                Ok(None) => {
                    debug!(
                        action = "periodic_already_deferred",
                        task = task.task_name(),
                        periodic_id = task.id(),
                        tick = timestamp,
                        "Tick already deferred elsewhere"
                    );
                }
                Err(err) if err.is_queueing_lock_conflict() => {
                    warn!(
                        action = "skip_periodic_task_queueing_lock",
                        task = task.task_name(),
                        periodic_id = task.id(),
                        tick = timestamp,
                        error = %err,
                        "Previous periodic job still pending, skipping tick"
                    );
                }
                Err(err) => {
                    error!(
                        action = "periodic_defer_failed",
                        task = task.task_name(),
                        periodic_id = task.id(),
                        tick = timestamp,
                        error = %err,
                        "Failed to defer periodic job"
                    );
                }
            }
        }
        deferred
    }

    /// Time until the next boundary of any entry.
    pub fn next_wake(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.registry
            .iter()
            .filter_map(|task| task.next_tick(now))
            .min()
            .map(|tick| (tick - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub async fn run(mut self, stop: CancellationToken) {
        if self.registry.is_empty() {
            debug!("No periodic task registered, deferrer idle");
            stop.cancelled().await;
            return;
        }
        info!(
            action = "start_periodic_deferrer",
            tasks = self.registry.len(),
            "Periodic deferrer started"
        );
        loop {
            let now = self.clock.now();
            self.tick(now).await;
            let sleep_for = self.next_wake(now).unwrap_or(IDLE_WAIT);
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        debug!(action = "stop_periodic_deferrer", "Periodic deferrer stopped");
    }
}
