//! Worker - `concurrency` 本の worker loop と side task（periodic deferrer, listener）
//!
//! # 学習ポイント
//! - 各 loop は独立に fetch → 実行 → 結果の記録 を繰り返す。
//!   loop 同士の調停は store の原子的な claim だけ（共有キューを持たない）
//! - idle 時は `WakeListener` で待つ。fetch 前に `mark_seen()` しておくので、
//!   fetch と wait の間に届いた通知も取りこぼさない
//! - graceful stop: 停止フラグを立てて idle loop を起こし、実行中 job は最後まで待つ
//! - force stop: 実行中 handler を打ち切り、job は `running` のまま残す
//!
//! handler は別 task で実行する。panic しても worker loop は巻き込まれず、
//! critical fault として記録される。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::builder::App;
use super::config::WorkerConfig;
use super::shutdown::ShutdownCoordinator;
use crate::domain::{Job, JobId, JobStatus, Outcome, StoreError, TaskError, TaskFault, WorkerId};
use crate::ports::{Channel, JobStore, StatusTransition, WakeSignal};
use crate::typed::context::queues_display;
use crate::typed::{JobContext, RegisteredTask};

/// 成功ログに載せる result の最大文字数
const RESULT_LOG_LIMIT: usize = 250;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("critical error in job {job_id}: {fault}")]
    Critical {
        job_id: JobId,
        #[source]
        fault: TaskFault,
    },

    #[error("worker loop crashed: {0}")]
    Crashed(String),
}

/// handler 1 回分の実行結果
enum Execution {
    Finished {
        outcome: Outcome,
        critical: Option<TaskFault>,
    },
    /// force stop で打ち切られた。store には何も書かない。
    Interrupted,
}

impl Execution {
    fn finished(outcome: Outcome) -> Self {
        Execution::Finished {
            outcome,
            critical: None,
        }
    }
}

struct Shared {
    id: WorkerId,
    config: WorkerConfig,
    app: App,
    wake: WakeSignal,
    stop: CancellationToken,
    force: CancellationToken,
    /// worker loop index → 実行中 job（停止時のログ用）
    in_flight: Mutex<HashMap<usize, JobContext>>,
}

/// Worker pool handle. Clones share the same pool, so one clone can
/// `stop()` while another is inside `run()`.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(app: App, mut config: WorkerConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        Self {
            shared: Arc::new(Shared {
                id: WorkerId::generate(),
                config,
                app,
                wake: WakeSignal::new(),
                stop: CancellationToken::new(),
                force: CancellationToken::new(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Ids of the jobs currently being executed.
    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .shared
            .in_flight()
            .values()
            .map(|ctx| ctx.job.id)
            .collect();
        ids.sort();
        ids
    }

    /// Run every worker loop plus the side tasks until the loops end.
    ///
    /// Returns the first loop error (critical fault or store failure) once
    /// all loops have ended.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let shared = &self.shared;
        let config = &shared.config;
        info!(
            action = "start_worker",
            worker = %config.name,
            worker_id = %shared.id,
            concurrency = config.concurrency,
            "Starting worker on {}",
            queues_display(config.queues.as_deref())
        );

        let side_stop = CancellationToken::new();
        let mut side_tasks = Vec::new();
        side_tasks.push(tokio::spawn(
            shared.app.periodic_deferrer().run(side_stop.clone()),
        ));
        if config.wait && config.listen_notify {
            side_tasks.push(tokio::spawn(listen(
                Arc::clone(shared.app.store()),
                shared.wake.clone(),
                Channel::for_queues(config.queues.as_deref()),
                side_stop.clone(),
            )));
        }

        let mut loops = JoinSet::new();
        for index in 0..config.concurrency {
            let shared = Arc::clone(shared);
            loops.spawn(async move { (index, shared.single_worker(index).await) });
        }

        let mut first_error = None;
        while let Some(joined) = loops.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((index, Err(err))) => {
                    error!(
                        action = "worker_loop_error",
                        worker_index = index,
                        error = %err,
                        "Worker loop {index} stopped with an error"
                    );
                    err
                }
                Err(join_err) => {
                    error!(action = "worker_loop_crashed", error = %join_err, "Worker loop crashed");
                    WorkerError::Crashed(join_err.to_string())
                }
            };
            if first_error.is_none() {
                first_error = Some(err);
            }
        }

        side_stop.cancel();
        for task in side_tasks {
            if let Err(err) = task.await {
                error!(error = %err, "Worker side task crashed");
            }
        }
        info!(action = "stop_worker", worker = %config.name, "Stopped worker");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// `run()` wired to a coordinator: the first shutdown request stops the
    /// worker gracefully, the second aborts running handlers.
    pub async fn run_with_shutdown(
        &self,
        shutdown: &ShutdownCoordinator,
    ) -> Result<(), WorkerError> {
        let worker = self.clone();
        let graceful = shutdown.graceful();
        let force = shutdown.force();
        let bridge = tokio::spawn(async move {
            graceful.cancelled().await;
            worker.stop();
            force.cancelled().await;
            worker.stop_now();
        });
        let result = self.run().await;
        bridge.abort();
        result
    }

    /// Graceful stop: no new fetch, running jobs are awaited.
    pub fn stop(&self) {
        let shared = &self.shared;
        if shared.stop.is_cancelled() {
            return;
        }
        shared.stop.cancel();
        shared.wake.notify();
        info!(action = "stopping_worker", worker = %shared.config.name, "Stop requested");

        let now = Instant::now();
        for ctx in shared.in_flight().values() {
            info!(
                action = "ending_job",
                job_id = ctx.job.id.get(),
                "Waiting for job to finish: {}",
                ctx.job_description(now)
            );
        }
    }

    /// Abort running handlers. Their jobs stay `running`.
    pub fn stop_now(&self) {
        self.stop();
        let shared = &self.shared;
        if shared.force.is_cancelled() {
            return;
        }
        for ctx in shared.in_flight().values() {
            warn!(
                action = "abandon_job",
                job_id = ctx.job.id.get(),
                "Abandoning job {}, it stays running until reaped",
                ctx.job.call_string()
            );
        }
        shared.force.cancel();
    }
}

impl Shared {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<usize, JobContext>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopping(&self) -> bool {
        self.stop.is_cancelled() || self.force.is_cancelled()
    }

    async fn single_worker(&self, index: usize) -> Result<(), WorkerError> {
        let config = &self.config;
        let queues = config.queues.as_deref();
        let mut wake = self.wake.subscribe();
        // 起動直後は loop ごとにずらして一斉 polling を避ける
        let mut timeout = config.timeout.saturating_mul(index as u32 + 1);
        debug!(action = "start_worker_loop", worker_index = index, "Starting worker loop {index}");

        while !self.stopping() {
            wake.mark_seen();
            let Some(job) = self.app.store().fetch(queues).await? else {
                if !config.wait || self.stopping() {
                    break;
                }
                debug!(
                    action = "waiting_for_job",
                    worker_index = index,
                    "Waiting for new jobs on {}",
                    queues_display(queues)
                );
                wake.wait(timeout).await;
                timeout = config.timeout.saturating_mul(config.concurrency as u32);
                continue;
            };
            self.process_job(index, job).await?;
        }

        debug!(action = "stop_worker_loop", worker_index = index, "Stopped worker loop {index}");
        Ok(())
    }

    async fn process_job(&self, index: usize, job: Job) -> Result<(), WorkerError> {
        let abort = CancellationToken::new();
        let ctx = JobContext::new(
            self.config.name.clone(),
            self.id,
            index,
            self.config.queues.clone(),
            job.clone(),
            self.config.additional_context.clone(),
            abort.clone(),
            Arc::clone(self.app.store()),
        );
        debug!(
            action = "loaded_job_info",
            worker_index = index,
            job_id = job.id.get(),
            queue = %job.queue_name,
            task = %job.task_name,
            attempts = job.attempts,
            "Loaded job info, about to start job {}",
            job.call_string()
        );
        self.in_flight().insert(index, ctx.clone());
        self.app.notify(
            job.id,
            job.queue_name.clone(),
            job.task_name.clone(),
            JobStatus::Running,
            job.attempts,
        );

        let started = Instant::now();
        let result = match self.execute(&job, ctx, abort).await {
            Execution::Interrupted => Ok(()),
            Execution::Finished { outcome, critical } => {
                match self.record(&job, outcome, started.elapsed()).await {
                    Err(err) => Err(err.into()),
                    Ok(()) => match critical {
                        Some(fault) => Err(WorkerError::Critical {
                            job_id: job.id,
                            fault,
                        }),
                        None => Ok(()),
                    },
                }
            }
        };
        self.in_flight().remove(&index);
        result
    }

    async fn execute(&self, job: &Job, ctx: JobContext, abort: CancellationToken) -> Execution {
        let job_id = job.id.get();
        let Some(task) = self.app.registry().get(&job.task_name) else {
            error!(
                action = "task_not_found",
                job_id,
                task = %job.task_name,
                "Task was not found: {}",
                job.task_name
            );
            return Execution::finished(Outcome::Failed);
        };

        let call = job.call_string();
        info!(
            action = "start_job",
            job_id,
            queue = %job.queue_name,
            task = %job.task_name,
            "Starting job {call}"
        );

        let watcher_done = CancellationToken::new();
        let _watcher_guard = watcher_done.clone().drop_guard();
        tokio::spawn(watch_abort(
            Arc::clone(self.app.store()),
            job.id,
            abort,
            watcher_done,
            self.config.abort_poll_interval,
        ));

        let started = Instant::now();
        let handler = Arc::clone(task.handler());
        let args = job.args.clone();
        let mut running = tokio::spawn(async move { handler.handle_dyn(ctx, args).await });
        let joined = tokio::select! {
            joined = &mut running => joined,
            _ = self.force.cancelled() => {
                running.abort();
                warn!(action = "job_interrupted", job_id, "Job {call} interrupted, left running");
                return Execution::Interrupted;
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        match joined {
            Ok(Ok(result)) => {
                let shown = result
                    .as_ref()
                    .map(|value| truncate(&value.to_string(), RESULT_LOG_LIMIT))
                    .unwrap_or_else(|| "None".to_string());
                info!(
                    action = "job_success",
                    job_id,
                    "Job {call} ended with status: Success, lasted {elapsed:.3} s - Result: {shown}"
                );
                Execution::finished(Outcome::Success { result })
            }
            Ok(Err(TaskError::Aborted)) => {
                info!(
                    action = "job_aborted",
                    job_id,
                    "Job {call} ended with status: Aborted, lasted {elapsed:.3} s"
                );
                Execution::finished(Outcome::Aborted)
            }
            Ok(Err(TaskError::Fault(fault))) => {
                Execution::finished(self.after_fault(task, job, &fault, &call, elapsed))
            }
            Ok(Err(TaskError::Critical(fault))) => Execution::Finished {
                outcome: self.after_fault(task, job, &fault, &call, elapsed),
                critical: Some(fault),
            },
            Err(join_err) => {
                let fault = TaskFault::new(panic_message(join_err)).with_kind("panic");
                Execution::Finished {
                    outcome: self.after_fault(task, job, &fault, &call, elapsed),
                    critical: Some(fault),
                }
            }
        }
    }

    fn after_fault(
        &self,
        task: &RegisteredTask,
        job: &Job,
        fault: &TaskFault,
        call: &str,
        elapsed: f64,
    ) -> Outcome {
        let now = self.app.clock().now();
        match task.retry_policy().retry_decision(fault, job.attempts, now) {
            Some(decision) => {
                info!(
                    action = "job_error_retry",
                    job_id = job.id.get(),
                    retry_at = %decision.retry_at,
                    "Job {call} ended with status: Error, to retry, lasted {elapsed:.3} s - {fault}"
                );
                Outcome::Retry(decision)
            }
            None => {
                error!(
                    action = "job_error",
                    job_id = job.id.get(),
                    "Job {call} ended with status: Error, lasted {elapsed:.3} s - {fault}"
                );
                Outcome::Failed
            }
        }
    }

    async fn record(&self, job: &Job, outcome: Outcome, duration: Duration) -> Result<(), StoreError> {
        let store = self.app.store();
        let status = match &outcome {
            Outcome::Retry(decision) => {
                store.retry(job.id, decision).await?;
                JobStatus::Pending
            }
            Outcome::Success { .. } => JobStatus::Succeeded,
            Outcome::Failed => JobStatus::Failed,
            Outcome::Aborted => JobStatus::Aborted,
        };
        if status.is_finish_status() {
            let delete = self.config.delete_jobs.should_delete(status);
            store.finish(job.id, status, delete).await?;
        }
        debug!(
            action = "finish_task",
            job_id = job.id.get(),
            status = %status,
            "Acknowledged job completion"
        );
        self.app.notify_transition(StatusTransition {
            job_id: job.id,
            queue: job.queue_name.clone(),
            task: job.task_name.clone(),
            status,
            attempts: job.attempts + 1,
            duration: Some(duration),
        });
        Ok(())
    }
}

async fn listen(
    store: Arc<dyn JobStore>,
    signal: WakeSignal,
    channels: Vec<Channel>,
    stop: CancellationToken,
) {
    if let Err(err) = store.listen(signal, channels, stop).await {
        warn!(
            action = "listener_failed",
            error = %err,
            "Notification listener stopped, falling back to polling"
        );
    }
}

/// `abort_poll_interval` ごとに status を見て、`aborting` なら token を cancel
async fn watch_abort(
    store: Arc<dyn JobStore>,
    id: JobId,
    abort: CancellationToken,
    done: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = abort.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match store.status(id).await {
            Ok(Some(JobStatus::Aborting)) => {
                info!(action = "abort_job", job_id = id.get(), "Abort requested for job {id}");
                abort.cancel();
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(job_id = id.get(), error = %err, "Failed to poll job status");
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("handler task cancelled: {err}");
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut shown: String = text.chars().take(limit).collect();
    shown.push_str("...");
    shown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::config::DeleteJobCondition;
    use crate::domain::{EventType, JobArgs, NewJob};
    use crate::impls::InMemoryJobStore;
    use crate::ports::event_sink::fixtures::RecordingSink;
    use crate::ports::{Clock, FixedClock};
    use crate::typed::handler::fixtures::SumHandler;
    use crate::typed::task::fixtures::Sum;
    use crate::typed::task::Task;
    use crate::typed::RetryStrategy;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn batch() -> WorkerConfig {
        WorkerConfig::default().wait(false)
    }

    fn memory() -> Arc<InMemoryJobStore> {
        Arc::new(InMemoryJobStore::new())
    }

    async fn wait_for_status(store: &Arc<dyn JobStore>, id: JobId, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.status(id).await.unwrap() != Some(status) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_batch_worker_drains_queue() {
        let app = App::builder(memory())
            .register::<Sum, _>(SumHandler)
            .unwrap()
            .build()
            .unwrap();
        let a = app.defer(&Sum { a: 1, b: 2 }).await.unwrap();
        let b = app.defer(&Sum { a: 3, b: 4 }).await.unwrap();

        app.worker(batch()).run().await.unwrap();

        for id in [a, b] {
            assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Succeeded));
            let kinds: Vec<EventType> = app
                .store()
                .events(id)
                .await
                .unwrap()
                .into_iter()
                .map(|event| event.kind)
                .collect();
            assert_eq!(
                kinds,
                vec![EventType::Deferred, EventType::Started, EventType::Succeeded]
            );
        }
    }

    #[tokio::test]
    async fn test_jobs_run_in_priority_then_id_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let app = App::builder(memory())
            .register_fn("record", None, move |ctx: JobContext, _args: JobArgs| {
                let record = Arc::clone(&record);
                async move {
                    record.lock().unwrap().push(ctx.job.id);
                    Ok::<(), TaskError>(())
                }
            })
            .unwrap()
            .build()
            .unwrap();

        let mut ids = Vec::new();
        for priority in [5, 1, 5, 3] {
            ids.push(
                app.defer_job(NewJob::new("record").priority(priority))
                    .await
                    .unwrap(),
            );
        }

        app.worker(batch()).run().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ids[0], ids[2], ids[3], ids[1]]);
    }

    #[tokio::test]
    async fn test_every_execution_transition_reaches_event_sink() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap());
        let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
        let sink = Arc::new(RecordingSink::default());
        let app = App::builder(store)
            .clock(Arc::new(clock))
            .event_sink(sink.clone())
            .register::<Sum, _>(SumHandler)
            .unwrap()
            // wait 0 なので同じ batch の中で再実行される
            .register_fn(
                "flaky",
                Some(RetryStrategy::attempts(1)),
                |_ctx: JobContext, _args: JobArgs| async move {
                    Err::<(), _>(TaskError::msg("boom"))
                },
            )
            .unwrap()
            .register_fn("gives.up", None, |_ctx: JobContext, _args: JobArgs| async move {
                Err::<(), _>(TaskError::Aborted)
            })
            .unwrap()
            .build()
            .unwrap();
        let sum = app.defer(&Sum { a: 1, b: 1 }).await.unwrap();
        let flaky = app.defer_job(NewJob::new("flaky")).await.unwrap();
        let aborted = app.defer_job(NewJob::new("gives.up")).await.unwrap();
        let unknown = app.defer_job(NewJob::new("nobody.home")).await.unwrap();

        app.worker(batch()).run().await.unwrap();

        use JobStatus::*;
        assert_eq!(sink.statuses(sum), vec![Pending, Running, Succeeded]);
        assert_eq!(
            sink.statuses(flaky),
            vec![Pending, Running, Pending, Running, Failed]
        );
        assert_eq!(sink.statuses(aborted), vec![Pending, Running, Aborted]);
        assert_eq!(sink.statuses(unknown), vec![Pending, Running, Failed]);

        let of = |id: JobId| -> Vec<StatusTransition> {
            sink.transitions()
                .into_iter()
                .filter(|t| t.job_id == id)
                .collect()
        };
        let flaky_log = of(flaky);
        assert_eq!(
            flaky_log.iter().map(|t| t.attempts).collect::<Vec<_>>(),
            vec![0, 0, 1, 1, 2]
        );
        // 実行時間は実行を終える遷移にだけ付く
        assert_eq!(
            flaky_log.iter().map(|t| t.duration.is_some()).collect::<Vec<_>>(),
            vec![false, false, true, false, true]
        );
        assert!(of(sum).iter().all(|t| t.queue == "math" && t.task == Sum::NAME));
    }

    #[tokio::test]
    async fn test_unknown_task_is_failed() {
        let app = App::builder(memory()).build().unwrap();
        let id = app.defer_job(NewJob::new("nobody.home")).await.unwrap();

        app.worker(batch()).run().await.unwrap();
        assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_after_wait() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap());
        let store = Arc::new(InMemoryJobStore::with_clock(Arc::new(clock.clone())));
        let app = App::builder(store)
            .clock(Arc::new(clock.clone()))
            .register_fn(
                "always.fails",
                Some(RetryStrategy::attempts(1).with_wait(Duration::from_secs(30))),
                |_ctx: JobContext, _args: JobArgs| async move {
                    Err::<(), _>(TaskError::msg("boom"))
                },
            )
            .unwrap()
            .build()
            .unwrap();
        let id = app.defer_job(NewJob::new("always.fails")).await.unwrap();

        app.worker(batch()).run().await.unwrap();
        let jobs = app.list_jobs(&Default::default()).await.unwrap();
        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.scheduled_at, Some(clock.now() + chrono::Duration::seconds(30)));

        // retry_at 前は fetch されない
        app.worker(batch()).run().await.unwrap();
        assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Pending));

        clock.advance(chrono::Duration::seconds(30));
        app.worker(batch()).run().await.unwrap();
        let jobs = app.list_jobs(&Default::default()).await.unwrap();
        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_successful_jobs_are_deleted_when_configured() {
        let app = App::builder(memory())
            .register::<Sum, _>(SumHandler)
            .unwrap()
            .register_fn("fails", None, |_ctx: JobContext, _args: JobArgs| async move {
                Err::<(), _>(TaskError::msg("nope"))
            })
            .unwrap()
            .build()
            .unwrap();
        let ok = app.defer(&Sum { a: 1, b: 1 }).await.unwrap();
        let ko = app.defer_job(NewJob::new("fails")).await.unwrap();

        app.worker(batch().delete_jobs(DeleteJobCondition::Successful))
            .run()
            .await
            .unwrap();

        assert_eq!(app.store().status(ok).await.unwrap(), None);
        assert_eq!(app.store().status(ko).await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_critical_fault_is_recorded_then_returned() {
        let app = App::builder(memory())
            .register_fn("fatal", None, |_ctx: JobContext, _args: JobArgs| async move {
                Err::<(), _>(TaskError::critical(TaskFault::new("out of memory")))
            })
            .unwrap()
            .build()
            .unwrap();
        let id = app.defer_job(NewJob::new("fatal")).await.unwrap();

        let err = app.worker(batch()).run().await.unwrap_err();
        assert!(matches!(err, WorkerError::Critical { job_id, .. } if job_id == id));
        assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_critical() {
        let app = App::builder(memory())
            .register_fn("panics", None, |_ctx: JobContext, _args: JobArgs| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), TaskError>(())
            })
            .unwrap()
            .build()
            .unwrap();
        let id = app.defer_job(NewJob::new("panics")).await.unwrap();

        match app.worker(batch()).run().await {
            Err(WorkerError::Critical { fault, .. }) => {
                assert_eq!(fault.message(), "handler exploded");
                assert_eq!(fault.kind(), Some("panic"));
            }
            other => panic!("expected a critical error, got {other:?}"),
        }
        assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_lock_prevents_parallel_runs() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        let app = App::builder(memory())
            .register_fn("locked", None, move |_ctx: JobContext, _args: JobArgs| {
                let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), TaskError>(())
                }
            })
            .unwrap()
            .build()
            .unwrap();
        let a = app.defer_job(NewJob::new("locked").lock("account:1")).await.unwrap();
        let b = app.defer_job(NewJob::new("locked").lock("account:1")).await.unwrap();

        app.worker(batch().concurrency(2)).run().await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(app.store().status(a).await.unwrap(), Some(JobStatus::Succeeded));
        assert_eq!(app.store().status(b).await.unwrap(), Some(JobStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_context_carries_worker_metadata() {
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let app = App::builder(memory())
            .register_fn("ctx", None, move |ctx: JobContext, _args: JobArgs| {
                let record = Arc::clone(&record);
                async move {
                    *record.lock().unwrap() = Some((
                        ctx.worker_name.clone(),
                        ctx.additional_context.get("region").cloned(),
                        ctx.attempt(),
                    ));
                    Ok::<(), TaskError>(())
                }
            })
            .unwrap()
            .build()
            .unwrap();
        app.defer_job(NewJob::new("ctx")).await.unwrap();

        let config = WorkerConfig::named("billing")
            .wait(false)
            .context_value("region", "eu");
        app.worker(config).run().await.unwrap();

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(("billing".to_string(), Some(Value::from("eu")), 1))
        );
    }

    #[tokio::test]
    async fn test_abort_request_reaches_running_handler() {
        let app = App::builder(memory())
            .register_fn("long", None, |ctx: JobContext, _args: JobArgs| async move {
                tokio::select! {
                    _ = ctx.aborted() => Err(TaskError::Aborted),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
                }
            })
            .unwrap()
            .build()
            .unwrap();
        let id = app.defer_job(NewJob::new("long")).await.unwrap();

        let worker = app.worker(batch().abort_poll_interval(Duration::from_millis(10)));
        let run = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        wait_for_status(app.store(), id, JobStatus::Running).await;

        assert_eq!(app.cancel(id, true, false).await.unwrap(), Some(id));
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Aborted));
    }

    #[tokio::test]
    async fn test_graceful_stop_waits_for_running_job() {
        let app = App::builder(memory())
            .register_fn("slow", None, |_ctx: JobContext, _args: JobArgs| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<(), TaskError>(())
            })
            .unwrap()
            .build()
            .unwrap();
        let id = app.defer_job(NewJob::new("slow")).await.unwrap();

        let worker = app.worker(WorkerConfig::default().timeout(Duration::from_secs(60)));
        let run = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.running_jobs() != vec![id] {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Succeeded));
        assert!(worker.running_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_idle_worker_wakes_on_defer() {
        let store = memory();
        let app = App::builder(store.clone())
            .register::<Sum, _>(SumHandler)
            .unwrap()
            .build()
            .unwrap();

        let worker = app.worker(WorkerConfig::default().timeout(Duration::from_secs(60)));
        let run = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.listener_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let id = app.defer(&Sum { a: 2, b: 2 }).await.unwrap();
        wait_for_status(app.store(), id, JobStatus::Succeeded).await;

        worker.stop();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(store.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_shutdown_request_abandons_running_job() {
        let app = App::builder(memory())
            .register_fn("stuck", None, |_ctx: JobContext, _args: JobArgs| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), TaskError>(())
            })
            .unwrap()
            .build()
            .unwrap();
        let id = app.defer_job(NewJob::new("stuck")).await.unwrap();

        let shutdown = ShutdownCoordinator::new();
        let worker = app.worker(WorkerConfig::default());
        let run = tokio::spawn({
            let (worker, shutdown) = (worker.clone(), shutdown.clone());
            async move { worker.run_with_shutdown(&shutdown).await }
        });
        wait_for_status(app.store(), id, JobStatus::Running).await;

        shutdown.trigger();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(app.store().status(id).await.unwrap(), Some(JobStatus::Running));
    }

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("ジョブの結果", 3), "ジョブ...");
    }
}
