//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）
//!
//! `App` は job の投入（defer）と管理操作（cancel / requeue / 一覧）の窓口で、
//! `App::worker()` で同じ store と registry を共有する `Worker` を作る。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use super::config::WorkerConfig;
use super::periodic::{PeriodicDeferrer, PeriodicRegistry, PeriodicTask, ScheduleError};
use super::worker::Worker;
use crate::domain::{Job, JobArgs, JobId, JobStatus, NewJob, RetryDecision, StoreError, TaskError};
use crate::ports::{
    Clock, EventSink, GroupBy, GroupStats, JobFilter, JobStore, StatusTransition, SystemClock,
    TracingEventSink,
};
use crate::typed::task::new_job;
use crate::typed::{
    ContextHandler, Handler, JobContext, RegistryError, RetryStrategy, Task, TaskArgsError,
    TaskRegistry,
};

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = App::builder(store)
///     .register::<SendEmail, _>(SendEmailHandler)?
///     .periodic(PeriodicTask::new("ops.heartbeat", "*/5 * * * *")?)?
///     .expect_tasks(&["mail.send", "ops.heartbeat"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task 名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - periodic entry の task が未登録でも BuildError
pub struct AppBuilder {
    store: Arc<dyn JobStore>,
    registry: TaskRegistry,
    periodic: PeriodicRegistry,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("Periodic schedule for unregistered task '{0}'")]
    UnknownPeriodicTask(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, thiserror::Error)]
pub enum DeferError {
    #[error(transparent)]
    Args(#[from] TaskArgsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AppBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            registry: TaskRegistry::new(),
            periodic: PeriodicRegistry::new(),
            clock: Arc::new(SystemClock),
            event_sink: Arc::new(TracingEventSink),
            expected_tasks: None,
        }
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, BuildError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// `JobContext` を受け取る Handler を登録
    pub fn register_with_context<T: Task, H: ContextHandler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, BuildError> {
        self.registry.register_with_context::<T, H>(handler)?;
        Ok(self)
    }

    /// 型を持たない（JSON 引数のまま扱う）handler を登録
    pub fn register_fn<F, Fut, R>(
        mut self,
        name: &str,
        retry: Option<RetryStrategy>,
        func: F,
    ) -> Result<Self, BuildError>
    where
        F: Fn(JobContext, JobArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.registry.register_fn(name, retry, func)?;
        Ok(self)
    }

    pub fn periodic(mut self, task: PeriodicTask) -> Result<Self, BuildError> {
        self.periodic.add(task)?;
        Ok(self)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// 期待される task 名のリストを設定
    pub fn expect_tasks(mut self, task_names: &[&str]) -> Self {
        self.expected_tasks = Some(task_names.iter().map(|name| name.to_string()).collect());
        self
    }

    /// AppBuilder を構築して App を生成
    ///
    /// # 検証
    /// - expect_tasks() で設定された task 名が全て登録されているか
    /// - periodic entry の task が登録されているか
    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        if let Some(task) = self
            .periodic
            .iter()
            .find(|task| !self.registry.contains(task.task_name()))
        {
            return Err(BuildError::UnknownPeriodicTask(task.task_name().to_string()));
        }
        Ok(App {
            store: self.store,
            registry: Arc::new(self.registry),
            periodic: Arc::new(self.periodic),
            clock: self.clock,
            event_sink: self.event_sink,
        })
    }
}

/// App はアプリケーションのランタイム
///
/// 安価に clone できる（中身は全部 `Arc`）。
#[derive(Clone)]
pub struct App {
    store: Arc<dyn JobStore>,
    registry: Arc<TaskRegistry>,
    periodic: Arc<PeriodicRegistry>,
    clock: Arc<dyn Clock>,
    event_sink: Arc<dyn EventSink>,
}

impl App {
    pub fn builder(store: Arc<dyn JobStore>) -> AppBuilder {
        AppBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn periodic_registry(&self) -> &Arc<PeriodicRegistry> {
        &self.periodic
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }

    pub fn worker(&self, config: WorkerConfig) -> Worker {
        Worker::new(self.clone(), config)
    }

    pub fn periodic_deferrer(&self) -> PeriodicDeferrer {
        PeriodicDeferrer::new(
            Arc::clone(&self.periodic),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        )
        .with_event_sink(Arc::clone(&self.event_sink))
    }

    /// Defer a typed task with its default queue and priority.
    pub async fn defer<T: Task>(&self, task: &T) -> Result<JobId, DeferError> {
        Ok(self.defer_job(new_job(task)?).await?)
    }

    pub async fn defer_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        let queue = job.queue_name.clone();
        let task = job.task_name.clone();
        let id = self.store.defer(job).await?;
        info!(
            action = "job_defer",
            job_id = id.get(),
            queue = %queue,
            task = %task,
            "Deferred job {task}[{id}]"
        );
        self.notify(id, queue, task, JobStatus::Pending, 0);
        Ok(id)
    }

    /// `pending` → `cancelled`、`abort` なら `running` → `aborting` も。
    pub async fn cancel(
        &self,
        id: JobId,
        abort: bool,
        delete: bool,
    ) -> Result<Option<JobId>, StoreError> {
        let Some(job) = self.find_job(id).await? else {
            return Ok(None);
        };
        let cancelled = self.store.cancel(id, abort, delete).await?;
        if cancelled.is_some() {
            // delete された行は cancelled 扱いで通知する
            let status = self
                .store
                .status(id)
                .await?
                .unwrap_or(JobStatus::Cancelled);
            info!(
                action = "job_cancel",
                job_id = id.get(),
                status = %status,
                "Cancelled job {id}"
            );
            self.notify(id, job.queue_name, job.task_name, status, job.attempts);
        }
        Ok(cancelled)
    }

    /// Put a `failed` job, or a stalled `running` one, back to `pending`.
    ///
    /// retry と同じ扱いで attempts が 1 増える。queueing_lock を持つ別の
    /// pending job があれば `QueueingLockConflict`、それ以外の status は
    /// `InvalidTransition`。
    pub async fn requeue(&self, id: JobId) -> Result<(), StoreError> {
        let job = self.find_job(id).await?.ok_or(StoreError::NotFound(id))?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Running) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        self.store
            .retry(id, &RetryDecision::at(self.clock.now()))
            .await?;
        info!(
            action = "job_requeue",
            job_id = id.get(),
            from = %job.status,
            "Requeued job {id}"
        );
        self.notify(
            id,
            job.queue_name,
            job.task_name,
            JobStatus::Pending,
            job.attempts + 1,
        );
        Ok(())
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let filter = JobFilter {
            id: Some(id),
            ..JobFilter::default()
        };
        Ok(self.store.list_jobs(&filter).await?.into_iter().next())
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.store.list_jobs(filter).await
    }

    pub async fn stats(
        &self,
        filter: &JobFilter,
        group_by: GroupBy,
    ) -> Result<Vec<GroupStats>, StoreError> {
        self.store.stats(filter, group_by).await
    }

    pub async fn stalled(
        &self,
        threshold: Duration,
        queue: Option<&str>,
        task: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        self.store.stalled(threshold, queue, task).await
    }

    pub async fn purge(
        &self,
        retention: Duration,
        queue: Option<&str>,
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError> {
        let deleted = self.store.purge(retention, queue, statuses).await?;
        info!(action = "purge_jobs", deleted, "Deleted {deleted} old jobs");
        Ok(deleted)
    }

    pub(crate) fn notify(
        &self,
        job_id: JobId,
        queue: String,
        task: String,
        status: JobStatus,
        attempts: u32,
    ) {
        self.notify_transition(StatusTransition {
            job_id,
            queue,
            task,
            status,
            attempts,
            duration: None,
        });
    }

    pub(crate) fn notify_transition(&self, transition: StatusTransition) {
        self.event_sink.on_transition(&transition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;
    use crate::impls::InMemoryJobStore;
    use crate::ports::event_sink::fixtures::RecordingSink;
    use crate::typed::handler::fixtures::SumHandler;
    use crate::typed::task::fixtures::Sum;

    fn builder() -> AppBuilder {
        App::builder(Arc::new(InMemoryJobStore::new()))
    }

    #[test]
    fn test_build_fails_with_missing_tasks() {
        let result = builder()
            .register::<Sum, _>(SumHandler)
            .unwrap()
            .expect_tasks(&[Sum::NAME, "mail.send"])
            .build();

        match result {
            Err(BuildError::MissingTaskTypes(missing)) => {
                assert_eq!(missing, vec!["mail.send".to_string()]);
            }
            _ => panic!("expected MissingTaskTypes"),
        }
    }

    #[test]
    fn test_build_succeeds_with_expected_tasks() {
        let app = builder()
            .register::<Sum, _>(SumHandler)
            .unwrap()
            .expect_tasks(&[Sum::NAME])
            .build()
            .unwrap();
        assert!(app.registry().contains(Sum::NAME));
    }

    #[test]
    fn test_duplicate_registration_is_a_build_error() {
        let result = builder()
            .register::<Sum, _>(SumHandler)
            .unwrap()
            .register::<Sum, _>(SumHandler);
        assert!(matches!(result, Err(BuildError::Registry(_))));
    }

    #[test]
    fn test_periodic_for_unregistered_task_fails() {
        let result = builder()
            .periodic(PeriodicTask::new("ops.heartbeat", "* * * * *").unwrap())
            .unwrap()
            .build();
        assert!(matches!(result, Err(BuildError::UnknownPeriodicTask(name)) if name == "ops.heartbeat"));
    }

    #[tokio::test]
    async fn test_defer_typed_task_uses_task_defaults() {
        let sink = Arc::new(RecordingSink::default());
        let app = builder().event_sink(sink.clone()).build().unwrap();

        let id = app.defer(&Sum { a: 1, b: 2 }).await.unwrap();

        let jobs = app.list_jobs(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].queue_name, "math");
        assert_eq!(jobs[0].priority, 3);
        assert_eq!(jobs[0].args["a"], 1);

        let transitions = sink.transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].status, JobStatus::Pending);
        assert_eq!(transitions[0].task, Sum::NAME);
    }

    async fn job(app: &App, id: JobId) -> Job {
        app.find_job(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_requeue_failed_job() {
        let sink = Arc::new(RecordingSink::default());
        let app = builder().event_sink(sink.clone()).build().unwrap();
        let id = app.defer_job(NewJob::new("t")).await.unwrap();
        let fetched = app.store().fetch(None).await.unwrap().unwrap();
        app.store().finish(fetched.id, JobStatus::Failed, false).await.unwrap();

        app.requeue(id).await.unwrap();

        let requeued = job(&app, id).await;
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 2);
        assert_eq!(sink.statuses(id), vec![JobStatus::Pending, JobStatus::Pending]);
        assert_eq!(sink.transitions()[1].attempts, 2);
    }

    #[tokio::test]
    async fn test_requeue_stalled_running_job_counts_an_attempt() {
        let app = builder().build().unwrap();
        let id = app.defer_job(NewJob::new("t")).await.unwrap();
        app.store().fetch(None).await.unwrap().unwrap();

        app.requeue(id).await.unwrap();

        let requeued = job(&app, id).await;
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 1);
        let kinds: Vec<EventType> = app
            .store()
            .events(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.last(), Some(&EventType::DeferredForRetry));
    }

    #[tokio::test]
    async fn test_requeue_rejects_other_statuses() {
        let app = builder().build().unwrap();
        let done = app.defer_job(NewJob::new("t")).await.unwrap();
        app.store().fetch(None).await.unwrap().unwrap();
        app.store().finish(done, JobStatus::Succeeded, false).await.unwrap();
        let cancelled = app.defer_job(NewJob::new("t")).await.unwrap();
        app.cancel(cancelled, false, false).await.unwrap();
        let pending = app.defer_job(NewJob::new("t")).await.unwrap();

        for id in [done, cancelled, pending] {
            let before = job(&app, id).await;
            assert!(matches!(
                app.requeue(id).await,
                Err(StoreError::InvalidTransition { .. })
            ));
            assert_eq!(job(&app, id).await, before);
        }
        assert!(matches!(
            app.requeue(JobId::new(999)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_requeue_respects_queueing_lock() {
        let app = builder().build().unwrap();
        let first = app
            .defer_job(NewJob::new("t").queueing_lock("sync"))
            .await
            .unwrap();
        app.store().fetch(None).await.unwrap().unwrap();
        app.store().finish(first, JobStatus::Failed, false).await.unwrap();
        app.defer_job(NewJob::new("t").queueing_lock("sync"))
            .await
            .unwrap();

        assert!(matches!(
            app.requeue(first).await,
            Err(StoreError::QueueingLockConflict(lock)) if lock == "sync"
        ));
        assert_eq!(job(&app, first).await.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_and_abort_reach_event_sink() {
        let sink = Arc::new(RecordingSink::default());
        let app = builder().event_sink(sink.clone()).build().unwrap();
        let running = app.defer_job(NewJob::new("t").queue("q")).await.unwrap();
        app.store().fetch(None).await.unwrap().unwrap();
        let pending = app.defer_job(NewJob::new("t").queue("q")).await.unwrap();
        let deleted = app.defer_job(NewJob::new("t").queue("q")).await.unwrap();

        // abort なしの running は何も起きない
        assert_eq!(app.cancel(running, false, false).await.unwrap(), None);
        assert_eq!(app.cancel(running, true, false).await.unwrap(), Some(running));
        assert_eq!(app.cancel(pending, false, false).await.unwrap(), Some(pending));
        assert_eq!(app.cancel(deleted, false, true).await.unwrap(), Some(deleted));

        assert_eq!(
            sink.statuses(running),
            vec![JobStatus::Pending, JobStatus::Aborting]
        );
        assert_eq!(
            sink.statuses(pending),
            vec![JobStatus::Pending, JobStatus::Cancelled]
        );
        assert_eq!(
            sink.statuses(deleted),
            vec![JobStatus::Pending, JobStatus::Cancelled]
        );
        assert_eq!(sink.transitions().last().map(|t| t.queue.as_str()), Some("q"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_none() {
        let app = builder().build().unwrap();
        assert_eq!(app.cancel(JobId::new(42), false, false).await.unwrap(), None);
    }
}
