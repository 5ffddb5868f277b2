//! In-memory job store.
//!
//! すべての状態を 1 つの `tokio::sync::Mutex` の中に置き、各操作を
//! ロック 1 回で完結させる（= 単一の調停点）。そのため fetch / cancel などの
//! 競合は必ずどちらかが先に完了し、部分的な効果は残らない。
//!
//! 永続化はしないので、複数プロセスで共有する用途には `PgJobStore` を使う。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    EventType, Job, JobEvent, JobId, JobStatus, NewJob, RetryDecision, StoreError,
};
use crate::ports::job_store::to_chrono;
use crate::ports::{Channel, Clock, GroupBy, GroupStats, JobFilter, JobStore, SystemClock, WakeSignal};

struct Listener {
    id: u64,
    signal: WakeSignal,
    channels: Vec<Channel>,
}

#[derive(Default)]
struct MemoryState {
    /// id 順に並ぶので fetch の tie-break にそのまま使える
    jobs: BTreeMap<JobId, Job>,
    events: HashMap<JobId, Vec<JobEvent>>,
    next_job_id: i64,
    /// (task_name, periodic_id) → last deferred tick
    periodic_defers: HashMap<(String, String), i64>,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

impl MemoryState {
    fn allocate_job_id(&mut self) -> JobId {
        self.next_job_id += 1;
        JobId::new(self.next_job_id)
    }

    fn log(&mut self, id: JobId, kind: EventType, at: chrono::DateTime<chrono::Utc>) {
        self.events.entry(id).or_default().push(JobEvent::new(kind, at));
    }

    fn last_event_at(&self, id: JobId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.events.get(&id).and_then(|events| events.iter().map(|e| e.at).max())
    }

    fn remove(&mut self, id: JobId) {
        self.jobs.remove(&id);
        self.events.remove(&id);
    }

    fn held_locks(&self) -> Vec<&str> {
        self.jobs
            .values()
            .filter(|job| job.status.holds_lock())
            .filter_map(|job| job.lock.as_deref())
            .collect()
    }

    /// `queueing_lock` を別の pending job が持っていれば conflict。
    fn check_queueing_lock(
        &self,
        queueing_lock: Option<&str>,
        except: Option<JobId>,
    ) -> Result<(), StoreError> {
        let Some(queueing_lock) = queueing_lock else {
            return Ok(());
        };
        let taken = self.jobs.values().any(|job| {
            Some(job.id) != except
                && job.status == JobStatus::Pending
                && job.queueing_lock.as_deref() == Some(queueing_lock)
        });
        if taken {
            return Err(StoreError::QueueingLockConflict(queueing_lock.to_string()));
        }
        Ok(())
    }

    /// Check that `id` may move to `to`, and that a move to `pending` keeps
    /// the queueing lock unique.
    fn check_transition(&self, id: JobId, to: JobStatus) -> Result<(), StoreError> {
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        if !job.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }
        if to == JobStatus::Pending {
            self.check_queueing_lock(job.queueing_lock.as_deref(), Some(id))?;
        }
        Ok(())
    }

    /// Insert a pending job. Returns the signals to fire once the lock is released.
    fn insert(
        &mut self,
        new: NewJob,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(JobId, Vec<WakeSignal>), StoreError> {
        self.check_queueing_lock(new.queueing_lock.as_deref(), None)?;

        let id = self.allocate_job_id();
        let job = new.into_job(id);
        if job.scheduled_at.is_some() {
            self.log(id, EventType::Scheduled, now);
        }
        self.log(id, EventType::Deferred, now);

        let wake = self
            .listeners
            .iter()
            .filter(|l| l.channels.iter().any(|c| c.matches_queue(&job.queue_name)))
            .map(|l| l.signal.clone())
            .collect();
        self.jobs.insert(id, job);
        Ok((id, wake))
    }
}

/// In-memory `JobStore`.
#[derive(Clone)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
        }
    }

    /// Number of transports currently listening (for tests).
    pub async fn listener_count(&self) -> usize {
        self.state.lock().await.listeners.len()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn notify_all(signals: Vec<WakeSignal>) {
    for signal in signals {
        signal.notify();
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn defer(&self, job: NewJob) -> Result<JobId, StoreError> {
        let now = self.clock.now();
        let (id, wake) = {
            let mut state = self.state.lock().await;
            state.insert(job, now)?
        };
        notify_all(wake);
        Ok(id)
    }

    async fn defer_periodic(
        &self,
        job: NewJob,
        periodic_id: &str,
        tick_timestamp: i64,
    ) -> Result<Option<JobId>, StoreError> {
        let now = self.clock.now();
        let (id, wake) = {
            let mut state = self.state.lock().await;
            let key = (job.task_name.clone(), periodic_id.to_string());
            if state.periodic_defers.get(&key) == Some(&tick_timestamp) {
                return Ok(None);
            }
            let inserted = state.insert(job, now)?;
            state.periodic_defers.insert(key, tick_timestamp);
            inserted
        };
        notify_all(wake);
        Ok(Some(id))
    }

    async fn fetch(&self, queues: Option<&[String]>) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        // lock の判定は毎回その時点の状態から作り直す（キャッシュしない）
        let held = state.held_locks();
        let candidate = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .filter(|job| queues.is_none_or(|qs| qs.iter().any(|q| *q == job.queue_name)))
            .filter(|job| job.is_ready(now))
            .filter(|job| job.lock.as_deref().is_none_or(|l| !held.contains(&l)))
            // priority 降順、同順位は id 昇順
            .min_by_key(|job| (std::cmp::Reverse(job.priority), job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        state.log(id, EventType::Started, now);
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        job.status = JobStatus::Running;
        Ok(Some(job.clone()))
    }

    async fn finish(&self, id: JobId, status: JobStatus, delete: bool) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !status.is_finish_status() || !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
                to: status,
            });
        }

        if delete {
            state.remove(id);
            return Ok(());
        }

        job.status = status;
        job.attempts += 1;
        if let Some(kind) = EventType::for_status(status) {
            state.log(id, kind, now);
        }
        Ok(())
    }

    async fn retry(&self, id: JobId, decision: &RetryDecision) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_transition(id, JobStatus::Pending)?;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        job.status = JobStatus::Pending;
        job.attempts += 1;
        job.scheduled_at = Some(decision.retry_at);
        if let Some(priority) = decision.priority {
            job.priority = priority;
        }
        if let Some(queue) = &decision.queue {
            job.queue_name = queue.clone();
        }
        if let Some(lock) = &decision.lock {
            job.lock = Some(lock.clone());
        }
        state.log(id, EventType::Scheduled, now);
        state.log(id, EventType::DeferredForRetry, now);
        Ok(())
    }

    async fn cancel(
        &self,
        id: JobId,
        abort: bool,
        delete: bool,
    ) -> Result<Option<JobId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        match job.status {
            JobStatus::Pending if delete => {
                state.remove(id);
                Ok(Some(id))
            }
            JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                state.log(id, EventType::Cancelled, now);
                Ok(Some(id))
            }
            JobStatus::Running if abort => {
                job.status = JobStatus::Aborting;
                Ok(Some(id))
            }
            _ => Ok(None),
        }
    }

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).map(|job| job.status))
    }

    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_transition(id, status)?;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.status = status;
        if let Some(kind) = EventType::for_status(status) {
            state.log(id, kind, now);
        }
        Ok(())
    }

    async fn events(&self, id: JobId) -> Result<Vec<JobEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.events.get(&id).cloned().unwrap_or_default())
    }

    async fn stalled(
        &self,
        threshold: Duration,
        queue: Option<&str>,
        task: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let cutoff = self.clock.now() - to_chrono(threshold);
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .filter(|job| queue.is_none_or(|q| q == job.queue_name))
            .filter(|job| task.is_none_or(|t| t == job.task_name))
            .filter(|job| state.last_event_at(job.id).is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn purge(
        &self,
        retention: Duration,
        queue: Option<&str>,
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - to_chrono(retention);
        let mut state = self.state.lock().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status) && job.status.is_terminal())
            .filter(|job| queue.is_none_or(|q| q == job.queue_name))
            .filter(|job| state.last_event_at(job.id).is_some_and(|at| at < cutoff))
            .map(|job| job.id)
            .collect();
        for id in &expired {
            state.remove(*id);
        }
        Ok(expired.len() as u64)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect())
    }

    async fn stats(
        &self,
        filter: &JobFilter,
        group_by: GroupBy,
    ) -> Result<Vec<GroupStats>, StoreError> {
        let state = self.state.lock().await;
        Ok(GroupStats::collect(
            state.jobs.values().filter(|job| filter.matches(job)),
            group_by,
        ))
    }

    async fn listen(
        &self,
        signal: WakeSignal,
        channels: Vec<Channel>,
        stop: CancellationToken,
    ) -> Result<(), StoreError> {
        let id = {
            let mut state = self.state.lock().await;
            state.next_listener_id += 1;
            let id = state.next_listener_id;
            state.listeners.push(Listener {
                id,
                signal,
                channels,
            });
            id
        };

        stop.cancelled().await;

        let mut state = self.state.lock().await;
        state.listeners.retain(|l| l.id != id);
        Ok(())
    }

    async fn check_connection(&self) -> Result<bool, StoreError> {
        Ok(true)
    }
}
