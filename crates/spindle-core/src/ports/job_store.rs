//! JobStore port - job の永続化と原子的操作
//!
//! lock / priority / queueing_lock / periodic dedup の調停は、すべてこの trait の
//! 各操作の内部（単一の原子的操作）で完結させる。worker 側のメモリで
//! 何かを覚えておくことはしない（複数プロセスが同じ store を共有するため）。
//!
//! # 操作一覧
//! | 操作 | 概要 |
//! |------|------|
//! | `defer` | pending で作成。queueing_lock 衝突は `QueueingLockConflict` |
//! | `defer_periodic` | 同じ tick の二重 defer は `None` |
//! | `fetch` | ready かつ lock 未保持の最高 priority（同順位は最小 id）を claim |
//! | `finish` | 終端 status、attempts+1、必要なら行を削除 |
//! | `retry` | pending に戻し `scheduled_at = retry_at`、attempts+1 |
//! | `cancel` | pending → cancelled/削除、running + abort → aborting |
//! | `stalled` | 最終イベントが古い running job（外部 reaper 用） |
//! | `purge` | 保持期間を過ぎた終端行の削除（外部メンテナンス用） |

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::notify::{Channel, WakeSignal};
use crate::domain::{Job, JobEvent, JobId, JobStatus, NewJob, RetryDecision, StoreError};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn defer(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Defer one tick of a periodic task. `None` when this
    /// `(task_name, periodic_id, tick_timestamp)` was already deferred.
    async fn defer_periodic(
        &self,
        job: NewJob,
        periodic_id: &str,
        tick_timestamp: i64,
    ) -> Result<Option<JobId>, StoreError>;

    async fn fetch(&self, queues: Option<&[String]>) -> Result<Option<Job>, StoreError>;

    async fn finish(&self, id: JobId, status: JobStatus, delete: bool) -> Result<(), StoreError>;

    async fn retry(&self, id: JobId, decision: &RetryDecision) -> Result<(), StoreError>;

    async fn cancel(&self, id: JobId, abort: bool, delete: bool)
    -> Result<Option<JobId>, StoreError>;

    async fn status(&self, id: JobId) -> Result<Option<JobStatus>, StoreError>;

    /// Administrative override, e.g. re-queue a failed job.
    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError>;

    async fn events(&self, id: JobId) -> Result<Vec<JobEvent>, StoreError>;

    async fn stalled(
        &self,
        threshold: Duration,
        queue: Option<&str>,
        task: Option<&str>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Returns the number of deleted rows.
    async fn purge(
        &self,
        retention: Duration,
        queue: Option<&str>,
        statuses: &[JobStatus],
    ) -> Result<u64, StoreError>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Per-group job counts by status, sorted by group name.
    async fn stats(&self, filter: &JobFilter, group_by: GroupBy)
    -> Result<Vec<GroupStats>, StoreError>;

    async fn list_queues(&self, filter: &JobFilter) -> Result<Vec<GroupStats>, StoreError> {
        self.stats(filter, GroupBy::Queue).await
    }

    async fn list_tasks(&self, filter: &JobFilter) -> Result<Vec<GroupStats>, StoreError> {
        self.stats(filter, GroupBy::Task).await
    }

    async fn list_locks(&self, filter: &JobFilter) -> Result<Vec<GroupStats>, StoreError> {
        self.stats(filter, GroupBy::Lock).await
    }

    /// Fire `signal` whenever a job is deferred on one of `channels`,
    /// until `stop` is cancelled.
    async fn listen(
        &self,
        signal: WakeSignal,
        channels: Vec<Channel>,
        stop: CancellationToken,
    ) -> Result<(), StoreError>;

    async fn check_connection(&self) -> Result<bool, StoreError>;
}

/// Filter for administrative listings. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub id: Option<JobId>,
    pub queue: Option<String>,
    pub task: Option<String>,
    pub lock: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.id.is_none_or(|id| id == job.id)
            && self.queue.as_deref().is_none_or(|q| q == job.queue_name)
            && self.task.as_deref().is_none_or(|t| t == job.task_name)
            && self
                .lock
                .as_deref()
                .is_none_or(|l| job.lock.as_deref() == Some(l))
            && self.status.is_none_or(|s| s == job.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Queue,
    Task,
    Lock,
}

impl GroupBy {
    pub fn key(self, job: &Job) -> Option<String> {
        match self {
            GroupBy::Queue => Some(job.queue_name.clone()),
            GroupBy::Task => Some(job.task_name.clone()),
            GroupBy::Lock => job.lock.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Group key; `None` only for the "no lock" group.
    pub name: Option<String>,
    pub jobs_count: u64,
    pub stats: BTreeMap<JobStatus, u64>,
}

impl GroupStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.stats.get(&status).copied().unwrap_or(0)
    }

    /// Build sorted groups from jobs.
    pub fn collect<'a>(jobs: impl IntoIterator<Item = &'a Job>, group_by: GroupBy) -> Vec<Self> {
        let mut groups: BTreeMap<Option<String>, GroupStats> = BTreeMap::new();
        for job in jobs {
            let key = group_by.key(job);
            let group = groups.entry(key.clone()).or_insert_with(|| GroupStats {
                name: key,
                ..GroupStats::default()
            });
            group.jobs_count += 1;
            *group.stats.entry(job.status).or_insert(0) += 1;
        }
        groups.into_values().collect()
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: i64, queue: &str, lock: Option<&str>, status: JobStatus) -> Job {
        let mut new = NewJob::new("t").queue(queue);
        if let Some(lock) = lock {
            new = new.lock(lock);
        }
        let mut job = new.into_job(JobId::new(id));
        job.status = status;
        job
    }

    #[test]
    fn filter_matches_on_every_set_field() {
        let j = job(1, "q", Some("l"), JobStatus::Pending);
        assert!(JobFilter::default().matches(&j));
        assert!(
            JobFilter {
                queue: Some("q".into()),
                lock: Some("l".into()),
                status: Some(JobStatus::Pending),
                ..JobFilter::default()
            }
            .matches(&j)
        );
        assert!(
            !JobFilter {
                lock: Some("other".into()),
                ..JobFilter::default()
            }
            .matches(&j)
        );
        assert!(
            !JobFilter {
                id: Some(JobId::new(2)),
                ..JobFilter::default()
            }
            .matches(&j)
        );
    }

    #[test]
    fn group_stats_count_by_status_sorted_by_name() {
        let jobs = vec![
            job(1, "b", None, JobStatus::Pending),
            job(2, "a", Some("x"), JobStatus::Running),
            job(3, "b", Some("x"), JobStatus::Pending),
            job(4, "b", None, JobStatus::Failed),
        ];

        let queues = GroupStats::collect(&jobs, GroupBy::Queue);
        assert_eq!(queues.len(), 2);
        assert_eq!(queues[0].name.as_deref(), Some("a"));
        assert_eq!(queues[1].jobs_count, 3);
        assert_eq!(queues[1].count(JobStatus::Pending), 2);
        assert_eq!(queues[1].count(JobStatus::Failed), 1);
        assert_eq!(queues[1].count(JobStatus::Running), 0);

        let locks = GroupStats::collect(&jobs, GroupBy::Lock);
        assert_eq!(locks[0].name, None);
        assert_eq!(locks[0].jobs_count, 2);
        assert_eq!(locks[1].name.as_deref(), Some("x"));
    }
}
