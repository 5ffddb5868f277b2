//! Job rows and defer requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::state::JobStatus;

/// Queue used when a defer request does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Task arguments: parameter name → JSON value.
pub type JobArgs = serde_json::Map<String, serde_json::Value>;

/// One unit of deferred work as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub task_name: String,
    pub priority: i32,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub args: JobArgs,
    pub status: JobStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl Job {
    /// `task_name[id](k=v, ...)` - ログ用の短い表現
    pub fn call_string(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}[{}]({})", self.task_name, self.id.get(), args)
    }

    /// Due for fetch at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// A defer request (everything but the store-assigned fields).
///
/// # 使用例
/// ```ignore
/// let job = NewJob::new("send_email")
///     .queue("mail")
///     .priority(5)
///     .lock("user:42")
///     .arg("to", "a@example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_name: String,
    pub queue_name: String,
    pub priority: i32,
    pub lock: Option<String>,
    pub queueing_lock: Option<String>,
    pub args: JobArgs,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            queue_name: DEFAULT_QUEUE.to_string(),
            priority: 0,
            lock: None,
            queueing_lock: None,
            args: JobArgs::new(),
            scheduled_at: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = queue.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn queueing_lock(mut self, queueing_lock: impl Into<String>) -> Self {
        self.queueing_lock = Some(queueing_lock.into());
        self
    }

    pub fn args(mut self, args: JobArgs) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Materialize the row a store writes for this request.
    pub fn into_job(self, id: JobId) -> Job {
        Job {
            id,
            queue_name: self.queue_name,
            task_name: self.task_name,
            priority: self.priority,
            lock: self.lock,
            queueing_lock: self.queueing_lock,
            args: self.args,
            status: JobStatus::Pending,
            scheduled_at: self.scheduled_at,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn new_job_defaults() {
        let job = NewJob::new("sum");
        assert_eq!(job.queue_name, DEFAULT_QUEUE);
        assert_eq!(job.priority, 0);
        assert!(job.lock.is_none());
        assert!(job.queueing_lock.is_none());
        assert!(job.args.is_empty());
    }

    #[test]
    fn into_job_starts_pending_with_no_attempts() {
        let job = NewJob::new("sum")
            .queue("math")
            .lock("l")
            .arg("a", 1)
            .into_job(JobId::new(3));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.queue_name, "math");
        assert_eq!(job.lock.as_deref(), Some("l"));
    }

    #[test]
    fn call_string_lists_args() {
        let job = NewJob::new("sum")
            .arg("a", 1)
            .arg("b", "x")
            .into_job(JobId::new(12));
        assert_eq!(job.call_string(), "sum[12](a=1, b=\"x\")");
    }

    #[rstest]
    #[case::unscheduled(None, true)]
    #[case::past(Some(9), true)]
    #[case::exactly_now(Some(10), true)]
    #[case::future(Some(11), false)]
    fn readiness(#[case] scheduled_minute: Option<u32>, #[case] ready: bool) {
        let at = |m| Utc.with_ymd_and_hms(2025, 1, 1, 0, m, 0).unwrap();
        let mut job = NewJob::new("t").into_job(JobId::new(1));
        job.scheduled_at = scheduled_minute.map(at);
        assert_eq!(job.is_ready(at(10)), ready);
    }
}
