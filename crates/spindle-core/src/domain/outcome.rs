//! Outcome - handler 実行結果の明示的な表現
//!
//! handler は `Result<_, TaskError>` を返し、worker がそれを retry policy と
//! 突き合わせて `Outcome` に変換する。worker loop は `Outcome` だけを見て
//! store への反映（finish / retry）を決める。
//!
//! `TaskError::Critical` だけは `Outcome` とは別に worker loop の外へ伝播する。

use std::fmt;

use serde_json::Value;

use super::decision::RetryDecision;
use super::state::JobStatus;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { result: Option<Value> },
    Retry(RetryDecision),
    Failed,
    Aborted,
}

impl Outcome {
    /// Terminal status to record, `None` when the job is rescheduled.
    pub fn final_status(&self) -> Option<JobStatus> {
        match self {
            Outcome::Success { .. } => Some(JobStatus::Succeeded),
            Outcome::Retry(_) => None,
            Outcome::Failed => Some(JobStatus::Failed),
            Outcome::Aborted => Some(JobStatus::Aborted),
        }
    }
}

/// A failure raised by a handler.
///
/// `kind` は retry policy のフィルタ（`RetryStrategy::retry_on`）に使う任意のラベル。
#[derive(Debug)]
pub struct TaskFault {
    kind: Option<String>,
    message: String,
    source: Option<BoxError>,
}

impl TaskFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error(err: impl Into<BoxError>) -> Self {
        let source = err.into();
        Self {
            kind: None,
            message: source.to_string(),
            source: Some(source),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "{kind}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TaskFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The handler observed an abort request and stopped.
    #[error("job aborted")]
    Aborted,

    /// Ordinary failure, routed through the task's retry policy.
    #[error(transparent)]
    Fault(TaskFault),

    /// Non-task failure. Recorded, then re-raised out of the worker loop.
    #[error("critical fault: {0}")]
    Critical(TaskFault),
}

impl TaskError {
    pub fn fault(err: impl Into<BoxError>) -> Self {
        TaskError::Fault(TaskFault::from_error(err))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Fault(TaskFault::new(message))
    }

    pub fn critical(err: impl Into<BoxError>) -> Self {
        TaskError::Critical(TaskFault::from_error(err))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Fault(TaskFault::from_error(err).with_kind("decode"))
    }
}

impl From<TaskFault> for TaskError {
    fn from(fault: TaskFault) -> Self {
        TaskError::Fault(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn outcome_status_mapping() {
        assert_eq!(
            Outcome::Success { result: None }.final_status(),
            Some(JobStatus::Succeeded)
        );
        assert_eq!(Outcome::Failed.final_status(), Some(JobStatus::Failed));
        assert_eq!(Outcome::Aborted.final_status(), Some(JobStatus::Aborted));
        let retry = Outcome::Retry(RetryDecision::at(chrono::Utc::now()));
        assert_eq!(retry.final_status(), None);
    }

    #[test]
    fn fault_keeps_kind_and_source() {
        let io = std::io::Error::other("disk full");
        let fault = TaskFault::from_error(io).with_kind("io");
        assert_eq!(fault.kind(), Some("io"));
        assert_eq!(fault.to_string(), "io: disk full");
        assert!(fault.source().is_some());
    }

    #[test]
    fn decode_errors_are_ordinary_faults() {
        let err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let task_err = TaskError::from(err);
        assert!(matches!(&task_err, TaskError::Fault(f) if f.kind() == Some("decode")));
    }
}
