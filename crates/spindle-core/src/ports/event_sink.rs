//! EventSink port - status 遷移の観測フック
//!
//! worker / app が job の status を変えるたびに `on_transition` を呼ぶ。
//! 既定は `TracingEventSink`（tracing へ構造化ログを出すだけ）。
//! メトリクス送信などはこの trait を実装して差し込む。

use std::time::Duration;

use crate::domain::{JobId, JobStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub job_id: JobId,
    pub queue: String,
    pub task: String,
    pub status: JobStatus,
    pub attempts: u32,
    /// Handler run time, when the transition ends an execution.
    pub duration: Option<Duration>,
}

pub trait EventSink: Send + Sync {
    fn on_transition(&self, transition: &StatusTransition);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_transition(&self, t: &StatusTransition) {
        tracing::debug!(
            target: "spindle::transitions",
            job_id = t.job_id.get(),
            queue = %t.queue,
            task = %t.task,
            status = %t.status,
            attempts = t.attempts,
            duration_ms = t.duration.map(|d| d.as_millis() as u64),
            "job status changed"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn on_transition(&self, _transition: &StatusTransition) {}
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::sync::Mutex;

    /// 受け取った遷移を順に貯めるだけの sink
    #[derive(Default)]
    pub struct RecordingSink(Mutex<Vec<StatusTransition>>);

    impl RecordingSink {
        pub fn transitions(&self) -> Vec<StatusTransition> {
            self.0.lock().unwrap().clone()
        }

        pub fn statuses(&self, job_id: JobId) -> Vec<JobStatus> {
            self.transitions()
                .into_iter()
                .filter(|t| t.job_id == job_id)
                .map(|t| t.status)
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn on_transition(&self, transition: &StatusTransition) {
            self.0.lock().unwrap().push(transition.clone());
        }
    }
}
