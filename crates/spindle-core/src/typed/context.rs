//! JobContext - 実行中 job の情報
//!
//! handler が `ContextHandler` として登録されたときだけ渡される。
//! abort は協調的: store 側で `aborting` になると worker の watcher が
//! `abort` トークンを cancel するので、handler は適当な区切りで
//! `abort_requested()` を見るか `aborted().await` と select して
//! `TaskError::Aborted` を返す。

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::domain::{Job, JobStatus, StoreError, WorkerId};
use crate::ports::JobStore;

#[derive(Clone)]
pub struct JobContext {
    pub worker_name: String,
    pub worker_id: WorkerId,
    /// Index of the worker loop (0..concurrency).
    pub worker_index: usize,
    pub worker_queues: Option<Vec<String>>,
    pub job: Job,
    pub additional_context: Map<String, Value>,
    started: Instant,
    abort: CancellationToken,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_name: String,
        worker_id: WorkerId,
        worker_index: usize,
        worker_queues: Option<Vec<String>>,
        job: Job,
        additional_context: Map<String, Value>,
        abort: CancellationToken,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            worker_name,
            worker_id,
            worker_index,
            worker_queues,
            job,
            additional_context,
            started: Instant::now(),
            abort,
            store,
        }
    }

    /// 1-based number of this execution.
    pub fn attempt(&self) -> u32 {
        self.job.attempts + 1
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once an abort has been requested for this job.
    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }

    /// Ask the store directly instead of waiting for the next watcher poll.
    pub async fn should_abort(&self) -> Result<bool, StoreError> {
        if self.abort.is_cancelled() {
            return Ok(true);
        }
        let aborting = self.store.status(self.job.id).await? == Some(JobStatus::Aborting);
        if aborting {
            self.abort.cancel();
        }
        Ok(aborting)
    }

    /// Store handle, e.g. to defer follow-up jobs.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queues_display(&self) -> String {
        queues_display(self.worker_queues.as_deref())
    }

    /// `worker 2: math.sum[12](a=1, b=2) (started 1.503 s ago)`
    pub fn job_description(&self, now: Instant) -> String {
        let elapsed = now.saturating_duration_since(self.started);
        format!(
            "worker {}: {} (started {:.3} s ago)",
            self.worker_index,
            self.job.call_string(),
            elapsed.as_secs_f64()
        )
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("worker_name", &self.worker_name)
            .field("worker_id", &self.worker_id)
            .field("worker_index", &self.worker_index)
            .field("job", &self.job.id)
            .field("abort_requested", &self.abort_requested())
            .finish()
    }
}

pub(crate) fn queues_display(queues: Option<&[String]>) -> String {
    match queues {
        None => "all queues".to_string(),
        Some(queues) => format!("queues {}", queues.join(", ")),
    }
}
