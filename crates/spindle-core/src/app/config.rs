//! WorkerConfig - worker pool の設定
//!
//! CLI では `config` crate で TOML / 環境変数から読み込むので、
//! すべて serde で deserialize でき、未指定フィールドは既定値になる。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::JobStatus;

/// Which finished jobs are deleted instead of kept with their final status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteJobCondition {
    #[default]
    Never,
    Successful,
    Always,
}

impl DeleteJobCondition {
    pub fn should_delete(self, status: JobStatus) -> bool {
        match self {
            DeleteJobCondition::Never => false,
            DeleteJobCondition::Successful => status == JobStatus::Succeeded,
            DeleteJobCondition::Always => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    /// `None` = listen on every queue.
    pub queues: Option<Vec<String>>,
    pub concurrency: usize,
    /// `false` だと job が無くなった時点で loop を抜ける（batch 実行向け）。
    pub wait: bool,
    /// Base polling timeout while idle.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub listen_notify: bool,
    pub delete_jobs: DeleteJobCondition,
    #[serde(with = "humantime_serde")]
    pub abort_poll_interval: Duration,
    pub additional_context: Map<String, Value>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            queues: None,
            concurrency: 1,
            wait: true,
            timeout: Duration::from_secs(5),
            listen_notify: true,
            delete_jobs: DeleteJobCondition::Never,
            abort_poll_interval: Duration::from_secs(1),
            additional_context: Map::new(),
        }
    }
}

impl WorkerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn listen_notify(mut self, listen_notify: bool) -> Self {
        self.listen_notify = listen_notify;
        self
    }

    pub fn delete_jobs(mut self, condition: DeleteJobCondition) -> Self {
        self.delete_jobs = condition;
        self
    }

    pub fn abort_poll_interval(mut self, interval: Duration) -> Self {
        self.abort_poll_interval = interval;
        self
    }

    pub fn context_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional_context.insert(key.into(), value.into());
        self
    }
}
