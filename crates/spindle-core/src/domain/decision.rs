//! RetryDecision - retry policy の出力
//!
//! policy が「いつ・どう再実行するか」を決めたときだけ生成される。
//! `None`（決定なし）は終端の `failed` を意味する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    pub retry_at: DateTime<Utc>,
    pub priority: Option<i32>,
    pub queue: Option<String>,
    pub lock: Option<String>,
}

impl RetryDecision {
    pub fn at(retry_at: DateTime<Utc>) -> Self {
        Self {
            retry_at,
            priority: None,
            queue: None,
            lock: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.lock = Some(lock.into());
        self
    }
}
