//! Job events - job ごとの追記専用ログ
//!
//! 最初のイベントは必ず `scheduled` か `deferred`。
//! 時刻順に並ぶことは store 側が保証する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::{JobStatus, UnknownStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Scheduled,
    Deferred,
    Started,
    Succeeded,
    Failed,
    Cancelled,
    Aborted,
    DeferredForRetry,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Scheduled => "scheduled",
            EventType::Deferred => "deferred",
            EventType::Started => "started",
            EventType::Succeeded => "succeeded",
            EventType::Failed => "failed",
            EventType::Cancelled => "cancelled",
            EventType::Aborted => "aborted",
            EventType::DeferredForRetry => "deferred_for_retry",
        }
    }

    /// Event logged when a job reaches `status`, if that status has one.
    pub fn for_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Succeeded => Some(EventType::Succeeded),
            JobStatus::Failed => Some(EventType::Failed),
            JobStatus::Cancelled => Some(EventType::Cancelled),
            JobStatus::Aborted => Some(EventType::Aborted),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        let all = [
            EventType::Scheduled,
            EventType::Deferred,
            EventType::Started,
            EventType::Succeeded,
            EventType::Failed,
            EventType::Cancelled,
            EventType::Aborted,
            EventType::DeferredForRetry,
        ];
        all.into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: EventType, at: DateTime<Utc>) -> Self {
        Self { kind, at }
    }
}
