//! JobStatus - job の状態と遷移規則
//!
//! ```text
//! pending → running → {succeeded, failed, aborting}
//! aborting → aborted
//! failed | pending → (retry) → pending
//! pending → (cancel) → cancelled
//! ```
//!
//! `running → aborted` も許可する（abort 要求前に handler が自発的に中断した場合）。
//! 終端状態は行の物理削除以外では抜けない。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Aborting,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Aborting,
        JobStatus::Aborted,
    ];

    /// Statuses a finished job can be purged from.
    pub const FINISHED: [JobStatus; 4] = [
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Aborting => "aborting",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::FINISHED.contains(&self)
    }

    /// `running` と `aborting` は lock を保持している状態。
    pub fn holds_lock(self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Aborting)
    }

    /// Valid targets for `finish`.
    pub fn is_finish_status(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Aborted
        )
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Pending)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Aborting)
                | (Running, Aborted)
                | (Running, Pending)
                | (Aborting, Aborted)
                | (Aborting, Succeeded)
                | (Aborting, Failed)
                | (Aborting, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
