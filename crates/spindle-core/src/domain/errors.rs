//! Store errors.
//!
//! worker はこれらを握りつぶさず、呼び出し元（supervisor）へ伝播する。

use super::ids::JobId;
use super::state::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A pending job already holds this queueing lock.
    #[error("a pending job already holds queueing lock '{0}'")]
    QueueingLockConflict(String),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("stored data is invalid: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_queueing_lock_conflict(&self) -> bool {
        matches!(self, StoreError::QueueingLockConflict(_))
    }
}
