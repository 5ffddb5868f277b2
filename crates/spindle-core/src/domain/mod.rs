//! Domain model (job rows, statuses, events, outcomes, errors).
//!
//! Store や worker から独立した純粋な値だけを置く。
//! I/O を伴うものは `ports` / `impls` 側に寄せる。

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod state;

pub use self::decision::RetryDecision;
pub use self::errors::StoreError;
pub use self::events::{EventType, JobEvent};
pub use self::ids::{JobId, WorkerId};
pub use self::job::{Job, JobArgs, NewJob, DEFAULT_QUEUE};
pub use self::outcome::{BoxError, Outcome, TaskError, TaskFault};
pub use self::state::{JobStatus, UnknownStatus};
