//! spindle-core
//!
//! Durable job queue and worker engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, state, events, outcome, decision, errors）
//! - **ports**: 抽象化レイヤー（JobStore, Clock, WakeSignal, EventSink）
//! - **impls**: 実装（InMemoryJobStore, PgJobStore）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TaskRegistry, RetryStrategy）
//! - **app**: アプリケーションロジック（AppBuilder, Worker, PeriodicDeferrer, ShutdownCoordinator）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use crate::app::{
    App, AppBuilder, BuildError, DeferError, DeleteJobCondition, PeriodicTask, ShutdownCoordinator,
    Worker, WorkerConfig, WorkerError,
};
pub use crate::domain::{Job, JobId, JobStatus, NewJob, StoreError, TaskError, TaskFault};
pub use crate::ports::JobStore;
pub use crate::typed::{ContextHandler, Handler, JobContext, RetryStrategy, Task};
