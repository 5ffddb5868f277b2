//! Typed task API
//!
//! - `Task`: task 名と引数の型を対応付ける
//! - `Handler` / `ContextHandler`: 実行本体（context を受け取るかどうかで使い分け）
//! - `TaskRegistry`: task 名 → handler + retry policy の表
//! - `JobContext`: 実行中 job のメタデータと abort トークン
//! - `RetryPolicy` / `RetryStrategy`: 失敗時の再実行判断

pub mod context;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod task;

pub use self::context::JobContext;
pub use self::handler::{ContextHandler, DynHandler, FnHandler, Handler};
pub use self::registry::{RegisteredTask, RegistryError, TaskRegistry};
pub use self::retry::{NoRetry, RetryPolicy, RetryStrategy};
pub use self::task::{Task, TaskArgsError};
