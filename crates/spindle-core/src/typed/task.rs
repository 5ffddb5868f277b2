//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const NAME`) と Associated Types (`type Output`)
//! - default メソッドで queue / priority / retry の既定値を持たせる

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::retry::RetryStrategy;
use crate::domain::{JobArgs, NewJob, DEFAULT_QUEUE};

/// Task は task 名と引数の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const NAME: &'static str = "mail.send";
///     type Output = ();
///
///     fn queue() -> &'static str {
///         "mail"
///     }
/// }
/// ```
///
/// 引数は JSON object として保存されるので、struct（named fields）で定義する。
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    /// Handler の戻り値。成功ログに載る。
    type Output: Serialize + Send + 'static;

    fn queue() -> &'static str {
        DEFAULT_QUEUE
    }

    fn priority() -> i32 {
        0
    }

    /// `None` = 失敗したら再実行しない
    fn retry_strategy() -> Option<RetryStrategy> {
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskArgsError {
    #[error("task arguments must serialize to a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("failed to serialize task arguments: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Serialize `task` into a defer request with the task's defaults.
pub fn new_job<T: Task>(task: &T) -> Result<NewJob, TaskArgsError> {
    let args: JobArgs = match serde_json::to_value(task)? {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => return Err(TaskArgsError::NotAnObject("null")),
        serde_json::Value::Array(_) => return Err(TaskArgsError::NotAnObject("an array")),
        _ => return Err(TaskArgsError::NotAnObject("a scalar")),
    };
    Ok(NewJob::new(T::NAME)
        .queue(T::queue())
        .priority(T::priority())
        .args(args))
}
