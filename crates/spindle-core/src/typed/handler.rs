//! Handler traits - Task を実行する Handler の定義
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<T>`, `ContextHandler<T>`)
//! - Object-safe trait (`DynHandler`)
//! - Type erasure パターン (`TypedHandler<T, H>` → `DynHandler`)
//!
//! worker は `DynHandler` しか知らない。JSON 引数のデコードと戻り値の
//! シリアライズはラッパー側で行う。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::context::JobContext;
use super::task::Task;
use crate::domain::{JobArgs, TaskError};

/// Handler は Task を実行する（context 不要な場合）
///
/// # 使用例
/// ```ignore
/// struct SumHandler;
///
/// #[async_trait]
/// impl Handler<Sum> for SumHandler {
///     async fn handle(&self, task: Sum) -> Result<i64, TaskError> {
///         Ok(task.a + task.b)
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<T::Output, TaskError>;
}

/// ContextHandler は `JobContext` も受け取る Handler
///
/// 試行回数・worker 情報・abort トークンが必要な task はこちらで登録する。
#[async_trait]
pub trait ContextHandler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: &JobContext, task: T) -> Result<T::Output, TaskError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// `Arc<dyn DynHandler>` として registry に格納され、worker から
/// `tokio::spawn` される（だから引数は owned）。
#[async_trait]
pub trait DynHandler: Send + Sync {
    /// `Ok(None)` when the handler returned nothing worth logging.
    async fn handle_dyn(&self, ctx: JobContext, args: JobArgs) -> Result<Option<Value>, TaskError>;

    fn task_name(&self) -> &str;
}

fn decode<T: Task>(args: JobArgs) -> Result<T, TaskError> {
    Ok(serde_json::from_value(Value::Object(args))?)
}

fn encode<R: Serialize>(result: R) -> Result<Option<Value>, TaskError> {
    match serde_json::to_value(result)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, _ctx: JobContext, args: JobArgs) -> Result<Option<Value>, TaskError> {
        let task = decode::<T>(args)?;
        encode(self.handler.handle(task).await?)
    }

    fn task_name(&self) -> &str {
        T::NAME
    }
}

pub struct ContextTypedHandler<T: Task, H: ContextHandler<T>> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T: Task, H: ContextHandler<T>> ContextTypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: ContextHandler<T>> DynHandler for ContextTypedHandler<T, H> {
    async fn handle_dyn(&self, ctx: JobContext, args: JobArgs) -> Result<Option<Value>, TaskError> {
        let task = decode::<T>(args)?;
        encode(self.handler.handle(&ctx, task).await?)
    }

    fn task_name(&self) -> &str {
        T::NAME
    }
}

/// Untyped handler built from a closure over raw JSON args.
///
/// ```ignore
/// registry.register_fn("echo", None, |_ctx, args| async move {
///     Ok(args.get("message").cloned())
/// })?;
/// ```
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut, R> DynHandler for FnHandler<F>
where
    F: Fn(JobContext, JobArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn handle_dyn(&self, ctx: JobContext, args: JobArgs) -> Result<Option<Value>, TaskError> {
        encode((self.func)(ctx, args).await?)
    }

    fn task_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::Sum;

    pub struct SumHandler;

    #[async_trait]
    impl Handler<Sum> for SumHandler {
        async fn handle(&self, task: Sum) -> Result<i64, TaskError> {
            Ok(task.a + task.b)
        }
    }

    pub struct AttemptEcho;

    #[async_trait]
    impl ContextHandler<Sum> for AttemptEcho {
        async fn handle(&self, ctx: &JobContext, _task: Sum) -> Result<i64, TaskError> {
            Ok(i64::from(ctx.attempt()))
        }
    }
}
