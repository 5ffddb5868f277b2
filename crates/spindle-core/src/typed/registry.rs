//! TaskRegistry - task 名 → handler + retry policy の表
//!
//! 起動時に登録し、以後は読み取り専用。worker は `task_name` でここを引くだけで、
//! 表にない名前は必ず `TaskNotFound` として扱う。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use super::context::JobContext;
use super::handler::{ContextHandler, ContextTypedHandler, DynHandler, FnHandler, Handler, TypedHandler};
use super::retry::{NoRetry, RetryPolicy, RetryStrategy};
use super::task::Task;
use crate::domain::{JobArgs, TaskError};

/// One registry entry.
#[derive(Clone)]
pub struct RegisteredTask {
    handler: Arc<dyn DynHandler>,
    retry: Arc<dyn RetryPolicy>,
}

impl RegisteredTask {
    pub fn handler(&self) -> &Arc<dyn DynHandler> {
        &self.handler
    }

    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.retry.as_ref()
    }
}

fn policy(strategy: Option<RetryStrategy>) -> Arc<dyn RetryPolicy> {
    match strategy {
        Some(strategy) => Arc::new(strategy),
        None => Arc::new(NoRetry),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Handler for task '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        name: &str,
        handler: Arc<dyn DynHandler>,
        retry: Arc<dyn RetryPolicy>,
    ) -> Result<(), RegistryError> {
        if self.tasks.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        self.tasks
            .insert(name.to_string(), RegisteredTask { handler, retry });
        Ok(())
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(
            T::NAME,
            Arc::new(TypedHandler::<T, H>::new(handler)),
            policy(T::retry_strategy()),
        )
    }

    pub fn register_with_context<T: Task, H: ContextHandler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(
            T::NAME,
            Arc::new(ContextTypedHandler::<T, H>::new(handler)),
            policy(T::retry_strategy()),
        )
    }

    pub fn register_fn<F, Fut, R>(
        &mut self,
        name: &str,
        retry: Option<RetryStrategy>,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(JobContext, JobArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.insert(name, Arc::new(FnHandler::new(name, func)), policy(retry))
    }

    /// Register with a custom retry policy.
    pub fn register_dyn(
        &mut self,
        handler: Arc<dyn DynHandler>,
        retry: Arc<dyn RetryPolicy>,
    ) -> Result<(), RegistryError> {
        let name = handler.task_name().to_string();
        self.insert(&name, handler, retry)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }
}
