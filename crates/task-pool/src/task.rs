//! Task, result and handler types.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::{BoxError, TaskError};

/// A unit of work submitted to a [`TaskExecutor`](crate::TaskExecutor).
///
/// `index` and `total` are carried for logging only.
#[derive(Debug, Clone)]
pub struct Task<T> {
    pub payload: T,
    pub index: usize,
    pub total: usize,
}

impl<T> Task<T> {
    pub fn new(payload: T, index: usize, total: usize) -> Self {
        Self {
            payload,
            index,
            total,
        }
    }
}

/// Outcome of one task.
#[derive(Debug)]
pub struct TaskResult<R> {
    /// Key derived from the payload by [`TaskHandler::key`].
    pub key: String,
    /// Index of the originating task.
    pub index: usize,
    pub outcome: Result<R, TaskError>,
}

impl<R> TaskResult<R> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }
}

/// Processes task payloads for an executor.
///
/// `handle` runs on its own spawned task so that the worker can race it
/// against the per-task timeout.
#[async_trait]
pub trait TaskHandler<T, R>: Send + Sync + 'static
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Identity of the payload, reported back on the result.
    fn key(&self, payload: &T) -> String;

    async fn handle(&self, payload: T) -> Result<R, BoxError>;
}

/// Adapts a pair of closures into a [`TaskHandler`].
pub struct FnHandler<T, K, F> {
    key: K,
    handle: F,
    _payload: PhantomData<fn(T)>,
}

impl<T, K, F> FnHandler<T, K, F> {
    pub fn new(key: K, handle: F) -> Self {
        Self {
            key,
            handle,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, R, K, F, Fut> TaskHandler<T, R> for FnHandler<T, K, F>
where
    T: Send + 'static,
    R: Send + 'static,
    K: Fn(&T) -> String + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    fn key(&self, payload: &T) -> String {
        (self.key)(payload)
    }

    async fn handle(&self, payload: T) -> Result<R, BoxError> {
        (self.handle)(payload).await
    }
}
