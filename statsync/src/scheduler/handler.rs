//! Job handler seam.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Per-invocation context handed to a [`JobHandler`].
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: String,
    /// Cancelled on process shutdown. Long-running handlers should watch it.
    pub cancel: CancellationToken,
    pub max_batch_size: Option<usize>,
}

impl JobContext {
    pub fn new(job: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            job: job.into(),
            cancel,
            max_batch_size: None,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: Option<usize>) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }
}

/// Work bound to a job name.
///
/// Failures are reported by returning an error; pushing individual
/// sub-task failures to the failed-job store is up to the handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnJobHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, ctx: JobContext) -> Result<()> {
        (self.f)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnJobHandler { f })
}
