//! Bounded task executor.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ExecutorError, Task, TaskError, TaskHandler, TaskResult};

/// Configuration for a [`TaskExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Name used in log records (e.g. "team").
    pub name: String,
    /// Number of concurrent workers. Values below 1 are raised to 1.
    pub workers: usize,
    /// Upper bound for a single task.
    pub task_timeout: Duration,
    /// Capacity of the task and result queues.
    ///
    /// Defaults to `workers` when `None`.
    pub queue_capacity: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            workers: 4,
            task_timeout: Duration::from_secs(60),
            queue_capacity: None,
        }
    }
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>, workers: usize, task_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            workers,
            task_timeout,
            queue_capacity: None,
        }
    }

    fn capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.workers).max(1)
    }
}

/// Fixed-size set of workers draining a task queue into a result queue.
///
/// Lifecycle: [`new`](Self::new) → [`start`](Self::start) →
/// [`add_task`](Self::add_task)… → [`close`](Self::close) →
/// [`wait`](Self::wait). The result queue is bounded, so results must be
/// consumed concurrently with `add_task`/`wait`; take the receiver with
/// [`take_results`](Self::take_results) and drain it from another task, or use
/// [`run_batch`](Self::run_batch) which does both.
pub struct TaskExecutor<T: Send + 'static, R: Send + 'static> {
    config: ExecutorConfig,
    handler: Arc<dyn TaskHandler<T, R>>,
    cancel: CancellationToken,
    task_tx: Option<mpsc::Sender<Task<T>>>,
    task_rx: Arc<Mutex<mpsc::Receiver<Task<T>>>>,
    result_tx: Option<mpsc::Sender<TaskResult<R>>>,
    result_rx: Option<mpsc::Receiver<TaskResult<R>>>,
    workers: JoinSet<()>,
    started: bool,
}

impl<T, R> TaskExecutor<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Create an executor bound to `cancel`.
    pub fn new(
        cancel: CancellationToken,
        config: ExecutorConfig,
        handler: Arc<dyn TaskHandler<T, R>>,
    ) -> Self {
        let capacity = config.capacity();
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        Self {
            config,
            handler,
            cancel,
            task_tx: Some(task_tx),
            task_rx: Arc::new(Mutex::new(task_rx)),
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            workers: JoinSet::new(),
            started: false,
        }
    }

    /// Launch the workers. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        // Workers own the only result senders from here on, so the result
        // queue closes exactly when the last worker exits.
        let Some(result_tx) = self.result_tx.take() else {
            return;
        };

        let workers = self.config.workers.max(1);
        debug!(pool = %self.config.name, workers, "starting executor");

        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                pool: self.config.name.clone(),
                timeout: self.config.task_timeout,
                handler: self.handler.clone(),
                cancel: self.cancel.clone(),
                task_rx: self.task_rx.clone(),
                result_tx: result_tx.clone(),
            };
            self.workers.spawn(worker.run());
        }
    }

    /// Queue a task, waiting for queue capacity.
    pub async fn add_task(&self, task: Task<T>) -> Result<(), ExecutorError> {
        if !self.started {
            return Err(ExecutorError::NotStarted);
        }
        let tx = self.task_tx.as_ref().ok_or(ExecutorError::Closed)?;
        tx.send(task).await.map_err(|_| ExecutorError::Closed)
    }

    /// Signal that no more tasks will be added.
    pub fn close(&mut self) {
        self.task_tx.take();
    }

    /// Take the receiving end of the result queue.
    ///
    /// Returns `None` if it was already taken.
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<TaskResult<R>>> {
        self.result_rx.take()
    }

    /// Close the task queue and block until every worker has exited.
    ///
    /// The result queue is closed once this returns.
    pub async fn wait(mut self) {
        self.close();
        // Never started: dropping the sender is what closes the result queue.
        self.result_tx.take();

        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                warn!(pool = %self.config.name, error = ?e, "executor worker ended abnormally");
            }
        }
        debug!(pool = %self.config.name, "executor drained");
    }

    /// Run every payload through the pool and collect all results.
    ///
    /// Tasks are fed from a separate task while results are consumed here, so
    /// the bounded queues never deadlock.
    pub async fn run_batch(mut self, payloads: Vec<T>) -> Vec<TaskResult<R>> {
        self.start();

        let Some(mut results_rx) = self.take_results() else {
            self.wait().await;
            return Vec::new();
        };

        let total = payloads.len();
        let cancel = self.cancel.clone();
        let feeder = self.task_tx.take().map(|tx| {
            tokio::spawn(async move {
                for (index, payload) in payloads.into_iter().enumerate() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = tx.send(Task::new(payload, index, total)) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        });

        let mut results = Vec::with_capacity(total);
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }

        if let Some(feeder) = feeder {
            let _ = feeder.await;
        }
        self.wait().await;
        results
    }
}

struct Worker<T: Send + 'static, R: Send + 'static> {
    id: usize,
    pool: String,
    timeout: Duration,
    handler: Arc<dyn TaskHandler<T, R>>,
    cancel: CancellationToken,
    task_rx: Arc<Mutex<mpsc::Receiver<Task<T>>>>,
    result_tx: mpsc::Sender<TaskResult<R>>,
}

impl<T, R> Worker<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let next = {
                let mut rx = self.task_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = next else {
                break;
            };

            let result = self.execute(task).await;
            if self.result_tx.send(result).await.is_err() {
                debug!(pool = %self.pool, worker = self.id, "result queue dropped, worker exiting");
                break;
            }
        }
    }

    /// Race the task against its timeout and the shared cancellation token.
    async fn execute(&self, task: Task<T>) -> TaskResult<R> {
        let Task {
            payload,
            index,
            total,
        } = task;
        let key = self.handler.key(&payload);
        debug!(pool = %self.pool, worker = self.id, key = %key, "task {}/{}", index + 1, total);

        let handler = self.handler.clone();
        let mut handle = tokio::spawn(async move { handler.handle(payload).await });

        let outcome = tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(TaskError::Failed(e)),
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    warn!(pool = %self.pool, key = %key, panic = %message, "task panicked");
                    Err(TaskError::Panicked(message))
                }
                Err(_) => Err(TaskError::Cancelled),
            },
            _ = tokio::time::sleep(self.timeout) => {
                handle.abort();
                warn!(pool = %self.pool, key = %key, timeout = ?self.timeout, "task timed out");
                Err(TaskError::Timeout(self.timeout))
            }
            _ = self.cancel.cancelled() => {
                handle.abort();
                Err(TaskError::Cancelled)
            }
        };

        TaskResult {
            key,
            index,
            outcome,
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
