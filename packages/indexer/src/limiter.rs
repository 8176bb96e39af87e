//! Bounded Concurrency Limiter
//!
//! Runs submitted async work on the tokio runtime with a fixed cap on how many
//! units execute at once. Waiting units acquire permits in FIFO order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::{ConfigError, DEFAULT_MAX_CONCURRENT};

/// Errors surfaced through a task handle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("Limiter was closed before the task could start")]
    Closed,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task was cancelled")]
    Cancelled,
}

/// Caps the number of concurrently running tasks
#[derive(Debug, Clone)]
pub struct Limiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Default for Limiter {
    fn default() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl Limiter {
    /// Create a limiter allowing `max_concurrent` tasks in flight
    pub fn new(max_concurrent: usize) -> Result<Self, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of tasks currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Submit a unit of work
    ///
    /// The task is spawned right away and waits for a permit inside the
    /// runtime, so submission never blocks the caller. Dropping the returned
    /// handle does not cancel the task.
    pub fn submit<F, Fut, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let inner = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| LimiterError::Closed)?;
            Ok(task().await)
        });
        TaskHandle { inner }
    }
}

/// Resolves to the result of a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T, LimiterError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, LimiterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_panic() => {
                Poll::Ready(Err(LimiterError::Panicked(e.to_string())))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(LimiterError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
