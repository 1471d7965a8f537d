//! Bounded worker pool for cache refreshes and sync fan-out.
//!
//! Tasks are spawned onto the tokio runtime but gated by a semaphore so
//! that at most `size` of them run concurrently. Each spawn returns a
//! handle that can be awaited; awaiting a whole batch of handles is the
//! synchronization barrier used by the sync engine.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Fixed-size pool of concurrent task slots.
#[derive(Clone)]
pub struct WorkerPool {
  permits: Arc<Semaphore>,
}

impl WorkerPool {
  /// Create a pool allowing `size` tasks to run at once.
  pub fn new(size: usize) -> Self {
    Self {
      permits: Arc::new(Semaphore::new(size)),
    }
  }

  /// Submit a task. The task starts running as soon as a slot frees up;
  /// the returned handle resolves with its output.
  pub fn spawn<F>(&self, task: F) -> TaskHandle<F::Output>
  where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
  {
    let permits = Arc::clone(&self.permits);
    let handle = tokio::spawn(async move {
      // The semaphore is never closed, so this only fails if the pool
      // is torn down mid-flight; run unthrottled in that case.
      let _permit = permits.acquire_owned().await.ok();
      task.await
    });

    TaskHandle { handle }
  }
}

/// Awaitable handle to a submitted task.
pub struct TaskHandle<T> {
  handle: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
  /// Wait for the task to finish and return its output.
  pub async fn join(self) -> Result<T> {
    self
      .handle
      .await
      .map_err(|e| eyre!("Worker task failed: {}", e))
  }
}

/// Await every handle in a batch, collecting each task's outcome.
pub async fn join_all<T>(handles: Vec<TaskHandle<T>>) -> Vec<Result<T>> {
  futures::future::join_all(handles.into_iter().map(|h| h.join())).await
}
