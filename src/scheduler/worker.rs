//! Worker routine and live-worker accounting

use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::SchedulerInner;
use crate::task::{Task, TaskResult, TaskStatus};

/// A finished attempt on its way to the result processor
#[derive(Debug)]
pub(crate) struct Completion {
    pub task: Task,
    pub result: TaskResult,
}

/// Holds one unit of the live-worker count for as long as a worker runs
struct LiveWorker<'a> {
    live: &'a AtomicUsize,
    released: bool,
}

impl<'a> LiveWorker<'a> {
    /// Adopt a unit already added by [`WorkerPool::spawn_worker`]
    fn adopt(live: &'a AtomicUsize) -> Self {
        Self {
            live,
            released: false,
        }
    }

    /// Give up this worker's unit unless that would leave fewer than `min`
    fn try_retire(&mut self, min: usize) -> bool {
        let mut current = self.live.load(Ordering::Acquire);
        loop {
            if current <= min {
                return false;
            }
            match self.live.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.released = true;
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Everything a worker needs, shared by the dispatcher to grow the pool
#[derive(Clone)]
pub(crate) struct WorkerPool {
    pub inner: Arc<SchedulerInner>,
    pub tasks: Arc<Mutex<mpsc::Receiver<Task>>>,
    pub results: mpsc::Sender<Completion>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

impl WorkerPool {
    pub fn spawn_worker(&self) -> usize {
        let worker_id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let live = self.inner.live_workers.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(worker_id, live, "Spawning worker");

        let pool = self.clone();
        self.tracker.spawn(pool.run(worker_id));
        worker_id
    }

    /// Add one worker when `backlog` (tasks not yet picked up by a worker)
    /// exceeds twice the live count
    pub fn scale_up(&self, backlog: usize) -> bool {
        let live = self.inner.live_workers.load(Ordering::Acquire);
        if backlog > 2 * live && live < self.inner.config.max_workers {
            info!(backlog, live, "Scaling up worker pool");
            self.spawn_worker();
            return true;
        }
        false
    }

    async fn next_task(&self) -> Option<Task> {
        self.tasks.lock().await.recv().await
    }

    async fn run(self, worker_id: usize) {
        let inner = Arc::clone(&self.inner);
        let mut guard = LiveWorker::adopt(&inner.live_workers);
        let idle_timeout = inner.config.idle_timeout;

        loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = tokio::time::timeout(idle_timeout, self.next_task()) => received,
            };

            let task = match received {
                Ok(Some(task)) => task,
                // channel closed
                Ok(None) => break,
                Err(_) => {
                    if guard.try_retire(inner.config.min_workers) {
                        debug!(worker_id, "Idle worker retiring");
                        break;
                    }
                    continue;
                }
            };

            let completion = self.execute(worker_id, task).await;

            // The result processor drains until every worker has exited, so
            // this send cannot block past shutdown.
            if self.results.send(completion).await.is_err() {
                warn!(worker_id, "Result channel closed, dropping result");
                break;
            }
        }

        debug!(worker_id, "Worker stopped");
    }

    async fn execute(&self, worker_id: usize, mut task: Task) -> Completion {
        let token = task.cancellation_token().cloned().unwrap_or_default();

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        if let Some(mut entry) = self.inner.in_flight.get_mut(&task.id) {
            entry.task.status = TaskStatus::Running;
            entry.task.started_at = task.started_at;
        }
        debug!(worker_id, task_id = %task.id, task_type = %task.task_type, "Executing task");

        // handler panics end the attempt as a non-retryable failure
        let attempt = AssertUnwindSafe(self.inner.executor.execute(&token, &task)).catch_unwind();
        let result = match attempt.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(worker_id, task_id = %task.id, error = %e, "Executor rejected task");
                fallback_result(&task, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker_id, task_id = %task.id, panic = %message, "Task handler panicked");
                let mut result = fallback_result(&task, format!("handler panicked: {}", message));
                result.retryable = false;
                result
            }
        };

        task.status = result.status;
        task.completed_at = Some(result.completed_at);
        Completion { task, result }
    }
}

fn fallback_result(task: &Task, error: String) -> TaskResult {
    let mut result = TaskResult::failed(task, error);
    if let Some(started) = task.started_at {
        result.started_at = started;
    }
    result
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
