//! Priority scheduler with a dynamically sized worker pool.
//!
//! Scheduled tasks wait in a [`TaskQueue`]. A dispatcher ticking every
//! `dispatch_interval` grows the pool when the backlog exceeds twice the live
//! worker count and moves ready tasks onto a bounded channel. Workers run
//! each task through the [`Executor`] and hand the result to a single result
//! processor, which persists it, folds it into the agent's metrics and
//! reschedules the task after a backoff delay when its retry policy allows.
//!
//! The dispatcher pops, registers the cancellation token and sends while
//! holding the queue write lock, and [`Scheduler::cancel`] takes the same
//! lock, so a queue-level cancel never races a dispatch.

pub mod queue;
mod worker;

pub use queue::TaskQueue;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::core::config::WorkerPoolConfig;
use crate::core::errors::{Result, TaskError};
use crate::executor::Executor;
use crate::storage::TaskRepository;
use crate::task::{AgentId, AgentTaskMetrics, Task, TaskId, TaskResult, TaskStatus};
use worker::{Completion, WorkerPool};

/// Where and what the scheduler persists
#[derive(Clone)]
pub struct Persistence {
    pub repository: Option<Arc<dyn TaskRepository>>,
    /// Task status changes
    pub tasks: bool,
    /// Attempt results
    pub results: bool,
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            repository: None,
            tasks: true,
            results: true,
        }
    }
}

impl Persistence {
    pub fn new(repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            repository: Some(repository),
            ..Default::default()
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    fn task_store(&self) -> Option<&Arc<dyn TaskRepository>> {
        self.repository.as_ref().filter(|_| self.tasks)
    }

    fn result_store(&self) -> Option<&Arc<dyn TaskRepository>> {
        self.repository.as_ref().filter(|_| self.results)
    }
}

/// A task handed to the worker channel
struct InFlight {
    seq: u64,
    task: Task,
    token: CancellationToken,
}

/// A task waiting out its backoff delay
struct PendingRetry {
    task: Task,
    token: CancellationToken,
}

pub(crate) struct SchedulerInner {
    config: WorkerPoolConfig,
    queue: RwLock<TaskQueue>,
    in_flight: DashMap<TaskId, InFlight>,
    retrying: DashMap<TaskId, PendingRetry>,
    /// Retries already consumed per task
    attempts: DashMap<TaskId, u32>,
    metrics: DashMap<AgentId, AgentTaskMetrics>,
    executor: Arc<Executor>,
    persistence: Persistence,
    live_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    running: AtomicBool,
}

struct Runtime {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    tasks: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    runtime: Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new(
        config: WorkerPoolConfig,
        executor: Arc<Executor>,
        persistence: Persistence,
    ) -> Self {
        let queue = TaskQueue::new(config.queue_size, config.scheduling_policy);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                queue: RwLock::new(queue),
                in_flight: DashMap::new(),
                retrying: DashMap::new(),
                attempts: DashMap::new(),
                metrics: DashMap::new(),
                executor,
                persistence,
                live_workers: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                running: AtomicBool::new(false),
            }),
            runtime: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawn the dispatcher, `min_workers` workers and the result processor.
    /// Returns `Ok(false)` when already running.
    pub fn start(&self) -> Result<bool> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(false);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TaskError::internal("scheduler must be started inside a tokio runtime"));
        }

        let config = &self.inner.config;
        let (task_tx, task_rx) = mpsc::channel::<Task>(config.queue_size);
        let (result_tx, result_rx) = mpsc::channel::<Completion>(config.max_workers.max(1));

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let tasks = Arc::new(tokio::sync::Mutex::new(task_rx));

        let pool = WorkerPool {
            inner: Arc::clone(&self.inner),
            tasks: Arc::clone(&tasks),
            results: result_tx,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };

        self.inner.running.store(true, Ordering::SeqCst);

        for _ in 0..config.min_workers {
            pool.spawn_worker();
        }
        tracker.spawn(run_result_processor(Arc::clone(&self.inner), result_rx));
        tracker.spawn(run_dispatcher(pool, task_tx));

        info!(
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            queue_size = config.queue_size,
            "Scheduler started"
        );

        *runtime = Some(Runtime {
            shutdown,
            tracker,
            tasks,
        });
        Ok(true)
    }

    /// Stop intake, let workers finish their current task and drain the
    /// result processor. Tasks left in the worker channel go back to the
    /// queue. Returns `false` when already stopped.
    pub async fn stop(&self) -> bool {
        let runtime = self.runtime.lock().take();
        let Some(runtime) = runtime else {
            return false;
        };

        self.inner.running.store(false, Ordering::SeqCst);
        runtime.shutdown.cancel();
        runtime.tracker.close();
        runtime.tracker.wait().await;

        let mut stranded = Vec::new();
        {
            let mut rx = runtime.tasks.lock().await;
            rx.close();
            while let Ok(task) = rx.try_recv() {
                stranded.push(task);
            }
        }
        let requeued = stranded.len();
        for task in stranded {
            self.inner.requeue_stranded(task);
        }

        info!(requeued, "Scheduler stopped");
        true
    }

    /// Queue a task for dispatch.
    ///
    /// Fails when the scheduler is stopped, the queue is full or the id is
    /// already queued. Persisting the queued state happens in the background
    /// and never fails the call.
    pub fn schedule(&self, task: Task) -> Result<()> {
        if !self.is_running() {
            return Err(TaskError::SchedulerStopped);
        }
        self.inner.enqueue(task)
    }

    /// Cancel a task that has not started: queued, or waiting to be retried.
    ///
    /// Returns the cancelled task, or `TaskNotFound` when the task is not
    /// held here (already dispatched, finished or unknown).
    pub async fn cancel(&self, task_id: &str) -> Result<Task> {
        let removed = self.inner.queue.write().remove(task_id);
        let mut task = match removed {
            Some(task) => task,
            None => match self.inner.retrying.remove(task_id) {
                Some((_, pending)) => {
                    pending.token.cancel();
                    pending.task
                }
                None => return Err(TaskError::task_not_found(task_id)),
            },
        };

        self.inner.attempts.remove(task_id);
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        info!(task_id = %task_id, "Cancelled task before dispatch");

        if let Some(repo) = self.inner.persistence.task_store() {
            if let Err(e) = repo.update_task(&task).await {
                warn!(task_id = %task_id, error = %e, "Failed to persist cancellation");
            }
        }
        Ok(task)
    }

    /// Signal the token of a dispatched task. Returns false when the task is
    /// not in flight.
    pub fn cancel_in_flight(&self, task_id: &str) -> bool {
        match self.inner.in_flight.get(task_id) {
            Some(entry) => {
                entry.token.cancel();
                debug!(task_id = %task_id, "Signalled in-flight cancellation");
                true
            }
            None => false,
        }
    }

    /// A task held by the scheduler: queued, in flight or awaiting retry
    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        if let Some(task) = self.inner.queue.read().get(task_id) {
            return Some(task.clone());
        }
        if let Some(entry) = self.inner.in_flight.get(task_id) {
            return Some(entry.task.clone());
        }
        self.inner
            .retrying
            .get(task_id)
            .map(|entry| entry.task.clone())
    }

    /// Queued tasks in dispatch order
    pub fn queued_tasks(&self) -> Vec<Task> {
        self.inner.queue.read().snapshot()
    }

    /// Every task currently held: queued, in flight and awaiting retry
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks = self.queued_tasks();
        tasks.extend(self.inner.in_flight.iter().map(|e| e.task.clone()));
        tasks.extend(self.inner.retrying.iter().map(|e| e.task.clone()));
        tasks
    }

    /// Number of queued tasks
    pub fn size(&self) -> usize {
        self.inner.queue.read().len()
    }

    /// Drop all queued tasks, returning them
    pub fn clear(&self) -> Vec<Task> {
        let cleared = self.inner.queue.write().clear();
        for task in &cleared {
            self.inner.attempts.remove(&task.id);
        }
        cleared
    }

    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::Acquire)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.retrying.len()
    }

    /// Metrics aggregated in memory for an agent
    pub fn metrics(&self, agent_id: &str) -> Option<AgentTaskMetrics> {
        self.inner.metrics.get(agent_id).map(|m| m.clone())
    }

    pub fn all_metrics(&self) -> Vec<AgentTaskMetrics> {
        self.inner.metrics.iter().map(|m| m.clone()).collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            self.inner.running.store(false, Ordering::SeqCst);
            runtime.shutdown.cancel();
        }
    }
}

impl SchedulerInner {
    fn enqueue(self: &Arc<Self>, mut task: Task) -> Result<()> {
        task.status = TaskStatus::Queued;
        task.scheduled_at = Some(Utc::now());
        task.started_at = None;
        task.completed_at = None;
        task.clear_cancellation();

        self.queue.write().push(task.clone())?;
        debug!(task_id = %task.id, priority = task.priority(), "Task queued");

        self.persist_in_background(task);
        Ok(())
    }

    /// Fire-and-forget write of the queued state. Skipped once the task has
    /// left the queue so it cannot overwrite a later status.
    fn persist_in_background(self: &Arc<Self>, task: Task) {
        let Some(repo) = self.persistence.task_store().cloned() else {
            return;
        };
        let inner = Arc::downgrade(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    let still_queued = {
                        let queue = inner.queue.read();
                        queue
                            .get(&task.id)
                            .map_or(false, |queued| queued.scheduled_at == task.scheduled_at)
                    };
                    drop(inner);
                    if !still_queued {
                        return;
                    }
                    if let Err(e) = repo.update_task(&task).await {
                        warn!(task_id = %task.id, error = %e, "Failed to persist task update");
                    }
                });
            }
            Err(_) => debug!(task_id = %task.id, "No runtime, skipping task persistence"),
        }
    }

    /// Move ready tasks onto the worker channel until it fills up
    fn dispatch_ready(&self, tx: &mpsc::Sender<Task>) -> usize {
        let mut queue = self.queue.write();
        let mut dispatched = 0;

        while let Some((seq, mut task)) = queue.pop_entry() {
            let token = CancellationToken::new();
            task.attach_cancellation(token.clone());
            self.in_flight.insert(
                task.id.clone(),
                InFlight {
                    seq,
                    task: task.clone(),
                    token,
                },
            );

            match tx.try_send(task) {
                Ok(()) => dispatched += 1,
                Err(TrySendError::Full(mut task)) | Err(TrySendError::Closed(mut task)) => {
                    self.in_flight.remove(&task.id);
                    task.clear_cancellation();
                    queue.restore(seq, task);
                    break;
                }
            }
        }

        if dispatched > 0 {
            trace!(dispatched, remaining = queue.len(), "Dispatched tasks");
        }
        dispatched
    }

    fn requeue_stranded(&self, mut task: Task) {
        let seq = self.in_flight.remove(&task.id).map(|(_, entry)| entry.seq);
        if task.cancellation_token().map_or(false, |t| t.is_cancelled()) {
            debug!(task_id = %task.id, "Dropping stranded task that was cancelled");
            return;
        }
        task.clear_cancellation();
        task.status = TaskStatus::Queued;

        let mut queue = self.queue.write();
        match seq {
            Some(seq) => queue.restore(seq, task),
            None => {
                if let Err(e) = queue.push(task) {
                    warn!(error = %e, "Failed to requeue stranded task");
                }
            }
        }
    }

    async fn process_result(self: &Arc<Self>, task: Task, mut result: TaskResult) {
        self.in_flight.remove(&task.id);

        let retry_count = self.attempts.get(&task.id).map(|n| *n).unwrap_or(0);
        result.retry_count = retry_count;

        if let Some(repo) = self.persistence.result_store() {
            if let Err(e) = repo.store_result(&result).await {
                warn!(task_id = %task.id, error = %e, "Failed to store task result");
            }
        }
        if let Some(repo) = self.persistence.task_store() {
            if let Err(e) = repo.update_task(&task).await {
                warn!(task_id = %task.id, error = %e, "Failed to persist task status");
            }
        }

        self.record_metrics(&task, &result).await;

        if task.should_retry(&result) {
            let delay = task.retry_delay(retry_count);
            self.attempts.insert(task.id.clone(), retry_count + 1);
            info!(
                task_id = %task.id,
                status = %result.status,
                retry = retry_count + 1,
                ?delay,
                "Scheduling retry"
            );
            self.schedule_retry(task, delay);
        } else {
            self.attempts.remove(&task.id);
            debug!(task_id = %task.id, status = %result.status, "Task finished");
        }
    }

    async fn record_metrics(&self, task: &Task, result: &TaskResult) {
        let agent_id = &task.agent_id;
        let mut metrics = match &self.persistence.repository {
            Some(repo) => match repo.get_metrics(agent_id).await {
                Ok(metrics) => metrics,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Failed to load agent metrics");
                    self.local_metrics(agent_id)
                }
            },
            None => self.local_metrics(agent_id),
        };

        metrics.record(result, &task.task_type);
        self.metrics.insert(agent_id.clone(), metrics.clone());

        if let Some(repo) = &self.persistence.repository {
            if let Err(e) = repo.update_metrics(&metrics).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to update agent metrics");
            }
        }
    }

    fn local_metrics(&self, agent_id: &str) -> AgentTaskMetrics {
        self.metrics
            .get(agent_id)
            .map(|m| m.clone())
            .unwrap_or_else(|| AgentTaskMetrics::new(agent_id))
    }

    fn schedule_retry(self: &Arc<Self>, task: Task, delay: Duration) {
        let token = CancellationToken::new();
        let mut pending = task;
        pending.status = TaskStatus::Pending;
        pending.started_at = None;
        pending.completed_at = None;
        pending.clear_cancellation();

        let task_id = pending.id.clone();
        self.retrying.insert(
            task_id.clone(),
            PendingRetry {
                task: pending,
                token: token.clone(),
            },
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some((_, pending)) = inner.retrying.remove(&task_id) else {
                return;
            };
            if let Err(e) = inner.enqueue(pending.task) {
                error!(task_id = %task_id, error = %e, "Failed to reschedule task for retry");
                inner.attempts.remove(&task_id);
            }
        });
    }
}

async fn run_dispatcher(pool: WorkerPool, tx: mpsc::Sender<Task>) {
    let tick = pool.inner.config.dispatch_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = pool.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let waiting = tx.max_capacity() - tx.capacity();
                let backlog = pool.inner.queue.read().len() + waiting;
                pool.scale_up(backlog);
                pool.inner.dispatch_ready(&tx);
            }
        }
    }
    debug!("Dispatcher stopped");
}

/// Runs until every worker and the dispatcher have dropped their senders
async fn run_result_processor(inner: Arc<SchedulerInner>, mut rx: mpsc::Receiver<Completion>) {
    while let Some(Completion { task, result }) = rx.recv().await {
        inner.process_result(task, result).await;
    }
    debug!("Result processor stopped");
}
