//! Task manager facade.
//!
//! Composes the executor, the scheduler and an optional repository behind
//! one API: submission, cancellation, lookup, listing and metrics. Starting
//! brings up the executor before the scheduler; stopping tears them down in
//! reverse so in-flight work drains before handlers become unavailable.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::ManagerConfig;
use crate::core::errors::{Result, TaskError};
use crate::core::metrics::{ExecutionMetrics, MetricsSnapshot};
use crate::executor::Executor;
use crate::handler::{register_builtin_handlers, HandlerRegistry, TaskHandler};
use crate::scheduler::{Persistence, Scheduler};
use crate::storage::{select_tasks, TaskRepository};
use crate::task::{
    generate_task_id, AgentTaskMetrics, Task, TaskFilters, TaskId, TaskResult, TaskStatus,
};

/// Point-in-time view of the manager
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub queue_size: usize,
    pub queue_capacity: usize,
    pub in_flight: usize,
    pub pending_retries: usize,
    pub live_workers: usize,
    pub handlers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_metrics: Option<MetricsSnapshot>,
}

struct RetentionLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Manager {
    config: ManagerConfig,
    executor: Arc<Executor>,
    scheduler: Scheduler,
    repository: Option<Arc<dyn TaskRepository>>,
    execution_metrics: Option<Arc<ExecutionMetrics>>,
    running: AtomicBool,
    /// Serializes start/stop; holds the retention loop while running
    lifecycle: Mutex<Option<Option<RetentionLoop>>>,
}

impl Manager {
    /// Build a manager with the built-in handlers registered.
    /// Unset configuration fields take their defaults.
    pub fn new(config: ManagerConfig, repository: Option<Arc<dyn TaskRepository>>) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;

        let registry = HandlerRegistry::new();
        register_builtin_handlers(&registry)?;

        let mut executor = Executor::new(registry, config.executor.clone());
        let execution_metrics = if config.executor.metrics_enabled {
            let metrics = Arc::new(ExecutionMetrics::new());
            executor = executor.with_collector(metrics.clone());
            Some(metrics)
        } else {
            None
        };
        let executor = Arc::new(executor);

        let persistence = Persistence {
            repository: repository.clone(),
            tasks: config.persist_tasks,
            results: config.persist_results,
        };
        let scheduler = Scheduler::new(
            config.worker_pool.clone(),
            Arc::clone(&executor),
            persistence,
        );

        Ok(Self {
            config,
            executor,
            scheduler,
            repository,
            execution_metrics,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn repository(&self) -> Option<&Arc<dyn TaskRepository>> {
        self.repository.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the executor, then the scheduler. A no-op when running.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(());
        }

        self.executor.start();
        if let Err(e) = self.scheduler.start() {
            self.executor.stop();
            return Err(e);
        }

        *lifecycle = Some(self.spawn_retention_loop());
        self.running.store(true, Ordering::SeqCst);
        info!(handlers = ?self.executor.list_handlers(), "Task manager started");
        Ok(())
    }

    /// Stop the scheduler, then the executor. A no-op when stopped.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(retention) = lifecycle.take() else {
            return Ok(());
        };

        self.running.store(false, Ordering::SeqCst);
        if let Some(retention) = retention {
            retention.token.cancel();
            if let Err(e) = retention.handle.await {
                warn!(error = %e, "Result retention loop ended abnormally");
            }
        }

        self.scheduler.stop().await;
        self.executor.stop();
        info!("Task manager stopped");
        Ok(())
    }

    fn spawn_retention_loop(&self) -> Option<RetentionLoop> {
        let retention = self.config.result_retention?;
        let repository = match &self.repository {
            Some(repository) => Arc::clone(repository),
            None => {
                debug!("Result retention configured without a repository, skipping");
                return None;
            }
        };

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_retention(
            repository,
            retention,
            self.config.cleanup_interval,
            token.clone(),
        ));
        Some(RetentionLoop { token, handle })
    }

    /// Accept a task for execution and return its id.
    ///
    /// Rejections (stopped manager, invalid task, full queue, duplicate id)
    /// are reported here; the task is not admitted in that case.
    pub async fn submit(&self, mut task: Task) -> Result<TaskId> {
        if !self.is_running() {
            return Err(TaskError::ManagerStopped);
        }
        if task.task_type.trim().is_empty() {
            return Err(TaskError::InvalidTask("task type cannot be empty".to_string()));
        }
        if task.agent_id.trim().is_empty() {
            return Err(TaskError::InvalidTask("agent id cannot be empty".to_string()));
        }

        if task.id.is_empty() {
            task.id = generate_task_id();
        }
        task.status = TaskStatus::Pending;
        if task.retry_policy.is_none() {
            task.retry_policy = self.config.executor.default_retry_policy.clone();
        }

        if self.config.persist_tasks {
            if let Some(repository) = &self.repository {
                repository.store_task(&task).await?;
            }
        }

        let task_id = task.id.clone();
        self.scheduler.schedule(task)?;
        info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    pub fn register_handler(&self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        self.executor.register_handler(handler)
    }

    /// Look a task up in the scheduler, then in the repository
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        if let Some(task) = self.scheduler.get_task(task_id) {
            return Ok(task);
        }
        match &self.repository {
            Some(repository) => repository.get_task(task_id).await,
            None => Err(TaskError::task_not_found(task_id)),
        }
    }

    /// Latest attempt result; requires a repository
    pub async fn get_task_result(&self, task_id: &str) -> Result<TaskResult> {
        let repository = self.repository.as_ref().ok_or(TaskError::RepositoryUnavailable)?;
        repository.get_result(task_id).await
    }

    /// Cancel a task wherever it is.
    ///
    /// A queued or retry-pending task is removed before it runs. A dispatched
    /// task has its cancellation token signalled and the stored record is
    /// marked cancelled; the handler stops once it observes the token.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        match self.scheduler.cancel(task_id).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let signalled = self.scheduler.cancel_in_flight(task_id);

        let Some(repository) = &self.repository else {
            return if signalled {
                Ok(())
            } else {
                Err(TaskError::task_not_found(task_id))
            };
        };

        let mut task = match repository.get_task(task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() && signalled => return Ok(()),
            Err(e) => return Err(e),
        };

        if task.is_terminal() {
            if signalled {
                return Ok(());
            }
            return Err(TaskError::TaskAlreadyTerminal {
                task_id: task_id.to_string(),
                status: task.status,
            });
        }

        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        task.cancel();
        if self.config.persist_tasks {
            repository.update_task(&task).await?;
        }
        info!(task_id = %task_id, in_flight = signalled, "Task cancelled");
        Ok(())
    }

    /// List tasks from the repository, or from the scheduler's live view
    /// when there is none
    pub async fn list_tasks(
        &self,
        agent_id: Option<&str>,
        filters: &TaskFilters,
    ) -> Result<Vec<Task>> {
        match &self.repository {
            Some(repository) => repository.list_tasks(agent_id, filters).await,
            None => Ok(select_tasks(self.scheduler.tasks(), agent_id, filters)),
        }
    }

    pub async fn get_metrics(&self, agent_id: &str) -> Result<AgentTaskMetrics> {
        match &self.repository {
            Some(repository) => repository.get_metrics(agent_id).await,
            None => Ok(self
                .scheduler
                .metrics(agent_id)
                .unwrap_or_else(|| AgentTaskMetrics::new(agent_id))),
        }
    }

    pub fn status(&self) -> ManagerStatus {
        ManagerStatus {
            running: self.is_running(),
            queue_size: self.scheduler.size(),
            queue_capacity: self.config.worker_pool.queue_size,
            in_flight: self.scheduler.in_flight_count(),
            pending_retries: self.scheduler.pending_retries(),
            live_workers: self.scheduler.live_workers(),
            handlers: self.executor.list_handlers(),
            execution_metrics: self.execution_metrics.as_ref().map(|m| m.snapshot()),
        }
    }

    /// Delete results completed before `before`; requires a repository
    pub async fn cleanup_old_results(&self, before: DateTime<Utc>) -> Result<usize> {
        let repository = self.repository.as_ref().ok_or(TaskError::RepositoryUnavailable)?;
        repository.cleanup_old_results(before).await
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(Some(retention)) = self.lifecycle.get_mut().take() {
            retention.token.cancel();
        }
    }
}

async fn run_retention(
    repository: Arc<dyn TaskRepository>,
    retention: Duration,
    every: Duration,
    token: CancellationToken,
) {
    let retention = match chrono::Duration::from_std(retention) {
        Ok(retention) => retention,
        Err(e) => {
            warn!(error = %e, "Result retention out of range, cleanup disabled");
            return;
        }
    };

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
                    continue;
                };
                match repository.cleanup_old_results(cutoff).await {
                    Ok(removed) => debug!(removed, %cutoff, "Purged old task results"),
                    Err(e) => warn!(error = %e, "Failed to purge old task results"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTaskRepository;
    use crate::task::Payload;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn echo(agent: &str) -> Task {
        Task::new(agent, "echo", "", json!({"message": "hi"}).as_object().cloned().unwrap())
    }

    fn with_repo(config: ManagerConfig) -> (Manager, Arc<InMemoryTaskRepository>) {
        let repo = Arc::new(InMemoryTaskRepository::new());
        let manager = Manager::new(config, Some(repo.clone())).unwrap();
        (manager, repo)
    }

    async fn wait_for_result(manager: &Manager, task_id: &str) -> TaskResult {
        for _ in 0..300 {
            let finished = manager
                .get_task(task_id)
                .await
                .map_or(false, |task| task.is_terminal());
            if let (true, Ok(result)) = (finished, manager.get_task_result(task_id).await) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no result for {task_id}");
    }

    #[tokio::test]
    async fn test_submit_requires_start() {
        let (manager, _) = with_repo(ManagerConfig::development());
        let err = manager.submit(echo("a")).await.unwrap_err();
        assert!(matches!(err, TaskError::ManagerStopped));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_task() {
        let (manager, _) = with_repo(ManagerConfig::development());
        manager.start().await.unwrap();

        let err = manager
            .submit(Task::new("a", "", "", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));

        let err = manager
            .submit(Task::new("", "echo", "", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let (manager, repo) = with_repo(ManagerConfig::development());
        manager.start().await.unwrap();

        let mut task = echo("agent-1");
        task.id.clear();
        let task_id = manager.submit(task).await.unwrap();
        assert!(task_id.starts_with("task_"));

        let result = wait_for_result(&manager, &task_id).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result["echo"], json!({"message": "hi"}));

        let stored = repo.get_task(&task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.retry_policy.is_some());

        let mut metrics = manager.get_metrics("agent-1").await.unwrap();
        for _ in 0..100 {
            if metrics.total_tasks > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            metrics = manager.get_metrics("agent-1").await.unwrap();
        }
        assert_eq!(metrics.total_tasks, 1);
        assert_eq!(metrics.completed_tasks, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_queued_then_terminal() {
        let config = ManagerConfig::builder()
            .min_workers(1)
            .max_workers(2)
            .dispatch_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let (manager, repo) = with_repo(config);
        manager.start().await.unwrap();

        let task_id = manager.submit(echo("a")).await.unwrap();
        manager.cancel_task(&task_id).await.unwrap();
        assert_eq!(repo.get_task(&task_id).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(manager.status().queue_size, 0);

        let err = manager.cancel_task(&task_id).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::TaskAlreadyTerminal {
                status: TaskStatus::Cancelled,
                ..
            }
        ));

        assert!(manager.cancel_task("missing").await.unwrap_err().is_not_found());
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_without_repository() {
        let config = ManagerConfig::builder()
            .dispatch_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let manager = Manager::new(config, None).unwrap();
        manager.start().await.unwrap();

        let task_id = manager.submit(echo("a")).await.unwrap();
        assert_eq!(manager.get_task(&task_id).await.unwrap().status, TaskStatus::Queued);

        let listed = manager.list_tasks(Some("a"), &TaskFilters::new()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(manager.list_tasks(Some("b"), &TaskFilters::new()).await.unwrap().is_empty());

        assert!(matches!(
            manager.get_task_result(&task_id).await.unwrap_err(),
            TaskError::RepositoryUnavailable
        ));
        assert!(matches!(
            manager.cleanup_old_results(Utc::now()).await.unwrap_err(),
            TaskError::RepositoryUnavailable
        ));
        assert_eq!(manager.get_metrics("a").await.unwrap().total_tasks, 0);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (manager, _) = with_repo(ManagerConfig::development());
        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert!(manager.executor().is_running());

        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert!(!manager.executor().is_running());
        assert!(!manager.scheduler().is_running());
    }

    #[tokio::test]
    async fn test_status_reports_execution_metrics() {
        let config = ManagerConfig::builder()
            .min_workers(1)
            .dispatch_interval(Duration::from_millis(10))
            .metrics(true)
            .build()
            .unwrap();
        let (manager, _) = with_repo(config);
        manager.start().await.unwrap();

        let task_id = manager.submit(echo("a")).await.unwrap();
        wait_for_result(&manager, &task_id).await;

        let status = manager.status();
        assert!(status.running);
        assert_eq!(
            status.handlers,
            vec!["delay", "echo", "error", "http_request"]
        );
        let snapshot = status.execution_metrics.unwrap();
        assert_eq!(snapshot.tasks_completed, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_loop_purges_results() {
        let config = ManagerConfig::builder()
            .result_retention(Duration::from_secs(60), Duration::from_secs(30))
            .build()
            .unwrap();
        let (manager, repo) = with_repo(config);

        let task = echo("a");
        let mut old = TaskResult::new(&task, TaskStatus::Completed);
        old.completed_at = Utc::now() - chrono::Duration::hours(2);
        repo.store_result(&old).await.unwrap();

        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(repo.result_count(), 0);
        manager.stop().await.unwrap();
    }
}
