//! Single-attempt task execution.
//!
//! [`Executor::execute`] resolves the handler for a task, validates the task,
//! runs the handler under an effective timeout and classifies the outcome
//! into a [`TaskResult`]. It never retries; that is the scheduler's job.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::ExecutorConfig;
use crate::core::errors::{Result, TaskError};
use crate::core::metrics::{MetricsCollector, NoopCollector};
use crate::handler::{ExecutionContext, HandlerError, HandlerRegistry, TaskHandler};
use crate::task::{Task, TaskResult, TaskStatus};

pub struct Executor {
    registry: HandlerRegistry,
    config: ExecutorConfig,
    collector: Arc<dyn MetricsCollector>,
    running: AtomicBool,
}

impl Executor {
    pub fn new(registry: HandlerRegistry, config: ExecutorConfig) -> Self {
        Self {
            registry,
            config,
            collector: Arc::new(NoopCollector),
            running: AtomicBool::new(false),
        }
    }

    /// Replace the metrics hook. Only consulted when `metrics_enabled` is set.
    pub fn with_collector(mut self, collector: Arc<dyn MetricsCollector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Returns false if already running
    pub fn start(&self) -> bool {
        let started = !self.running.swap(true, Ordering::SeqCst);
        if started {
            info!(handlers = ?self.registry.list(), "Executor started");
        }
        started
    }

    /// Returns false if already stopped
    pub fn stop(&self) -> bool {
        let stopped = self.running.swap(false, Ordering::SeqCst);
        if stopped {
            info!("Executor stopped");
        }
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn register_handler(&self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let task_type = handler.task_type().to_string();
        self.registry.register(handler)?;
        debug!(task_type = %task_type, "Registered handler");
        Ok(())
    }

    pub fn get_handler(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>> {
        self.registry.get(task_type)
    }

    pub fn list_handlers(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Task timeout if set, else the default, never above `max_timeout`
    pub fn effective_timeout(&self, task: &Task) -> Duration {
        task.timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout)
    }

    /// Run one attempt of `task`. Cancelling `token` interrupts the handler.
    ///
    /// Only a stopped executor yields `Err`; every execution outcome,
    /// including a missing handler, is reported as a result.
    pub async fn execute(&self, token: &CancellationToken, task: &Task) -> Result<TaskResult> {
        if !self.is_running() {
            return Err(TaskError::ExecutorStopped);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut result = TaskResult::new(task, TaskStatus::Running);
        result.started_at = started_at;

        match self.registry.get(&task.task_type) {
            Err(_) => {
                warn!(task_id = %task.id, task_type = %task.task_type, "No handler registered");
                result.status = TaskStatus::Failed;
                result.error = format!("handler not found for task type: {}", task.task_type);
            }
            Ok(handler) => {
                if let Err(e) = handler.validate(task) {
                    debug!(task_id = %task.id, error = %e, "Task validation failed");
                    result.status = TaskStatus::Failed;
                    result.error = format!("validation failed: {}", e);
                    result.retryable = false;
                } else if token.is_cancelled() {
                    result.status = TaskStatus::Cancelled;
                    result.error = HandlerError::Cancelled.to_string();
                } else {
                    self.run_handler(handler.as_ref(), token, task, &mut result)
                        .await;
                }
            }
        }

        result.completed_at = Utc::now();
        result.duration = clock.elapsed();

        debug!(
            task_id = %task.id,
            status = %result.status,
            duration_ms = result.duration_ms(),
            "Task attempt finished"
        );

        if self.config.metrics_enabled {
            self.collector.collect(task, &result);
        }
        Ok(result)
    }

    async fn run_handler(
        &self,
        handler: &dyn TaskHandler,
        token: &CancellationToken,
        task: &Task,
        result: &mut TaskResult,
    ) {
        let timeout = self.effective_timeout(task);
        let attempt = token.child_token();
        let ctx = ExecutionContext::new(attempt.clone(), timeout);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(HandlerError::Cancelled),
            _ = tokio::time::sleep(timeout) => {
                attempt.cancel();
                Err(HandlerError::DeadlineExceeded)
            }
            output = handler.execute(&ctx, task) => output,
        };

        match outcome {
            Ok(output) => {
                result.status = TaskStatus::Completed;
                result.result = output.data;
                result.metrics = output.metrics;
            }
            Err(HandlerError::Cancelled) => {
                result.status = TaskStatus::Cancelled;
                result.error = HandlerError::Cancelled.to_string();
            }
            Err(HandlerError::DeadlineExceeded) => {
                warn!(task_id = %task.id, ?timeout, "Task execution timed out");
                result.status = TaskStatus::Timeout;
                result.error = HandlerError::DeadlineExceeded.to_string();
            }
            Err(e) => {
                result.status = TaskStatus::Failed;
                result.error = e.to_string();
            }
        }
        result.metrics.handler_calls = result.metrics.handler_calls.max(1);
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metrics::ExecutionMetrics;
    use crate::handler::{register_builtin_handlers, TaskOutput};
    use crate::task::Payload;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn executor(config: ExecutorConfig) -> Executor {
        let registry = HandlerRegistry::new();
        register_builtin_handlers(&registry).unwrap();
        let executor = Executor::new(registry, config);
        executor.start();
        executor
    }

    /// Ignores cancellation entirely
    struct Stubborn;

    #[async_trait]
    impl TaskHandler for Stubborn {
        fn task_type(&self) -> &str {
            "stubborn"
        }

        fn validate(&self, _task: &Task) -> anyhow::Result<()> {
            Ok(())
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _task: &Task,
        ) -> std::result::Result<TaskOutput, HandlerError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(TaskOutput::default())
        }
    }

    #[tokio::test]
    async fn test_stopped_executor_rejects() {
        let executor = Executor::new(HandlerRegistry::new(), ExecutorConfig::default());
        let task = Task::new("a", "echo", "", Payload::new());
        let err = executor.execute(&CancellationToken::new(), &task).await.unwrap_err();
        assert!(matches!(err, TaskError::ExecutorStopped));

        assert!(executor.start());
        assert!(!executor.start());
        assert!(executor.stop());
        assert!(!executor.stop());
    }

    #[tokio::test]
    async fn test_echo_completes() {
        let executor = executor(ExecutorConfig::default());
        let task = Task::new("a", "echo", "", payload(json!({"message": "hello"})));

        let result = executor.execute(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result["echo"], json!({"message": "hello"}));
        assert!(result.error.is_empty());
        assert!(result.completed_at >= result.started_at);
        assert_eq!(result.metrics.handler_calls, 1);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_retryable() {
        let executor = executor(ExecutorConfig::default());
        let task = Task::new("a", "unknown", "", Payload::new());

        let result = executor.execute(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.contains("unknown"));
        assert!(result.retryable);
    }

    #[tokio::test]
    async fn test_validation_failure_not_retryable() {
        let executor = executor(ExecutorConfig::default());
        let task = Task::new("a", "delay", "", Payload::new());

        let result = executor.execute(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.starts_with("validation failed"));
        assert!(!result.retryable);
    }

    #[tokio::test]
    async fn test_timeout() {
        let executor = executor(ExecutorConfig::default());
        let task = Task::new("a", "delay", "", payload(json!({"duration": "200ms"})))
            .with_timeout(Duration::from_millis(50));

        let result = executor.execute(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Timeout);
        assert_eq!(result.error, "task execution timeout");
        assert!(result.duration >= Duration::from_millis(50));
        assert!(result.duration < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_timeout_enforced_on_uncooperative_handler() {
        let executor = executor(ExecutorConfig::default());
        executor.register_handler(Arc::new(Stubborn)).unwrap();
        let task =
            Task::new("a", "stubborn", "", Payload::new()).with_timeout(Duration::from_millis(30));

        let result = executor.execute(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let executor = executor(ExecutorConfig::default());
        let token = CancellationToken::new();
        let task = Task::new("a", "delay", "", payload(json!({"duration": "5s"})));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = executor.execute(&token, &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.error, "task execution cancelled");
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_skips_handler() {
        let executor = executor(ExecutorConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        let task = Task::new("a", "echo", "", Payload::new());

        let result = executor.execute(&token, &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.metrics.handler_calls, 0);
    }

    #[tokio::test]
    async fn test_handler_error() {
        let executor = executor(ExecutorConfig::default());
        let task = Task::new("a", "error", "", payload(json!({"message": "kaboom"})));

        let result = executor.execute(&CancellationToken::new(), &task).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error, "kaboom");
        assert!(result.retryable);
    }

    #[test]
    fn test_effective_timeout() {
        let config = ExecutorConfig {
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let executor = Executor::new(HandlerRegistry::new(), config);
        let task = Task::new("a", "echo", "", Payload::new());

        assert_eq!(executor.effective_timeout(&task), Duration::from_secs(5));
        let zero = task.clone().with_timeout(Duration::ZERO);
        assert_eq!(executor.effective_timeout(&zero), Duration::from_secs(5));
        let long = task.clone().with_timeout(Duration::from_secs(60));
        assert_eq!(executor.effective_timeout(&long), Duration::from_secs(10));
        let short = task.with_timeout(Duration::from_secs(1));
        assert_eq!(executor.effective_timeout(&short), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_metrics_hook() {
        let metrics = Arc::new(ExecutionMetrics::new());
        let registry = HandlerRegistry::new();
        register_builtin_handlers(&registry).unwrap();
        let config = ExecutorConfig {
            metrics_enabled: true,
            ..Default::default()
        };
        let executor = Executor::new(registry, config).with_collector(metrics.clone());
        executor.start();

        let ok = Task::new("a", "echo", "", Payload::new());
        let bad = Task::new("a", "error", "", Payload::new());
        executor.execute(&CancellationToken::new(), &ok).await.unwrap();
        executor.execute(&CancellationToken::new(), &bad).await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.tasks_failed, 1);
    }
}
