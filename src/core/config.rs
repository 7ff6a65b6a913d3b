use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::duration;
use crate::core::errors::{Result, TaskError};
use crate::task::RetryPolicy;

/// Order in which queued tasks are handed to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Highest priority first, earliest creation breaks ties
    #[default]
    PriorityFirst,
    /// Creation order only
    Fifo,
}

/// Worker pool and dispatch tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Upper bound on concurrently running workers
    pub max_workers: usize,
    /// Workers kept alive even when idle
    pub min_workers: usize,
    /// A worker above the minimum retires after receiving nothing for this long
    #[serde(with = "duration")]
    pub idle_timeout: Duration,
    /// Capacity of the priority queue and of the worker channel
    pub queue_size: usize,
    pub scheduling_policy: SchedulingPolicy,
    /// Dispatcher tick
    #[serde(with = "duration")]
    pub dispatch_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            min_workers: 2,
            idle_timeout: Duration::from_secs(5 * 60),
            queue_size: 100,
            scheduling_policy: SchedulingPolicy::PriorityFirst,
            dispatch_interval: Duration::from_millis(100),
        }
    }
}

impl WorkerPoolConfig {
    /// Replace unset (zero) fields with their defaults
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.max_workers == 0 {
            self.max_workers = defaults.max_workers;
        }
        if self.min_workers == 0 {
            self.min_workers = defaults.min_workers.min(self.max_workers);
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = defaults.idle_timeout;
        }
        if self.queue_size == 0 {
            self.queue_size = defaults.queue_size;
        }
        if self.dispatch_interval.is_zero() {
            self.dispatch_interval = defaults.dispatch_interval;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(invalid("max_workers must be greater than 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(invalid("min_workers cannot be greater than max_workers"));
        }
        if self.queue_size == 0 {
            return Err(invalid("queue_size must be greater than 0"));
        }
        if self.dispatch_interval.is_zero() {
            return Err(invalid("dispatch_interval must be greater than 0"));
        }
        Ok(())
    }
}

/// Handler execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Used when a task carries no timeout
    #[serde(with = "duration")]
    pub default_timeout: Duration,
    /// Hard ceiling for any task timeout
    #[serde(with = "duration")]
    pub max_timeout: Duration,
    /// Applied at submission to tasks without their own policy
    pub default_retry_policy: Option<RetryPolicy>,
    /// Install the execution metrics collector
    pub metrics_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5 * 60),
            max_timeout: Duration::from_secs(30 * 60),
            default_retry_policy: Some(RetryPolicy::default()),
            metrics_enabled: false,
        }
    }
}

impl ExecutorConfig {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.default_timeout.is_zero() {
            self.default_timeout = defaults.default_timeout;
        }
        if self.max_timeout.is_zero() {
            self.max_timeout = defaults.max_timeout.max(self.default_timeout);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(invalid("default_timeout must be greater than 0"));
        }
        if self.default_timeout > self.max_timeout {
            return Err(invalid("default_timeout cannot exceed max_timeout"));
        }
        if let Some(policy) = &self.default_retry_policy {
            policy.validate().map_err(TaskError::InvalidConfiguration)?;
        }
        Ok(())
    }
}

/// Top level configuration of the task manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub worker_pool: WorkerPoolConfig,
    pub executor: ExecutorConfig,
    /// Write tasks and their status changes to the repository
    pub persist_tasks: bool,
    /// Write execution results to the repository
    pub persist_results: bool,
    /// Results older than this are purged periodically; `None` keeps them
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub result_retention: Option<Duration>,
    /// Period of the retention sweep
    #[serde(with = "duration")]
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::default(),
            executor: ExecutorConfig::default(),
            persist_tasks: true,
            persist_results: true,
            result_retention: None,
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::new()
    }

    /// Fast ticks and short timeouts, for tests and local runs
    pub fn development() -> Self {
        Self {
            worker_pool: WorkerPoolConfig {
                max_workers: 4,
                min_workers: 1,
                idle_timeout: Duration::from_secs(10),
                queue_size: 100,
                scheduling_policy: SchedulingPolicy::PriorityFirst,
                dispatch_interval: Duration::from_millis(10),
            },
            executor: ExecutorConfig {
                default_timeout: Duration::from_secs(30),
                max_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            cleanup_interval: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn normalized(mut self) -> Self {
        self.worker_pool = self.worker_pool.normalized();
        self.executor = self.executor.normalized();
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = Self::default().cleanup_interval;
        }
        if self.result_retention == Some(Duration::ZERO) {
            self.result_retention = None;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.worker_pool.validate()?;
        self.executor.validate()?;
        if self.result_retention.is_some() && self.cleanup_interval.is_zero() {
            return Err(invalid(
                "cleanup_interval must be greater than 0 when result_retention is set",
            ));
        }
        Ok(())
    }

    /// Parse YAML; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ManagerConfig = serde_yaml::from_str(yaml)?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn invalid(msg: &str) -> TaskError {
    TaskError::InvalidConfiguration(msg.to_string())
}

/// Builder for ManagerConfig
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl Default for ManagerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.worker_pool.max_workers = max_workers;
        self
    }

    pub fn min_workers(mut self, min_workers: usize) -> Self {
        self.config.worker_pool.min_workers = min_workers;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker_pool.idle_timeout = timeout;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.worker_pool.queue_size = size;
        self
    }

    pub fn scheduling_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.config.worker_pool.scheduling_policy = policy;
        self
    }

    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.config.worker_pool.dispatch_interval = interval;
        self
    }

    /// Set default and maximum task timeouts
    pub fn timeouts(mut self, default: Duration, max: Duration) -> Self {
        self.config.executor.default_timeout = default;
        self.config.executor.max_timeout = max;
        self
    }

    pub fn default_retry_policy(mut self, policy: Option<RetryPolicy>) -> Self {
        self.config.executor.default_retry_policy = policy;
        self
    }

    pub fn metrics(mut self, enabled: bool) -> Self {
        self.config.executor.metrics_enabled = enabled;
        self
    }

    pub fn persistence(mut self, tasks: bool, results: bool) -> Self {
        self.config.persist_tasks = tasks;
        self.config.persist_results = results;
        self
    }

    pub fn result_retention(mut self, retention: Duration, cleanup_interval: Duration) -> Self {
        self.config.result_retention = Some(retention);
        self.config.cleanup_interval = cleanup_interval;
        self
    }

    /// Normalize and validate the configuration
    pub fn build(self) -> Result<ManagerConfig> {
        let config = self.config.normalized();
        config.validate()?;
        Ok(config)
    }
}
