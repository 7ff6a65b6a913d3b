use std::io;
use thiserror::Error;

use crate::task::TaskStatus;

/// Errors raised by the task engine
#[derive(Error, Debug)]
pub enum TaskError {
    // Submission / lifecycle rejections
    #[error("Task manager is stopped")]
    ManagerStopped,

    #[error("Scheduler is stopped")]
    SchedulerStopped,

    #[error("Executor is stopped")]
    ExecutorStopped,

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    // Queue errors
    #[error("Task queue is full: capacity {capacity} reached")]
    QueueFull { capacity: usize },

    #[error("Task already in queue: {task_id}")]
    TaskAlreadyQueued { task_id: String },

    // Task lookup errors
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Task already exists: {task_id}")]
    TaskAlreadyExists { task_id: String },

    #[error("Task {task_id} is already {status}")]
    TaskAlreadyTerminal { task_id: String, status: TaskStatus },

    #[error("Result not found for task: {task_id}")]
    ResultNotFound { task_id: String },

    // Handler registry errors
    #[error("Handler not found for task type: {task_type}")]
    HandlerNotFound { task_type: String },

    #[error("Handler already registered for type: {task_type}")]
    HandlerAlreadyRegistered { task_type: String },

    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    // Persistence errors
    #[error("Repository not available")]
    RepositoryUnavailable,

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    /// True for the errors that refuse a task at submission time.
    /// A rejected task was never admitted to the queue.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::ManagerStopped
                | Self::SchedulerStopped
                | Self::InvalidTask(_)
                | Self::QueueFull { .. }
                | Self::TaskAlreadyQueued { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. } | Self::ResultNotFound { .. } | Self::HandlerNotFound { .. }
        )
    }
}

/// Result type alias for TaskError
pub type Result<T> = std::result::Result<T, TaskError>;
