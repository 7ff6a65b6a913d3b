//! Handler extension point.
//!
//! A handler is bound to one task type. The executor validates the task with
//! it, then runs it under an [`ExecutionContext`] whose cancellation token
//! fires on timeout or on an explicit cancel. Handlers must observe that token
//! (select on [`ExecutionContext::cancelled`] or use
//! [`ExecutionContext::sleep`]); the engine only guarantees that it fires.

pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::task::{Payload, Task, TaskMetrics};

pub use builtin::{
    register_builtin_handlers, DelayHandler, EchoHandler, ErrorHandler, HttpRequestHandler,
};
pub use registry::HandlerRegistry;

/// Error returned by a handler's `execute`
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// The handler observed cancellation of its context
    #[error("task execution cancelled")]
    Cancelled,

    /// The handler observed its deadline passing
    #[error("task execution timeout")]
    DeadlineExceeded,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Successful handler output
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    pub data: Payload,
    /// Counters reported by the handler
    pub metrics: TaskMetrics,
}

impl TaskOutput {
    pub fn new(data: Payload) -> Self {
        Self {
            data,
            metrics: TaskMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: TaskMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

impl From<Payload> for TaskOutput {
    fn from(data: Payload) -> Self {
        Self::new(data)
    }
}

/// Per-attempt execution context handed to a handler
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    token: CancellationToken,
    deadline: Instant,
    timeout: Duration,
}

impl ExecutionContext {
    pub fn new(token: CancellationToken, timeout: Duration) -> Self {
        Self {
            token,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the attempt is cancelled or times out
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Sleep for `duration` unless the context is cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<(), HandlerError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(self.interruption()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// The error a handler should return after observing cancellation
    pub fn interruption(&self) -> HandlerError {
        if Instant::now() >= self.deadline {
            HandlerError::DeadlineExceeded
        } else {
            HandlerError::Cancelled
        }
    }
}

/// Logic bound to a task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Dispatch key; must be non-empty and unique within a registry
    fn task_type(&self) -> &str;

    /// Reject a task before execution. Validation failures are not retried.
    fn validate(&self, task: &Task) -> anyhow::Result<()>;

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        task: &Task,
    ) -> Result<TaskOutput, HandlerError>;
}
