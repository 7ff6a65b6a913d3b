//! Concurrent task scheduling and execution engine.
//!
//! Tasks are submitted to a [`Manager`], ordered by priority in a bounded
//! queue, dispatched to a worker pool that grows and shrinks with load, and
//! executed by the [`TaskHandler`] registered for their type. Failed tasks
//! are retried with exponential backoff; results and per-agent metrics are
//! written to an optional [`TaskRepository`].

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod duration;
    pub mod errors;
    pub mod metrics;
}

pub mod executor;
pub mod handler;
pub mod manager;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod telemetry;

// Re-exports for convenience
pub use crate::core::config::{ExecutorConfig, ManagerConfig, SchedulingPolicy, WorkerPoolConfig};
pub use crate::core::errors::{Result, TaskError};
pub use crate::core::metrics::{ExecutionMetrics, MetricsCollector, MetricsSnapshot};
pub use executor::Executor;
pub use handler::{
    register_builtin_handlers, ExecutionContext, HandlerError, HandlerRegistry, TaskHandler,
    TaskOutput,
};
pub use manager::{Manager, ManagerStatus};
pub use scheduler::{Persistence, Scheduler, TaskQueue};
pub use storage::{InMemoryTaskRepository, SledTaskRepository, TaskRepository};
pub use task::{
    AgentTaskMetrics, Payload, RetryPolicy, Task, TaskFilters, TaskId, TaskMetrics, TaskResult,
    TaskStatus,
};
pub use telemetry::init_tracing;
