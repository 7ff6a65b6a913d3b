//! Task data model and retry policy

pub mod model;
pub mod retry;

pub use model::{
    generate_task_id, AgentId, AgentTaskMetrics, Payload, SortField, Task, TaskFilters, TaskId,
    TaskMetrics, TaskResult, TaskStatus, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
pub use retry::RetryPolicy;
