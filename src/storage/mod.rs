//! Persistence boundary for tasks, results and per-agent metrics.
//!
//! The scheduler and manager only talk to storage through [`TaskRepository`].
//! Two implementations ship with the crate: an in-memory map for tests and
//! embedding, and a sled-backed store.

pub mod memory;
pub mod sled_repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::errors::Result;
use crate::task::{AgentTaskMetrics, Task, TaskFilters, TaskResult};

pub use memory::InMemoryTaskRepository;
pub use sled_repository::SledTaskRepository;

/// Storage trait for task persistence
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Store a new task. Fails with `TaskAlreadyExists` for a known id.
    async fn store_task(&self, task: &Task) -> Result<()>;

    /// Fails with `TaskNotFound` for an unknown id
    async fn get_task(&self, task_id: &str) -> Result<Task>;

    /// Replace a stored task. Fails with `TaskNotFound` for an unknown id.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Tasks of one agent (or all agents) matching `filters`
    async fn list_tasks(&self, agent_id: Option<&str>, filters: &TaskFilters) -> Result<Vec<Task>>;

    /// Store the result of an attempt; a later attempt replaces it
    async fn store_result(&self, result: &TaskResult) -> Result<()>;

    /// Fails with `ResultNotFound` when the task has no result yet
    async fn get_result(&self, task_id: &str) -> Result<TaskResult>;

    /// Metrics of an agent; an empty record when none exist
    async fn get_metrics(&self, agent_id: &str) -> Result<AgentTaskMetrics>;

    async fn update_metrics(&self, metrics: &AgentTaskMetrics) -> Result<()>;

    /// Delete results completed before `before`, returning how many were removed
    async fn cleanup_old_results(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Apply agent scoping and filters to an iterator of stored tasks
pub(crate) fn select_tasks<I>(tasks: I, agent_id: Option<&str>, filters: &TaskFilters) -> Vec<Task>
where
    I: IntoIterator<Item = Task>,
{
    let scoped = tasks
        .into_iter()
        .filter(|task| agent_id.map_or(true, |agent| agent.is_empty() || task.agent_id == agent));
    filters.apply(scoped)
}
