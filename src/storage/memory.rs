use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::core::errors::{Result, TaskError};
use crate::storage::{select_tasks, TaskRepository};
use crate::task::{AgentId, AgentTaskMetrics, Task, TaskFilters, TaskId, TaskResult};

/// Repository kept entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    tasks: DashMap<TaskId, Task>,
    results: DashMap<TaskId, TaskResult>,
    metrics: DashMap<AgentId, AgentTaskMetrics>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn store_task(&self, task: &Task) -> Result<()> {
        match self.tasks.entry(task.id.clone()) {
            Entry::Occupied(_) => Err(TaskError::TaskAlreadyExists {
                task_id: task.id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                Ok(())
            }
        }
    }

    async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .get(task_id)
            .map(|task| task.clone())
            .ok_or_else(|| TaskError::task_not_found(task_id))
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        match self.tasks.get_mut(&task.id) {
            Some(mut stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(TaskError::task_not_found(&task.id)),
        }
    }

    async fn list_tasks(&self, agent_id: Option<&str>, filters: &TaskFilters) -> Result<Vec<Task>> {
        let tasks: Vec<Task> = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        Ok(select_tasks(tasks, agent_id, filters))
    }

    async fn store_result(&self, result: &TaskResult) -> Result<()> {
        self.results.insert(result.task_id.clone(), result.clone());
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> Result<TaskResult> {
        self.results
            .get(task_id)
            .map(|result| result.clone())
            .ok_or_else(|| TaskError::ResultNotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn get_metrics(&self, agent_id: &str) -> Result<AgentTaskMetrics> {
        Ok(self
            .metrics
            .get(agent_id)
            .map(|m| m.clone())
            .unwrap_or_else(|| AgentTaskMetrics::new(agent_id)))
    }

    async fn update_metrics(&self, metrics: &AgentTaskMetrics) -> Result<()> {
        self.metrics.insert(metrics.agent_id.clone(), metrics.clone());
        Ok(())
    }

    async fn cleanup_old_results(&self, before: DateTime<Utc>) -> Result<usize> {
        let initial = self.results.len();
        self.results.retain(|_, result| result.completed_at >= before);
        Ok(initial.saturating_sub(self.results.len()))
    }
}
