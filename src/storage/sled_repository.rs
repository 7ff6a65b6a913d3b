use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, warn};

use crate::core::errors::{Result, TaskError};
use crate::storage::{select_tasks, TaskRepository};
use crate::task::{AgentTaskMetrics, Task, TaskFilters, TaskResult};

const TASKS_TREE: &str = "tasks";
const RESULTS_TREE: &str = "task_results";
const METRICS_TREE: &str = "task_metrics";

/// Repository backed by an embedded sled database.
///
/// Tasks, results and metrics live in separate trees keyed by task id or
/// agent id, with JSON values.
#[derive(Debug, Clone)]
pub struct SledTaskRepository {
    db: Db,
    tasks: Tree,
    results: Tree,
    metrics: Tree,
}

impl SledTaskRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self> {
        let tasks = db.open_tree(TASKS_TREE)?;
        let results = db.open_tree(RESULTS_TREE)?;
        let metrics = db.open_tree(METRICS_TREE)?;
        Ok(Self {
            db,
            tasks,
            results,
            metrics,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl TaskRepository for SledTaskRepository {
    async fn store_task(&self, task: &Task) -> Result<()> {
        let value = serde_json::to_vec(task)?;
        match self
            .tasks
            .compare_and_swap(task.id.as_bytes(), None as Option<&[u8]>, Some(value))?
        {
            Ok(()) => {
                debug!(task_id = %task.id, "Stored task");
                Ok(())
            }
            Err(_) => Err(TaskError::TaskAlreadyExists {
                task_id: task.id.clone(),
            }),
        }
    }

    async fn get_task(&self, task_id: &str) -> Result<Task> {
        match self.tasks.get(task_id.as_bytes())? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(TaskError::task_not_found(task_id)),
        }
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        if !self.tasks.contains_key(task.id.as_bytes())? {
            return Err(TaskError::task_not_found(&task.id));
        }
        self.tasks.insert(task.id.as_bytes(), serde_json::to_vec(task)?)?;
        Ok(())
    }

    async fn list_tasks(&self, agent_id: Option<&str>, filters: &TaskFilters) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for item in self.tasks.iter() {
            let (key, value) = item?;
            match Self::decode::<Task>(&value) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&key),
                    error = %e,
                    "Skipping undecodable task"
                ),
            }
        }
        Ok(select_tasks(tasks, agent_id, filters))
    }

    async fn store_result(&self, result: &TaskResult) -> Result<()> {
        self.results
            .insert(result.task_id.as_bytes(), serde_json::to_vec(result)?)?;
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> Result<TaskResult> {
        match self.results.get(task_id.as_bytes())? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(TaskError::ResultNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn get_metrics(&self, agent_id: &str) -> Result<AgentTaskMetrics> {
        match self.metrics.get(agent_id.as_bytes())? {
            Some(bytes) => Self::decode(&bytes),
            None => Ok(AgentTaskMetrics::new(agent_id)),
        }
    }

    async fn update_metrics(&self, metrics: &AgentTaskMetrics) -> Result<()> {
        self.metrics
            .insert(metrics.agent_id.as_bytes(), serde_json::to_vec(metrics)?)?;
        Ok(())
    }

    async fn cleanup_old_results(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for item in self.results.iter() {
            let (key, value) = item?;
            let result: TaskResult = match Self::decode(&value) {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable result");
                    continue;
                }
            };
            if result.completed_at < before && self.results.remove(&key)?.is_some() {
                removed += 1;
            }
        }
        debug!(removed, "Cleaned up old results");
        Ok(removed)
    }
}
