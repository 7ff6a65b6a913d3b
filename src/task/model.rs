use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::duration;
use crate::task::retry::RetryPolicy;

// Type aliases
pub type TaskId = String;
pub type AgentId = String;

/// Opaque key/value input or output of a handler
pub type Payload = Map<String, Value>;

pub const MIN_PRIORITY: i32 = 0;
pub const MAX_PRIORITY: i32 = 10;
pub const DEFAULT_PRIORITY: i32 = 5;

/// Generate a fresh task identifier
pub fn generate_task_id() -> TaskId {
    format!("task_{}", cuid2::create_id())
}

/// Lifecycle state of a task.
///
/// `Pending -> Queued -> Running -> {Completed | Failed | Cancelled | Timeout}`,
/// plus `Queued -> Cancelled` for a cancel before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Whether a direct move from `self` to `next` is a legal lifecycle step.
    /// Re-entering `Pending` after a terminal state only happens through a
    /// retry reschedule.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Queued) | (Pending, Cancelled) => true,
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Timeout) => true,
            (Failed, Pending) | (Timeout, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "timeout" => Ok(TaskStatus::Timeout),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// A unit of work executed by the handler registered for its `task_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    /// Dispatch key selecting the handler
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub payload: Payload,
    /// 0..=10, higher runs sooner
    #[serde(default = "default_priority", deserialize_with = "deserialize_priority")]
    priority: i32,
    /// `None` (or zero) uses the executor default
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Informational only; the scheduler does not order by dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Created when the task is handed to a worker
    #[serde(skip)]
    cancellation: Option<CancellationToken>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn deserialize_priority<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(raw.clamp(MIN_PRIORITY as i64, MAX_PRIORITY as i64) as i32)
}

impl Task {
    /// Create a pending task with a generated id and medium priority
    pub fn new(
        agent_id: impl Into<AgentId>,
        task_type: impl Into<String>,
        name: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            id: generate_task_id(),
            agent_id: agent_id.into(),
            task_type: task_type.into(),
            name: name.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            timeout: None,
            dependencies: Vec::new(),
            retry_policy: None,
            metadata: HashMap::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            cancellation: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority; out-of-range values are clamped to 0..=10
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.set_priority(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True iff a retry policy is set and it accepts this attempt's result
    pub fn should_retry(&self, result: &TaskResult) -> bool {
        self.retry_policy
            .as_ref()
            .map_or(false, |policy| policy.allows(result))
    }

    /// Backoff before the given retry; zero without a policy
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.retry_policy
            .as_ref()
            .map_or(Duration::ZERO, |policy| policy.delay_for(retry_count))
    }

    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub(crate) fn attach_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = Some(token);
    }

    pub(crate) fn clear_cancellation(&mut self) {
        self.cancellation = None;
    }

    /// Signal the execution owning this task to stop. No-op before dispatch.
    pub fn cancel(&self) {
        if let Some(token) = &self.cancellation {
            token.cancel();
        }
    }
}

/// Handler-reported performance counters for one attempt (best effort)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMetrics {
    pub cpu_time_ms: u64,
    pub memory_bytes: u64,
    pub handler_calls: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub database_queries: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub network_requests: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Outcome of one execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub result: Payload,
    /// Empty on success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(with = "duration")]
    pub duration: Duration,
    #[serde(default)]
    pub retry_count: u32,
    /// Cleared for deterministic failures such as validation errors
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    #[serde(default)]
    pub metrics: TaskMetrics,
}

fn default_retryable() -> bool {
    true
}

impl TaskResult {
    /// A zero-length result for `task` with the given status
    pub fn new(task: &Task, status: TaskStatus) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            status,
            result: Payload::new(),
            error: String::new(),
            started_at: now,
            completed_at: now,
            duration: Duration::ZERO,
            retry_count: 0,
            retryable: true,
            metrics: TaskMetrics::default(),
        }
    }

    pub fn failed(task: &Task, error: impl Into<String>) -> Self {
        let mut result = Self::new(task, TaskStatus::Failed);
        result.error = error.into();
        result
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration.as_millis() as i64
    }
}

/// Per-agent aggregate of execution outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskMetrics {
    pub agent_id: AgentId,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub cancelled_tasks: i64,
    pub timeout_tasks: i64,
    pub avg_duration_ms: i64,
    pub total_duration_ms: i64,
    #[serde(default)]
    pub tasks_by_type: HashMap<String, i64>,
    pub last_updated: DateTime<Utc>,
}

impl AgentTaskMetrics {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            timeout_tasks: 0,
            avg_duration_ms: 0,
            total_duration_ms: 0,
            tasks_by_type: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Fold one attempt's result into the aggregate.
    ///
    /// The average is taken over completed tasks only, so it stays zero
    /// until the first success.
    pub fn record(&mut self, result: &TaskResult, task_type: &str) {
        self.total_tasks += 1;
        match result.status {
            TaskStatus::Completed => self.completed_tasks += 1,
            TaskStatus::Failed => self.failed_tasks += 1,
            TaskStatus::Cancelled => self.cancelled_tasks += 1,
            TaskStatus::Timeout => self.timeout_tasks += 1,
            _ => {}
        }

        self.total_duration_ms += result.duration_ms();
        if self.completed_tasks > 0 {
            self.avg_duration_ms = self.total_duration_ms / self.completed_tasks;
        }

        if !task_type.is_empty() {
            *self.tasks_by_type.entry(task_type.to_string()).or_insert(0) += 1;
        }

        self.last_updated = Utc::now();
    }
}

/// Field used to order task listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    Priority,
}

/// Filters for task listings. Listings default to newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFilters {
    /// Any of these statuses; empty matches all
    pub status: Vec<TaskStatus>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub min_priority: Option<i32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: SortField,
    pub sort_desc: bool,
}

impl Default for TaskFilters {
    fn default() -> Self {
        Self {
            status: Vec::new(),
            task_type: None,
            min_priority: None,
            created_after: None,
            created_before: None,
            limit: None,
            offset: 0,
            sort_by: SortField::CreatedAt,
            sort_desc: true,
        }
    }
}

impl TaskFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status.push(status);
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_min_priority(mut self, priority: i32) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn sorted_by(mut self, field: SortField, descending: bool) -> Self {
        self.sort_by = field;
        self.sort_desc = descending;
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.status.is_empty() && !self.status.contains(&task.status) {
            return false;
        }
        if let Some(task_type) = &self.task_type {
            if !task_type.is_empty() && &task.task_type != task_type {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority() < min {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if task.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if task.created_at > before {
                return false;
            }
        }
        true
    }

    /// Filter, sort and paginate `tasks`
    pub fn apply<I>(&self, tasks: I) -> Vec<Task>
    where
        I: IntoIterator<Item = Task>,
    {
        let mut selected: Vec<Task> = tasks.into_iter().filter(|t| self.matches(t)).collect();

        match self.sort_by {
            SortField::CreatedAt => selected.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            SortField::Priority => selected.sort_by(|a, b| {
                a.priority()
                    .cmp(&b.priority())
                    .then_with(|| a.created_at.cmp(&b.created_at))
            }),
        }
        if self.sort_desc {
            selected.reverse();
        }

        let paged = selected.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => paged.take(limit).collect(),
            None => paged.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("agent-1", "echo", "say hi", payload(json!({"message": "hi"})));
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.priority(), DEFAULT_PRIORITY);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.timeout.is_none());
        assert!(task.cancellation_token().is_none());

        let other = Task::new("agent-1", "echo", "say hi", Payload::new());
        assert_ne!(task.id, other.id);
    }

    #[test]
    fn test_priority_is_clamped() {
        let task = Task::new("a", "echo", "", Payload::new()).with_priority(42);
        assert_eq!(task.priority(), MAX_PRIORITY);

        let task = Task::new("a", "echo", "", Payload::new()).with_priority(-3);
        assert_eq!(task.priority(), MIN_PRIORITY);

        let task = Task::new("a", "echo", "", Payload::new()).with_priority(7);
        assert_eq!(task.priority(), 7);
    }

    #[test]
    fn test_priority_clamped_on_deserialize() {
        let task = Task::new("a", "echo", "", Payload::new());
        let mut value = serde_json::to_value(&task).unwrap();
        value["priority"] = json!(99);
        let decoded: Task = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.priority(), MAX_PRIORITY);
    }

    #[test]
    fn test_task_serialization_shape() {
        let task = Task::new("agent-1", "delay", "wait", payload(json!({"duration": "1s"})))
            .with_timeout(Duration::from_millis(500))
            .with_metadata("source", "test");
        let value = serde_json::to_value(&task).unwrap();

        assert_eq!(value["type"], "delay");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["timeout"], "500ms");
        assert_eq!(value["metadata"]["source"], "test");
        assert!(value.get("cancellation").is_none());

        let decoded: Task = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.id, task.id);
        assert_eq!(decoded.timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Timeout));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));

        assert!(Timeout.is_terminal());
        assert!(!Running.is_terminal());
        assert_eq!("timeout".parse::<TaskStatus>().unwrap(), Timeout);
        assert!("sleeping".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_should_retry_requires_policy() {
        let task = Task::new("a", "error", "", Payload::new());
        let result = TaskResult::failed(&task, "boom");
        assert!(!task.should_retry(&result));
        assert_eq!(task.retry_delay(0), Duration::ZERO);

        let task = task.with_retry_policy(RetryPolicy::default());
        assert!(task.should_retry(&result));
        assert_eq!(task.retry_delay(0), Duration::from_secs(2));

        let cancelled = TaskResult::new(&task, TaskStatus::Cancelled);
        assert!(!task.should_retry(&cancelled));
        let completed = TaskResult::new(&task, TaskStatus::Completed);
        assert!(!task.should_retry(&completed));
    }

    #[test]
    fn test_cancel_signals_attached_token() {
        let mut task = Task::new("a", "echo", "", Payload::new());
        task.cancel();

        let token = CancellationToken::new();
        task.attach_cancellation(token.clone());
        task.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_agent_metrics_aggregation() {
        let task = Task::new("agent-1", "echo", "", Payload::new());
        let mut metrics = AgentTaskMetrics::new("agent-1");

        for ms in [100u64, 300] {
            let mut result = TaskResult::new(&task, TaskStatus::Completed);
            result.duration = Duration::from_millis(ms);
            metrics.record(&result, "echo");
        }
        let mut failed = TaskResult::failed(&task, "boom");
        failed.duration = Duration::from_millis(200);
        metrics.record(&failed, "error");

        assert_eq!(metrics.total_tasks, 3);
        assert_eq!(metrics.completed_tasks, 2);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.total_duration_ms, 600);
        assert_eq!(metrics.avg_duration_ms, 300);
        assert_eq!(metrics.tasks_by_type.get("echo"), Some(&2));
        assert_eq!(metrics.tasks_by_type.get("error"), Some(&1));
    }

    #[test]
    fn test_filters() {
        let now = Utc::now();
        let mut old = Task::new("a", "echo", "old", Payload::new()).with_priority(2);
        old.created_at = now - ChronoDuration::hours(2);
        let mut fresh = Task::new("a", "delay", "fresh", Payload::new()).with_priority(8);
        fresh.created_at = now;
        fresh.status = TaskStatus::Queued;

        let tasks = vec![old.clone(), fresh.clone()];

        let by_type = TaskFilters::new().with_type("echo").apply(tasks.clone());
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].id, old.id);

        let by_status = TaskFilters::new().with_status(TaskStatus::Queued).apply(tasks.clone());
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].id, fresh.id);

        let by_priority = TaskFilters::new().with_min_priority(5).apply(tasks.clone());
        assert_eq!(by_priority.len(), 1);

        let window = TaskFilters::new()
            .created_between(Some(now - ChronoDuration::minutes(5)), None)
            .apply(tasks.clone());
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].id, fresh.id);

        let newest_first = TaskFilters::new()
            .sorted_by(SortField::CreatedAt, true)
            .with_limit(1)
            .apply(tasks.clone());
        assert_eq!(newest_first[0].id, fresh.id);

        let paged = TaskFilters::new().with_offset(1).apply(tasks.clone());
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, old.id);

        let by_priority = TaskFilters::new()
            .sorted_by(SortField::Priority, false)
            .apply(tasks);
        assert_eq!(by_priority[0].id, old.id);
    }
}
