//! Execution metrics collection
//!
//! The executor reports every finished attempt to a [`MetricsCollector`].
//! The default collector discards everything; [`ExecutionMetrics`] keeps
//! process-wide counters that the manager exposes in its status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::task::{Task, TaskResult, TaskStatus};

/// Hook invoked by the executor after each attempt
pub trait MetricsCollector: Send + Sync {
    fn collect(&self, task: &Task, result: &TaskResult);
}

/// Collector that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

impl MetricsCollector for NoopCollector {
    fn collect(&self, _task: &Task, _result: &TaskResult) {}
}

/// Task execution counters
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    /// Tasks completed successfully
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    pub tasks_timed_out: AtomicU64,
    /// Execution time across all attempts
    pub total_execution_time_ms: AtomicU64,
    /// Average over completed tasks
    pub avg_execution_time_ms: AtomicU64,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, status: TaskStatus, execution_time: Duration) {
        let counter = match status {
            TaskStatus::Completed => &self.tasks_completed,
            TaskStatus::Failed => &self.tasks_failed,
            TaskStatus::Cancelled => &self.tasks_cancelled,
            TaskStatus::Timeout => &self.tasks_timed_out,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let total = self
            .total_execution_time_ms
            .fetch_add(execution_time.as_millis() as u64, Ordering::Relaxed)
            + execution_time.as_millis() as u64;

        // Simple running average
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        if completed > 0 {
            self.avg_execution_time_ms
                .store(total / completed, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            total_execution_time_ms: self.total_execution_time_ms.load(Ordering::Relaxed),
            avg_execution_time_ms: self.avg_execution_time_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.tasks_completed.store(0, Ordering::Relaxed);
        self.tasks_failed.store(0, Ordering::Relaxed);
        self.tasks_cancelled.store(0, Ordering::Relaxed);
        self.tasks_timed_out.store(0, Ordering::Relaxed);
        self.total_execution_time_ms.store(0, Ordering::Relaxed);
        self.avg_execution_time_ms.store(0, Ordering::Relaxed);
    }
}

impl MetricsCollector for ExecutionMetrics {
    fn collect(&self, _task: &Task, result: &TaskResult) {
        self.record(result.status, result.duration);
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_timed_out: u64,
    pub total_execution_time_ms: u64,
    pub avg_execution_time_ms: u64,
}

impl MetricsSnapshot {
    pub fn total(&self) -> u64 {
        self.tasks_completed + self.tasks_failed + self.tasks_cancelled + self.tasks_timed_out
    }

    /// Completed share of all finished attempts (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}
