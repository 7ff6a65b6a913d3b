use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::duration;
use crate::task::model::{TaskResult, TaskStatus};

/// Retry behaviour for failed or timed-out tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first execution
    pub max_retries: u32,
    /// Base delay before the first retry
    #[serde(with = "duration")]
    pub initial_delay: Duration,
    /// Upper bound for any computed delay
    #[serde(with = "duration")]
    pub max_delay: Duration,
    /// Scale factor applied on top of the exponential growth
    pub multiplier: f64,
    /// Substrings of error text that are worth retrying. Empty means every
    /// failed or timed-out attempt is eligible.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_retryable_errors<I, S>(mut self, errors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = errors.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the attempt described by `result` may be retried.
    ///
    /// Completed and cancelled attempts never are. Failed and timed-out
    /// attempts are, while retries remain, unless the result was marked
    /// non-retryable (validation failures) or its error text misses the
    /// allow-list.
    pub fn allows(&self, result: &TaskResult) -> bool {
        if result.retry_count >= self.max_retries {
            return false;
        }

        match result.status {
            TaskStatus::Failed | TaskStatus::Timeout => {}
            _ => return false,
        }

        if !result.retryable {
            return false;
        }

        self.retryable_errors.is_empty()
            || self
                .retryable_errors
                .iter()
                .any(|pattern| result.error.contains(pattern.as_str()))
    }

    /// Backoff before retry number `retry_count` (zero-based):
    /// `initial_delay * 2^retry_count * multiplier`, capped at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(62) as i32;
        let secs = self.initial_delay.as_secs_f64() * 2f64.powi(exponent) * self.multiplier;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        if secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err("retry multiplier must be a positive number".to_string());
        }
        if self.initial_delay > self.max_delay {
            return Err("retry initial_delay cannot exceed max_delay".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result_with(status: TaskStatus, retry_count: u32, error: &str) -> TaskResult {
        let now = Utc::now();
        TaskResult {
            task_id: "task_1".to_string(),
            agent_id: "agent_1".to_string(),
            status,
            result: Default::default(),
            error: error.to_string(),
            started_at: now,
            completed_at: now,
            duration: Duration::ZERO,
            retry_count,
            retryable: true,
            metrics: Default::default(),
        }
    }

    #[test]
    fn test_default_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3), Duration::from_secs(16));
        assert_eq!(policy.delay_for(4), Duration::from_secs(32));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_fractional_multiplier() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(250), Duration::from_secs(10))
            .with_multiplier(1.5);
        assert_eq!(policy.delay_for(0), Duration::from_millis(375));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
    }

    #[test]
    fn test_retry_eligibility_by_status() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(&result_with(TaskStatus::Failed, 0, "boom")));
        assert!(policy.allows(&result_with(TaskStatus::Timeout, 2, "task execution timeout")));
        assert!(!policy.allows(&result_with(TaskStatus::Completed, 0, "")));
        assert!(!policy.allows(&result_with(TaskStatus::Cancelled, 0, "")));
    }

    #[test]
    fn test_retries_exhausted() {
        let policy = RetryPolicy::default();
        assert!(!policy.allows(&result_with(TaskStatus::Failed, 3, "boom")));
        assert!(!RetryPolicy::none().allows(&result_with(TaskStatus::Failed, 0, "boom")));
    }

    #[test]
    fn test_non_retryable_result() {
        let mut result = result_with(TaskStatus::Failed, 0, "validation failed: missing url");
        result.retryable = false;
        assert!(!RetryPolicy::default().allows(&result));
    }

    #[test]
    fn test_retryable_errors_allow_list() {
        let policy = RetryPolicy::default().with_retryable_errors(["connection reset", "503"]);
        assert!(policy.allows(&result_with(
            TaskStatus::Failed,
            0,
            "request failed: connection reset by peer"
        )));
        assert!(policy.allows(&result_with(TaskStatus::Failed, 0, "upstream returned 503")));
        assert!(!policy.allows(&result_with(TaskStatus::Failed, 0, "permission denied")));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::default().with_multiplier(0.0).validate().is_err());
        assert!(RetryPolicy::default()
            .with_delays(Duration::from_secs(10), Duration::from_secs(1))
            .validate()
            .is_err());
    }
}
