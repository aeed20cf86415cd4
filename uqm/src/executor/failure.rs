//! Failure tracking for a pipeline run.
//!
//! Fail-fast stops at the first failed step. Continue-on-error keeps
//! running; dependents of a failed step then fail on their own when they
//! read its missing row set.

use crate::errors::ExecutionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a run reacts to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop at the first failure (default).
    #[default]
    FailFast,
    /// Record the failure and run the remaining steps.
    ContinueOnError,
}

impl FailureMode {
    /// Mode for a `continue_on_error` flag.
    #[must_use]
    pub fn from_flag(continue_on_error: bool) -> Self {
        if continue_on_error {
            Self::ContinueOnError
        } else {
            Self::FailFast
        }
    }
}

/// A failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Step name.
    pub step_name: String,
    /// Step type.
    pub step_type: String,
    /// Error message.
    pub message: String,
    /// Error class (`ExecutionError`, `ConnectionError`, ...).
    pub error_type: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a record stamped now.
    #[must_use]
    pub fn new(
        step_name: impl Into<String>,
        step_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            step_type: step_type.into(),
            message: message.into(),
            error_type: "ExecutionError".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Sets the error class.
    #[must_use]
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    /// The failure as an execution error attributed to its step.
    #[must_use]
    pub fn to_error(&self) -> ExecutionError {
        ExecutionError::new(self.message.clone()).with_step(&self.step_name, &self.step_type)
    }
}

/// Collects failures and completions during a run.
#[derive(Debug, Default)]
pub struct FailureCollector {
    mode: FailureMode,
    failures: Vec<FailureRecord>,
    failed_steps: HashSet<String>,
    completed_steps: HashSet<String>,
}

impl FailureCollector {
    /// Creates a collector.
    #[must_use]
    pub fn new(mode: FailureMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// The failure mode.
    #[must_use]
    pub fn mode(&self) -> FailureMode {
        self.mode
    }

    /// Records a failed step.
    pub fn record_failure(&mut self, record: FailureRecord) {
        self.failed_steps.insert(record.step_name.clone());
        self.failures.push(record);
    }

    /// Records a step that produced rows.
    pub fn record_completion(&mut self, step: &str) {
        self.completed_steps.insert(step.to_string());
    }

    /// Whether the step failed.
    #[must_use]
    pub fn has_failed(&self, step: &str) -> bool {
        self.failed_steps.contains(step)
    }

    /// Whether the step completed.
    #[must_use]
    pub fn has_completed(&self, step: &str) -> bool {
        self.completed_steps.contains(step)
    }

    /// Whether the run must stop now.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        match self.mode {
            FailureMode::FailFast => !self.failures.is_empty(),
            FailureMode::ContinueOnError => false,
        }
    }

    /// First failed dependency of a step, if any.
    #[must_use]
    pub fn failed_dependency<'a>(&self, dependencies: &'a [String]) -> Option<&'a str> {
        dependencies
            .iter()
            .find(|dep| self.failed_steps.contains(dep.as_str()))
            .map(String::as_str)
    }

    /// Recorded failures in order.
    #[must_use]
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Consumes the collector, returning the failures.
    #[must_use]
    pub fn into_failures(self) -> Vec<FailureRecord> {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mode_from_flag() {
        assert_eq!(FailureMode::default(), FailureMode::FailFast);
        assert_eq!(FailureMode::from_flag(true), FailureMode::ContinueOnError);
    }

    #[test]
    fn test_fail_fast_stops() {
        let mut collector = FailureCollector::new(FailureMode::FailFast);
        assert!(!collector.should_stop());

        collector.record_failure(FailureRecord::new("a", "query", "boom"));
        assert!(collector.should_stop());
        assert!(collector.has_failed("a"));
        assert!(!collector.has_failed("b"));
    }

    #[test]
    fn test_continue_tracks_failed_dependencies() {
        let mut collector = FailureCollector::new(FailureMode::ContinueOnError);
        collector.record_completion("a");
        collector.record_failure(FailureRecord::new("b", "query", "boom").with_error_type("ConnectionError"));

        assert!(!collector.should_stop());
        assert!(collector.has_completed("a"));
        let deps = vec!["a".to_string(), "b".to_string()];
        assert_eq!(collector.failed_dependency(&deps), Some("b"));
        assert_eq!(collector.failed_dependency(&deps[..1]), None);
        assert_eq!(collector.failures()[0].error_type, "ConnectionError");
    }

    #[test]
    fn test_record_to_error() {
        let err = FailureRecord::new("totals", "pivot", "no rows").to_error();
        assert_eq!(err.to_string(), "Step 'totals' (pivot) failed: no rows");
    }
}
