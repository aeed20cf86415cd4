//! Step kind and status enums.

use crate::errors::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Selects, filters and aggregates rows from a table or an upstream step.
    Query,
    /// Joins a source row set against a lookup.
    Enrich,
    /// Reshapes long rows into a wide table.
    Pivot,
    /// Melts wide rows into long (variable, value) rows.
    Unpivot,
    /// Combines several row sets with set semantics.
    Union,
    /// Runs data quality checks over a row set.
    Assert,
}

impl StepKind {
    /// All step kinds, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Query,
        Self::Enrich,
        Self::Pivot,
        Self::Unpivot,
        Self::Union,
        Self::Assert,
    ];

    /// Returns the document name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Enrich => "enrich",
            Self::Pivot => "pivot",
            Self::Unpivot => "unpivot",
            Self::Union => "union",
            Self::Assert => "assert",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(StepKind::as_str).collect();
                ParseError::new(format!(
                    "Unknown step type '{s}'; expected one of: {}",
                    known.join(", ")
                ))
                .with_value(serde_json::json!(s))
            })
    }
}

/// The execution status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step is waiting to run.
    #[default]
    Pending,
    /// Step is currently running.
    Running,
    /// Step produced a row set.
    Success,
    /// Step failed.
    Failed,
    /// Step was not run because the pipeline aborted first.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StepStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_display() {
        assert_eq!(StepKind::Query.to_string(), "query");
        assert_eq!(StepKind::Unpivot.to_string(), "unpivot");
        assert_eq!(StepKind::Assert.to_string(), "assert");
    }

    #[test]
    fn test_step_kind_from_str() {
        assert_eq!("Pivot".parse::<StepKind>().unwrap(), StepKind::Pivot);
        assert_eq!(" union ".parse::<StepKind>().unwrap(), StepKind::Union);

        let err = "transmogrify".parse::<StepKind>().unwrap_err();
        assert!(err.message.contains("transmogrify"));
        assert!(err.message.contains("enrich"));
    }

    #[test]
    fn test_step_status_is_terminal() {
        assert!(StepStatus::Success.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_status_serialize() {
        let json = serde_json::to_string(&StepStatus::Failed).unwrap();
        assert_eq!(json, r#""failed""#);

        let kind: StepKind = serde_json::from_str(r#""enrich""#).unwrap();
        assert_eq!(kind, StepKind::Enrich);
    }
}
