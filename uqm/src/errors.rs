//! Error types for the UQM engine.
//!
//! Every fallible operation in the crate returns [`UqmError`], which wraps one
//! of the concrete error structs below. Parse and validation errors carry the
//! document field path they refer to so the API layer can point at the
//! offending input.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type UqmResult<T> = Result<T, UqmError>;

/// The main error type for UQM operations.
#[derive(Debug, Clone, Error)]
pub enum UqmError {
    /// The pipeline document could not be parsed.
    #[error("{0}")]
    Parse(#[from] ParseError),

    /// Supplied input (parameters, options) failed validation.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A step failed while executing.
    #[error("{0}")]
    Execution(#[from] ExecutionError),

    /// An expression failed to parse or evaluate.
    #[error("{0}")]
    Expression(#[from] ExpressionError),

    /// A cache backend operation failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// A connector operation failed.
    #[error("{0}")]
    Connection(#[from] ConnectionError),

    /// An operation exceeded its deadline.
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl UqmError {
    /// Returns the taxonomy name of the error.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Parse(_) => "ParseError",
            Self::Validation(_) => "ValidationError",
            Self::Execution(_) => "ExecutionError",
            Self::Expression(_) => "ExpressionError",
            Self::Cache(_) => "CacheError",
            Self::Connection(_) => "ConnectionError",
            Self::Timeout(_) => "TimeoutError",
            Self::Serialization(_) => "SerializationError",
        }
    }

    /// Creates an execution error not yet attributed to a step.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::new(message))
    }

    /// Attributes this error to a step, converting it into an execution error.
    ///
    /// Errors that already name a step keep their original attribution.
    #[must_use]
    pub fn in_step(self, step_name: &str, step_type: &str) -> ExecutionError {
        match self {
            Self::Execution(err) if err.step_name.is_some() => err,
            Self::Execution(err) => err.with_step(step_name, step_type),
            other => ExecutionError::new(other.to_string()).with_step(step_name, step_type),
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.error_type()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::Parse(err) => {
                if let Some(ref field) = err.field {
                    map.insert("field".to_string(), serde_json::json!(field));
                }
            }
            Self::Validation(err) => {
                map.insert("errors".to_string(), serde_json::json!(err.issues));
            }
            Self::Execution(err) => {
                if let Some(ref step) = err.step_name {
                    map.insert("step_name".to_string(), serde_json::json!(step));
                }
                if let Some(ref step_type) = err.step_type {
                    map.insert("step_type".to_string(), serde_json::json!(step_type));
                }
            }
            _ => {}
        }

        map
    }
}

impl From<serde_json::Error> for UqmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised when a pipeline document is malformed.
#[derive(Debug, Clone, Error)]
#[error("{}", render_parse_error(.field.as_deref(), .message))]
pub struct ParseError {
    /// Dotted path of the offending document field (e.g. `steps[1].type`).
    pub field: Option<String>,
    /// The error message.
    pub message: String,
    /// The offending value, when known.
    pub value: Option<serde_json::Value>,
}

fn render_parse_error(field: Option<&str>, message: &str) -> String {
    match field {
        Some(field) => format!("Parse error at '{field}': {message}"),
        None => format!("Parse error: {message}"),
    }
}

impl ParseError {
    /// Creates a new parse error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
            value: None,
        }
    }

    /// Sets the field path.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Sets the offending value.
    #[must_use]
    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Converts to a validation issue.
    #[must_use]
    pub fn to_issue(&self) -> ValidationIssue {
        ValidationIssue {
            field: self.field.clone().unwrap_or_default(),
            message: self.message.clone(),
            value: self.value.clone(),
        }
    }
}

/// Error raised when a cycle is detected in the step dependency graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected at step '{step}': {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The step that was re-visited while still in progress.
    pub step: String,
    /// The path of steps forming the cycle.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(step: impl Into<String>, cycle_path: Vec<String>) -> Self {
        Self {
            step: step.into(),
            cycle_path,
        }
    }
}

impl From<CycleDetectedError> for ParseError {
    fn from(err: CycleDetectedError) -> Self {
        ParseError::new(err.to_string())
            .with_field("steps")
            .with_value(serde_json::json!(err.cycle_path))
    }
}

impl From<CycleDetectedError> for UqmError {
    fn from(err: CycleDetectedError) -> Self {
        Self::Parse(err.into())
    }
}

/// A single field-level validation problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending field.
    pub field: String,
    /// Human readable message.
    pub message: String,
    /// The offending value, when known.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl ValidationIssue {
    /// Creates a new validation issue.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value: None,
        }
    }

    /// Sets the offending value.
    #[must_use]
    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Error raised when supplied input fails validation.
#[derive(Debug, Clone, Error)]
#[error("Validation failed: {}", summarize_issues(.issues))]
pub struct ValidationError {
    /// Individual issues found.
    pub issues: Vec<ValidationIssue>,
}

fn summarize_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    /// Creates a validation error from a list of issues.
    #[must_use]
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    /// Creates a validation error with a single issue.
    #[must_use]
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue::new(field, message)],
        }
    }
}

/// Error raised when a step fails during execution.
#[derive(Debug, Clone, Error)]
#[error("{}", render_execution_error(.step_name.as_deref(), .step_type.as_deref(), .message))]
pub struct ExecutionError {
    /// The failing step, once known.
    pub step_name: Option<String>,
    /// The failing step's type, once known.
    pub step_type: Option<String>,
    /// The error message.
    pub message: String,
}

fn render_execution_error(step: Option<&str>, step_type: Option<&str>, message: &str) -> String {
    match (step, step_type) {
        (Some(step), Some(kind)) => format!("Step '{step}' ({kind}) failed: {message}"),
        (Some(step), None) => format!("Step '{step}' failed: {message}"),
        _ => format!("Execution error: {message}"),
    }
}

impl ExecutionError {
    /// Creates a new execution error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            step_name: None,
            step_type: None,
            message: message.into(),
        }
    }

    /// Sets the failing step.
    #[must_use]
    pub fn with_step(mut self, step_name: impl Into<String>, step_type: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self.step_type = Some(step_type.into());
        self
    }
}

/// Errors raised by the expression lexer, parser and evaluator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    /// The expression text is not valid in the closed grammar.
    #[error("Syntax error at position {position}: {message}")]
    Syntax {
        /// Character offset where the problem was found.
        position: usize,
        /// Description of the problem.
        message: String,
    },

    /// A function outside the allow-list was called.
    #[error("Function not allowed: {name}")]
    UnknownFunction {
        /// The function name.
        name: String,
    },

    /// A referenced field is absent from the row.
    #[error("Unknown field: {name}")]
    UnknownField {
        /// The field name.
        name: String,
    },

    /// An operator was applied to incompatible operand types.
    #[error("Type mismatch: cannot apply '{op}' to {left} and {right}")]
    TypeMismatch {
        /// The operator.
        op: String,
        /// Type of the left operand.
        left: String,
        /// Type of the right operand.
        right: String,
    },

    /// Division or modulo by zero.
    #[error("Division by zero")]
    DivisionByZero,

    /// A function received an invalid argument.
    #[error("Invalid argument to {function}: {message}")]
    InvalidArgument {
        /// The function name.
        function: String,
        /// Description of the problem.
        message: String,
    },

    /// A construct was used where it cannot be evaluated.
    #[error("Unsupported expression: {0}")]
    Unsupported(String),
}

impl ExpressionError {
    /// Creates a syntax error.
    #[must_use]
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    /// Creates a type mismatch error.
    #[must_use]
    pub fn type_mismatch(op: impl Into<String>, left: &str, right: &str) -> Self {
        Self::TypeMismatch {
            op: op.into(),
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            function: function.into(),
            message: message.into(),
        }
    }
}

/// Error raised by a cache backend.
#[derive(Debug, Clone, Error)]
#[error("Cache error: {message}")]
pub struct CacheError {
    /// The error message.
    pub message: String,
}

impl CacheError {
    /// Creates a new cache error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error raised by a connector.
#[derive(Debug, Clone, Error)]
#[error("Connection error: {message}")]
pub struct ConnectionError {
    /// The error message.
    pub message: String,
}

impl ConnectionError {
    /// Creates a new connection error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error raised when an operation exceeds its deadline.
#[derive(Debug, Clone, Error)]
#[error("Timeout: {operation} exceeded {timeout_ms}ms")]
pub struct TimeoutError {
    /// The operation that timed out.
    pub operation: String,
    /// The deadline in milliseconds.
    pub timeout_ms: u64,
}

impl TimeoutError {
    /// Creates a new timeout error.
    #[must_use]
    pub fn new(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            operation: operation.into(),
            timeout_ms,
        }
    }
}
