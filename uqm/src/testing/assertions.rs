//! Test assertions for execution results.

use crate::core::{lookup_field, Row, StepStatus, Value};
use crate::engine::ExecutionResult;

/// Asserts that the run succeeded.
pub fn assert_success(result: &ExecutionResult) {
    assert!(
        result.success,
        "Expected success, got errors: {:?}",
        result.errors.iter().map(|e| &e.message).collect::<Vec<_>>()
    );
}

/// Asserts that the run failed.
pub fn assert_failed(result: &ExecutionResult) {
    assert!(
        !result.success,
        "Expected failure, got {} rows",
        result.data.len()
    );
}

/// Asserts the final status of a step.
pub fn assert_step_status(result: &ExecutionResult, step: &str, expected: StepStatus) {
    let actual = result.step(step).map(|r| r.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected step '{step}' to be {expected:?}, got {actual:?}"
    );
}

/// Asserts the number of returned rows.
pub fn assert_row_count(result: &ExecutionResult, expected: usize) {
    assert_eq!(
        result.data.len(),
        expected,
        "Expected {expected} rows, got {}",
        result.data.len()
    );
}

/// Asserts the values of one column, in row order.
pub fn assert_column_values(rows: &[Row], column: &str, expected: &[Value]) {
    let actual: Vec<Value> = rows
        .iter()
        .map(|row| lookup_field(row, column).cloned().unwrap_or_default())
        .collect();
    assert_eq!(actual, expected, "Unexpected values in column '{column}'");
}
