//! Testing utilities for UQM pipelines.
//!
//! This module provides:
//! - Row and document fixtures
//! - An in-memory connector and mock step engines
//! - Assertions over execution results

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_column_values, assert_failed, assert_row_count, assert_step_status, assert_success,
};
pub use fixtures::{pipeline_doc, query_step, rows, sales_connector, sales_rows};
pub use mocks::{CountingStep, FailingStep, StaticConnector};
