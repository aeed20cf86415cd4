//! Core domain model types for the UQM engine.
//!
//! This module contains the fundamental types used throughout the crate:
//! - The `Value` tagged union
//! - Rows and row sets
//! - Step kind and status enums
//! - Resolved parameter values

mod row;
mod status;
mod value;

pub use row::{
    column_names, has_field, lookup_field, row_from_pairs, row_identity, rows_from_json,
    rows_to_json, Row, RowSet,
};
pub use status::{StepKind, StepStatus};
pub use value::Value;

/// Resolved parameter values keyed by name.
///
/// Ordered by name so fingerprints over parameters are deterministic.
pub type Parameters = std::collections::BTreeMap<String, Value>;
