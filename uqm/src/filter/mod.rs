//! Filter trees and conditional gates.
//!
//! One [`FilterNode`] representation serves both execution paths: the SQL
//! builder renders it with `to_sql`, the in-memory path with
//! [`FilterNode::evaluate`].

mod gate;
mod node;

pub use gate::{resolve_conditions, ConditionalGate};
pub use node::{FilterCondition, FilterNode, FilterOperator, LogicalOp};
