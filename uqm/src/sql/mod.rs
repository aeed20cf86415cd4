//! Dialect-aware SQL generation.
//!
//! Everything here is pure: specs in, SQL text out. Identifiers are checked
//! against a conservative grammar and literals are escaped, so values from
//! parameters never reach the statement unquoted.

mod builder;
mod dialect;
mod render;

pub use builder::{
    build_count, build_select, JoinClause, JoinOn, JoinType, OrderBy, SelectField, SelectSpec,
};
pub use dialect::SqlDialect;
pub use render::{
    identifier, is_valid_identifier, literal, quote_string, render_expr, render_expr_with,
};
