//! Pipeline documents: parsing, dependency resolution and validation.
//!
//! [`parse`] turns a JSON document into a [`Pipeline`] whose steps are
//! ordered so that every step runs after the steps it reads from. Steps
//! depend on each other through `source`/`sources` and, when the name
//! matches a declared step, through a query's `data_source` or join table,
//! an enrich `lookup` and an assertion `reference`.

mod dag;
mod document;
mod parser;

pub use dag::topological_order;
pub use document::{Metadata, Pipeline, Step, ValidationResult};
pub use parser::{parse, parse_str, validate_schema, validate_schema_with, DEFAULT_MAX_STEPS_WARNING};
