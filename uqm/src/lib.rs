//! # UQM
//!
//! Execution engine for declarative UQM query/transform pipelines.
//!
//! A UQM document names a set of steps (query, enrich, pivot, unpivot,
//! union, assert), the parameters they take and the step whose rows are the
//! result. The engine provides:
//!
//! - **Schema parsing**: validation, dependency extraction and topological ordering
//! - **Parameter resolution**: typed parameters, `$name` substitution and conditional filters
//! - **Dual-path queries**: SQL generation for tables, in-memory evaluation for upstream rows
//! - **Caching**: per-step and whole-pipeline results behind a pluggable backend
//! - **Failure policy**: fail-fast or continue-on-error with per-step results
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use uqm::prelude::*;
//!
//! let engine = PipelineEngine::new(EngineConfig::default())
//!     .with_connector(connector)
//!     .with_cache(Arc::new(InMemoryCache::new()));
//!
//! let result = engine
//!     .execute(&document, params, ExecutionOptions::new().with_page(1, 50))
//!     .await?
//!     .into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod config;
pub mod connectors;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod expr;
pub mod filter;
pub mod observability;
pub mod params;
pub mod schema;
pub mod sql;
pub mod steps;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheBackend, CacheStats, InMemoryCache};
    pub use crate::config::{EngineConfig, ExecutionOptions, ExpressionFailurePolicy};
    pub use crate::connectors::{ColumnInfo, Connector, TableSchema};
    pub use crate::core::{Parameters, Row, RowSet, StepKind, StepStatus, Value};
    pub use crate::engine::{ExecutionPlan, ExecutionResult, PaginationInfo, PipelineEngine};
    pub use crate::errors::{
        CacheError, ConnectionError, ExecutionError, ExpressionError, ParseError, UqmError,
        UqmResult, ValidationError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{Executor, FailureMode, StepResult};
    pub use crate::filter::{ConditionalGate, FilterNode, FilterOperator};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::schema::{parse, Pipeline, ValidationResult};
    pub use crate::sql::SqlDialect;
    pub use crate::steps::{StepContext, StepEngine, StepOutput, StepRegistry};
}
