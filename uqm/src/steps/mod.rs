//! Step engines.
//!
//! Each [`StepKind`] has one [`StepEngine`] that turns a step config plus
//! upstream row sets into a [`StepOutput`]. Engines are looked up through an
//! explicit [`StepRegistry`] owned by the executor.

mod assert;
mod common;
mod enrich;
mod pivot;
mod query;
mod union;
mod unpivot;

pub use assert::{AssertConfig, AssertStep, Assertion, AssertionKind, AssertionResult, OnFailure};
pub use common::{parse_config, OneOrMany};
pub use enrich::{EnrichConfig, EnrichStep, JoinHow, OnMissing};
pub use pivot::{PivotAgg, PivotConfig, PivotStep};
pub use query::{preview_sql, QueryConfig, QueryStep};
pub use union::{UnionConfig, UnionMode, UnionStep};
pub use unpivot::{UnpivotConfig, UnpivotStep};

use crate::config::ExpressionFailurePolicy;
use crate::connectors::Connector;
use crate::core::{Parameters, RowSet, StepKind};
use crate::errors::{ConnectionError, ExecutionError, UqmResult};
use crate::sql::SqlDialect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Rows requested from a step's SQL path: `LIMIT`/`OFFSET` plus a total
/// count query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Rows per page.
    pub limit: u64,
    /// Rows to skip.
    pub offset: u64,
}

impl Pagination {
    /// Pagination for a 1-based page number.
    #[must_use]
    pub fn page(page: u64, page_size: u64) -> Self {
        Self {
            limit: page_size,
            offset: page.saturating_sub(1).saturating_mul(page_size),
        }
    }
}

/// What a step produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Result rows.
    pub rows: RowSet,
    /// Total rows before pagination, when the step paginated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    /// Non-fatal problems.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Kind-specific details (assertion results, generated SQL).
    #[serde(default)]
    pub details: serde_json::Value,
}

impl StepOutput {
    /// Wraps rows.
    #[must_use]
    pub fn new(rows: RowSet) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Sets the details payload.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Sets the pre-pagination total.
    #[must_use]
    pub fn with_total_count(mut self, total_count: u64) -> Self {
        self.total_count = Some(total_count);
        self
    }
}

/// Everything a step engine may read while executing.
#[derive(Clone)]
pub struct StepContext {
    /// Step name.
    pub step_name: String,
    /// Step kind.
    pub step_type: StepKind,
    /// Resolved config.
    pub config: serde_json::Value,
    /// Declared upstream steps.
    pub upstream: Vec<String>,
    /// Row sets of upstream steps that succeeded.
    pub inputs: HashMap<String, Arc<RowSet>>,
    /// Resolved parameters.
    pub params: Arc<Parameters>,
    /// Database access, if configured.
    pub connector: Option<Arc<dyn Connector>>,
    /// Dialect for generated SQL.
    pub dialect: SqlDialect,
    /// Default calculated-field failure policy.
    pub expression_failure: ExpressionFailurePolicy,
    /// Pagination pushed into the SQL path.
    pub pagination: Option<Pagination>,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step_name", &self.step_name)
            .field("step_type", &self.step_type)
            .field("upstream", &self.upstream)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("has_connector", &self.connector.is_some())
            .field("dialect", &self.dialect)
            .field("pagination", &self.pagination)
            .finish_non_exhaustive()
    }
}

impl StepContext {
    /// Creates a context with no inputs, parameters or connector.
    #[must_use]
    pub fn new(step_name: impl Into<String>, step_type: StepKind, config: serde_json::Value) -> Self {
        Self {
            step_name: step_name.into(),
            step_type,
            config,
            upstream: Vec::new(),
            inputs: HashMap::new(),
            params: Arc::new(Parameters::new()),
            connector: None,
            dialect: SqlDialect::default(),
            expression_failure: ExpressionFailurePolicy::default(),
            pagination: None,
        }
    }

    /// Adds an upstream row set.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, rows: RowSet) -> Self {
        let name = name.into();
        if !self.upstream.contains(&name) {
            self.upstream.push(name.clone());
        }
        self.inputs.insert(name, Arc::new(rows));
        self
    }

    /// Sets the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Parameters) -> Self {
        self.params = Arc::new(params);
        self
    }

    /// Sets the connector and adopts its dialect.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.dialect = connector.dialect();
        self.connector = Some(connector);
        self
    }

    /// Sets the pagination.
    #[must_use]
    pub fn with_pagination(mut self, pagination: Option<Pagination>) -> Self {
        self.pagination = pagination;
        self
    }

    /// Whether `name` refers to an upstream step rather than a table.
    #[must_use]
    pub fn is_upstream(&self, name: &str) -> bool {
        self.upstream.iter().any(|u| u == name)
    }

    /// Returns the rows of an upstream step.
    ///
    /// # Errors
    ///
    /// Fails when the upstream step produced no result, typically because it
    /// failed earlier in a continue-on-error run.
    pub fn input(&self, name: &str) -> UqmResult<Arc<RowSet>> {
        self.inputs.get(name).cloned().ok_or_else(|| {
            ExecutionError::new(format!(
                "Step '{}' cannot read '{name}': no result is available",
                self.step_name
            ))
            .into()
        })
    }

    /// Returns the connector.
    ///
    /// # Errors
    ///
    /// Fails with a connection error when none is configured.
    pub fn connector(&self) -> Result<&Arc<dyn Connector>, ConnectionError> {
        self.connector.as_ref().ok_or_else(|| {
            ConnectionError::new(format!(
                "Step '{}' needs a database connector but none is configured",
                self.step_name
            ))
        })
    }
}

/// Executes one kind of step.
#[async_trait]
pub trait StepEngine: Send + Sync {
    /// The kind this engine handles.
    fn kind(&self) -> StepKind;

    /// Runs the step.
    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput>;
}

/// Maps step kinds to engines.
#[derive(Clone)]
pub struct StepRegistry {
    engines: HashMap<StepKind, Arc<dyn StepEngine>>,
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.engines.keys().map(StepKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("StepRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StepRegistry {
    /// Creates a registry with no engines.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in engine for every kind.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::empty()
            .with(Arc::new(QueryStep))
            .with(Arc::new(EnrichStep))
            .with(Arc::new(PivotStep))
            .with(Arc::new(UnpivotStep))
            .with(Arc::new(UnionStep))
            .with(Arc::new(AssertStep))
    }

    /// Registers an engine, replacing any previous one for its kind.
    #[must_use]
    pub fn with(mut self, engine: Arc<dyn StepEngine>) -> Self {
        self.register(engine);
        self
    }

    /// Registers an engine, replacing any previous one for its kind.
    pub fn register(&mut self, engine: Arc<dyn StepEngine>) {
        self.engines.insert(engine.kind(), engine);
    }

    /// Returns the engine for `kind`.
    ///
    /// # Errors
    ///
    /// Fails when no engine is registered for the kind.
    pub fn get(&self, kind: StepKind) -> UqmResult<Arc<dyn StepEngine>> {
        self.engines.get(&kind).cloned().ok_or_else(|| {
            ExecutionError::new(format!("No engine registered for step type '{kind}'")).into()
        })
    }

    /// Whether an engine is registered for `kind`.
    #[must_use]
    pub fn contains(&self, kind: StepKind) -> bool {
        self.engines.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults_cover_all_kinds() {
        let registry = StepRegistry::with_defaults();
        for kind in StepKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
        assert!(StepRegistry::empty().get(StepKind::Query).is_err());
    }

    #[test]
    fn test_pagination_page() {
        assert_eq!(Pagination::page(3, 10), Pagination { limit: 10, offset: 20 });
        assert_eq!(Pagination::page(1, 10).offset, 0);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let ctx = StepContext::new("b", StepKind::Union, serde_json::json!({}));
        assert!(ctx.input("a").is_err());
        assert!(ctx.connector().is_err());
    }
}
