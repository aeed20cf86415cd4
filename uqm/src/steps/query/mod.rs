//! Query step: select, filter, group and compute over a table or an
//! upstream row set.
//!
//! A `data_source` naming an upstream step runs entirely in memory; any
//! other name is treated as a table and compiled to SQL for the connector.
//! Both paths share one [`QueryPlan`] so they agree on semantics.

mod memory;
mod sql_path;

pub use sql_path::preview_sql;

use super::common::{parse_config, OneOrMany};
use super::{StepContext, StepEngine, StepOutput};
use crate::config::ExpressionFailurePolicy;
use crate::core::{RowSet, StepKind, Value};
use crate::errors::{ExecutionError, ExpressionError, UqmResult};
use crate::expr::{parse_expression, AggregateFunction, Expr};
use crate::filter::FilterNode;
use crate::sql::{JoinClause, JoinOn, JoinType, OrderBy};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

/// A dimension: a column name, optionally aliased.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    /// Bare column name.
    Name(String),
    /// Column with an output alias.
    Aliased {
        /// Source column.
        field: String,
        /// Output name.
        #[serde(default)]
        alias: Option<String>,
    },
}

impl Dimension {
    fn field(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Aliased { field, .. } => field,
        }
    }

    fn output_name(&self) -> &str {
        match self {
            Self::Name(name) | Self::Aliased { field: name, alias: None } => name,
            Self::Aliased { alias: Some(alias), .. } => alias,
        }
    }
}

/// A metric: an aggregation over a field, an expression, or a plain column.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Metric {
    /// Output name.
    pub name: String,
    /// Source field; defaults to `name`.
    #[serde(default)]
    pub field: Option<String>,
    /// `sum|count|count_distinct|avg|min|max`.
    #[serde(default)]
    pub aggregation: Option<String>,
    /// Expression computing the metric.
    #[serde(default)]
    pub expression: Option<String>,
}

/// Join condition in config form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum JoinCondition {
    /// `"left = right"`.
    Text(String),
    /// Explicit sides.
    Pair {
        /// Left column.
        left: String,
        /// Right column.
        right: String,
    },
}

/// A join in config form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinConfig {
    /// `inner|left|right|full`; defaults to inner.
    #[serde(rename = "type", default)]
    pub join_type: Option<String>,
    /// Table or upstream step.
    pub table: String,
    /// Alias for the joined side.
    #[serde(default)]
    pub alias: Option<String>,
    /// Equality conditions.
    pub on: OneOrMany<JoinCondition>,
}

/// ORDER BY entry in config form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OrderSpec {
    /// `"field [ASC|DESC]"`.
    Text(String),
    /// Explicit direction.
    Keyed {
        /// Field or alias.
        field: String,
        /// `asc` or `desc`.
        #[serde(default)]
        direction: Option<String>,
    },
}

/// A calculated field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalculatedField {
    /// Output name.
    pub name: String,
    /// Expression text.
    pub expression: String,
}

/// Query step configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryConfig {
    /// Table name or upstream step.
    pub data_source: String,
    /// Grouping/projection columns.
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    /// Metrics.
    #[serde(default)]
    pub metrics: Vec<Metric>,
    /// WHERE tree.
    #[serde(default)]
    pub filters: Option<serde_json::Value>,
    /// WHERE tree under its SQL name; ANDed with `filters`.
    #[serde(default, rename = "where")]
    pub where_clause: Option<serde_json::Value>,
    /// Joins.
    #[serde(default)]
    pub joins: Vec<JoinConfig>,
    /// Explicit GROUP BY.
    #[serde(default)]
    pub group_by: OneOrMany<String>,
    /// HAVING tree.
    #[serde(default)]
    pub having: Option<serde_json::Value>,
    /// Calculated fields, evaluated in order.
    #[serde(default)]
    pub calculated_fields: Vec<CalculatedField>,
    /// ORDER BY.
    #[serde(default)]
    pub order_by: OneOrMany<OrderSpec>,
    /// Row limit.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Row offset.
    #[serde(default)]
    pub offset: Option<u64>,
    /// SELECT DISTINCT.
    #[serde(default)]
    pub distinct: bool,
    /// Calculated-field failure policy for this step.
    #[serde(default)]
    pub expression_failure: Option<ExpressionFailurePolicy>,
}

/// How a metric is computed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MetricPlan {
    Aggregate {
        func: AggregateFunction,
        field: Option<String>,
        alias: String,
    },
    Expression {
        expr: Expr,
        alias: String,
    },
    Column {
        field: String,
        alias: String,
    },
}

impl MetricPlan {
    pub(crate) fn alias(&self) -> &str {
        match self {
            Self::Aggregate { alias, .. } | Self::Expression { alias, .. } | Self::Column { alias, .. } => {
                alias
            }
        }
    }

    pub(crate) fn is_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Expression { expr, .. } => expr.contains_aggregate(),
            Self::Column { .. } => false,
        }
    }
}

/// A calculated field whose expression may have failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CalculatedPlan {
    pub(crate) name: String,
    pub(crate) expr: Result<Expr, ExpressionError>,
}

/// Validated, parsed form of a [`QueryConfig`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueryPlan {
    pub(crate) data_source: String,
    pub(crate) dimensions: Vec<Dimension>,
    pub(crate) metrics: Vec<MetricPlan>,
    pub(crate) filter: Option<FilterNode>,
    pub(crate) joins: Vec<JoinClause>,
    pub(crate) group_by: Vec<String>,
    pub(crate) having: Option<FilterNode>,
    pub(crate) calculated: Vec<CalculatedPlan>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) distinct: bool,
}

fn config_error(message: impl Into<String>) -> ExecutionError {
    ExecutionError::new(message)
}

fn parse_filter(raw: Option<&serde_json::Value>, key: &str) -> UqmResult<Option<FilterNode>> {
    match raw {
        None => Ok(None),
        Some(raw) => FilterNode::from_json(raw)
            .map_err(|e| config_error(format!("Invalid {key}: {e}")).into()),
    }
}

impl QueryPlan {
    pub(crate) fn from_config(config: QueryConfig) -> UqmResult<Self> {
        if config.data_source.trim().is_empty() {
            return Err(config_error("Query step requires a data_source").into());
        }

        let metrics = config
            .metrics
            .iter()
            .map(|metric| -> UqmResult<MetricPlan> {
                let alias = metric.name.clone();
                if let Some(expression) = &metric.expression {
                    let expr = parse_expression(expression).map_err(|e| {
                        config_error(format!("Invalid expression for metric '{alias}': {e}"))
                    })?;
                    return Ok(MetricPlan::Expression { expr, alias });
                }
                match &metric.aggregation {
                    Some(name) => {
                        let func = AggregateFunction::from_name(name).ok_or_else(|| {
                            config_error(format!(
                                "Unknown aggregation '{name}' for metric '{alias}'"
                            ))
                        })?;
                        let field = match (&metric.field, func) {
                            (Some(field), _) if field != "*" => Some(field.clone()),
                            (_, AggregateFunction::Count) => None,
                            (_, _) => Some(alias.clone()),
                        };
                        Ok(MetricPlan::Aggregate { func, field, alias })
                    }
                    None => Ok(MetricPlan::Column {
                        field: metric.field.clone().unwrap_or_else(|| alias.clone()),
                        alias,
                    }),
                }
            })
            .collect::<UqmResult<Vec<_>>>()?;

        let filter = match (
            parse_filter(config.filters.as_ref(), "filters")?,
            parse_filter(config.where_clause.as_ref(), "where")?,
        ) {
            (Some(a), Some(b)) => Some(FilterNode::and(vec![a, b])),
            (a, b) => a.or(b),
        };

        let joins = config
            .joins
            .into_iter()
            .map(|join| -> UqmResult<JoinClause> {
                let join_type = match &join.join_type {
                    Some(text) => text.parse::<JoinType>()?,
                    None => JoinType::Inner,
                };
                let on = join
                    .on
                    .into_vec()
                    .into_iter()
                    .map(|cond| match cond {
                        JoinCondition::Text(text) => JoinOn::parse(&text),
                        JoinCondition::Pair { left, right } => Ok(JoinOn { left, right }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if on.is_empty() {
                    return Err(config_error(format!("Join with '{}' has no condition", join.table)).into());
                }
                Ok(JoinClause {
                    join_type,
                    table: join.table,
                    alias: join.alias,
                    on,
                })
            })
            .collect::<UqmResult<Vec<_>>>()?;

        let calculated = config
            .calculated_fields
            .into_iter()
            .map(|field| CalculatedPlan {
                expr: parse_expression(&field.expression),
                name: field.name,
            })
            .collect();

        let order_by = config
            .order_by
            .into_vec()
            .into_iter()
            .map(|spec| match spec {
                OrderSpec::Text(text) => OrderBy::parse(&text),
                OrderSpec::Keyed { field, direction } => OrderBy {
                    field,
                    descending: direction.is_some_and(|d| d.eq_ignore_ascii_case("desc")),
                },
            })
            .filter(|key| !key.field.is_empty())
            .collect();

        Ok(Self {
            data_source: config.data_source,
            dimensions: config.dimensions,
            metrics,
            filter,
            joins,
            group_by: config.group_by.into_vec(),
            having: parse_filter(config.having.as_ref(), "having")?,
            calculated,
            order_by,
            limit: config.limit,
            offset: config.offset,
            distinct: config.distinct,
        })
    }

    /// Whether rows are bucketed into groups.
    pub(crate) fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || self.metrics.iter().any(MetricPlan::is_aggregate)
    }

    /// Fields forming the group key: explicit GROUP BY, else the dimensions.
    pub(crate) fn group_key(&self) -> Vec<String> {
        if self.group_by.is_empty() {
            self.dimensions.iter().map(|d| d.field().to_string()).collect()
        } else {
            self.group_by.clone()
        }
    }

    pub(crate) fn orders_by_calculated(&self) -> bool {
        self.order_by
            .iter()
            .any(|key| self.calculated.iter().any(|c| c.name == key.field))
    }
}

/// Evaluates calculated fields in order, writing each into `rows` (and into
/// `eval_rows`, the rows expressions read from). Returns the warnings raised
/// under the null policy.
pub(crate) fn apply_calculated(
    plan: &QueryPlan,
    rows: &mut RowSet,
    eval_rows: &mut RowSet,
    groups: Option<&[RowSet]>,
    ctx: &StepContext,
    policy: ExpressionFailurePolicy,
) -> UqmResult<Vec<String>> {
    let mut warnings = Vec::new();

    for field in &plan.calculated {
        let values: Vec<Value> = match &field.expr {
            Err(err) => match policy {
                ExpressionFailurePolicy::Error => return Err(err.clone().into()),
                ExpressionFailurePolicy::Null => {
                    warn!(step = %ctx.step_name, field = %field.name, error = %err, "Calculated field failed to parse");
                    warnings.push(format!("Calculated field '{}' is invalid: {err}", field.name));
                    vec![Value::Null; rows.len()]
                }
            },
            Ok(expr) => {
                let results = crate::expr::evaluate_rows(expr, eval_rows, groups, Some(ctx.params.as_ref()));
                let mut failed = 0usize;
                let mut first_error = None;
                let mut values = Vec::with_capacity(results.len());
                for result in results {
                    match result {
                        Ok(value) => values.push(value),
                        Err(err) if policy == ExpressionFailurePolicy::Error => return Err(err.into()),
                        Err(err) => {
                            failed += 1;
                            first_error.get_or_insert(err);
                            values.push(Value::Null);
                        }
                    }
                }
                if let Some(err) = first_error {
                    warn!(step = %ctx.step_name, field = %field.name, failed, error = %err, "Calculated field evaluated to null");
                    warnings.push(format!(
                        "Calculated field '{}' failed on {failed} row(s): {err}",
                        field.name
                    ));
                }
                values
            }
        };

        for ((row, eval_row), value) in rows.iter_mut().zip(eval_rows.iter_mut()).zip(values) {
            eval_row.insert(field.name.clone(), value.clone());
            row.insert(field.name.clone(), value);
        }
    }

    Ok(warnings)
}

/// The query step engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStep;

#[async_trait]
impl StepEngine for QueryStep {
    fn kind(&self) -> StepKind {
        StepKind::Query
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        let config: QueryConfig = parse_config(ctx)?;
        let policy = config.expression_failure.unwrap_or(ctx.expression_failure);
        let plan = QueryPlan::from_config(config)?;

        if ctx.is_upstream(&plan.data_source) {
            debug!(step = %ctx.step_name, source = %plan.data_source, "Running query in memory");
            memory::execute(&plan, ctx, policy)
        } else {
            debug!(step = %ctx.step_name, table = %plan.data_source, "Running query through connector");
            sql_path::execute(&plan, ctx, policy).await
        }
    }
}
