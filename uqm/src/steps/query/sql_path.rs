//! Compilation of a query plan to SQL and execution through the connector.

use super::{apply_calculated, MetricPlan, QueryConfig, QueryPlan};
use crate::config::ExpressionFailurePolicy;
use crate::errors::{ExecutionError, UqmResult};
use crate::filter::FilterNode;
use crate::sql::{build_count, build_select, JoinClause, JoinOn, SelectField, SelectSpec, SqlDialect};
use crate::steps::common::{field_value, paginate, sort_rows};
use crate::steps::{Pagination, StepContext, StepOutput};
use serde_json::json;
use tracing::debug;

fn qualify(name: &str, table: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{table}.{name}")
    }
}

fn qualify_filter(node: &FilterNode, table: &str) -> FilterNode {
    match node {
        FilterNode::Logical { logic, conditions } => FilterNode::Logical {
            logic: *logic,
            conditions: conditions.iter().map(|c| qualify_filter(c, table)).collect(),
        },
        FilterNode::Leaf(condition) => {
            let mut condition = condition.clone();
            condition.field = qualify(&condition.field, table);
            FilterNode::Leaf(condition)
        }
    }
}

/// Column select entry; qualified names keep their bare output name.
fn column(field: &str, output: &str, table: Option<&str>) -> SelectField {
    let name = table.map_or_else(|| field.to_string(), |t| qualify(field, t));
    let alias = (name != output).then(|| output.to_string());
    SelectField::Column { name, alias }
}

/// Translates the plan into a SELECT without pagination.
///
/// With joins present, unqualified columns are qualified with the base
/// table so they stay unambiguous.
pub(crate) fn select_spec(plan: &QueryPlan) -> SelectSpec {
    let base = (!plan.joins.is_empty()).then_some(plan.data_source.as_str());

    let mut fields: Vec<SelectField> = plan
        .dimensions
        .iter()
        .map(|dim| column(dim.field(), dim.output_name(), base))
        .collect();
    fields.extend(plan.metrics.iter().map(|metric| match metric {
        MetricPlan::Aggregate { func, field, alias } => SelectField::Aggregate {
            func: *func,
            field: field.as_ref().map(|f| base.map_or_else(|| f.clone(), |t| qualify(f, t))),
            alias: alias.clone(),
        },
        MetricPlan::Expression { expr, alias } => SelectField::Expression {
            expr: expr.clone(),
            alias: alias.clone(),
        },
        MetricPlan::Column { field, alias } => column(field, alias, base),
    }));

    let joins = plan
        .joins
        .iter()
        .map(|join| {
            let joined = join.alias.as_deref().unwrap_or(&join.table);
            JoinClause {
                on: join
                    .on
                    .iter()
                    .map(|on| JoinOn {
                        left: qualify(&on.left, &plan.data_source),
                        right: qualify(&on.right, joined),
                    })
                    .collect(),
                ..join.clone()
            }
        })
        .collect();

    let group_by = if plan.is_grouped() {
        plan.group_key()
            .iter()
            .map(|f| base.map_or_else(|| f.clone(), |t| qualify(f, t)))
            .collect()
    } else {
        Vec::new()
    };

    let order_by = if plan.orders_by_calculated() {
        Vec::new()
    } else {
        plan.order_by.clone()
    };

    SelectSpec {
        fields,
        from: plan.data_source.clone(),
        from_alias: None,
        joins,
        filter: match base {
            Some(table) => plan.filter.as_ref().map(|f| qualify_filter(f, table)),
            None => plan.filter.clone(),
        },
        group_by,
        having: plan.having.clone(),
        order_by,
        limit: None,
        offset: None,
        distinct: plan.distinct,
    }
}

/// Whether the query collapses to a single aggregate row.
fn single_row(plan: &QueryPlan) -> bool {
    plan.is_grouped() && plan.group_key().is_empty()
}

/// Narrows the configured LIMIT/OFFSET window to one page of it.
fn page_window(plan: &QueryPlan, page: Pagination) -> (u64, u64) {
    let offset = plan.offset.unwrap_or(0).saturating_add(page.offset);
    let limit = plan
        .limit
        .map_or(page.limit, |limit| page.limit.min(limit.saturating_sub(page.offset)));
    (limit, offset)
}

/// Total rows the configured window holds, given the unpaginated count.
fn windowed_total(plan: &QueryPlan, count: u64) -> u64 {
    let available = count.saturating_sub(plan.offset.unwrap_or(0));
    plan.limit.map_or(available, |limit| available.min(limit))
}

/// Renders the SELECT a query step would send, or `None` when it reads an
/// upstream step and so runs in memory.
///
/// # Errors
///
/// Returns an error for an invalid config or an unsafe identifier.
pub fn preview_sql(
    config: &serde_json::Value,
    upstream: &[String],
    dialect: SqlDialect,
) -> UqmResult<Option<String>> {
    let config: QueryConfig = serde_json::from_value(config.clone())
        .map_err(|e| ExecutionError::new(format!("Invalid query config: {e}")))?;
    let plan = QueryPlan::from_config(config)?;
    if upstream.iter().any(|u| *u == plan.data_source) {
        return Ok(None);
    }

    let mut spec = select_spec(&plan);
    if !plan.orders_by_calculated() {
        spec.limit = plan.limit;
        spec.offset = plan.offset;
    }
    build_select(&spec, dialect).map(Some)
}

/// Runs the plan against the connector.
pub(crate) async fn execute(
    plan: &QueryPlan,
    ctx: &StepContext,
    policy: ExpressionFailurePolicy,
) -> UqmResult<StepOutput> {
    if let Some(join) = plan.joins.iter().find(|j| ctx.is_upstream(&j.table)) {
        return Err(ExecutionError::new(format!(
            "Cannot join upstream step '{}' to table '{}'; query the step instead",
            join.table, plan.data_source
        ))
        .into());
    }
    let connector = ctx.connector()?;

    let mut spec = select_spec(plan);
    let in_memory_order = plan.orders_by_calculated();
    let mut details = serde_json::Map::new();
    let mut total_count = None;

    if !in_memory_order {
        spec.limit = plan.limit;
        spec.offset = plan.offset;

        if let Some(page) = ctx.pagination {
            let count = if single_row(plan) {
                1
            } else {
                let count_sql = build_count(&spec, ctx.dialect)?;
                let counted = connector.execute_query(&count_sql).await?;
                details.insert("count_sql".to_string(), json!(count_sql));
                counted
                    .first()
                    .and_then(|row| field_value(row, "total_count").as_i64())
                    .and_then(|n| u64::try_from(n).ok())
                    .unwrap_or(0)
            };
            total_count = Some(windowed_total(plan, count));

            let (limit, offset) = page_window(plan, page);
            spec.limit = Some(limit);
            spec.offset = Some(offset);
        }
    }

    let sql = build_select(&spec, ctx.dialect)?;
    debug!(step = %ctx.step_name, sql = %sql, "Executing query");
    let mut rows = connector.execute_query(&sql).await?;
    details.insert("sql".to_string(), json!(sql));

    let mut warnings = Vec::new();
    if !plan.calculated.is_empty() {
        let mut eval_rows = rows.clone();
        warnings = apply_calculated(plan, &mut rows, &mut eval_rows, None, ctx, policy)?;
    }

    if in_memory_order {
        let keys: Vec<(String, bool)> = plan
            .order_by
            .iter()
            .map(|key| (key.field.clone(), key.descending))
            .collect();
        sort_rows(&mut rows, &keys);
        rows = paginate(rows, plan.limit, plan.offset);
        if let Some(page) = ctx.pagination {
            total_count = Some(rows.len() as u64);
            rows = paginate(rows, Some(page.limit), Some(page.offset));
        }
    }

    Ok(StepOutput {
        rows,
        total_count,
        warnings,
        details: serde_json::Value::Object(details),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::MockConnector;
    use crate::core::{row_from_pairs, StepKind, Value};
    use crate::steps::query::QueryStep;
    use crate::steps::StepEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn mock() -> MockConnector {
        let mut mock = MockConnector::new();
        mock.expect_dialect().return_const(SqlDialect::Postgres);
        mock
    }

    #[tokio::test]
    async fn test_paginated_grouped_query() {
        let mut mock = mock();
        mock.expect_execute_query()
            .withf(|sql| sql.starts_with("SELECT COUNT(*)"))
            .times(1)
            .returning(|_| Ok(vec![row_from_pairs([("total_count", Value::Int(45))])]));
        mock.expect_execute_query()
            .withf(|sql| {
                sql == "SELECT region, SUM(amount) AS total\nFROM sales\nWHERE status = 'paid'\n\
                        GROUP BY region\nORDER BY total DESC\nLIMIT 10 OFFSET 10"
            })
            .times(1)
            .returning(|_| Ok(vec![row_from_pairs([("region", Value::from("EU")), ("total", Value::Int(7))])]));

        let ctx = StepContext::new(
            "by_region",
            StepKind::Query,
            json!({
                "data_source": "sales",
                "dimensions": ["region"],
                "metrics": [{"name": "total", "field": "amount", "aggregation": "sum"}],
                "filters": [{"field": "status", "operator": "=", "value": "paid"}],
                "order_by": "total DESC",
                "limit": 50
            }),
        )
        .with_connector(Arc::new(mock))
        .with_pagination(Some(Pagination::page(2, 10)));

        let out = QueryStep.execute(&ctx).await.unwrap();
        assert_eq!(out.total_count, Some(45));
        assert_eq!(out.rows.len(), 1);
        assert!(out.details["count_sql"].as_str().unwrap().contains("grouped_count"));
    }

    #[tokio::test]
    async fn test_calculated_ordering_runs_in_memory() {
        let mut mock = mock();
        mock.expect_execute_query()
            .withf(|sql| sql == "SELECT *\nFROM sales")
            .times(1)
            .returning(|_| {
                Ok(vec![
                    row_from_pairs([("amount", Value::Int(1))]),
                    row_from_pairs([("amount", Value::Int(3))]),
                ])
            });

        let ctx = StepContext::new(
            "q",
            StepKind::Query,
            json!({
                "data_source": "sales",
                "calculated_fields": [{"name": "double", "expression": "amount * 2"}],
                "order_by": "double DESC",
                "limit": 1
            }),
        )
        .with_connector(Arc::new(mock));

        let out = QueryStep.execute(&ctx).await.unwrap();
        assert_eq!(
            out.rows,
            vec![row_from_pairs([("amount", Value::Int(3)), ("double", Value::Int(6))])]
        );
    }

    #[test]
    fn test_preview_qualifies_joined_columns() {
        let config = json!({
            "data_source": "orders",
            "dimensions": ["region"],
            "metrics": [{"name": "n", "aggregation": "count"}],
            "joins": [{"type": "left", "table": "customers", "on": "customer_id = customers.id"}]
        });

        assert_eq!(
            preview_sql(&config, &[], SqlDialect::Generic).unwrap().unwrap(),
            "SELECT orders.region AS region, COUNT(*) AS n\nFROM orders\n\
             LEFT JOIN customers ON orders.customer_id = customers.id\nGROUP BY orders.region"
        );
        assert_eq!(
            preview_sql(&config, &["orders".to_string()], SqlDialect::Generic).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_missing_connector_and_upstream_join() {
        let ctx = StepContext::new("q", StepKind::Query, json!({"data_source": "sales"}));
        let err = QueryStep.execute(&ctx).await.unwrap_err();
        assert_eq!(err.error_type(), "ConnectionError");

        let ctx = StepContext::new(
            "q",
            StepKind::Query,
            json!({"data_source": "sales", "joins": [{"table": "prev", "on": "id = prev.id"}]}),
        )
        .with_input("prev", Vec::new());
        assert!(QueryStep.execute(&ctx).await.is_err());
    }

    #[test]
    fn test_page_window_stays_inside_limit() {
        let plan = QueryPlan::from_config(QueryConfig {
            data_source: "t".into(),
            limit: Some(25),
            offset: Some(5),
            ..QueryConfig::default()
        })
        .unwrap();

        assert_eq!(page_window(&plan, Pagination::page(3, 10)), (5, 25));
        assert_eq!(windowed_total(&plan, 100), 25);
        assert_eq!(windowed_total(&plan, 12), 7);
    }
}
