//! In-memory evaluation of a query plan over upstream row sets.

use super::{apply_calculated, MetricPlan, QueryPlan};
use crate::config::ExpressionFailurePolicy;
use crate::core::{column_names, row_identity, Row, RowSet, Value};
use crate::errors::{ExecutionError, UqmResult};
use crate::expr::{evaluate, evaluate_aggregate, substitute_aggregates, EvalContext, Expr};
use crate::sql::{JoinClause, JoinType};
use crate::steps::common::{field_value, paginate, require_field, sort_rows};
use crate::steps::{StepContext, StepOutput};
use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::debug;

/// Join key of a row; `None` when any part is null or missing.
fn join_key(row: &Row, fields: &[&str]) -> Option<String> {
    let mut parts = Vec::with_capacity(fields.len());
    for field in fields {
        let value = field_value(row, field);
        if value.is_null() {
            return None;
        }
        parts.push(value.canonical_key());
    }
    Some(parts.join("\u{1f}"))
}

fn null_row(columns: &[String]) -> Row {
    columns.iter().map(|c| (c.clone(), Value::Null)).collect()
}

/// Merges a right row into a left row; colliding names become
/// `alias.column`.
fn merge(left: &Row, right: &Row, qualifier: &str) -> Row {
    let mut merged = left.clone();
    for (key, value) in right {
        if left.contains_key(key) {
            merged.insert(format!("{qualifier}.{key}"), value.clone());
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

pub(crate) fn join_rows(left: &[Row], right: &[Row], join: &JoinClause) -> UqmResult<RowSet> {
    let qualifier = join.alias.as_deref().unwrap_or(&join.table);
    let left_fields: Vec<&str> = join.on.iter().map(|on| on.left.as_str()).collect();
    let right_fields: Vec<&str> = join.on.iter().map(|on| on.right.as_str()).collect();

    for field in &left_fields {
        require_field(left, field, "join")?;
    }
    for field in &right_fields {
        require_field(right, field, "join")?;
    }

    let mut index: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (i, row) in right.iter().enumerate() {
        if let Some(key) = join_key(row, &right_fields) {
            index.entry(key).or_default().push(i);
        }
    }

    let left_columns = column_names(left);
    let right_columns = column_names(right);
    let right_nulls = null_row(&right_columns);
    let left_nulls = null_row(&left_columns);

    let mut matched_right = HashSet::new();
    let mut joined = Vec::new();

    for row in left {
        let matches = join_key(row, &left_fields).and_then(|key| index.get(&key));
        match matches {
            Some(indices) => {
                for &i in indices {
                    matched_right.insert(i);
                    joined.push(merge(row, &right[i], qualifier));
                }
            }
            None if matches!(join.join_type, JoinType::Left | JoinType::Full) => {
                joined.push(merge(row, &right_nulls, qualifier));
            }
            None => {}
        }
    }

    if matches!(join.join_type, JoinType::Right | JoinType::Full) {
        for (i, row) in right.iter().enumerate() {
            if !matched_right.contains(&i) {
                joined.push(merge(&left_nulls, row, qualifier));
            }
        }
    }

    Ok(joined)
}

fn eval_scalar(expr: &Expr, row: &Row, ctx: &StepContext) -> Value {
    let eval_ctx = EvalContext::new().with_row(row).with_params(&ctx.params);
    evaluate(expr, &eval_ctx).unwrap_or_default()
}

fn metric_value(metric: &MetricPlan, group: &[Row], ctx: &StepContext) -> UqmResult<Value> {
    let params = Some(ctx.params.as_ref());
    Ok(match metric {
        MetricPlan::Aggregate { func, field, .. } => {
            let arg = field.as_ref().map(|f| Expr::Field(f.clone()));
            evaluate_aggregate(*func, arg.as_ref(), group, params)?
        }
        MetricPlan::Expression { expr, .. } => {
            let resolved = substitute_aggregates(expr, group, params)?;
            group
                .first()
                .map_or_else(
                    || {
                        let empty = Row::new();
                        eval_scalar(&resolved, &empty, ctx)
                    },
                    |row| eval_scalar(&resolved, row, ctx),
                )
        }
        MetricPlan::Column { field, .. } => group
            .first()
            .map(|row| field_value(row, field))
            .unwrap_or_default(),
    })
}

/// Buckets rows by the group key and reduces each bucket.
///
/// Returns the output rows and, per output row, the rows of its group.
fn group_rows(plan: &QueryPlan, rows: RowSet, ctx: &StepContext) -> UqmResult<(RowSet, Vec<RowSet>)> {
    let key_fields = plan.group_key();
    for field in &key_fields {
        require_field(&rows, field, "group_by")?;
    }

    let mut buckets: IndexMap<String, RowSet> = IndexMap::new();
    for row in rows {
        let key = key_fields
            .iter()
            .map(|f| field_value(&row, f).canonical_key())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        buckets.entry(key).or_default().push(row);
    }

    if buckets.is_empty() && key_fields.is_empty() {
        buckets.insert(String::new(), Vec::new());
    }

    let mut output = Vec::with_capacity(buckets.len());
    let mut groups = Vec::with_capacity(buckets.len());
    for (_, group) in buckets {
        let first = group.first();
        let mut out = Row::new();

        if plan.dimensions.is_empty() {
            for field in &key_fields {
                out.insert(field.clone(), first.map(|r| field_value(r, field)).unwrap_or_default());
            }
        } else {
            for dim in &plan.dimensions {
                out.insert(
                    dim.output_name().to_string(),
                    first.map(|r| field_value(r, dim.field())).unwrap_or_default(),
                );
            }
        }

        for metric in &plan.metrics {
            out.insert(metric.alias().to_string(), metric_value(metric, &group, ctx)?);
        }

        output.push(out);
        groups.push(group);
    }

    Ok((output, groups))
}

/// Projects each row onto dimensions and non-aggregate metrics, or keeps it
/// whole when neither is given.
fn project_rows(plan: &QueryPlan, rows: &[Row], ctx: &StepContext) -> RowSet {
    if plan.dimensions.is_empty() && plan.metrics.is_empty() {
        return rows.to_vec();
    }
    rows.iter()
        .map(|row| {
            let mut out = Row::new();
            for dim in &plan.dimensions {
                out.insert(dim.output_name().to_string(), field_value(row, dim.field()));
            }
            for metric in &plan.metrics {
                let value = match metric {
                    MetricPlan::Column { field, .. } => field_value(row, field),
                    MetricPlan::Expression { expr, .. } => eval_scalar(expr, row, ctx),
                    MetricPlan::Aggregate { .. } => Value::Null,
                };
                out.insert(metric.alias().to_string(), value);
            }
            out
        })
        .collect()
}

/// Runs the plan against upstream rows.
pub(crate) fn execute(
    plan: &QueryPlan,
    ctx: &StepContext,
    policy: ExpressionFailurePolicy,
) -> UqmResult<StepOutput> {
    let source = ctx.input(&plan.data_source)?;
    let mut rows: RowSet = source.as_ref().clone();

    for join in &plan.joins {
        if !ctx.is_upstream(&join.table) {
            return Err(ExecutionError::new(format!(
                "Cannot join table '{}' in memory; only upstream steps can be joined to '{}'",
                join.table, plan.data_source
            ))
            .into());
        }
        let right = ctx.input(&join.table)?;
        rows = join_rows(&rows, &right, join)?;
    }

    if let Some(filter) = &plan.filter {
        rows.retain(|row| filter.evaluate(row));
    }

    let (mut output, mut eval_rows, groups) = if plan.is_grouped() {
        let (output, groups) = group_rows(plan, rows, ctx)?;
        (output.clone(), output, Some(groups))
    } else {
        let projected = project_rows(plan, &rows, ctx);
        let eval_rows = rows
            .into_iter()
            .zip(&projected)
            .map(|(mut source_row, projected_row)| {
                for (key, value) in projected_row {
                    source_row.insert(key.clone(), value.clone());
                }
                source_row
            })
            .collect();
        (projected, eval_rows, None)
    };

    let warnings = apply_calculated(plan, &mut output, &mut eval_rows, groups.as_deref(), ctx, policy)?;

    if let Some(having) = &plan.having {
        output.retain(|row| having.evaluate(row));
    }

    if plan.distinct {
        let mut seen = HashSet::new();
        output.retain(|row| seen.insert(row_identity(row)));
    }

    let keys: Vec<(String, bool)> = plan
        .order_by
        .iter()
        .map(|key| (key.field.clone(), key.descending))
        .collect();
    sort_rows(&mut output, &keys);

    let mut output = paginate(output, plan.limit, plan.offset);

    let mut result = StepOutput::default();
    if let Some(page) = ctx.pagination {
        let total = output.len() as u64;
        output = paginate(output, Some(page.limit), Some(page.offset));
        result.total_count = Some(total);
    }

    debug!(step = %ctx.step_name, rows = output.len(), "In-memory query complete");
    result.rows = output;
    result.warnings = warnings;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{row_from_pairs, StepKind};
    use crate::steps::query::QueryStep;
    use crate::steps::{Pagination, StepEngine};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sales() -> RowSet {
        vec![
            row_from_pairs([("d", Value::from("A")), ("v", Value::Int(10))]),
            row_from_pairs([("d", Value::from("A")), ("v", Value::Int(20))]),
            row_from_pairs([("d", Value::from("B")), ("v", Value::Int(5))]),
        ]
    }

    async fn run(config: serde_json::Value, inputs: &[(&str, RowSet)]) -> UqmResult<StepOutput> {
        let mut ctx = StepContext::new("q", StepKind::Query, config);
        for (name, rows) in inputs {
            ctx = ctx.with_input(*name, rows.clone());
        }
        QueryStep.execute(&ctx).await
    }

    #[tokio::test]
    async fn test_group_by_sum() {
        let out = run(
            json!({
                "data_source": "src",
                "group_by": ["d"],
                "metrics": [{"name": "total", "field": "v", "aggregation": "sum"}]
            }),
            &[("src", sales())],
        )
        .await
        .unwrap();

        assert_eq!(
            out.rows,
            vec![
                row_from_pairs([("d", Value::from("A")), ("total", Value::Int(30))]),
                row_from_pairs([("d", Value::from("B")), ("total", Value::Int(5))]),
            ]
        );
    }

    #[tokio::test]
    async fn test_all_aggregate_collapses_to_one_row() {
        let out = run(
            json!({
                "data_source": "src",
                "metrics": [
                    {"name": "n", "aggregation": "count"},
                    {"name": "avg_v", "field": "v", "aggregation": "avg"}
                ]
            }),
            &[("src", sales())],
        )
        .await
        .unwrap();

        assert_eq!(
            out.rows,
            vec![row_from_pairs([("n", Value::Int(3)), ("avg_v", Value::Float(35.0 / 3.0))])]
        );
    }

    #[tokio::test]
    async fn test_filter_calculated_having_order_limit() {
        let out = run(
            json!({
                "data_source": "src",
                "dimensions": ["d"],
                "metrics": [{"name": "total", "field": "v", "aggregation": "sum"}],
                "filters": [{"field": "v", "operator": ">=", "value": 5}],
                "calculated_fields": [
                    {"name": "share", "expression": "total * 100 / SUM(v)"},
                    {"name": "big", "expression": "CASE WHEN total > 10 THEN 'yes' ELSE 'no' END"}
                ],
                "having": [{"field": "total", "operator": ">", "value": 1}],
                "order_by": "total DESC",
                "limit": 1
            }),
            &[("src", sales())],
        )
        .await
        .unwrap();

        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0]["d"], Value::from("A"));
        assert_eq!(out.rows[0]["share"], Value::Float(100.0));
        assert_eq!(out.rows[0]["big"], Value::from("yes"));
    }

    #[tokio::test]
    async fn test_row_number_window() {
        let rows = vec![
            row_from_pairs([("d", Value::from("A")), ("v", Value::Int(1))]),
            row_from_pairs([("d", Value::from("A")), ("v", Value::Int(5))]),
        ];
        let out = run(
            json!({
                "data_source": "src",
                "calculated_fields": [{
                    "name": "rn",
                    "expression": "ROW_NUMBER() OVER (PARTITION BY d ORDER BY v DESC)"
                }]
            }),
            &[("src", rows)],
        )
        .await
        .unwrap();

        assert_eq!(out.rows[0]["rn"], Value::Int(2));
        assert_eq!(out.rows[1]["rn"], Value::Int(1));
    }

    #[tokio::test]
    async fn test_expression_failure_policy() {
        let config = |policy: &str| {
            json!({
                "data_source": "src",
                "calculated_fields": [{"name": "bad", "expression": "v / 0"}],
                "expression_failure": policy
            })
        };

        let lenient = run(config("null"), &[("src", sales())]).await.unwrap();
        assert!(lenient.rows.iter().all(|r| r["bad"].is_null()));
        assert_eq!(lenient.warnings.len(), 1);

        assert!(run(config("error"), &[("src", sales())]).await.is_err());
    }

    #[tokio::test]
    async fn test_join_upstream_steps() {
        let orders = vec![
            row_from_pairs([("id", Value::Int(1)), ("cust", Value::Int(10))]),
            row_from_pairs([("id", Value::Int(2)), ("cust", Value::Int(99))]),
        ];
        let customers = vec![row_from_pairs([("id", Value::Int(10)), ("name", Value::from("Ada"))])];

        let out = run(
            json!({
                "data_source": "orders",
                "joins": [{"type": "left", "table": "customers", "alias": "c", "on": "cust = c.id"}]
            }),
            &[("orders", orders), ("customers", customers)],
        )
        .await
        .unwrap();

        assert_eq!(
            out.rows[0],
            row_from_pairs([
                ("id", Value::Int(1)),
                ("cust", Value::Int(10)),
                ("c.id", Value::Int(10)),
                ("name", Value::from("Ada")),
            ])
        );
        assert_eq!(out.rows[1]["name"], Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_group_field_is_named() {
        let err = run(
            json!({"data_source": "src", "group_by": "nope",
                   "metrics": [{"name": "n", "aggregation": "count"}]}),
            &[("src", sales())],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("'nope'"), "{err}");
    }

    #[tokio::test]
    async fn test_distinct_and_pagination() {
        let mut ctx = StepContext::new(
            "q",
            StepKind::Query,
            json!({"data_source": "src", "dimensions": ["d"], "distinct": true}),
        )
        .with_input("src", sales())
        .with_pagination(Some(Pagination::page(2, 1)));
        ctx.step_name = "paged".to_string();

        let out = QueryStep.execute(&ctx).await.unwrap();
        assert_eq!(out.total_count, Some(2));
        assert_eq!(out.rows, vec![row_from_pairs([("d", Value::from("B"))])]);
    }
}
