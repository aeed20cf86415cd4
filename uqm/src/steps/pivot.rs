//! Pivot step: long rows to a wide table.

use super::common::{field_value, parse_config, require_field, OneOrMany};
use super::{StepContext, StepEngine, StepOutput};
use crate::core::{Row, RowSet, StepKind, Value};
use crate::errors::{ExecutionError, UqmResult};
use crate::expr::{aggregate_values, compare_sort_keys, AggregateFunction};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::debug;

/// Aggregation applied to the values of one pivot cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PivotAgg {
    /// Sum.
    Sum,
    /// Arithmetic mean.
    #[serde(alias = "avg", alias = "average")]
    Mean,
    /// Non-null count.
    Count,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Sample standard deviation.
    Std,
    /// Sample variance.
    Var,
    /// First non-null value.
    First,
    /// Last non-null value.
    Last,
    /// Median.
    Median,
}

impl fmt::Display for PivotAgg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::Std => "std",
            Self::Var => "var",
            Self::First => "first",
            Self::Last => "last",
            Self::Median => "median",
        };
        f.write_str(name)
    }
}

#[allow(clippy::cast_precision_loss)]
fn sample_variance(values: &[Value]) -> Option<f64> {
    let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
    if numbers.len() < 2 {
        return None;
    }
    let n = numbers.len() as f64;
    let mean = numbers.iter().sum::<f64>() / n;
    Some(numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0))
}

impl PivotAgg {
    /// Reduces the values of one cell. Nulls are ignored.
    #[must_use]
    pub fn apply(self, values: &[Value]) -> Value {
        match self {
            Self::Sum => aggregate_values(AggregateFunction::Sum, values),
            Self::Mean => aggregate_values(AggregateFunction::Avg, values),
            Self::Count => aggregate_values(AggregateFunction::Count, values),
            Self::Min => aggregate_values(AggregateFunction::Min, values),
            Self::Max => aggregate_values(AggregateFunction::Max, values),
            Self::Var => sample_variance(values).map_or(Value::Null, Value::Float),
            Self::Std => sample_variance(values).map_or(Value::Null, |v| Value::Float(v.sqrt())),
            Self::First => values.iter().find(|v| !v.is_null()).cloned().unwrap_or_default(),
            Self::Last => values.iter().rev().find(|v| !v.is_null()).cloned().unwrap_or_default(),
            Self::Median => {
                let mut numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
                if numbers.is_empty() {
                    return Value::Null;
                }
                numbers.sort_by(f64::total_cmp);
                let mid = numbers.len() / 2;
                if numbers.len() % 2 == 0 {
                    Value::Float((numbers[mid - 1] + numbers[mid]) / 2.0)
                } else {
                    Value::Float(numbers[mid])
                }
            }
        }
    }
}

fn default_aggfunc() -> OneOrMany<PivotAgg> {
    OneOrMany::One(PivotAgg::Sum)
}

/// Pivot step configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PivotConfig {
    /// Upstream step.
    pub source: String,
    /// Columns identifying an output row.
    pub index: OneOrMany<String>,
    /// Columns whose values become output columns.
    pub columns: OneOrMany<String>,
    /// Columns aggregated into the cells.
    pub values: OneOrMany<String>,
    /// Aggregation(s).
    #[serde(default = "default_aggfunc")]
    pub aggfunc: OneOrMany<PivotAgg>,
    /// Prepended to generated column names.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Appended to generated column names.
    #[serde(default)]
    pub suffix: Option<String>,
    /// Value for index/column combinations with no rows.
    #[serde(default)]
    pub fill_value: Option<Value>,
}

fn tuple_key(values: &[Value]) -> String {
    values
        .iter()
        .map(Value::canonical_key)
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

fn sorted_tuples(mut tuples: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let ascending = vec![false; tuples.first().map_or(0, Vec::len)];
    tuples.sort_by(|a, b| compare_sort_keys(a, b, &ascending));
    tuples
}

/// Pivots `rows`.
pub(crate) fn pivot_rows(rows: &[Row], config: &PivotConfig) -> UqmResult<RowSet> {
    let index = config.index.clone().into_vec();
    let columns = config.columns.clone().into_vec();
    let values = config.values.clone().into_vec();
    let aggs = config.aggfunc.clone().into_vec();
    if columns.is_empty() || values.is_empty() || aggs.is_empty() {
        return Err(ExecutionError::new("Pivot needs columns, values and aggfunc").into());
    }
    for field in index.iter().chain(&columns).chain(&values) {
        require_field(rows, field, "pivot")?;
    }

    let read = |row: &Row, fields: &[String]| -> Vec<Value> {
        fields.iter().map(|f| field_value(row, f)).collect()
    };

    let mut index_tuples: IndexMap<String, Vec<Value>> = IndexMap::new();
    let mut column_tuples: IndexMap<String, Vec<Value>> = IndexMap::new();
    // (index key, column key) -> rows in the cell.
    let mut cells: IndexMap<(String, String), Vec<&Row>> = IndexMap::new();
    for row in rows {
        let index_values = read(row, &index);
        let column_values = read(row, &columns);
        let index_key = tuple_key(&index_values);
        let column_key = tuple_key(&column_values);
        index_tuples.entry(index_key.clone()).or_insert(index_values);
        column_tuples.entry(column_key.clone()).or_insert(column_values);
        cells.entry((index_key, column_key)).or_default().push(row);
    }

    let index_tuples = sorted_tuples(index_tuples.into_values().collect());
    let column_tuples = sorted_tuples(column_tuples.into_values().collect());

    let mut generated: Vec<(String, PivotAgg, &str, String)> = Vec::new();
    for agg in &aggs {
        for value in &values {
            for tuple in &column_tuples {
                let mut parts = Vec::new();
                if aggs.len() > 1 {
                    parts.push(agg.to_string());
                }
                if values.len() > 1 {
                    parts.push(value.clone());
                }
                parts.extend(tuple.iter().map(Value::to_display_string));
                let name = format!(
                    "{}{}{}",
                    config.prefix.as_deref().unwrap_or_default(),
                    parts.join("_"),
                    config.suffix.as_deref().unwrap_or_default()
                );
                generated.push((name, *agg, value.as_str(), tuple_key(tuple)));
            }
        }
    }

    let fill = config.fill_value.clone().unwrap_or_default();
    let output = index_tuples
        .iter()
        .map(|index_values| {
            let index_key = tuple_key(index_values);
            let mut out: Row = index.iter().cloned().zip(index_values.iter().cloned()).collect();
            for (name, agg, value_field, column_key) in &generated {
                let cell = match cells.get(&(index_key.clone(), column_key.clone())) {
                    Some(cell_rows) => {
                        let cell_values: Vec<Value> =
                            cell_rows.iter().map(|r| field_value(r, value_field)).collect();
                        agg.apply(&cell_values)
                    }
                    None => fill.clone(),
                };
                out.insert(name.clone(), cell);
            }
            out
        })
        .collect();

    Ok(output)
}

/// The pivot step engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct PivotStep;

#[async_trait]
impl StepEngine for PivotStep {
    fn kind(&self) -> StepKind {
        StepKind::Pivot
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        let config: PivotConfig = parse_config(ctx)?;
        let source = ctx.input(&config.source)?;
        let rows = pivot_rows(&source, &config)?;
        let generated = rows.first().map_or(0, |r| r.len().saturating_sub(config.index.clone().into_vec().len()));
        debug!(step = %ctx.step_name, rows = rows.len(), columns = generated, "Pivot complete");
        Ok(StepOutput::new(rows).with_details(json!({"generated_columns": generated})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;
    use crate::testing::rows;
    use pretty_assertions::assert_eq;

    fn sales() -> RowSet {
        rows(json!([
            {"region": "EU", "quarter": "Q2", "amount": 5},
            {"region": "US", "quarter": "Q1", "amount": 7},
            {"region": "EU", "quarter": "Q1", "amount": 10},
            {"region": "EU", "quarter": "Q1", "amount": 20}
        ]))
    }

    async fn run(config: serde_json::Value) -> RowSet {
        let ctx = StepContext::new("p", StepKind::Pivot, config).with_input("sales", sales());
        PivotStep.execute(&ctx).await.unwrap().rows
    }

    #[tokio::test]
    async fn test_pivot_sorted_with_fill() {
        let out = run(json!({
            "source": "sales", "index": "region", "columns": "quarter", "values": "amount",
            "fill_value": 0
        }))
        .await;

        assert_eq!(
            out,
            vec![
                row_from_pairs([("region", Value::from("EU")), ("Q1", Value::Int(30)), ("Q2", Value::Int(5))]),
                row_from_pairs([("region", Value::from("US")), ("Q1", Value::Int(7)), ("Q2", Value::Int(0))]),
            ]
        );
    }

    #[tokio::test]
    async fn test_multiple_aggregations_flatten_names() {
        let out = run(json!({
            "source": "sales", "index": ["region"], "columns": ["quarter"], "values": "amount",
            "aggfunc": ["sum", "avg"], "prefix": "q_"
        }))
        .await;

        let names: Vec<&str> = out[0].keys().map(String::as_str).collect();
        assert_eq!(names, vec!["region", "q_sum_Q1", "q_sum_Q2", "q_mean_Q1", "q_mean_Q2"]);
        assert_eq!(out[0]["q_mean_Q1"], Value::Float(15.0));
        assert_eq!(out[1]["q_sum_Q2"], Value::Null);
    }

    #[test]
    fn test_aggregations() {
        let values = vec![Value::Int(2), Value::Null, Value::Int(4), Value::Int(9)];
        assert_eq!(PivotAgg::Median.apply(&values), Value::Float(4.0));
        assert_eq!(PivotAgg::First.apply(&values), Value::Int(2));
        assert_eq!(PivotAgg::Last.apply(&values), Value::Int(9));
        assert_eq!(PivotAgg::Count.apply(&values), Value::Int(3));
        assert_eq!(PivotAgg::Var.apply(&[Value::Int(1), Value::Int(3)]), Value::Float(2.0));
        assert_eq!(PivotAgg::Std.apply(&[Value::Int(1)]), Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_column_is_rejected() {
        let ctx = StepContext::new(
            "p",
            StepKind::Pivot,
            json!({"source": "sales", "index": "region", "columns": "month", "values": "amount"}),
        )
        .with_input("sales", sales());
        assert!(PivotStep.execute(&ctx).await.is_err());
    }
}
