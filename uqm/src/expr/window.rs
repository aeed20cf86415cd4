//! Window function evaluation over a whole row set.

use super::aggregate::{aggregate_values, evaluate_aggregate};
use super::ast::{Expr, WindowFunction, WindowSpec};
use super::eval::{evaluate, EvalContext};
use crate::core::{Parameters, Row, Value};
use crate::errors::ExpressionError;
use indexmap::IndexMap;
use std::cmp::Ordering;

fn lenient(expr: &Expr, row: &Row, params: Option<&Parameters>) -> Result<Value, ExpressionError> {
    let mut ctx = EvalContext::new().with_row(row);
    if let Some(params) = params {
        ctx = ctx.with_params(params);
    }
    match evaluate(expr, &ctx) {
        Err(ExpressionError::UnknownField { .. }) => Ok(Value::Null),
        other => other,
    }
}

/// Orders two sort keys, nulls last ascending and first descending.
#[must_use]
pub fn compare_sort_keys(left: &[Value], right: &[Value], descending: &[bool]) -> Ordering {
    for ((a, b), desc) in left.iter().zip(right).zip(descending) {
        let ordering = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => a.total_cmp(b),
        };
        let ordering = if *desc { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Computes a window function for every row, returning values in row order.
///
/// Rows are partitioned by the PARTITION BY keys (first-seen order) and
/// stably sorted by the ORDER BY keys. Ranking functions yield 1-based
/// positions; aggregates cover the whole partition, or run up to and
/// including the current row's peers when ordered.
///
/// # Errors
///
/// Returns an error if a key or aggregate argument fails to evaluate.
pub fn compute_window(
    spec: &WindowSpec,
    rows: &[Row],
    params: Option<&Parameters>,
) -> Result<Vec<Value>, ExpressionError> {
    let mut partitions: IndexMap<String, Vec<usize>> = IndexMap::new();
    let mut sort_keys: Vec<Vec<Value>> = Vec::with_capacity(rows.len());

    for (index, row) in rows.iter().enumerate() {
        let key = spec
            .partition_by
            .iter()
            .map(|e| lenient(e, row, params).map(|v| v.canonical_key()))
            .collect::<Result<Vec<_>, _>>()?
            .join("\u{1f}");
        partitions.entry(key).or_default().push(index);

        sort_keys.push(
            spec.order_by
                .iter()
                .map(|k| lenient(&k.expr, row, params))
                .collect::<Result<_, _>>()?,
        );
    }

    let descending: Vec<bool> = spec.order_by.iter().map(|k| k.descending).collect();
    let mut results = vec![Value::Null; rows.len()];

    for members in partitions.values_mut() {
        members.sort_by(|a, b| compare_sort_keys(&sort_keys[*a], &sort_keys[*b], &descending));
        let peers = |a: usize, b: usize| {
            compare_sort_keys(&sort_keys[a], &sort_keys[b], &descending) == Ordering::Equal
        };

        match &spec.func {
            WindowFunction::RowNumber => {
                for (position, index) in members.iter().enumerate() {
                    results[*index] = Value::from(position + 1);
                }
            }
            WindowFunction::Rank | WindowFunction::DenseRank => {
                let dense = matches!(spec.func, WindowFunction::DenseRank);
                let mut rank = 0usize;
                for (position, index) in members.iter().enumerate() {
                    let tied = position > 0 && peers(members[position - 1], *index);
                    if !tied {
                        rank = if dense { rank + 1 } else { position + 1 };
                    }
                    results[*index] = Value::from(rank);
                }
            }
            WindowFunction::Aggregate { func, arg } => {
                let partition_rows: Vec<Row> =
                    members.iter().map(|index| rows[*index].clone()).collect();

                if spec.order_by.is_empty() {
                    let value =
                        evaluate_aggregate(*func, arg.as_deref(), &partition_rows, params)?;
                    for index in members.iter() {
                        results[*index] = value.clone();
                    }
                    continue;
                }

                let values: Vec<Value> = match arg {
                    Some(arg) => partition_rows
                        .iter()
                        .map(|row| lenient(arg, row, params))
                        .collect::<Result<_, _>>()?,
                    None => vec![Value::Bool(true); partition_rows.len()],
                };

                let mut start = 0;
                while start < members.len() {
                    let mut end = start + 1;
                    while end < members.len() && peers(members[start], members[end]) {
                        end += 1;
                    }
                    let value = aggregate_values(*func, &values[..end]);
                    for index in &members[start..end] {
                        results[*index] = value.clone();
                    }
                    start = end;
                }
            }
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;
    use crate::expr::parse_expression;

    fn spec_of(text: &str) -> WindowSpec {
        match parse_expression(text).unwrap() {
            Expr::Window { spec, .. } => spec,
            other => panic!("not a window: {other:?}"),
        }
    }

    fn rows(values: &[(&str, i64)]) -> Vec<Row> {
        values
            .iter()
            .map(|(d, v)| row_from_pairs([("d", Value::from(*d)), ("v", Value::Int(*v))]))
            .collect()
    }

    #[test]
    fn test_row_number_partition_desc() {
        let data = rows(&[("A", 1), ("A", 5)]);
        let spec = spec_of("ROW_NUMBER() OVER (PARTITION BY d ORDER BY v DESC)");
        let values = compute_window(&spec, &data, None).unwrap();
        assert_eq!(values, vec![Value::Int(2), Value::Int(1)]);
    }

    #[test]
    fn test_rank_and_dense_rank_ties() {
        let data = rows(&[("A", 10), ("A", 20), ("A", 10), ("A", 5)]);

        let rank = compute_window(&spec_of("RANK() OVER (ORDER BY v)"), &data, None).unwrap();
        assert_eq!(
            rank,
            vec![Value::Int(2), Value::Int(4), Value::Int(2), Value::Int(1)]
        );

        let dense =
            compute_window(&spec_of("DENSE_RANK() OVER (ORDER BY v)"), &data, None).unwrap();
        assert_eq!(
            dense,
            vec![Value::Int(2), Value::Int(3), Value::Int(2), Value::Int(1)]
        );
    }

    #[test]
    fn test_nulls_sort_last_ascending() {
        let data = vec![
            row_from_pairs([("v", Value::Null)]),
            row_from_pairs([("v", Value::Int(3))]),
        ];
        let asc = compute_window(&spec_of("ROW_NUMBER() OVER (ORDER BY v)"), &data, None).unwrap();
        assert_eq!(asc, vec![Value::Int(2), Value::Int(1)]);

        let desc =
            compute_window(&spec_of("ROW_NUMBER() OVER (ORDER BY v DESC)"), &data, None).unwrap();
        assert_eq!(desc, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_partition_total_and_running_sum() {
        let data = rows(&[("A", 1), ("B", 10), ("A", 2), ("A", 2)]);

        let total =
            compute_window(&spec_of("SUM(v) OVER (PARTITION BY d)"), &data, None).unwrap();
        assert_eq!(
            total,
            vec![Value::Int(5), Value::Int(10), Value::Int(5), Value::Int(5)]
        );

        let running = compute_window(
            &spec_of("SUM(v) OVER (PARTITION BY d ORDER BY v)"),
            &data,
            None,
        )
        .unwrap();
        assert_eq!(
            running,
            vec![Value::Int(1), Value::Int(10), Value::Int(5), Value::Int(5)]
        );
    }
}
