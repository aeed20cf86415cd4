//! Closed-grammar expression language.
//!
//! Expressions appear in filters, calculated fields, HAVING clauses,
//! custom assertions and conditional gates. The grammar is fixed: literals,
//! field and `$param` references, arithmetic, comparison and boolean
//! operators, `CASE`, `IN`, `BETWEEN`, `LIKE`, `IS NULL`, aggregates, window
//! functions and an allow-listed set of scalar functions. Nothing in it can
//! reach a general-purpose evaluator.
//!
//! ```rust
//! use uqm::core::{row_from_pairs, Value};
//! use uqm::expr::{evaluate, parse_expression, EvalContext};
//!
//! let expr = parse_expression("price * qty > 100").unwrap();
//! let row = row_from_pairs([("price", 30), ("qty", 4)]);
//! let value = evaluate(&expr, &EvalContext::new().with_row(&row)).unwrap();
//! assert_eq!(value, Value::Bool(true));
//! ```

mod aggregate;
mod ast;
mod eval;
mod functions;
mod lexer;
mod parser;
mod window;

pub use aggregate::{aggregate_values, evaluate_aggregate, substitute_aggregates};
pub use ast::{
    AggregateFunction, BinaryOp, Expr, OrderKey, UnaryOp, WindowFunction, WindowSpec,
};
pub use eval::{binary, evaluate, like_match, EvalContext};
pub use functions::ScalarFunction;
pub use lexer::{Lexer, Spanned, Token};
pub use parser::{parse_expression, Parser};
pub use window::{compare_sort_keys, compute_window};

use crate::core::{Parameters, Row, RowSet, Value};
use crate::errors::ExpressionError;
use std::collections::HashMap;

/// Evaluates a parsed expression for every row of a row set.
///
/// Window functions are computed over `rows` first; aggregates are
/// substituted per row using `groups[i]` (or the whole row set when no
/// grouping applies).
///
/// Returns one result per row so the caller can apply its own failure
/// policy.
pub fn evaluate_rows(
    expr: &Expr,
    rows: &[Row],
    groups: Option<&[RowSet]>,
    params: Option<&Parameters>,
) -> Vec<Result<Value, ExpressionError>> {
    let mut window_values: HashMap<usize, Vec<Value>> = HashMap::new();
    for (slot, spec) in expr.windows() {
        match compute_window(spec, rows, params) {
            Ok(values) => {
                window_values.insert(slot, values);
            }
            Err(err) => return rows.iter().map(|_| Err(err.clone())).collect(),
        }
    }

    let shared = if groups.is_none() && expr.contains_aggregate() {
        Some(substitute_aggregates(expr, rows, params))
    } else {
        None
    };

    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            let resolved = match (&shared, groups) {
                (Some(shared), _) => shared.clone()?,
                (None, Some(groups)) if expr.contains_aggregate() => {
                    let group: &[Row] = groups.get(index).map_or(&[][..], Vec::as_slice);
                    substitute_aggregates(expr, group, params)?
                }
                _ => expr.clone(),
            };

            let slots: HashMap<usize, Value> = window_values
                .iter()
                .map(|(slot, values)| (*slot, values[index].clone()))
                .collect();

            let mut ctx = EvalContext::new().with_row(row).with_windows(&slots);
            if let Some(params) = params {
                ctx = ctx.with_params(params);
            }
            evaluate(&resolved, &ctx)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;

    #[test]
    fn test_evaluate_rows_with_window_and_share() {
        let rows = vec![
            row_from_pairs([("v", 10)]),
            row_from_pairs([("v", 30)]),
        ];
        let expr =
            parse_expression("ROW_NUMBER() OVER (ORDER BY v DESC) * 100 + v * 100 / SUM(v)")
                .unwrap();
        let values: Vec<Value> = evaluate_rows(&expr, &rows, None, None)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(values, vec![Value::Float(225.0), Value::Float(175.0)]);
    }

    #[test]
    fn test_evaluate_rows_reports_per_row_errors() {
        let rows = vec![row_from_pairs([("v", 0)]), row_from_pairs([("v", 2)])];
        let expr = parse_expression("10 / v").unwrap();
        let results = evaluate_rows(&expr, &rows, None, None);
        assert!(results[0].is_err());
        assert_eq!(results[1], Ok(Value::Float(5.0)));
    }
}
