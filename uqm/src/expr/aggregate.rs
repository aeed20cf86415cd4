//! Aggregate reduction and pre-substitution of aggregate sub-expressions.

use super::ast::{AggregateFunction, Expr};
use super::eval::{evaluate, EvalContext};
use crate::core::{Parameters, Row, Value};
use crate::errors::ExpressionError;
use std::collections::HashSet;

/// Reduces values with an aggregate, ignoring nulls as SQL does.
///
/// `SUM`, `AVG`, `MIN` and `MAX` of no values are Null; counts are zero.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_values(func: AggregateFunction, values: &[Value]) -> Value {
    let present = values.iter().filter(|v| !v.is_null());
    match func {
        AggregateFunction::Count => Value::from(present.count()),
        AggregateFunction::CountDistinct => {
            let distinct: HashSet<String> = present.map(Value::canonical_key).collect();
            Value::from(distinct.len())
        }
        AggregateFunction::Sum => {
            let numbers: Vec<&Value> = present.filter(|v| v.is_numeric()).collect();
            if numbers.is_empty() {
                return Value::Null;
            }
            let ints: Option<Vec<i64>> = numbers
                .iter()
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect();
            if let Some(total) =
                ints.and_then(|ints| ints.into_iter().try_fold(0i64, i64::checked_add))
            {
                return Value::Int(total);
            }
            Value::Float(numbers.iter().filter_map(|v| v.as_f64()).sum())
        }
        AggregateFunction::Avg => {
            let numbers: Vec<f64> = present.filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        AggregateFunction::Min => present
            .min_by(|a, b| a.total_cmp(b))
            .cloned()
            .unwrap_or_default(),
        AggregateFunction::Max => present
            .max_by(|a, b| a.total_cmp(b))
            .cloned()
            .unwrap_or_default(),
    }
}

/// Evaluates an aggregate over a group of rows.
///
/// Missing fields contribute Null; `arg = None` counts rows (`COUNT(*)`).
///
/// # Errors
///
/// Returns any non-field evaluation error raised by the argument.
pub fn evaluate_aggregate(
    func: AggregateFunction,
    arg: Option<&Expr>,
    rows: &[Row],
    params: Option<&Parameters>,
) -> Result<Value, ExpressionError> {
    let Some(arg) = arg else {
        return Ok(Value::from(rows.len()));
    };

    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        let mut ctx = EvalContext::new().with_row(row);
        if let Some(params) = params {
            ctx = ctx.with_params(params);
        }
        match evaluate(arg, &ctx) {
            Ok(value) => values.push(value),
            Err(ExpressionError::UnknownField { .. }) => values.push(Value::Null),
            Err(err) => return Err(err),
        }
    }
    Ok(aggregate_values(func, &values))
}

/// Replaces every aggregate node (outside windows) with its scalar result
/// over `group`.
///
/// # Errors
///
/// Returns the first error raised while computing an aggregate.
pub fn substitute_aggregates(
    expr: &Expr,
    group: &[Row],
    params: Option<&Parameters>,
) -> Result<Expr, ExpressionError> {
    if !expr.contains_aggregate() {
        return Ok(expr.clone());
    }

    let recurse = |e: &Expr| substitute_aggregates(e, group, params);
    let boxed = |e: &Expr| recurse(e).map(Box::new);

    Ok(match expr {
        Expr::Aggregate { func, arg } => {
            Expr::Literal(evaluate_aggregate(*func, arg.as_deref(), group, params)?)
        }
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: boxed(expr)?,
        },
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: boxed(left)?,
            right: boxed(right)?,
        },
        Expr::Call { func, args } => Expr::Call {
            func: *func,
            args: args.iter().map(&recurse).collect::<Result<_, _>>()?,
        },
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => Expr::Case {
            operand: operand.as_deref().map(&boxed).transpose()?,
            branches: branches
                .iter()
                .map(|(when, then)| -> Result<(Expr, Expr), ExpressionError> {
                    Ok((recurse(when)?, recurse(then)?))
                })
                .collect::<Result<_, ExpressionError>>()?,
            otherwise: otherwise.as_deref().map(&boxed).transpose()?,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: boxed(expr)?,
            list: list.iter().map(&recurse).collect::<Result<_, _>>()?,
            negated: *negated,
        },
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Expr::Between {
            expr: boxed(expr)?,
            low: boxed(low)?,
            high: boxed(high)?,
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => Expr::Like {
            expr: boxed(expr)?,
            pattern: boxed(pattern)?,
            negated: *negated,
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: boxed(expr)?,
            negated: *negated,
        },
        Expr::Literal(_) | Expr::Field(_) | Expr::Param(_) | Expr::Window { .. } => expr.clone(),
    })
}
