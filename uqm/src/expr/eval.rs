//! Tree-walking interpreter for parsed expressions.

use super::ast::{BinaryOp, Expr, UnaryOp};
use crate::core::{lookup_field, Parameters, Row, Value};
use crate::errors::ExpressionError;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Everything an expression may read while evaluating.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext<'a> {
    row: Option<&'a Row>,
    params: Option<&'a Parameters>,
    windows: Option<&'a HashMap<usize, Value>>,
}

impl<'a> EvalContext<'a> {
    /// Creates an empty context with no row, parameters or window values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the current row.
    #[must_use]
    pub fn with_row(mut self, row: &'a Row) -> Self {
        self.row = Some(row);
        self
    }

    /// Sets the parameter values.
    #[must_use]
    pub fn with_params(mut self, params: &'a Parameters) -> Self {
        self.params = Some(params);
        self
    }

    /// Sets precomputed window values for the current row, keyed by slot.
    #[must_use]
    pub fn with_windows(mut self, windows: &'a HashMap<usize, Value>) -> Self {
        self.windows = Some(windows);
        self
    }

    /// Returns the parameters, if any.
    #[must_use]
    pub fn params(&self) -> Option<&'a Parameters> {
        self.params
    }

    fn field(&self, name: &str) -> Option<&'a Value> {
        self.row.and_then(|row| lookup_field(row, name))
    }
}

/// Evaluates an expression against a context.
///
/// # Errors
///
/// Returns an error for unknown fields, type mismatches, division by zero,
/// bad function arguments and aggregates that were not substituted.
pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(name) => ctx
            .field(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownField { name: name.clone() }),
        Expr::Param(name) => Ok(ctx
            .params
            .and_then(|params| params.get(name))
            .cloned()
            .unwrap_or_default()),
        Expr::Unary { op, expr } => {
            let value = evaluate(expr, ctx)?;
            unary(*op, &value)
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => {
                if !evaluate(left, ctx)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(evaluate(right, ctx)?.is_truthy()))
            }
            BinaryOp::Or => {
                if evaluate(left, ctx)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(evaluate(right, ctx)?.is_truthy()))
            }
            _ => {
                let l = evaluate(left, ctx)?;
                let r = evaluate(right, ctx)?;
                binary(*op, &l, &r)
            }
        },
        Expr::Call { func, args } => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            func.call(&values)
        }
        Expr::Aggregate { func, .. } => Err(ExpressionError::Unsupported(format!(
            "aggregate {} outside a grouped context",
            func.sql_name()
        ))),
        Expr::Window { slot, .. } => ctx
            .windows
            .and_then(|windows| windows.get(slot))
            .cloned()
            .ok_or_else(|| {
                ExpressionError::Unsupported("window function outside a row set".to_string())
            }),
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => {
            let subject = operand.as_ref().map(|e| evaluate(e, ctx)).transpose()?;
            for (when, then) in branches {
                let candidate = evaluate(when, ctx)?;
                let matched = match &subject {
                    Some(subject) => !subject.is_null() && subject.loose_eq(&candidate),
                    None => candidate.is_truthy(),
                };
                if matched {
                    return evaluate(then, ctx);
                }
            }
            otherwise
                .as_ref()
                .map_or(Ok(Value::Null), |e| evaluate(e, ctx))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let value = evaluate(expr, ctx)?;
            if value.is_null() {
                return Ok(Value::Null);
            }
            let mut found = false;
            for item in list {
                match evaluate(item, ctx)? {
                    Value::Array(items) => found |= items.iter().any(|v| v.loose_eq(&value)),
                    other => found |= other.loose_eq(&value),
                }
                if found {
                    break;
                }
            }
            Ok(Value::Bool(found != *negated))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = evaluate(expr, ctx)?;
            let low = evaluate(low, ctx)?;
            let high = evaluate(high, ctx)?;
            if value.is_null() || low.is_null() || high.is_null() {
                return Ok(Value::Null);
            }
            let above = ordered("BETWEEN", &value, &low)? != Ordering::Less;
            let below = ordered("BETWEEN", &value, &high)? != Ordering::Greater;
            Ok(Value::Bool((above && below) != *negated))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let value = evaluate(expr, ctx)?;
            let pattern = evaluate(pattern, ctx)?;
            match (&value, &pattern) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (_, Value::String(p)) => {
                    Ok(Value::Bool(like_match(&value.to_display_string(), p) != *negated))
                }
                _ => Err(ExpressionError::type_mismatch(
                    "LIKE",
                    value.type_name(),
                    pattern.type_name(),
                )),
            }
        }
        Expr::IsNull { expr, negated } => {
            let value = match evaluate(expr, ctx) {
                Ok(value) => value,
                Err(ExpressionError::UnknownField { .. }) => Value::Null,
                Err(err) => return Err(err),
            };
            Ok(Value::Bool(value.is_null() != *negated))
        }
    }
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value, ExpressionError> {
    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.is_truthy())),
        (UnaryOp::Neg, Value::Null) => Ok(Value::Null),
        (UnaryOp::Neg, Value::Int(i)) => Ok(i
            .checked_neg()
            .map_or_else(|| Value::Float(-value.as_f64().unwrap_or_default()), Value::Int)),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, v) => Err(ExpressionError::type_mismatch("-", v.type_name(), "")),
    }
}

fn ordered(op: &str, left: &Value, right: &Value) -> Result<Ordering, ExpressionError> {
    left.compare(right)
        .ok_or_else(|| ExpressionError::type_mismatch(op, left.type_name(), right.type_name()))
}

/// Applies a non-short-circuit binary operator to two values.
///
/// # Errors
///
/// Returns a type mismatch or division-by-zero error.
pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(right))),
        BinaryOp::NotEq => Ok(Value::Bool(!left.loose_eq(right))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let ordering = ordered(&op.to_string(), left, right)?;
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, left, right)
        }
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    if let (BinaryOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
        return Ok(Value::String(format!("{a}{b}")));
    }

    let mismatch = || ExpressionError::type_mismatch(op.to_string(), left.type_name(), right.type_name());

    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let checked = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Mod => {
                if *b == 0 {
                    return Err(ExpressionError::DivisionByZero);
                }
                a.checked_rem(*b)
            }
            _ => None,
        };
        if let Some(result) = checked {
            return Ok(Value::Int(result));
        }
    }

    let a = left.as_f64().ok_or_else(mismatch)?;
    let b = right.as_f64().ok_or_else(mismatch)?;
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Mod if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => a / b,
        _ => a % b,
    };
    Ok(Value::Float(result))
}

/// SQL LIKE matching: `%` matches any run of characters, `_` exactly one.
#[must_use]
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('%') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(c) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}
