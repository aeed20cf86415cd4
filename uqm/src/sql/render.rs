//! Rendering of identifiers, literals, filters and expressions to SQL text.

use super::dialect::SqlDialect;
use crate::core::Value;
use crate::errors::{ExecutionError, UqmResult};
use crate::expr::{AggregateFunction, BinaryOp, Expr, ScalarFunction, UnaryOp, WindowFunction};
use crate::filter::{FilterCondition, FilterNode, FilterOperator, LogicalOp};

fn is_identifier_part(part: &str) -> bool {
    let mut chars = part.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns true for `name` or `table.name` made of `[A-Za-z_][A-Za-z0-9_]*`
/// parts.
#[must_use]
pub fn is_valid_identifier(name: &str) -> bool {
    match name.split_once('.') {
        Some((table, column)) => is_identifier_part(table) && is_identifier_part(column),
        None => is_identifier_part(name),
    }
}

/// Validates an identifier, returning it unchanged.
///
/// # Errors
///
/// Returns an execution error naming the rejected identifier.
pub fn identifier(name: &str) -> UqmResult<&str> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(ExecutionError::new(format!("Invalid SQL identifier '{name}'")).into())
    }
}

/// Escapes a string as a single-quoted SQL literal.
#[must_use]
pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Renders a scalar value as a SQL literal.
///
/// Arrays render as a parenthesised list; objects as a quoted JSON string.
#[must_use]
pub fn literal(value: &Value, dialect: SqlDialect) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => dialect.boolean(*b).to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::String(s) => quote_string(s),
        Value::Array(items) => format!(
            "({})",
            items
                .iter()
                .map(|item| literal(item, dialect))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::Object(_) => quote_string(&value.canonical_key()),
    }
}

impl FilterCondition {
    /// Renders the predicate as SQL, resolving the field through `column`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identifiers or malformed operands.
    pub fn to_sql_with(
        &self,
        dialect: SqlDialect,
        column: &dyn Fn(&str) -> UqmResult<String>,
    ) -> UqmResult<String> {
        let field = column(&self.field)?;
        let op = self.operator;

        let rendered = match op {
            FilterOperator::IsNull | FilterOperator::IsNotNull => format!("{field} {op}"),
            FilterOperator::In | FilterOperator::NotIn => {
                let items = match &self.value {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                match (items.is_empty(), op) {
                    (true, FilterOperator::In) => "1 = 0".to_string(),
                    (true, _) => "1 = 1".to_string(),
                    (false, _) => format!("{field} {op} {}", literal(&Value::Array(items), dialect)),
                }
            }
            FilterOperator::Between => match self.value.as_array() {
                Some([low, high]) => format!(
                    "{field} BETWEEN {} AND {}",
                    literal(low, dialect),
                    literal(high, dialect)
                ),
                _ => {
                    return Err(ExecutionError::new(format!(
                        "BETWEEN on '{}' requires a [low, high] pair",
                        self.field
                    ))
                    .into())
                }
            },
            _ => format!("{field} {op} {}", literal(&self.value, dialect)),
        };
        Ok(rendered)
    }
}

impl FilterNode {
    /// Renders the tree as a SQL boolean expression.
    ///
    /// `AND`/`OR` nodes render parenthesised; a node with a single child
    /// collapses to the child.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identifiers or malformed operands.
    pub fn to_sql(&self, dialect: SqlDialect) -> UqmResult<String> {
        self.to_sql_with(dialect, &|name| identifier(name).map(str::to_string))
    }

    /// Like [`FilterNode::to_sql`], resolving each field through `column`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identifiers or malformed operands.
    pub fn to_sql_with(
        &self,
        dialect: SqlDialect,
        column: &dyn Fn(&str) -> UqmResult<String>,
    ) -> UqmResult<String> {
        match self {
            Self::Leaf(condition) => condition.to_sql_with(dialect, column),
            Self::Logical { conditions, .. } if conditions.len() == 1 => {
                conditions[0].to_sql_with(dialect, column)
            }
            Self::Logical { logic, conditions } if conditions.is_empty() => Ok(match logic {
                LogicalOp::And => "1 = 1".to_string(),
                LogicalOp::Or => "1 = 0".to_string(),
            }),
            Self::Logical { logic, conditions } => {
                let parts = conditions
                    .iter()
                    .map(|c| c.to_sql_with(dialect, column))
                    .collect::<UqmResult<Vec<_>>>()?;
                Ok(format!("({})", parts.join(&format!(" {logic} "))))
            }
        }
    }
}

fn function_name(func: ScalarFunction, dialect: SqlDialect) -> &'static str {
    match (func, dialect) {
        (ScalarFunction::Ceil, SqlDialect::SqlServer) => "CEILING",
        (ScalarFunction::Length, SqlDialect::SqlServer) => "LEN",
        (ScalarFunction::Substr, SqlDialect::SqlServer) => "SUBSTRING",
        (func, _) => func.name(),
    }
}

fn binary_sql(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::NotEq => "<>",
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Eq => "=",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
    }
}

fn aggregate_sql(
    func: AggregateFunction,
    arg: Option<&Expr>,
    dialect: SqlDialect,
    column: &dyn Fn(&str) -> UqmResult<String>,
) -> UqmResult<String> {
    let inner = match arg {
        None => "*".to_string(),
        Some(arg) => render_expr_with(arg, dialect, column)?,
    };
    Ok(match func {
        AggregateFunction::CountDistinct => format!("COUNT(DISTINCT {inner})"),
        other => format!("{}({inner})", other.sql_name()),
    })
}

/// Renders an expression AST as SQL.
///
/// # Errors
///
/// Returns an error for invalid identifiers or unresolved parameters.
pub fn render_expr(expr: &Expr, dialect: SqlDialect) -> UqmResult<String> {
    render_expr_with(expr, dialect, &|name| identifier(name).map(str::to_string))
}

/// Like [`render_expr`], resolving each field through `column`.
///
/// # Errors
///
/// Returns an error for invalid identifiers or unresolved parameters.
pub fn render_expr_with(
    expr: &Expr,
    dialect: SqlDialect,
    column: &dyn Fn(&str) -> UqmResult<String>,
) -> UqmResult<String> {
    let render = |e: &Expr| render_expr_with(e, dialect, column);
    let list = |items: &[Expr]| -> UqmResult<String> {
        Ok(items.iter().map(&render).collect::<UqmResult<Vec<_>>>()?.join(", "))
    };

    Ok(match expr {
        Expr::Literal(value) => literal(value, dialect),
        Expr::Field(name) => column(name)?,
        Expr::Param(name) => {
            return Err(ExecutionError::new(format!("Unresolved parameter '${name}'")).into())
        }
        Expr::Unary {
            op: UnaryOp::Neg,
            expr,
        } => format!("-({})", render(expr)?),
        Expr::Unary {
            op: UnaryOp::Not,
            expr,
        } => format!("NOT ({})", render(expr)?),
        Expr::Binary { op, left, right } => {
            format!("({} {} {})", render(left)?, binary_sql(*op), render(right)?)
        }
        Expr::Call { func, args } => format!("{}({})", function_name(*func, dialect), list(args)?),
        Expr::Aggregate { func, arg } => aggregate_sql(*func, arg.as_deref(), dialect, column)?,
        Expr::Window { spec, .. } => {
            let head = match &spec.func {
                WindowFunction::RowNumber => "ROW_NUMBER()".to_string(),
                WindowFunction::Rank => "RANK()".to_string(),
                WindowFunction::DenseRank => "DENSE_RANK()".to_string(),
                WindowFunction::Aggregate { func, arg } => {
                    aggregate_sql(*func, arg.as_deref(), dialect, column)?
                }
            };
            let mut over = Vec::new();
            if !spec.partition_by.is_empty() {
                over.push(format!("PARTITION BY {}", list(&spec.partition_by)?));
            }
            if !spec.order_by.is_empty() {
                let keys = spec
                    .order_by
                    .iter()
                    .map(|k| {
                        render(&k.expr)
                            .map(|e| format!("{e} {}", if k.descending { "DESC" } else { "ASC" }))
                    })
                    .collect::<UqmResult<Vec<_>>>()?;
                over.push(format!("ORDER BY {}", keys.join(", ")));
            }
            format!("{head} OVER ({})", over.join(" "))
        }
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => {
            let mut sql = String::from("CASE");
            if let Some(operand) = operand {
                sql.push(' ');
                sql.push_str(&render(operand)?);
            }
            for (when, then) in branches {
                sql.push_str(&format!(" WHEN {} THEN {}", render(when)?, render(then)?));
            }
            if let Some(otherwise) = otherwise {
                sql.push_str(&format!(" ELSE {}", render(otherwise)?));
            }
            sql.push_str(" END");
            sql
        }
        Expr::InList {
            expr,
            list: items,
            negated,
        } => {
            let not = if *negated { "NOT " } else { "" };
            format!("{} {not}IN ({})", render(expr)?, list(items)?)
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let not = if *negated { "NOT " } else { "" };
            format!(
                "{} {not}BETWEEN {} AND {}",
                render(expr)?,
                render(low)?,
                render(high)?
            )
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let not = if *negated { "NOT " } else { "" };
            format!("{} {not}LIKE {}", render(expr)?, render(pattern)?)
        }
        Expr::IsNull { expr, negated } => {
            let not = if *negated { "NOT " } else { "" };
            format!("{} IS {not}NULL", render(expr)?)
        }
    })
}
