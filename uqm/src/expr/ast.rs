//! Closed expression AST.
//!
//! The node set is fixed: there is no node that can reach a general-purpose
//! evaluator, so every expression can only read row fields, parameters and
//! the allow-listed functions.

use super::functions::ScalarFunction;
use crate::core::Value;
use std::fmt;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Logical negation.
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `=` / `==`
    Eq,
    /// `!=` / `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `AND` / `&&`
    And,
    /// `OR` / `||`
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
        };
        f.write_str(symbol)
    }
}

/// Aggregate functions usable in metrics, calculated fields and windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    /// Sum of numeric values.
    Sum,
    /// Count of non-null values (or rows for `COUNT(*)`).
    Count,
    /// Count of distinct non-null values.
    CountDistinct,
    /// Arithmetic mean of numeric values.
    Avg,
    /// Minimum non-null value.
    Min,
    /// Maximum non-null value.
    Max,
}

impl AggregateFunction {
    /// Resolves an aggregate by name (`sum`, `avg`/`mean`, `count_distinct`, ...).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "count_distinct" | "nunique" => Some(Self::CountDistinct),
            "avg" | "mean" | "average" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    /// Returns the SQL function name.
    #[must_use]
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Count | Self::CountDistinct => "COUNT",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// Ranking and aggregate window functions.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowFunction {
    /// Sequential 1-based position within the partition.
    RowNumber,
    /// Rank with gaps after ties.
    Rank,
    /// Rank without gaps.
    DenseRank,
    /// Aggregate over the partition (running when ordered).
    Aggregate {
        /// The aggregate.
        func: AggregateFunction,
        /// The argument; `None` for `COUNT(*)`.
        arg: Option<Box<Expr>>,
    },
}

/// One ORDER BY key inside an OVER clause.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    /// The sort expression.
    pub expr: Expr,
    /// Whether the key sorts descending.
    pub descending: bool,
}

/// A window function application.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSpec {
    /// The function.
    pub func: WindowFunction,
    /// PARTITION BY expressions.
    pub partition_by: Vec<Expr>,
    /// ORDER BY keys.
    pub order_by: Vec<OrderKey>,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// A row field reference.
    Field(String),
    /// A parameter reference (`$name`).
    Param(String),
    /// A unary operation.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        expr: Box<Expr>,
    },
    /// A binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// An allow-listed scalar function call.
    Call {
        /// The function.
        func: ScalarFunction,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// An aggregate, evaluated only after substitution with its group result.
    Aggregate {
        /// The aggregate.
        func: AggregateFunction,
        /// The argument; `None` for `COUNT(*)`.
        arg: Option<Box<Expr>>,
    },
    /// A window function whose per-row result is looked up by slot.
    Window {
        /// Slot number, unique within one parsed expression.
        slot: usize,
        /// The window definition.
        spec: WindowSpec,
    },
    /// `CASE [operand] WHEN .. THEN .. [ELSE ..] END`.
    Case {
        /// Optional operand for the simple CASE form.
        operand: Option<Box<Expr>>,
        /// `(when, then)` branches.
        branches: Vec<(Expr, Expr)>,
        /// ELSE branch.
        otherwise: Option<Box<Expr>>,
    },
    /// `expr [NOT] IN (list)`.
    InList {
        /// Tested expression.
        expr: Box<Expr>,
        /// Candidate values.
        list: Vec<Expr>,
        /// NOT IN.
        negated: bool,
    },
    /// `expr [NOT] BETWEEN low AND high`.
    Between {
        /// Tested expression.
        expr: Box<Expr>,
        /// Lower bound (inclusive).
        low: Box<Expr>,
        /// Upper bound (inclusive).
        high: Box<Expr>,
        /// NOT BETWEEN.
        negated: bool,
    },
    /// `expr [NOT] LIKE pattern`.
    Like {
        /// Tested expression.
        expr: Box<Expr>,
        /// SQL LIKE pattern.
        pattern: Box<Expr>,
        /// NOT LIKE.
        negated: bool,
    },
    /// `expr IS [NOT] NULL`.
    IsNull {
        /// Tested expression.
        expr: Box<Expr>,
        /// IS NOT NULL.
        negated: bool,
    },
}

impl Expr {
    /// Visits every node in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Self::Literal(_) | Self::Field(_) | Self::Param(_) => {}
            Self::Unary { expr, .. } | Self::IsNull { expr, .. } => expr.walk(visit),
            Self::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Self::Call { args, .. } => args.iter().for_each(|arg| arg.walk(visit)),
            Self::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.walk(visit);
                }
            }
            Self::Window { spec, .. } => {
                if let WindowFunction::Aggregate { arg: Some(arg), .. } = &spec.func {
                    arg.walk(visit);
                }
                spec.partition_by.iter().for_each(|e| e.walk(visit));
                spec.order_by.iter().for_each(|k| k.expr.walk(visit));
            }
            Self::Case {
                operand,
                branches,
                otherwise,
            } => {
                if let Some(operand) = operand {
                    operand.walk(visit);
                }
                for (when, then) in branches {
                    when.walk(visit);
                    then.walk(visit);
                }
                if let Some(otherwise) = otherwise {
                    otherwise.walk(visit);
                }
            }
            Self::InList { expr, list, .. } => {
                expr.walk(visit);
                list.iter().for_each(|e| e.walk(visit));
            }
            Self::Between {
                expr, low, high, ..
            } => {
                expr.walk(visit);
                low.walk(visit);
                high.walk(visit);
            }
            Self::Like { expr, pattern, .. } => {
                expr.walk(visit);
                pattern.walk(visit);
            }
        }
    }

    /// Returns true if any node outside a window is an aggregate.
    #[must_use]
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Window { .. } | Self::Literal(_) | Self::Field(_) | Self::Param(_) => false,
            Self::Unary { expr, .. } | Self::IsNull { expr, .. } => expr.contains_aggregate(),
            Self::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Self::Call { args, .. } => args.iter().any(Self::contains_aggregate),
            Self::Case {
                operand,
                branches,
                otherwise,
            } => {
                operand.as_ref().is_some_and(|e| e.contains_aggregate())
                    || branches
                        .iter()
                        .any(|(w, t)| w.contains_aggregate() || t.contains_aggregate())
                    || otherwise.as_ref().is_some_and(|e| e.contains_aggregate())
            }
            Self::InList { expr, list, .. } => {
                expr.contains_aggregate() || list.iter().any(Self::contains_aggregate)
            }
            Self::Between {
                expr, low, high, ..
            } => expr.contains_aggregate() || low.contains_aggregate() || high.contains_aggregate(),
            Self::Like { expr, pattern, .. } => {
                expr.contains_aggregate() || pattern.contains_aggregate()
            }
        }
    }

    /// Returns the window applications in the expression with their slots.
    #[must_use]
    pub fn windows(&self) -> Vec<(usize, &WindowSpec)> {
        let mut found = Vec::new();
        self.walk(&mut |node| {
            if let Self::Window { slot, spec } = node {
                found.push((*slot, spec));
            }
        });
        found
    }

    /// Returns the names of all referenced parameters.
    #[must_use]
    pub fn params(&self) -> Vec<&str> {
        let mut found = Vec::new();
        self.walk(&mut |node| {
            if let Self::Param(name) = node {
                found.push(name.as_str());
            }
        });
        found
    }

    /// Returns the names of all referenced fields.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        let mut found = Vec::new();
        self.walk(&mut |node| {
            if let Self::Field(name) = node {
                found.push(name.as_str());
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_aggregate_ignores_windows() {
        let agg = Expr::Aggregate {
            func: AggregateFunction::Sum,
            arg: Some(Box::new(Expr::Field("v".into()))),
        };
        assert!(agg.contains_aggregate());

        let window = Expr::Window {
            slot: 0,
            spec: WindowSpec {
                func: WindowFunction::Aggregate {
                    func: AggregateFunction::Sum,
                    arg: Some(Box::new(Expr::Field("v".into()))),
                },
                partition_by: vec![],
                order_by: vec![],
            },
        };
        assert!(!window.contains_aggregate());
        assert_eq!(window.windows().len(), 1);
    }

    #[test]
    fn test_aggregate_from_name() {
        assert_eq!(AggregateFunction::from_name("MEAN"), Some(AggregateFunction::Avg));
        assert_eq!(AggregateFunction::from_name("median"), None);
        assert_eq!(AggregateFunction::CountDistinct.sql_name(), "COUNT");
    }
}
