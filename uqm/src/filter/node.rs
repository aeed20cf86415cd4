//! The filter tree shared by the SQL and in-memory paths.

use super::gate::ConditionalGate;
use crate::core::{lookup_field, Row, Value};
use crate::errors::ParseError;
use crate::expr::like_match;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Boolean connective of a logical node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOp {
    /// All children must hold.
    #[default]
    #[serde(alias = "and")]
    And,
    /// Any child must hold.
    #[serde(alias = "or")]
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterOperator {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `IN`
    In,
    /// `NOT IN`
    NotIn,
    /// `BETWEEN`
    Between,
    /// `LIKE`
    Like,
    /// `NOT LIKE`
    NotLike,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
}

impl FilterOperator {
    /// Returns the SQL spelling.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Between => "BETWEEN",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    /// Returns true for operators that take no value.
    #[must_use]
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsNull | Self::IsNotNull)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for FilterOperator {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', ' '], "");
        let op = match normalized.as_str() {
            "=" | "==" | "eq" => Self::Eq,
            "!=" | "<>" | "ne" | "neq" => Self::NotEq,
            ">" | "gt" => Self::Gt,
            ">=" | "gte" | "ge" => Self::GtEq,
            "<" | "lt" => Self::Lt,
            "<=" | "lte" | "le" => Self::LtEq,
            "in" => Self::In,
            "notin" => Self::NotIn,
            "between" => Self::Between,
            "like" => Self::Like,
            "notlike" => Self::NotLike,
            "isnull" => Self::IsNull,
            "isnotnull" | "notnull" => Self::IsNotNull,
            _ => {
                return Err(ParseError::new(format!("Unknown filter operator '{s}'"))
                    .with_value(serde_json::json!(s)))
            }
        };
        Ok(op)
    }
}

impl TryFrom<String> for FilterOperator {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterOperator> for String {
    fn from(op: FilterOperator) -> Self {
        op.as_sql().to_string()
    }
}

/// A single `field operator value` predicate, optionally gated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Field name, optionally qualified (`orders.amount`).
    pub field: String,
    /// Operator.
    pub operator: FilterOperator,
    /// Operand; an array for `IN`/`NOT IN`/`BETWEEN`.
    #[serde(default)]
    pub value: Value,
    /// Gate deciding whether the condition participates in a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<ConditionalGate>,
}

impl FilterCondition {
    /// Creates an ungated condition.
    #[must_use]
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            conditional: None,
        }
    }

    /// Attaches a gate.
    #[must_use]
    pub fn with_conditional(mut self, gate: ConditionalGate) -> Self {
        self.conditional = Some(gate);
        self
    }

    /// Evaluates the predicate against a row.
    ///
    /// Missing fields read as Null; any comparison against Null is false,
    /// as in SQL.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        let actual = lookup_field(row, &self.field).unwrap_or(&Value::Null);

        match self.operator {
            FilterOperator::IsNull => return actual.is_null(),
            FilterOperator::IsNotNull => return !actual.is_null(),
            _ if actual.is_null() => return false,
            _ => {}
        }

        match self.operator {
            FilterOperator::Eq => coerced_cmp(actual, &self.value) == Some(Ordering::Equal),
            FilterOperator::NotEq => {
                !self.value.is_null() && coerced_cmp(actual, &self.value) != Some(Ordering::Equal)
            }
            FilterOperator::Gt => coerced_cmp(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::GtEq => matches!(
                coerced_cmp(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lt => coerced_cmp(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::LtEq => matches!(
                coerced_cmp(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::In => self.candidates().any(|c| is_equal(actual, c)),
            FilterOperator::NotIn => !self.candidates().any(|c| is_equal(actual, c)),
            FilterOperator::Between => match self.value.as_array() {
                Some([low, high]) => {
                    matches!(
                        coerced_cmp(actual, low),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(
                        coerced_cmp(actual, high),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                }
                _ => false,
            },
            FilterOperator::Like | FilterOperator::NotLike => {
                let Some(pattern) = self.value.as_str() else {
                    return false;
                };
                like_match(&actual.to_display_string(), pattern)
                    == (self.operator == FilterOperator::Like)
            }
            FilterOperator::IsNull | FilterOperator::IsNotNull => false,
        }
    }

    fn candidates(&self) -> impl Iterator<Item = &Value> {
        match &self.value {
            Value::Array(items) => items.iter(),
            other => std::slice::from_ref(other).iter(),
        }
    }
}

fn is_equal(actual: &Value, candidate: &Value) -> bool {
    coerced_cmp(actual, candidate) == Some(Ordering::Equal)
}

/// Compares values, parsing numeric strings when the other side is a number.
fn coerced_cmp(left: &Value, right: &Value) -> Option<Ordering> {
    if let Some(ordering) = left.compare(right) {
        return Some(ordering);
    }
    let parse = |v: &Value| v.as_str().and_then(|s| s.trim().parse::<f64>().ok());
    match (left, right) {
        (l, r) if l.is_numeric() => l.as_f64()?.partial_cmp(&parse(r)?),
        (l, r) if r.is_numeric() => parse(l)?.partial_cmp(&r.as_f64()?),
        _ => None,
    }
}

/// A node of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    /// `AND`/`OR` over child nodes.
    Logical {
        /// The connective.
        #[serde(alias = "op")]
        logic: LogicalOp,
        /// Child nodes.
        #[serde(alias = "children")]
        conditions: Vec<FilterNode>,
    },
    /// A single predicate.
    Leaf(FilterCondition),
}

impl FilterNode {
    /// Creates a leaf node.
    #[must_use]
    pub fn leaf(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self::Leaf(FilterCondition::new(field, operator, value))
    }

    /// Creates an `AND` node.
    #[must_use]
    pub fn and(conditions: Vec<FilterNode>) -> Self {
        Self::Logical {
            logic: LogicalOp::And,
            conditions,
        }
    }

    /// Creates an `OR` node.
    #[must_use]
    pub fn or(conditions: Vec<FilterNode>) -> Self {
        Self::Logical {
            logic: LogicalOp::Or,
            conditions,
        }
    }

    /// Parses a filter from document JSON.
    ///
    /// Accepts a node object or a bare array of nodes (meaning `AND`).
    /// Null and empty arrays yield `None`.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the JSON is not a valid filter.
    pub fn from_json(value: &serde_json::Value) -> Result<Option<Self>, ParseError> {
        match value {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::Array(items) if items.is_empty() => Ok(None),
            serde_json::Value::Array(items) => {
                let conditions = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        Self::from_json(item)
                            .map_err(|e| prefix_field(e, &format!("[{i}]")))?
                            .ok_or_else(|| ParseError::new("empty filter node").with_field(format!("[{i}]")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(Self::and(conditions)))
            }
            serde_json::Value::Object(_) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    ParseError::new(format!("invalid filter: {e}")).with_value(value.clone())
                }),
            other => Err(ParseError::new("filter must be an object or an array")
                .with_value(other.clone())),
        }
    }

    /// Converts to document JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Evaluates the tree against a row.
    ///
    /// An empty `AND` holds; an empty `OR` does not.
    #[must_use]
    pub fn evaluate(&self, row: &Row) -> bool {
        match self {
            Self::Leaf(condition) => condition.matches(row),
            Self::Logical {
                logic: LogicalOp::And,
                conditions,
            } => conditions.iter().all(|c| c.evaluate(row)),
            Self::Logical {
                logic: LogicalOp::Or,
                conditions,
            } => conditions.iter().any(|c| c.evaluate(row)),
        }
    }

    /// Returns every leaf in the tree.
    #[must_use]
    pub fn leaves(&self) -> Vec<&FilterCondition> {
        match self {
            Self::Leaf(condition) => vec![condition],
            Self::Logical { conditions, .. } => {
                conditions.iter().flat_map(FilterNode::leaves).collect()
            }
        }
    }
}

fn prefix_field(err: ParseError, prefix: &str) -> ParseError {
    let field = match &err.field {
        Some(field) if field.starts_with('[') => format!("{prefix}{field}"),
        Some(field) => format!("{prefix}.{field}"),
        None => prefix.to_string(),
    };
    err.with_field(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;
    use serde_json::json;

    fn row() -> Row {
        row_from_pairs([
            ("region", Value::from("EU")),
            ("amount", Value::Int(120)),
            ("name", Value::from("Acme Corp")),
            ("note", Value::Null),
        ])
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("==".parse::<FilterOperator>().unwrap(), FilterOperator::Eq);
        assert_eq!("not_in".parse::<FilterOperator>().unwrap(), FilterOperator::NotIn);
        assert_eq!("IS NOT NULL".parse::<FilterOperator>().unwrap(), FilterOperator::IsNotNull);
        assert!("~=".parse::<FilterOperator>().is_err());
    }

    #[test]
    fn test_leaf_matches() {
        let row = row();
        assert!(FilterCondition::new("region", FilterOperator::Eq, "EU").matches(&row));
        assert!(FilterCondition::new("amount", FilterOperator::Gt, 100).matches(&row));
        assert!(FilterCondition::new("amount", FilterOperator::LtEq, "120").matches(&row));
        assert!(FilterCondition::new(
            "region",
            FilterOperator::In,
            Value::Array(vec!["US".into(), "EU".into()])
        )
        .matches(&row));
        assert!(FilterCondition::new(
            "amount",
            FilterOperator::Between,
            Value::Array(vec![100.into(), 200.into()])
        )
        .matches(&row));
        assert!(FilterCondition::new("name", FilterOperator::Like, "Acme%").matches(&row));
        assert!(FilterCondition::new("note", FilterOperator::IsNull, Value::Null).matches(&row));
        assert!(!FilterCondition::new("note", FilterOperator::NotEq, "x").matches(&row));
        assert!(!FilterCondition::new("missing", FilterOperator::Eq, 1).matches(&row));
    }

    #[test]
    fn test_empty_in_lists() {
        let row = row();
        let empty = Value::Array(vec![]);
        assert!(!FilterCondition::new("region", FilterOperator::In, empty.clone()).matches(&row));
        assert!(FilterCondition::new("region", FilterOperator::NotIn, empty).matches(&row));
    }

    #[test]
    fn test_tree_from_json() {
        let tree = FilterNode::from_json(&json!({
            "logic": "OR",
            "conditions": [
                {"logic": "AND", "conditions": [
                    {"field": "region", "operator": "=", "value": "EU"},
                    {"field": "amount", "operator": ">", "value": 500}
                ]},
                {"field": "name", "operator": "like", "value": "Acme%"}
            ]
        }))
        .unwrap()
        .unwrap();

        assert_eq!(tree.leaves().len(), 3);
        assert!(tree.evaluate(&row()));
    }

    #[test]
    fn test_bare_array_means_and() {
        let tree = FilterNode::from_json(&json!([
            {"field": "region", "operator": "=", "value": "EU"},
            {"field": "amount", "operator": "<", "value": 100}
        ]))
        .unwrap()
        .unwrap();

        assert!(matches!(tree, FilterNode::Logical { logic: LogicalOp::And, .. }));
        assert!(!tree.evaluate(&row()));
        assert_eq!(FilterNode::from_json(&json!([])).unwrap(), None);
    }

    #[test]
    fn test_invalid_filter() {
        let err = FilterNode::from_json(&json!([{"field": "a", "operator": "~~"}])).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("[0]"));
        assert!(FilterNode::from_json(&json!("a = 1")).is_err());
    }
}
