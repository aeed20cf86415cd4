//! Conditional gates that decide whether a filter participates in a run.

use super::node::FilterNode;
use crate::core::{Parameters, Value};
use crate::expr::{evaluate, parse_expression, EvalContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

fn default_empty_values() -> Vec<Value> {
    vec![Value::Null, Value::Array(Vec::new())]
}

/// A predicate over the supplied parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionalGate {
    /// Holds when the parameter was supplied (or defaulted).
    ParameterExists {
        /// Parameter name.
        #[serde(alias = "param", alias = "name")]
        parameter: String,
    },
    /// Holds when the parameter is present and not one of `empty_values`.
    ParameterNotEmpty {
        /// Parameter name.
        #[serde(alias = "param", alias = "name")]
        parameter: String,
        /// Values treated as empty.
        #[serde(default = "default_empty_values")]
        empty_values: Vec<Value>,
    },
    /// Holds when every named parameter is present.
    AllParametersExist {
        /// Parameter names.
        #[serde(alias = "params", alias = "names")]
        parameters: Vec<String>,
    },
    /// Holds when a boolean expression over `$params` is truthy.
    Expression {
        /// Expression text, e.g. `$region != null && $year == 2024`.
        #[serde(alias = "expr")]
        expression: String,
    },
}

impl ConditionalGate {
    /// Evaluates the gate against resolved parameters.
    ///
    /// An expression that fails to parse or evaluate is false.
    #[must_use]
    pub fn evaluate(&self, params: &Parameters) -> bool {
        match self {
            Self::ParameterExists { parameter } => params.contains_key(parameter),
            Self::ParameterNotEmpty {
                parameter,
                empty_values,
            } => params
                .get(parameter)
                .is_some_and(|value| !empty_values.iter().any(|empty| empty.loose_eq(value))),
            Self::AllParametersExist { parameters } => {
                parameters.iter().all(|name| params.contains_key(name))
            }
            Self::Expression { expression } => {
                let result = parse_expression(expression).and_then(|expr| {
                    evaluate(&expr, &EvalContext::new().with_params(params))
                });
                match result {
                    Ok(value) => value.is_truthy(),
                    Err(err) => {
                        warn!(expression = %expression, error = %err, "Conditional expression failed; gate is closed");
                        false
                    }
                }
            }
        }
    }
}

/// Drops gated leaves whose gate is false and collapses the tree.
///
/// Logical nodes left with no children disappear; nodes with one child are
/// replaced by that child. Returns `None` when nothing survives. Applying
/// it twice with the same parameters gives the same tree.
#[must_use]
pub fn resolve_conditions(node: &FilterNode, params: &Parameters) -> Option<FilterNode> {
    match node {
        FilterNode::Leaf(condition) => match &condition.conditional {
            Some(gate) if !gate.evaluate(params) => {
                debug!(field = %condition.field, "Dropping gated filter");
                None
            }
            _ => Some(node.clone()),
        },
        FilterNode::Logical { logic, conditions } => {
            let mut surviving: Vec<FilterNode> = conditions
                .iter()
                .filter_map(|child| resolve_conditions(child, params))
                .collect();
            match surviving.len() {
                0 => None,
                1 => surviving.pop(),
                _ => Some(FilterNode::Logical {
                    logic: *logic,
                    conditions: surviving,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterCondition, FilterOperator};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parameter_not_empty_defaults() {
        let gate: ConditionalGate =
            serde_json::from_value(json!({"type": "parameter_not_empty", "parameter": "r"})).unwrap();

        assert!(!gate.evaluate(&params(&[])));
        assert!(!gate.evaluate(&params(&[("r", Value::Null)])));
        assert!(!gate.evaluate(&params(&[("r", Value::Array(vec![]))])));
        assert!(gate.evaluate(&params(&[("r", Value::from("EU"))])));
        assert!(gate.evaluate(&params(&[("r", Value::Int(0))])));
    }

    #[test]
    fn test_exists_and_all_exist() {
        let exists = ConditionalGate::ParameterExists {
            parameter: "a".into(),
        };
        let all = ConditionalGate::AllParametersExist {
            parameters: vec!["a".into(), "b".into()],
        };
        let p = params(&[("a", Value::Null)]);
        assert!(exists.evaluate(&p));
        assert!(!all.evaluate(&p));
    }

    #[test]
    fn test_expression_gate() {
        let gate = ConditionalGate::Expression {
            expression: "$region != null && $year == 2024".into(),
        };
        assert!(gate.evaluate(&params(&[
            ("region", Value::from("EU")),
            ("year", Value::Int(2024))
        ])));
        assert!(!gate.evaluate(&params(&[("year", Value::Int(2024))])));

        let broken = ConditionalGate::Expression {
            expression: "$region ===".into(),
        };
        assert!(!broken.evaluate(&params(&[])));
    }

    #[test]
    fn test_resolution_collapses_and_is_idempotent() {
        let gated = |name: &str| {
            FilterNode::Leaf(
                FilterCondition::new(name, FilterOperator::Eq, format!("${name}")).with_conditional(
                    ConditionalGate::ParameterExists {
                        parameter: name.into(),
                    },
                ),
            )
        };
        let tree = FilterNode::or(vec![
            FilterNode::and(vec![gated("a"), gated("b")]),
            gated("c"),
        ]);
        let p = params(&[("a", Value::Int(1)), ("c", Value::Int(2))]);

        let once = resolve_conditions(&tree, &p).unwrap();
        assert_eq!(once, FilterNode::or(vec![gated("a"), gated("c")]));
        assert_eq!(resolve_conditions(&once, &p), Some(once.clone()));

        assert_eq!(resolve_conditions(&tree, &params(&[])), None);
    }
}
