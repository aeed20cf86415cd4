//! Assert step: data quality checks over a row set.
//!
//! Rows pass through unchanged. Each check produces an [`AssertionResult`];
//! failures are raised, logged or ignored according to [`OnFailure`].

use super::common::{field_value, parse_config, OneOrMany};
use super::{StepContext, StepEngine, StepOutput};
use crate::core::{column_names, has_field, Row, StepKind, Value};
use crate::errors::{ExecutionError, UqmResult};
use crate::expr::{evaluate_rows, parse_expression};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, warn};

/// What a failed check does to the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Fail the step.
    #[default]
    Error,
    /// Record a warning.
    #[serde(alias = "warn")]
    Warning,
    /// Record the result only.
    Ignore,
}

/// A check and its parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum AssertionKind {
    /// Row count bounds.
    RowCount {
        /// Minimum rows.
        #[serde(default)]
        min: Option<u64>,
        /// Maximum rows.
        #[serde(default)]
        max: Option<u64>,
        /// Exact count.
        #[serde(default)]
        equals: Option<u64>,
    },
    /// No nulls in the fields.
    NotNull {
        /// Checked fields.
        #[serde(alias = "field")]
        fields: OneOrMany<String>,
    },
    /// The field tuple is unique.
    Unique {
        /// Key fields.
        #[serde(alias = "field")]
        fields: OneOrMany<String>,
    },
    /// Non-null values lie within bounds (inclusive).
    Range {
        /// Checked field.
        field: String,
        /// Lower bound.
        #[serde(default)]
        min: Option<Value>,
        /// Upper bound.
        #[serde(default)]
        max: Option<Value>,
    },
    /// Non-null values match a pattern.
    Regex {
        /// Checked field.
        field: String,
        /// Regular expression.
        pattern: String,
    },
    /// An expression holds for every row.
    Custom {
        /// Boolean expression.
        expression: String,
    },
    /// The columns are present.
    ColumnExists {
        /// Required columns.
        #[serde(alias = "field")]
        fields: OneOrMany<String>,
    },
    /// Non-null values have the expected type.
    DataType {
        /// Checked field.
        field: String,
        /// `integer|number|string|boolean|date|array|object`.
        #[serde(alias = "type")]
        expected: String,
    },
    /// Non-null values are among the allowed ones.
    ValueIn {
        /// Checked field.
        field: String,
        /// Allowed values.
        values: Vec<Value>,
    },
    /// Every non-null value exists in another step's column.
    Relationship {
        /// Checked field.
        field: String,
        /// Upstream step holding the referenced rows.
        reference: String,
        /// Referenced column; defaults to `field`.
        #[serde(default)]
        reference_field: Option<String>,
    },
}

impl AssertionKind {
    /// Check name as written in configs.
    #[must_use]
    pub fn check_name(&self) -> &'static str {
        match self {
            Self::RowCount { .. } => "row_count",
            Self::NotNull { .. } => "not_null",
            Self::Unique { .. } => "unique",
            Self::Range { .. } => "range",
            Self::Regex { .. } => "regex",
            Self::Custom { .. } => "custom",
            Self::ColumnExists { .. } => "column_exists",
            Self::DataType { .. } => "data_type",
            Self::ValueIn { .. } => "value_in",
            Self::Relationship { .. } => "relationship",
        }
    }
}

/// A named check.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Assertion {
    /// Name reported in results.
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the step's failure policy.
    #[serde(default)]
    pub on_failure: Option<OnFailure>,
    /// The check.
    #[serde(flatten)]
    pub kind: AssertionKind,
}

/// Assert step configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssertConfig {
    /// Upstream step.
    pub source: String,
    /// Checks, run in order.
    pub assertions: Vec<Assertion>,
    /// Default failure policy.
    #[serde(default)]
    pub on_failure: OnFailure,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Assertion name.
    pub name: String,
    /// Check name.
    pub check: String,
    /// Whether the check held.
    pub passed: bool,
    /// Summary.
    pub message: String,
    /// Check-specific counts.
    pub details: serde_json::Value,
}

struct Outcome {
    passed: bool,
    message: String,
    details: serde_json::Value,
}

impl Outcome {
    fn new(passed: bool, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            passed,
            message: message.into(),
            details,
        }
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected.to_ascii_lowercase().as_str() {
        "integer" | "int" => matches!(value, Value::Int(_)),
        "number" | "float" | "numeric" => value.is_numeric(),
        "string" | "text" => matches!(value, Value::String(_)),
        "boolean" | "bool" => matches!(value, Value::Bool(_)),
        "array" => matches!(value, Value::Array(_)),
        "object" => matches!(value, Value::Object(_)),
        "date" => value.as_str().is_some_and(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
        }),
        _ => false,
    }
}

fn non_null<'a>(rows: &'a [Row], field: &'a str) -> impl Iterator<Item = Value> + 'a {
    rows.iter()
        .map(move |row| field_value(row, field))
        .filter(|value| !value.is_null())
}

#[allow(clippy::too_many_lines)]
fn run_check(kind: &AssertionKind, rows: &[Row], ctx: &StepContext) -> UqmResult<Outcome> {
    Ok(match kind {
        AssertionKind::RowCount { min, max, equals } => {
            let count = rows.len() as u64;
            let passed = min.map_or(true, |m| count >= m)
                && max.map_or(true, |m| count <= m)
                && equals.map_or(true, |e| count == e);
            Outcome::new(
                passed,
                format!("Row count is {count}"),
                json!({"count": count, "min": min, "max": max, "equals": equals}),
            )
        }
        AssertionKind::NotNull { fields } => {
            let mut counts = serde_json::Map::new();
            let mut total = 0usize;
            for field in fields.clone().into_vec() {
                let nulls = rows.iter().filter(|row| field_value(row, &field).is_null()).count();
                total += nulls;
                counts.insert(field, json!(nulls));
            }
            Outcome::new(
                total == 0,
                format!("{total} null value(s) found"),
                json!({"null_counts": counts}),
            )
        }
        AssertionKind::Unique { fields } => {
            let fields = fields.clone().into_vec();
            let mut seen = HashSet::new();
            let duplicates = rows
                .iter()
                .filter(|row| {
                    let key: Vec<String> = fields
                        .iter()
                        .map(|f| field_value(row, f).canonical_key())
                        .collect();
                    !seen.insert(key)
                })
                .count();
            Outcome::new(
                duplicates == 0,
                format!("{duplicates} duplicate row(s) on ({})", fields.join(", ")),
                json!({"duplicates": duplicates}),
            )
        }
        AssertionKind::Range { field, min, max } => {
            let mut violations = 0usize;
            let mut lowest: Option<Value> = None;
            let mut highest: Option<Value> = None;
            for value in non_null(rows, field) {
                let below = min.as_ref().is_some_and(|m| value.compare(m).map_or(true, |o| o.is_lt()));
                let above = max.as_ref().is_some_and(|m| value.compare(m).map_or(true, |o| o.is_gt()));
                if below || above {
                    violations += 1;
                }
                if lowest.as_ref().map_or(true, |l| value.total_cmp(l).is_lt()) {
                    lowest = Some(value.clone());
                }
                if highest.as_ref().map_or(true, |h| value.total_cmp(h).is_gt()) {
                    highest = Some(value);
                }
            }
            Outcome::new(
                violations == 0,
                format!("{violations} value(s) of '{field}' outside the range"),
                json!({
                    "violations": violations,
                    "min_found": lowest.as_ref().map(Value::to_json),
                    "max_found": highest.as_ref().map(Value::to_json),
                }),
            )
        }
        AssertionKind::Regex { field, pattern } => {
            let regex = Regex::new(pattern)
                .map_err(|e| ExecutionError::new(format!("Invalid pattern '{pattern}': {e}")))?;
            let mismatches = non_null(rows, field)
                .filter(|value| !regex.is_match(&value.to_display_string()))
                .count();
            Outcome::new(
                mismatches == 0,
                format!("{mismatches} value(s) of '{field}' do not match"),
                json!({"mismatches": mismatches}),
            )
        }
        AssertionKind::Custom { expression } => {
            let expr = parse_expression(expression)?;
            let failures = evaluate_rows(&expr, rows, None, Some(ctx.params.as_ref()))
                .into_iter()
                .filter(|result| !result.as_ref().is_ok_and(Value::is_truthy))
                .count();
            Outcome::new(
                failures == 0,
                format!("{failures} row(s) fail '{expression}'"),
                json!({"failures": failures}),
            )
        }
        AssertionKind::ColumnExists { fields } => {
            let present = column_names(rows);
            let missing: Vec<String> = fields
                .clone()
                .into_vec()
                .into_iter()
                .filter(|f| !present.contains(f) && !rows.iter().any(|row| has_field(row, f)))
                .collect();
            Outcome::new(
                missing.is_empty(),
                if missing.is_empty() {
                    "All columns present".to_string()
                } else {
                    format!("Missing column(s): {}", missing.join(", "))
                },
                json!({"missing": missing}),
            )
        }
        AssertionKind::DataType { field, expected } => {
            let mismatches = non_null(rows, field)
                .filter(|value| !type_matches(value, expected))
                .count();
            Outcome::new(
                mismatches == 0,
                format!("{mismatches} value(s) of '{field}' are not {expected}"),
                json!({"mismatches": mismatches}),
            )
        }
        AssertionKind::ValueIn { field, values } => {
            let invalid: Vec<Value> = non_null(rows, field)
                .filter(|value| !values.iter().any(|allowed| allowed.loose_eq(value)))
                .collect();
            Outcome::new(
                invalid.is_empty(),
                format!("{} value(s) of '{field}' are not allowed", invalid.len()),
                json!({
                    "invalid_count": invalid.len(),
                    "examples": invalid.iter().take(5).map(Value::to_json).collect::<Vec<_>>(),
                }),
            )
        }
        AssertionKind::Relationship {
            field,
            reference,
            reference_field,
        } => {
            let referenced = ctx.input(reference)?;
            let target = reference_field.as_deref().unwrap_or(field);
            let known: HashSet<String> = non_null(&referenced, target).map(|v| v.canonical_key()).collect();
            let orphans = non_null(rows, field)
                .filter(|value| !known.contains(&value.canonical_key()))
                .count();
            Outcome::new(
                orphans == 0,
                format!("{orphans} value(s) of '{field}' have no match in '{reference}.{target}'"),
                json!({"orphans": orphans}),
            )
        }
    })
}

/// The assert step engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssertStep;

#[async_trait]
impl StepEngine for AssertStep {
    fn kind(&self) -> StepKind {
        StepKind::Assert
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        let config: AssertConfig = parse_config(ctx)?;
        let source = ctx.input(&config.source)?;

        let mut results = Vec::with_capacity(config.assertions.len());
        let mut warnings = Vec::new();
        let mut fatal = Vec::new();

        for (i, assertion) in config.assertions.iter().enumerate() {
            let check = assertion.kind.check_name();
            let name = assertion
                .name
                .clone()
                .unwrap_or_else(|| format!("{check}_{}", i + 1));
            let outcome = run_check(&assertion.kind, &source, ctx)?;

            if !outcome.passed {
                match assertion.on_failure.unwrap_or(config.on_failure) {
                    OnFailure::Error => fatal.push(format!("{name}: {}", outcome.message)),
                    OnFailure::Warning => {
                        warn!(step = %ctx.step_name, assertion = %name, check, message = %outcome.message, "Assertion failed");
                        warnings.push(format!("Assertion '{name}' failed: {}", outcome.message));
                    }
                    OnFailure::Ignore => {}
                }
            }

            results.push(AssertionResult {
                name,
                check: check.to_string(),
                passed: outcome.passed,
                message: outcome.message,
                details: outcome.details,
            });
        }

        let passed = results.iter().filter(|r| r.passed).count();
        debug!(step = %ctx.step_name, passed, total = results.len(), "Assertions evaluated");

        if !fatal.is_empty() {
            return Err(ExecutionError::new(format!("Assertion(s) failed: {}", fatal.join("; "))).into());
        }

        let details = json!({
            "assertions": results,
            "passed": passed,
            "failed": results.len() - passed,
        });
        let mut output = StepOutput::new(source.as_ref().clone()).with_details(details);
        output.warnings = warnings;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::rows;
    use pretty_assertions::assert_eq;

    fn ctx(config: serde_json::Value) -> StepContext {
        StepContext::new("checks", StepKind::Assert, config)
            .with_input(
                "orders",
                rows(json!([
                    {"id": 1, "total": 13, "status": "paid", "email": "a@x.io", "customer_id": 10},
                    {"id": 2, "total": 250, "status": "open", "email": null, "customer_id": 11},
                    {"id": 2, "total": 900, "status": "void", "email": "bad", "customer_id": 10}
                ])),
            )
            .with_input("customers", rows(json!([{"customer_id": 10}])))
    }

    async fn results(assertions: serde_json::Value) -> Vec<AssertionResult> {
        let out = AssertStep
            .execute(&ctx(json!({
                "source": "orders", "assertions": assertions, "on_failure": "ignore"
            })))
            .await
            .unwrap();
        serde_json::from_value(out.details["assertions"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_range_below_minimum_fails() {
        let step = ctx(json!({"source": "orders", "assertions": []}));
        let step = step.with_input("small", rows(json!([{"total": 13}])));
        let out = AssertStep
            .execute(&StepContext {
                config: json!({
                    "source": "small",
                    "on_failure": "warning",
                    "assertions": [{"check": "range", "field": "total", "min": 100, "max": 10000}]
                }),
                ..step
            })
            .await
            .unwrap();

        let results: Vec<AssertionResult> = serde_json::from_value(out.details["assertions"].clone()).unwrap();
        assert!(!results[0].passed);
        assert_eq!(results[0].name, "range_1");
        assert_eq!(results[0].details["min_found"], json!(13));
        assert_eq!(results[0].details["max_found"], json!(13));
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_every_check() {
        let results = results(json!([
            {"check": "row_count", "min": 1, "max": 5},
            {"check": "not_null", "field": "email"},
            {"check": "unique", "fields": ["id"]},
            {"check": "regex", "field": "email", "pattern": "^[^@]+@[^@]+$"},
            {"check": "custom", "expression": "total > 0"},
            {"check": "column_exists", "fields": ["id", "missing"]},
            {"check": "data_type", "field": "total", "type": "integer"},
            {"check": "value_in", "field": "status", "values": ["paid", "open"]},
            {"check": "relationship", "field": "customer_id", "reference": "customers"}
        ]))
        .await;

        let passed: Vec<(&str, bool)> = results.iter().map(|r| (r.check.as_str(), r.passed)).collect();
        assert_eq!(
            passed,
            vec![
                ("row_count", true),
                ("not_null", false),
                ("unique", false),
                ("regex", false),
                ("custom", true),
                ("column_exists", false),
                ("data_type", true),
                ("value_in", false),
                ("relationship", false),
            ]
        );
        assert_eq!(results[8].details["orphans"], json!(1));
    }

    #[tokio::test]
    async fn test_error_policy_fails_step_with_per_check_override() {
        let err = AssertStep
            .execute(&ctx(json!({
                "source": "orders",
                "assertions": [
                    {"name": "has_email", "check": "not_null", "field": "email"},
                    {"check": "row_count", "equals": 99, "on_failure": "ignore"}
                ]
            })))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("has_email"), "{message}");
        assert!(!message.contains("row_count"), "{message}");
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_an_error() {
        let out = AssertStep
            .execute(&ctx(json!({
                "source": "orders",
                "assertions": [{"check": "regex", "field": "email", "pattern": "("}]
            })))
            .await;
        assert!(out.is_err());
    }
}
