//! Parameter declarations and supplied-value validation.

use crate::core::{Parameters, Value};
use crate::errors::{ValidationError, ValidationIssue};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a pipeline parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// Any string.
    #[default]
    String,
    /// A whole number; numeric strings are coerced.
    #[serde(alias = "int")]
    Integer,
    /// Any number; numeric strings are coerced.
    #[serde(alias = "float", alias = "decimal")]
    Number,
    /// `true`/`false`; the strings `"true"`/`"false"` are coerced.
    #[serde(alias = "bool")]
    Boolean,
    /// A list of values.
    #[serde(alias = "list")]
    Array,
    /// A key/value map.
    Object,
    /// An ISO-8601 date (`YYYY-MM-DD`) or RFC 3339 timestamp string.
    #[serde(alias = "datetime")]
    Date,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Date => "date",
        };
        f.write_str(name)
    }
}

impl ParameterType {
    /// Checks a supplied value against the type, coercing where allowed.
    ///
    /// Null passes for every type.
    ///
    /// # Errors
    ///
    /// Returns a message describing the mismatch.
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        let mismatch = || format!("expected {self}, got {}", value.type_name());

        match (self, value) {
            (_, Value::Null)
            | (Self::String, Value::String(_))
            | (Self::Integer, Value::Int(_))
            | (Self::Number, Value::Int(_) | Value::Float(_))
            | (Self::Boolean, Value::Bool(_))
            | (Self::Array, Value::Array(_))
            | (Self::Object, Value::Object(_)) => Ok(value.clone()),
            (Self::Integer, Value::Float(_)) => value.as_i64().map(Value::Int).ok_or_else(mismatch),
            (Self::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::Int).map_err(|_| mismatch())
            }
            (Self::Number, Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Value::Int)
                    .or_else(|_| s.parse::<f64>().map(Value::Float))
                    .map_err(|_| mismatch())
            }
            (Self::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (Self::Date, Value::String(s)) => {
                let valid = NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
                    || DateTime::parse_from_rfc3339(s).is_ok();
                if valid {
                    Ok(value.clone())
                } else {
                    Err(format!("expected date (YYYY-MM-DD), got '{s}'"))
                }
            }
            _ => Err(mismatch()),
        }
    }
}

/// A declared pipeline parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDecl {
    /// Parameter name, referenced as `$name` or `${name}`.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    /// Value used when none is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Whether a value must be supplied (or defaulted).
    #[serde(default)]
    pub required: bool,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Closed set of accepted values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<Value>>,
}

impl ParameterDecl {
    /// Creates an optional string parameter.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: ParameterType::String,
            default: None,
            required: false,
            description: None,
            allowed_values: None,
        }
    }

    /// Sets the type.
    #[must_use]
    pub fn with_type(mut self, param_type: ParameterType) -> Self {
        self.param_type = param_type;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Marks the parameter required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn check_allowed(&self, value: &Value) -> Result<(), String> {
        let Some(allowed) = &self.allowed_values else {
            return Ok(());
        };
        let is_allowed = |v: &Value| allowed.iter().any(|a| a.loose_eq(v));
        let ok = match value {
            Value::Null => true,
            Value::Array(items) if self.param_type == ParameterType::Array => {
                items.iter().all(is_allowed)
            }
            other => is_allowed(other),
        };
        if ok {
            Ok(())
        } else {
            Err(format!("value {} is not one of the allowed values", value.canonical_key()))
        }
    }
}

/// Applies defaults to supplied values and validates them.
///
/// Supplied values that were not declared pass through unchanged.
///
/// # Errors
///
/// Returns every problem found, each under `parameters.<name>`.
pub fn resolve_parameters(
    declarations: &[ParameterDecl],
    supplied: &Parameters,
) -> Result<Parameters, ValidationError> {
    let mut resolved = supplied.clone();
    let mut issues = Vec::new();

    for decl in declarations {
        let field = format!("parameters.{}", decl.name);

        let value = match supplied.get(&decl.name) {
            Some(value) if !(value.is_null() && decl.required) => value.clone(),
            _ => match &decl.default {
                Some(default) => default.clone(),
                None if decl.required => {
                    issues.push(ValidationIssue::new(field, "is required"));
                    continue;
                }
                None => continue,
            },
        };

        let checked = decl
            .param_type
            .coerce(&value)
            .and_then(|coerced| decl.check_allowed(&coerced).map(|()| coerced));

        match checked {
            Ok(coerced) => {
                resolved.insert(decl.name.clone(), coerced);
            }
            Err(message) => {
                issues.push(ValidationIssue::new(field, message).with_value(value.to_json()));
            }
        }
    }

    if issues.is_empty() {
        Ok(resolved)
    } else {
        Err(ValidationError::new(issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn supplied(pairs: &[(&str, Value)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_defaults_and_passthrough() {
        let decls = vec![
            ParameterDecl::new("region").with_default("EU"),
            ParameterDecl::new("limit").with_type(ParameterType::Integer),
        ];
        let resolved = resolve_parameters(&decls, &supplied(&[("extra", Value::Int(1))])).unwrap();

        assert_eq!(resolved.get("region"), Some(&Value::from("EU")));
        assert_eq!(resolved.get("limit"), None);
        assert_eq!(resolved.get("extra"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_required_and_type_errors() {
        let decls = vec![
            ParameterDecl::new("region").required(),
            ParameterDecl::new("year").with_type(ParameterType::Integer),
        ];
        let err = resolve_parameters(&decls, &supplied(&[("year", Value::from("abc"))]))
            .unwrap_err();

        let fields: Vec<&str> = err.issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(fields, vec!["parameters.region", "parameters.year"]);
    }

    #[test]
    fn test_coercion() {
        assert_eq!(
            ParameterType::Integer.coerce(&Value::from("42")),
            Ok(Value::Int(42))
        );
        assert_eq!(
            ParameterType::Number.coerce(&Value::from("2.5")),
            Ok(Value::Float(2.5))
        );
        assert_eq!(
            ParameterType::Boolean.coerce(&Value::from("TRUE")),
            Ok(Value::Bool(true))
        );
        assert!(ParameterType::Date.coerce(&Value::from("2024-02-30")).is_err());
        assert!(ParameterType::Date.coerce(&Value::from("2024-02-29")).is_ok());
        assert!(ParameterType::Array.coerce(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_allowed_values() {
        let decl = ParameterDecl {
            allowed_values: Some(vec!["EU".into(), "US".into()]),
            ..ParameterDecl::new("region")
        };
        assert!(resolve_parameters(
            std::slice::from_ref(&decl),
            &supplied(&[("region", Value::from("EU"))])
        )
        .is_ok());
        assert!(resolve_parameters(&[decl], &supplied(&[("region", Value::from("APAC"))])).is_err());
    }

    #[test]
    fn test_declaration_deserializes_with_defaults() {
        let decl: ParameterDecl =
            serde_json::from_value(serde_json::json!({"name": "ids", "type": "array"})).unwrap();
        assert_eq!(decl.param_type, ParameterType::Array);
        assert!(!decl.required);
        assert_eq!(decl.default, None);
    }
}
