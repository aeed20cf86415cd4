//! `$name` substitution and conditional-filter resolution over step configs.

use crate::core::{Parameters, Value};
use crate::errors::{ParseError, UqmResult};
use crate::filter::{resolve_conditions, FilterNode};
use crate::schema::Pipeline;
use std::collections::BTreeSet;
use tracing::debug;

/// Config keys whose values are filter trees.
pub const FILTER_KEYS: [&str; 3] = ["filters", "where", "having"];

/// Config key holding a conditional gate, never substituted.
const CONDITIONAL_KEY: &str = "conditional";

/// A `$name` or `${name}` occurrence inside a string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder<'a> {
    start: usize,
    end: usize,
    name: &'a str,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn placeholders(text: &str) -> Vec<Placeholder<'_>> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let rest = &text[i + 1..];
        if let Some(braced) = rest.strip_prefix('{') {
            if let Some(close) = braced.find('}') {
                let name = &braced[..close];
                if name.starts_with(is_name_start) && name.chars().all(is_name_char) {
                    let end = i + 2 + close + 1;
                    found.push(Placeholder { start: i, end, name });
                    i = end;
                    continue;
                }
            }
        } else if rest.starts_with(is_name_start) {
            let len = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
            let end = i + 1 + len;
            found.push(Placeholder {
                start: i,
                end,
                name: &rest[..len],
            });
            i = end;
            continue;
        }
        i += 1;
    }

    found
}

/// Config key holding expression source, where values render as literals.
const EXPRESSION_KEY: &str = "expression";

/// Renders a value as expression source. Objects have no literal form.
fn expression_literal(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("NULL".to_string()),
        Value::Bool(b) => Some(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) if f.is_finite() => {
            let text = f.to_string();
            Some(if text.contains('.') { text } else { format!("{text}.0") })
        }
        Value::Float(_) => Some("NULL".to_string()),
        Value::String(s) => Some(format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))),
        Value::Array(items) => items
            .iter()
            .map(expression_literal)
            .collect::<Option<Vec<_>>>()
            .map(|parts| format!("({})", parts.join(", "))),
        Value::Object(_) => None,
    }
}

/// Substitutes inside expression source. Unrenderable values keep their
/// placeholder for evaluation-time lookup.
fn substitute_expression(text: &str, params: &Parameters) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for placeholder in placeholders(text) {
        out.push_str(&text[cursor..placeholder.start]);
        match params.get(placeholder.name).and_then(expression_literal) {
            Some(literal) => out.push_str(&literal),
            None => out.push_str(&text[placeholder.start..placeholder.end]),
        }
        cursor = placeholder.end;
    }
    out.push_str(&text[cursor..]);
    out
}

fn substitute_string(text: &str, params: &Parameters) -> serde_json::Value {
    let found = placeholders(text);

    if let [only] = found.as_slice() {
        if only.start == 0 && only.end == text.len() {
            return params
                .get(only.name)
                .map_or_else(|| serde_json::Value::String(text.to_string()), Value::to_json);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for placeholder in &found {
        out.push_str(&text[cursor..placeholder.start]);
        match params.get(placeholder.name) {
            Some(value) => out.push_str(&value.to_display_string()),
            None => out.push_str(&text[placeholder.start..placeholder.end]),
        }
        cursor = placeholder.end;
    }
    out.push_str(&text[cursor..]);
    serde_json::Value::String(out)
}

/// Replaces parameter placeholders throughout a JSON tree.
///
/// A string that is exactly one placeholder becomes the parameter value
/// itself, keeping its type. Placeholders embedded in longer strings are
/// replaced textually, except under `expression` keys where values render
/// as expression literals. Unknown names are left as written and
/// `conditional` objects are copied untouched.
#[must_use]
pub fn substitute_value(value: &serde_json::Value, params: &Parameters) -> serde_json::Value {
    match value {
        serde_json::Value::String(text) if text.contains('$') => substitute_string(text, params),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| substitute_value(v, params)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, v)| {
                    let v = if key == CONDITIONAL_KEY {
                        v.clone()
                    } else if let (EXPRESSION_KEY, serde_json::Value::String(text)) = (key.as_str(), v) {
                        serde_json::Value::String(substitute_expression(text, params))
                    } else {
                        substitute_value(v, params)
                    };
                    (key.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Returns a copy of the pipeline with every step config substituted.
#[must_use]
pub fn substitute(pipeline: &Pipeline, params: &Parameters) -> Pipeline {
    let mut resolved = pipeline.clone();
    for step in &mut resolved.steps {
        step.config = substitute_value(&step.config, params);
    }
    resolved
}

/// Collects every parameter name a JSON tree refers to.
///
/// Counts `$name` placeholders as well as names used by conditional gates.
#[must_use]
pub fn referenced_parameters(value: &serde_json::Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_references(value, &mut names);
    names
}

fn collect_references(value: &serde_json::Value, names: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::String(text) => {
            names.extend(placeholders(text).into_iter().map(|p| p.name.to_string()));
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_references(item, names);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                if key == CONDITIONAL_KEY {
                    collect_gate_references(v, names);
                }
                collect_references(v, names);
            }
        }
        _ => {}
    }
}

fn collect_gate_references(gate: &serde_json::Value, names: &mut BTreeSet<String>) {
    if let Some(name) = gate.get("parameter").and_then(serde_json::Value::as_str) {
        names.insert(name.to_string());
    }
    if let Some(list) = gate.get("parameters").and_then(serde_json::Value::as_array) {
        names.extend(list.iter().filter_map(|v| v.as_str().map(str::to_string)));
    }
}

fn has_gate(node: &FilterNode) -> bool {
    node.leaves().iter().any(|leaf| leaf.conditional.is_some())
}

fn resolve_filters_in(
    value: &mut serde_json::Value,
    params: &Parameters,
    path: &str,
) -> Result<(), ParseError> {
    match value {
        serde_json::Value::Object(map) => {
            for key in FILTER_KEYS {
                let Some(raw) = map.get(key) else { continue };
                let field = format!("{path}.{key}");
                let Some(tree) = FilterNode::from_json(raw).map_err(|e| {
                    let inner = e.field.clone().unwrap_or_default();
                    ParseError {
                        field: Some(format!("{field}{inner}")),
                        ..e
                    }
                })?
                else {
                    continue;
                };
                if !has_gate(&tree) {
                    continue;
                }
                match resolve_conditions(&tree, params) {
                    Some(resolved) => {
                        map.insert(key.to_string(), resolved.to_json());
                    }
                    None => {
                        debug!(field = %field, "Removing filter emptied by conditions");
                        map.shift_remove(key);
                    }
                }
            }
            for (key, child) in map.iter_mut() {
                if FILTER_KEYS.contains(&key.as_str()) || key == CONDITIONAL_KEY {
                    continue;
                }
                resolve_filters_in(child, params, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                resolve_filters_in(item, params, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Evaluates conditional gates in every filter tree of every step config.
///
/// Trees under `filters`, `where` and `having` are resolved wherever they
/// appear in a config; a tree that resolves to nothing is removed.
///
/// # Errors
///
/// Returns a parse error if a filter tree is malformed.
pub fn resolve_conditional_filters(pipeline: &Pipeline, params: &Parameters) -> UqmResult<Pipeline> {
    let mut resolved = pipeline.clone();
    for (i, step) in resolved.steps.iter_mut().enumerate() {
        resolve_filters_in(&mut step.config, params, &format!("steps[{i}].config"))?;
    }
    Ok(resolved)
}
