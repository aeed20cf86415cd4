//! Config helpers shared by the step engines.

use super::StepContext;
use crate::core::{has_field, lookup_field, Row, Value};
use crate::errors::{ExecutionError, UqmResult};
use crate::expr::compare_sort_keys;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A config value given either as a single item or as a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single item.
    One(T),
    /// A list of items.
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    /// Flattens into a list.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }
}

/// Deserializes the step's config into its typed form.
///
/// # Errors
///
/// Returns an execution error naming the step when the config does not match.
pub fn parse_config<T: DeserializeOwned>(ctx: &StepContext) -> UqmResult<T> {
    serde_json::from_value(ctx.config.clone()).map_err(|e| {
        ExecutionError::new(format!("Invalid {} config: {e}", ctx.step_type))
            .with_step(&ctx.step_name, ctx.step_type.as_str())
            .into()
    })
}

/// Reads a field for sorting or keying; missing fields read as Null.
pub(crate) fn field_value(row: &Row, name: &str) -> Value {
    lookup_field(row, name).cloned().unwrap_or_default()
}

/// Fails when rows exist but none has `field`, naming the field and its
/// role in the message.
pub(crate) fn require_field(rows: &[Row], field: &str, role: &str) -> UqmResult<()> {
    if rows.is_empty() || rows.iter().any(|row| has_field(row, field)) {
        Ok(())
    } else {
        Err(ExecutionError::new(format!("Unknown {role} field '{field}'")).into())
    }
}

/// Stable multi-key sort by `(field, descending)` keys.
pub(crate) fn sort_rows(rows: &mut [Row], keys: &[(String, bool)]) {
    if keys.is_empty() {
        return;
    }
    let descending: Vec<bool> = keys.iter().map(|(_, desc)| *desc).collect();
    let mut keyed: Vec<(Vec<Value>, Row)> = rows
        .iter()
        .map(|row| {
            let key = keys.iter().map(|(field, _)| field_value(row, field)).collect();
            (key, row.clone())
        })
        .collect();
    keyed.sort_by(|(a, _), (b, _)| compare_sort_keys(a, b, &descending));
    for (slot, (_, row)) in rows.iter_mut().zip(keyed) {
        *slot = row;
    }
}

/// Applies OFFSET then LIMIT.
pub(crate) fn paginate<T>(items: Vec<T>, limit: Option<u64>, offset: Option<u64>) -> Vec<T> {
    let skip = usize::try_from(offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let take = limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    items.into_iter().skip(skip).take(take).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_one_or_many() {
        let one: OneOrMany<String> = serde_json::from_value(serde_json::json!("a")).unwrap();
        let many: OneOrMany<String> = serde_json::from_value(serde_json::json!(["a", "b"])).unwrap();
        assert_eq!(one.into_vec(), vec!["a"]);
        assert_eq!(many.into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_sort_rows_stable_with_nulls() {
        let mut rows = vec![
            row_from_pairs([("k", Value::Int(2)), ("i", Value::Int(0))]),
            row_from_pairs([("k", Value::Null), ("i", Value::Int(1))]),
            row_from_pairs([("k", Value::Int(1)), ("i", Value::Int(2))]),
            row_from_pairs([("k", Value::Int(2)), ("i", Value::Int(3))]),
        ];
        sort_rows(&mut rows, &[("k".to_string(), false)]);
        let order: Vec<Value> = rows.iter().map(|r| r["i"].clone()).collect();
        assert_eq!(order, vec![Value::Int(2), Value::Int(0), Value::Int(3), Value::Int(1)]);
    }

    #[test]
    fn test_paginate() {
        assert_eq!(paginate(vec![1, 2, 3, 4, 5], Some(2), Some(1)), vec![2, 3]);
        assert_eq!(paginate(vec![1, 2], None, None), vec![1, 2]);
    }
}
