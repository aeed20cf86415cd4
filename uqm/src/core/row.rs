//! Rows and row sets, the data currency between steps.

use super::Value;
use crate::errors::{UqmError, UqmResult};
use indexmap::IndexMap;

/// An ordered map of field name to value.
pub type Row = IndexMap<String, Value>;

/// An ordered sequence of rows.
pub type RowSet = Vec<Row>;

/// Builds a row set from a JSON array of objects.
///
/// # Errors
///
/// Returns a serialization error if the value is not an array of objects.
pub fn rows_from_json(value: &serde_json::Value) -> UqmResult<RowSet> {
    let items = value
        .as_array()
        .ok_or_else(|| UqmError::Serialization("expected an array of rows".to_string()))?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.as_object()
                .map(|obj| {
                    obj.iter()
                        .map(|(k, v)| (k.clone(), Value::from(v)))
                        .collect::<Row>()
                })
                .ok_or_else(|| {
                    UqmError::Serialization(format!("row {index} is not an object"))
                })
        })
        .collect()
}

/// Converts rows to a JSON array of objects.
#[must_use]
pub fn rows_to_json(rows: &[Row]) -> serde_json::Value {
    serde_json::Value::Array(
        rows.iter()
            .map(|row| {
                serde_json::Value::Object(
                    row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                )
            })
            .collect(),
    )
}

/// Returns the union of column names across rows, in first-seen order.
#[must_use]
pub fn column_names(rows: &[Row]) -> Vec<String> {
    let mut columns: IndexMap<&str, ()> = IndexMap::new();
    for row in rows {
        for key in row.keys() {
            columns.entry(key.as_str()).or_insert(());
        }
    }
    columns.into_keys().map(str::to_string).collect()
}

/// Looks up a field, tolerating the naming variants produced by joins.
///
/// Resolution order: exact name; for a qualified `alias.field`, the
/// underscore form `alias_field` and then the bare `field`; for a bare name,
/// a single qualified column ending in `.field`.
#[must_use]
pub fn lookup_field<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    if let Some(value) = row.get(name) {
        return Some(value);
    }

    if let Some((qualifier, bare)) = name.rsplit_once('.') {
        if let Some(value) = row.get(&format!("{qualifier}_{bare}")) {
            return Some(value);
        }
        return row.get(bare);
    }

    let suffix = format!(".{name}");
    let mut matches = row.iter().filter(|(key, _)| key.ends_with(&suffix));
    match (matches.next(), matches.next()) {
        (Some((_, value)), None) => Some(value),
        _ => None,
    }
}

/// Returns true when [`lookup_field`] would resolve the name.
#[must_use]
pub fn has_field(row: &Row, name: &str) -> bool {
    lookup_field(row, name).is_some()
}

/// Identity of a row for dedup and set operations: its sorted (key, value)
/// pairs.
#[must_use]
pub fn row_identity(row: &Row) -> String {
    let mut pairs: Vec<(&String, String)> =
        row.iter().map(|(k, v)| (k, v.canonical_key())).collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k:?}={v}"))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Builds a row from `(name, value)` pairs.
pub fn row_from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Row
where
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_from_json() {
        let rows = rows_from_json(&json!([{"a": 1}, {"a": 2, "b": "x"}])).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("b"), Some(&Value::from("x")));

        assert!(rows_from_json(&json!({"a": 1})).is_err());
        assert!(rows_from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_column_names_union_in_first_seen_order() {
        let rows = rows_from_json(&json!([{"a": 1}, {"b": 2, "a": 3}, {"c": 4}])).unwrap();
        let columns = column_names(&rows);
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0], "a");
        assert!(columns.contains(&"c".to_string()));
    }

    #[test]
    fn test_lookup_field_variants() {
        let row = row_from_pairs([("orders.amount", 10), ("customer_name", 1), ("id", 7)]);

        assert_eq!(lookup_field(&row, "orders.amount"), Some(&Value::Int(10)));
        assert_eq!(lookup_field(&row, "amount"), Some(&Value::Int(10)));
        assert_eq!(lookup_field(&row, "customer.name"), Some(&Value::Int(1)));
        assert_eq!(lookup_field(&row, "o.id"), Some(&Value::Int(7)));
        assert_eq!(lookup_field(&row, "missing"), None);
    }

    #[test]
    fn test_lookup_field_ambiguous_suffix() {
        let row = row_from_pairs([("a.id", 1), ("b.id", 2)]);
        assert_eq!(lookup_field(&row, "id"), None);
    }

    #[test]
    fn test_row_identity_ignores_key_order() {
        let a = row_from_pairs([("x", 1), ("y", 2)]);
        let b = row_from_pairs([("y", 2), ("x", 1)]);
        let c = row_from_pairs([("x", 1), ("y", 3)]);

        assert_eq!(row_identity(&a), row_identity(&b));
        assert_ne!(row_identity(&a), row_identity(&c));
    }
}
