//! Enrich step: joins a source row set against a lookup.

use super::common::{field_value, parse_config, require_field, OneOrMany};
use super::{StepContext, StepEngine, StepOutput};
use crate::core::{column_names, Row, RowSet, StepKind, Value};
use crate::errors::{ExecutionError, UqmResult};
use crate::filter::FilterNode;
use crate::sql::{build_select, SelectField, SelectSpec};
use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Which unmatched rows survive the join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinHow {
    /// Every source row.
    #[default]
    Left,
    /// Every lookup row.
    Right,
    /// Matches only.
    Inner,
    /// Both sides.
    #[serde(alias = "full")]
    Outer,
}

/// What to do with source rows that found no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissing {
    /// Keep the row with null lookup columns.
    #[default]
    Keep,
    /// Drop the row.
    Drop,
    /// Keep the row with `fill_value` in the lookup columns.
    Fill,
}

/// A join key: one column name on both sides, or a pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum JoinKey {
    /// Same name on both sides.
    Same(String),
    /// Different names.
    Pair {
        /// Source column.
        left: String,
        /// Lookup column.
        right: String,
    },
}

impl JoinKey {
    fn sides(&self) -> (&str, &str) {
        match self {
            Self::Same(name) => (name, name),
            Self::Pair { left, right } => (left, right),
        }
    }
}

/// Where lookup rows come from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Lookup {
    /// An upstream step.
    Step(String),
    /// An upstream step or a table queried through the connector.
    Source {
        /// Upstream step.
        #[serde(default)]
        step: Option<String>,
        /// Database table.
        #[serde(default)]
        table: Option<String>,
        /// Columns to fetch from the table.
        #[serde(default)]
        fields: Vec<String>,
        /// Filter applied to the table.
        #[serde(default, rename = "where")]
        where_clause: Option<serde_json::Value>,
    },
}

/// Enrich step configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrichConfig {
    /// Upstream step providing the rows to enrich.
    pub source: String,
    /// Lookup rows.
    pub lookup: Lookup,
    /// Join keys.
    pub on: OneOrMany<JoinKey>,
    /// Join type.
    #[serde(default)]
    pub how: JoinHow,
    /// Lookup columns to bring over; all when absent.
    #[serde(default)]
    pub lookup_fields: Option<Vec<String>>,
    /// Policy for unmatched source rows.
    #[serde(default)]
    pub on_missing: OnMissing,
    /// Fill for [`OnMissing::Fill`].
    #[serde(default)]
    pub fill_value: Value,
}

async fn lookup_rows(lookup: &Lookup, ctx: &StepContext) -> UqmResult<(Arc<RowSet>, Option<String>)> {
    let (step, table, fields, where_clause) = match lookup {
        Lookup::Step(name) => return Ok((ctx.input(name)?, None)),
        Lookup::Source {
            step,
            table,
            fields,
            where_clause,
        } => (step, table, fields, where_clause),
    };

    if let Some(step) = step {
        return Ok((ctx.input(step)?, None));
    }
    let Some(table) = table else {
        return Err(ExecutionError::new("Enrich lookup needs a step or a table").into());
    };

    let filter = match where_clause {
        Some(raw) => FilterNode::from_json(raw)?,
        None => None,
    };
    let spec = SelectSpec::new(table.clone())
        .with_fields(fields.iter().map(SelectField::column).collect())
        .with_filter(filter);
    let sql = build_select(&spec, ctx.dialect)?;
    debug!(step = %ctx.step_name, sql = %sql, "Fetching lookup table");
    let rows = ctx.connector()?.execute_query(&sql).await?;
    Ok((Arc::new(rows), Some(sql)))
}

/// First free `name_N` for a colliding lookup column.
fn suffixed(name: &str, taken: &IndexSet<String>) -> String {
    (1..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| name.to_string())
}

fn key_of(row: &Row, fields: &[&str]) -> Option<String> {
    let mut parts = Vec::with_capacity(fields.len());
    for field in fields {
        let value = field_value(row, field);
        if value.is_null() {
            return None;
        }
        parts.push(value.canonical_key());
    }
    Some(parts.join("\u{1f}"))
}

/// Joins `left` against `right`.
///
/// Returns the rows plus the number of source rows that matched.
pub(crate) fn enrich_rows(
    left: &[Row],
    right: &[Row],
    config: &EnrichConfig,
) -> UqmResult<(RowSet, usize)> {
    let keys: Vec<(String, String)> = config
        .on
        .clone()
        .into_vec()
        .iter()
        .map(|key| {
            let (l, r) = key.sides();
            (l.to_string(), r.to_string())
        })
        .collect();
    if keys.is_empty() {
        return Err(ExecutionError::new("Enrich step needs at least one join key").into());
    }
    let left_keys: Vec<&str> = keys.iter().map(|(l, _)| l.as_str()).collect();
    let right_keys: Vec<&str> = keys.iter().map(|(_, r)| r.as_str()).collect();
    for field in &left_keys {
        require_field(left, field, "join")?;
    }
    for field in &right_keys {
        require_field(right, field, "join")?;
    }

    let left_columns = column_names(left);
    let dropped: HashSet<&str> = keys
        .iter()
        .filter(|(l, r)| l == r)
        .map(|(_, r)| r.as_str())
        .collect();

    // Lookup column -> output name.
    let mut taken: IndexSet<String> = left_columns.iter().cloned().collect();
    let mut renames: IndexMap<String, String> = IndexMap::new();
    for column in column_names(right) {
        if dropped.contains(column.as_str()) {
            continue;
        }
        let wanted = config
            .lookup_fields
            .as_ref()
            .map_or(true, |fields| fields.contains(&column) || right_keys.contains(&column.as_str()));
        if !wanted {
            continue;
        }
        let output = if taken.contains(&column) {
            suffixed(&column, &taken)
        } else {
            column.clone()
        };
        taken.insert(output.clone());
        renames.insert(column, output);
    }

    let mut index: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (i, row) in right.iter().enumerate() {
        if let Some(key) = key_of(row, &right_keys) {
            index.entry(key).or_default().push(i);
        }
    }

    let with_lookup = |base: Row, lookup: Option<&Row>, fill: &Value| -> Row {
        let mut out = base;
        for (column, output) in &renames {
            let value = lookup.map_or_else(|| fill.clone(), |r| r.get(column).cloned().unwrap_or_default());
            out.insert(output.clone(), value);
        }
        out
    };

    let keep_left = matches!(config.how, JoinHow::Left | JoinHow::Outer);
    let keep_right = matches!(config.how, JoinHow::Right | JoinHow::Outer);
    let mut matched_right = HashSet::new();
    let mut matched_left = 0usize;
    let mut rows = Vec::with_capacity(left.len());

    for row in left {
        let base: Row = left_columns
            .iter()
            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or_default()))
            .collect();
        match key_of(row, &left_keys).and_then(|key| index.get(&key)) {
            Some(indices) => {
                matched_left += 1;
                for &i in indices {
                    matched_right.insert(i);
                    rows.push(with_lookup(base.clone(), Some(&right[i]), &Value::Null));
                }
            }
            None if keep_left => match config.on_missing {
                OnMissing::Keep => rows.push(with_lookup(base, None, &Value::Null)),
                OnMissing::Fill => rows.push(with_lookup(base, None, &config.fill_value)),
                OnMissing::Drop => {}
            },
            None => {}
        }
    }

    if keep_right {
        for (i, lookup) in right.iter().enumerate() {
            if matched_right.contains(&i) {
                continue;
            }
            let mut base: Row = left_columns.iter().map(|c| (c.clone(), Value::Null)).collect();
            for (l, r) in &keys {
                if l == r {
                    base.insert(l.clone(), field_value(lookup, r));
                }
            }
            rows.push(with_lookup(base, Some(lookup), &Value::Null));
        }
    }

    Ok((rows, matched_left))
}

/// The enrich step engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnrichStep;

#[async_trait]
impl StepEngine for EnrichStep {
    fn kind(&self) -> StepKind {
        StepKind::Enrich
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        let config: EnrichConfig = parse_config(ctx)?;
        let source = ctx.input(&config.source)?;
        let (lookup, sql) = lookup_rows(&config.lookup, ctx).await?;

        let (rows, matched) = enrich_rows(&source, &lookup, &config)?;
        let unmatched = source.len().saturating_sub(matched);
        debug!(step = %ctx.step_name, matched, unmatched, "Enrich complete");

        let mut output = StepOutput::new(rows).with_details(json!({
            "matched": matched,
            "unmatched": unmatched,
            "lookup_rows": lookup.len(),
            "sql": sql,
        }));
        if unmatched > 0 && config.how == JoinHow::Inner {
            output = output.with_warning(format!("{unmatched} source row(s) had no match in the lookup"));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;
    use crate::testing::{rows, StaticConnector};
    use pretty_assertions::assert_eq;

    fn orders() -> RowSet {
        rows(json!([
            {"id": 1, "customer_id": 10, "name": "order-1"},
            {"id": 2, "customer_id": 20, "name": "order-2"},
            {"id": 3, "customer_id": null, "name": "order-3"}
        ]))
    }

    fn customers() -> RowSet {
        rows(json!([
            {"customer_id": 10, "name": "Ada", "tier": "gold"},
            {"customer_id": 30, "name": "Lin", "tier": "silver"}
        ]))
    }

    fn ctx(config: serde_json::Value) -> StepContext {
        StepContext::new("enriched", StepKind::Enrich, config)
            .with_input("orders", orders())
            .with_input("customers", customers())
    }

    #[tokio::test]
    async fn test_left_join_renames_collisions() {
        let out = EnrichStep
            .execute(&ctx(json!({
                "source": "orders", "lookup": "customers", "on": "customer_id"
            })))
            .await
            .unwrap();

        assert_eq!(out.rows.len(), 3);
        assert_eq!(
            out.rows[0],
            row_from_pairs([
                ("id", Value::Int(1)),
                ("customer_id", Value::Int(10)),
                ("name", Value::from("order-1")),
                ("name_1", Value::from("Ada")),
                ("tier", Value::from("gold")),
            ])
        );
        assert_eq!(out.rows[2]["tier"], Value::Null);
        assert_eq!(out.details["matched"], json!(1));
    }

    #[tokio::test]
    async fn test_missing_policies() {
        let dropped = EnrichStep
            .execute(&ctx(json!({
                "source": "orders", "lookup": "customers", "on": ["customer_id"],
                "on_missing": "drop", "lookup_fields": ["tier"]
            })))
            .await
            .unwrap();
        assert_eq!(dropped.rows.len(), 1);
        assert!(!dropped.rows[0].contains_key("name_1"));

        let filled = EnrichStep
            .execute(&ctx(json!({
                "source": "orders", "lookup": "customers",
                "on": {"left": "customer_id", "right": "customer_id"},
                "on_missing": "fill", "fill_value": "unknown", "lookup_fields": ["tier"]
            })))
            .await
            .unwrap();
        assert_eq!(filled.rows[1]["tier"], Value::from("unknown"));
    }

    #[tokio::test]
    async fn test_outer_join_keeps_both_sides() {
        let out = EnrichStep
            .execute(&ctx(json!({
                "source": "orders", "lookup": "customers", "on": "customer_id", "how": "outer"
            })))
            .await
            .unwrap();

        assert_eq!(out.rows.len(), 4);
        let last = &out.rows[3];
        assert_eq!(last["customer_id"], Value::Int(30));
        assert_eq!(last["id"], Value::Null);
        assert_eq!(last["name_1"], Value::from("Lin"));

        let inner = EnrichStep
            .execute(&ctx(json!({
                "source": "orders", "lookup": "customers", "on": "customer_id", "how": "inner"
            })))
            .await
            .unwrap();
        assert_eq!(inner.rows.len(), 1);
        assert_eq!(inner.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_table_lookup_through_connector() {
        let connector = Arc::new(StaticConnector::new().with_table("regions", rows(json!([
            {"code": "EU", "label": "Europe"}
        ]))));
        let ctx = StepContext::new(
            "enriched",
            StepKind::Enrich,
            json!({
                "source": "sales",
                "lookup": {"table": "regions", "fields": ["code", "label"]},
                "on": {"left": "region", "right": "code"}
            }),
        )
        .with_input("sales", rows(json!([{"region": "EU", "amount": 3}])))
        .with_connector(connector.clone());

        let out = EnrichStep.execute(&ctx).await.unwrap();
        assert_eq!(out.rows[0]["label"], Value::from("Europe"));
        assert_eq!(out.rows[0]["code"], Value::from("EU"));
        assert_eq!(connector.queries(), vec!["SELECT code, label\nFROM regions".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_key_is_named() {
        let err = EnrichStep
            .execute(&ctx(json!({"source": "orders", "lookup": "customers", "on": "nope"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'nope'"));
    }
}
