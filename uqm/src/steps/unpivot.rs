//! Unpivot step: wide rows to long (melt).

use super::common::{parse_config, require_field, OneOrMany};
use super::{StepContext, StepEngine, StepOutput};
use crate::core::{column_names, Row, RowSet, StepKind, Value};
use crate::errors::{ExecutionError, UqmResult};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

fn default_var_name() -> String {
    "variable".to_string()
}

fn default_value_name() -> String {
    "value".to_string()
}

/// Unpivot step configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnpivotConfig {
    /// Upstream step.
    pub source: String,
    /// Columns repeated on every output row.
    #[serde(default)]
    pub id_vars: OneOrMany<String>,
    /// Columns melted into rows; every non-id column when empty.
    #[serde(default)]
    pub value_vars: OneOrMany<String>,
    /// Name of the column holding the melted column's name.
    #[serde(default = "default_var_name")]
    pub var_name: String,
    /// Name of the column holding the melted value.
    #[serde(default = "default_value_name")]
    pub value_name: String,
    /// Skip null values.
    #[serde(default)]
    pub dropna: bool,
}

/// Melts `rows`; output is row-major, one row per (input row, value column).
pub(crate) fn unpivot_rows(rows: &[Row], config: &UnpivotConfig) -> UqmResult<RowSet> {
    let id_vars = config.id_vars.clone().into_vec();
    let mut value_vars = config.value_vars.clone().into_vec();
    if value_vars.is_empty() {
        value_vars = column_names(rows)
            .into_iter()
            .filter(|c| !id_vars.contains(c))
            .collect();
    }
    for field in id_vars.iter().chain(&value_vars) {
        require_field(rows, field, "unpivot")?;
    }
    if id_vars.contains(&config.var_name) || id_vars.contains(&config.value_name) {
        return Err(ExecutionError::new(format!(
            "Unpivot output columns '{}'/'{}' clash with id_vars",
            config.var_name, config.value_name
        ))
        .into());
    }

    let mut output = Vec::with_capacity(rows.len() * value_vars.len());
    for row in rows {
        for column in &value_vars {
            let value = row.get(column).cloned().unwrap_or_default();
            if config.dropna && value.is_null() {
                continue;
            }
            let mut out: Row = id_vars
                .iter()
                .map(|id| (id.clone(), row.get(id).cloned().unwrap_or_default()))
                .collect();
            out.insert(config.var_name.clone(), Value::from(column.as_str()));
            out.insert(config.value_name.clone(), value);
            output.push(out);
        }
    }
    Ok(output)
}

/// The unpivot step engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpivotStep;

#[async_trait]
impl StepEngine for UnpivotStep {
    fn kind(&self) -> StepKind {
        StepKind::Unpivot
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        let config: UnpivotConfig = parse_config(ctx)?;
        let source = ctx.input(&config.source)?;
        let rows = unpivot_rows(&source, &config)?;
        debug!(step = %ctx.step_name, input = source.len(), output = rows.len(), "Unpivot complete");
        Ok(StepOutput::new(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;
    use crate::testing::rows;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn wide() -> RowSet {
        rows(json!([
            {"region": "EU", "Q1": 30, "Q2": null},
            {"region": "US", "Q1": 7, "Q2": 4}
        ]))
    }

    async fn run(config: serde_json::Value) -> RowSet {
        let ctx = StepContext::new("u", StepKind::Unpivot, config).with_input("wide", wide());
        UnpivotStep.execute(&ctx).await.unwrap().rows
    }

    #[tokio::test]
    async fn test_default_value_vars() {
        let out = run(json!({"source": "wide", "id_vars": "region"})).await;
        assert_eq!(out.len(), 4);
        assert_eq!(
            out[0],
            row_from_pairs([
                ("region", Value::from("EU")),
                ("variable", Value::from("Q1")),
                ("value", Value::Int(30)),
            ])
        );
    }

    #[tokio::test]
    async fn test_dropna_and_names() {
        let out = run(json!({
            "source": "wide", "id_vars": ["region"], "value_vars": ["Q2"],
            "var_name": "quarter", "value_name": "amount", "dropna": true
        }))
        .await;
        assert_eq!(
            out,
            vec![row_from_pairs([
                ("region", Value::from("US")),
                ("quarter", Value::from("Q2")),
                ("amount", Value::Int(4)),
            ])]
        );
    }

    #[tokio::test]
    async fn test_clashing_names_are_rejected() {
        let ctx = StepContext::new(
            "u",
            StepKind::Unpivot,
            json!({"source": "wide", "id_vars": "region", "var_name": "region"}),
        )
        .with_input("wide", wide());
        assert!(UnpivotStep.execute(&ctx).await.is_err());
    }
}
