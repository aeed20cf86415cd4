//! Union step: set operations over upstream row sets.

use super::common::parse_config;
use super::{StepContext, StepEngine, StepOutput};
use crate::core::{column_names, row_identity, Row, RowSet, StepKind, Value};
use crate::errors::{ExecutionError, UqmResult};
use async_trait::async_trait;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use tracing::debug;

/// How the sources combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnionMode {
    /// Distinct rows of all sources.
    #[default]
    Union,
    /// All rows of all sources.
    UnionAll,
    /// Distinct rows present in every source.
    Intersect,
    /// Distinct rows of the first source absent from the others.
    Except,
}

/// Union step configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnionConfig {
    /// Upstream steps, in order.
    pub sources: Vec<String>,
    /// Set operation.
    #[serde(default)]
    pub mode: UnionMode,
}

/// Aligns every row to the union of all columns, null-filling gaps.
fn align(sets: &[&[Row]]) -> Vec<RowSet> {
    let mut columns: IndexSet<String> = IndexSet::new();
    for set in sets {
        columns.extend(column_names(set));
    }
    sets.iter()
        .map(|set| {
            set.iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                        .collect()
                })
                .collect()
        })
        .collect()
}

fn dedup(rows: impl IntoIterator<Item = Row>) -> RowSet {
    let mut seen = HashSet::new();
    rows.into_iter().filter(|row| seen.insert(row_identity(row))).collect()
}

/// Combines aligned sets; results keep first-seen order.
pub(crate) fn combine(sets: &[&[Row]], mode: UnionMode) -> RowSet {
    let mut aligned = align(sets).into_iter();
    let Some(first) = aligned.next() else {
        return Vec::new();
    };
    let rest: Vec<RowSet> = aligned.collect();

    match mode {
        UnionMode::UnionAll => first.into_iter().chain(rest.into_iter().flatten()).collect(),
        UnionMode::Union => dedup(first.into_iter().chain(rest.into_iter().flatten())),
        UnionMode::Intersect => {
            let others: Vec<HashSet<String>> = rest
                .iter()
                .map(|set| set.iter().map(row_identity).collect())
                .collect();
            dedup(
                first
                    .into_iter()
                    .filter(|row| others.iter().all(|ids| ids.contains(&row_identity(row)))),
            )
        }
        UnionMode::Except => {
            let excluded: HashSet<String> = rest.iter().flatten().map(row_identity).collect();
            dedup(first.into_iter().filter(|row| !excluded.contains(&row_identity(row))))
        }
    }
}

/// The union step engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionStep;

#[async_trait]
impl StepEngine for UnionStep {
    fn kind(&self) -> StepKind {
        StepKind::Union
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        let config: UnionConfig = parse_config(ctx)?;
        if config.sources.is_empty() {
            return Err(ExecutionError::new("Union step needs at least one source").into());
        }
        let inputs = config
            .sources
            .iter()
            .map(|name| ctx.input(name))
            .collect::<UqmResult<Vec<_>>>()?;
        let sets: Vec<&[Row]> = inputs.iter().map(|rows| rows.as_slice()).collect();

        let rows = combine(&sets, config.mode);
        let input_rows: usize = sets.iter().map(|s| s.len()).sum();
        debug!(step = %ctx.step_name, mode = ?config.mode, input_rows, output_rows = rows.len(), "Union complete");
        Ok(StepOutput::new(rows).with_details(json!({"input_rows": input_rows})))
    }
}
