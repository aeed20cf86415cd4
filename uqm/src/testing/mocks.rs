//! Mock connectors and step engines for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connectors::{ColumnInfo, Connector, TableSchema};
use crate::core::{column_names, RowSet, StepKind, Value};
use crate::errors::{ConnectionError, ExecutionError, UqmResult};
use crate::sql::SqlDialect;
use crate::steps::{StepContext, StepEngine, StepOutput};

const COUNT_PREFIX: &str = "SELECT COUNT(*) AS total_count";

/// A connector answering queries from canned tables.
///
/// Every query returns the whole table named after its first `FROM`; count
/// queries return that table's row count. Executed SQL is recorded.
#[derive(Debug, Default)]
pub struct StaticConnector {
    tables: HashMap<String, RowSet>,
    failing: HashSet<String>,
    dialect: SqlDialect,
    queries: Mutex<Vec<String>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl StaticConnector {
    /// Creates a connector with no tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table.
    #[must_use]
    pub fn with_table(mut self, name: impl Into<String>, rows: RowSet) -> Self {
        self.tables.insert(name.into(), rows);
        self
    }

    /// Sets the reported dialect.
    #[must_use]
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Makes every query against `table` fail with a connection error.
    #[must_use]
    pub fn fail_on(mut self, table: impl Into<String>) -> Self {
        self.failing.insert(table.into());
        self
    }

    /// Returns the executed SQL, in order.
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    /// Returns the number of executed queries.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.lock().len()
    }

    /// Whether `connect` was called.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn table_of(sql: &str) -> Option<String> {
        sql.match_indices("FROM ").find_map(|(at, keyword)| {
            let rest = &sql[at + keyword.len()..];
            if rest.starts_with('(') {
                return None;
            }
            let name: String = rest
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != ')')
                .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
                .collect();
            (!name.is_empty()).then_some(name)
        })
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self) -> Result<(), ConnectionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn execute_query(&self, sql: &str) -> UqmResult<RowSet> {
        self.queries.lock().push(sql.to_string());
        let table = Self::table_of(sql)
            .ok_or_else(|| ExecutionError::new(format!("Cannot find a table in query: {sql}")))?;
        if self.failing.contains(&table) {
            return Err(ConnectionError::new(format!("Connection lost while reading '{table}'")).into());
        }
        let rows = self
            .tables
            .get(&table)
            .ok_or_else(|| ExecutionError::new(format!("Table '{table}' does not exist")))?;

        if sql.starts_with(COUNT_PREFIX) {
            let total = i64::try_from(rows.len()).unwrap_or(i64::MAX);
            return Ok(vec![[("total_count".to_string(), Value::Int(total))].into_iter().collect()]);
        }
        Ok(rows.clone())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn available_tables(&self) -> UqmResult<Vec<String>> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn table_schema(&self, table: &str) -> UqmResult<TableSchema> {
        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| ExecutionError::new(format!("Table '{table}' does not exist")))?;
        let columns = column_names(rows)
            .into_iter()
            .map(|name| {
                let data_type = rows
                    .iter()
                    .filter_map(|row| row.get(&name))
                    .find(|v| !v.is_null())
                    .map_or("null", Value::type_name);
                ColumnInfo::new(name, data_type)
            })
            .collect();
        Ok(TableSchema {
            name: table.to_string(),
            columns,
        })
    }

    fn dialect(&self) -> SqlDialect {
        self.dialect
    }
}

/// Wraps an engine and counts its executions.
pub struct CountingStep {
    inner: Arc<dyn StepEngine>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for CountingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingStep")
            .field("kind", &self.inner.kind())
            .field("calls", &self.call_count())
            .finish()
    }
}

impl CountingStep {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn StepEngine>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of executions.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepEngine for CountingStep {
    fn kind(&self) -> StepKind {
        self.inner.kind()
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(ctx).await
    }
}

/// An engine that always fails.
#[derive(Debug)]
pub struct FailingStep {
    kind: StepKind,
    error: String,
    calls: AtomicUsize,
}

impl FailingStep {
    /// Creates an engine for `kind` failing with `error`.
    #[must_use]
    pub fn new(kind: StepKind, error: impl Into<String>) -> Self {
        Self {
            kind,
            error: error.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of executions.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepEngine for FailingStep {
    fn kind(&self) -> StepKind {
        self.kind
    }

    async fn execute(&self, ctx: &StepContext) -> UqmResult<StepOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ExecutionError::new(self.error.clone())
            .with_step(&ctx.step_name, ctx.step_type.as_str())
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn single_column(name: &str, values: &[i64]) -> RowSet {
        values
            .iter()
            .map(|v| [(name.to_string(), Value::Int(*v))].into_iter().collect())
            .collect()
    }

    #[tokio::test]
    async fn test_static_connector_serves_tables() {
        let connector = StaticConnector::new().with_table("nums", single_column("n", &[1, 2, 3]));

        let all = connector.execute_query("SELECT *\nFROM nums\nWHERE n > 1").await.unwrap();
        assert_eq!(all.len(), 3);

        let count = connector
            .execute_query("SELECT COUNT(*) AS total_count\nFROM nums")
            .await
            .unwrap();
        assert_eq!(count[0]["total_count"], Value::Int(3));

        let grouped = connector
            .execute_query("SELECT COUNT(*) AS total_count\nFROM (SELECT n\nFROM \"nums\"\nGROUP BY n) AS grouped_count")
            .await
            .unwrap();
        assert_eq!(grouped[0]["total_count"], Value::Int(3));
        assert_eq!(connector.query_count(), 3);
    }

    #[tokio::test]
    async fn test_static_connector_errors() {
        let connector = StaticConnector::new().with_table("nums", Vec::new()).fail_on("nums");

        let err = connector.execute_query("SELECT *\nFROM nums").await.unwrap_err();
        assert_eq!(err.error_type(), "ConnectionError");
        let err = connector.execute_query("SELECT *\nFROM other").await.unwrap_err();
        assert!(err.to_string().contains("'other'"));
    }

    #[tokio::test]
    async fn test_static_connector_schema() {
        let connector = StaticConnector::new()
            .with_table("b", Vec::new())
            .with_table("a", crate::testing::rows(json!([{"id": null, "name": "x"}, {"id": 2}])));

        assert_eq!(connector.available_tables().await.unwrap(), vec!["a", "b"]);
        let schema = connector.table_schema("a").await.unwrap();
        assert_eq!(schema.column_names(), vec!["id", "name"]);
        assert_eq!(schema.columns[0].data_type, "integer");

        connector.connect().await.unwrap();
        connector.close().await.unwrap();
        assert!(connector.is_connected() && connector.is_closed());
    }

    #[tokio::test]
    async fn test_failing_step_names_itself() {
        let step = FailingStep::new(StepKind::Pivot, "boom");
        let ctx = StepContext::new("p", StepKind::Pivot, json!({}));

        let err = step.execute(&ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Step 'p' (pivot) failed: boom");
        assert_eq!(step.call_count(), 1);
    }
}
