//! Database connector interface.
//!
//! Concrete drivers live outside the crate. Steps reach a database only
//! through an injected `Arc<dyn Connector>`; the engine never opens
//! connections on its own.

use crate::core::RowSet;
use crate::errors::{ConnectionError, UqmResult};
use crate::sql::SqlDialect;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A column of a table as reported by a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Database type name.
    pub data_type: String,
    /// Whether the column accepts nulls.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnInfo {
    /// Creates a nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// Table description.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in table order.
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    /// Returns the column names.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Access to a relational data source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens the underlying connection (idempotent).
    async fn connect(&self) -> Result<(), ConnectionError>;

    /// Runs a SELECT statement and returns its rows.
    async fn execute_query(&self, sql: &str) -> UqmResult<RowSet>;

    /// Releases the underlying connection.
    async fn close(&self) -> Result<(), ConnectionError>;

    /// Lists the tables the connector can see.
    async fn available_tables(&self) -> UqmResult<Vec<String>>;

    /// Describes one table.
    async fn table_schema(&self, table: &str) -> UqmResult<TableSchema>;

    /// SQL dialect the connector speaks.
    fn dialect(&self) -> SqlDialect;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::row_from_pairs;
    use crate::core::Value;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_mock_connector() {
        let mut mock = MockConnector::new();
        mock.expect_dialect().return_const(SqlDialect::Postgres);
        mock.expect_execute_query()
            .withf(|sql| sql.starts_with("SELECT"))
            .times(1)
            .returning(|_| Ok(vec![row_from_pairs([("id", Value::Int(1))])]));

        let connector: &dyn Connector = &mock;
        assert_eq!(connector.dialect(), SqlDialect::Postgres);
        let rows = connector.execute_query("SELECT id FROM t").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_table_schema_column_names() {
        let schema = TableSchema {
            name: "orders".to_string(),
            columns: vec![ColumnInfo::new("id", "integer"), ColumnInfo::new("total", "numeric")],
        };
        assert_eq!(schema.column_names(), vec!["id", "total"]);
    }
}
