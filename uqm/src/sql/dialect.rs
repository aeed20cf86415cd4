//! SQL dialects.

use crate::errors::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Database-specific syntax variations the builder accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    /// ANSI-ish SQL with `LIMIT`/`OFFSET`.
    #[default]
    Generic,
    /// PostgreSQL.
    #[serde(alias = "postgresql")]
    Postgres,
    /// MySQL / MariaDB.
    #[serde(rename = "mysql", alias = "mariadb", alias = "my_sql")]
    MySql,
    /// SQLite.
    Sqlite,
    /// Microsoft SQL Server (`OFFSET .. FETCH`).
    #[serde(rename = "sqlserver", alias = "mssql", alias = "sql_server")]
    SqlServer,
}

impl SqlDialect {
    /// Returns the configuration name of the dialect.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
            Self::SqlServer => "sqlserver",
        }
    }

    /// Renders the pagination clause, if any.
    #[must_use]
    pub fn pagination(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        let offset = offset.filter(|o| *o > 0);
        match (self, limit, offset) {
            (_, None, None) => None,
            (Self::SqlServer, limit, offset) => {
                let mut clause = format!("OFFSET {} ROWS", offset.unwrap_or(0));
                if let Some(limit) = limit {
                    clause.push_str(&format!(" FETCH NEXT {limit} ROWS ONLY"));
                }
                Some(clause)
            }
            (_, Some(limit), None) => Some(format!("LIMIT {limit}")),
            (_, Some(limit), Some(offset)) => Some(format!("LIMIT {limit} OFFSET {offset}")),
            (Self::MySql, None, Some(offset)) => {
                Some(format!("LIMIT 18446744073709551615 OFFSET {offset}"))
            }
            (Self::Sqlite, None, Some(offset)) => Some(format!("LIMIT -1 OFFSET {offset}")),
            (_, None, Some(offset)) => Some(format!("OFFSET {offset}")),
        }
    }

    /// Whether pagination requires an ORDER BY clause.
    #[must_use]
    pub fn requires_order_for_pagination(&self) -> bool {
        matches!(self, Self::SqlServer)
    }

    /// Renders a boolean literal.
    #[must_use]
    pub fn boolean(&self, value: bool) -> &'static str {
        match (self, value) {
            (Self::SqlServer, true) => "1",
            (Self::SqlServer, false) => "0",
            (_, true) => "TRUE",
            (_, false) => "FALSE",
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SqlDialect {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "generic" | "ansi" => Ok(Self::Generic),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "sqlserver" | "mssql" | "tsql" => Ok(Self::SqlServer),
            _ => Err(ParseError::new(format!("Unknown SQL dialect '{s}'"))
                .with_value(serde_json::json!(s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination() {
        assert_eq!(SqlDialect::Generic.pagination(None, None), None);
        assert_eq!(
            SqlDialect::Postgres.pagination(Some(10), Some(20)).as_deref(),
            Some("LIMIT 10 OFFSET 20")
        );
        assert_eq!(
            SqlDialect::Sqlite.pagination(Some(10), Some(0)).as_deref(),
            Some("LIMIT 10")
        );
        assert_eq!(
            SqlDialect::SqlServer.pagination(Some(10), Some(20)).as_deref(),
            Some("OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY")
        );
        assert_eq!(
            SqlDialect::MySql.pagination(None, Some(5)).as_deref(),
            Some("LIMIT 18446744073709551615 OFFSET 5")
        );
    }

    #[test]
    fn test_parse_dialect() {
        assert_eq!("PostgreSQL".parse::<SqlDialect>().unwrap(), SqlDialect::Postgres);
        assert_eq!("sql_server".parse::<SqlDialect>().unwrap(), SqlDialect::SqlServer);
        assert!("oracle".parse::<SqlDialect>().is_err());

        let parsed: SqlDialect = serde_json::from_str(r#""mssql""#).unwrap();
        assert_eq!(parsed, SqlDialect::SqlServer);
    }
}
