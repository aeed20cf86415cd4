//! Stateless SELECT and COUNT composition.

use super::dialect::SqlDialect;
use super::render::{identifier, render_expr_with};
use crate::errors::{ExecutionError, ParseError, UqmResult};
use crate::expr::{AggregateFunction, Expr};
use crate::filter::FilterNode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One entry of the SELECT list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectField {
    /// A plain column, optionally aliased.
    Column {
        /// Column name, optionally qualified.
        name: String,
        /// Output alias.
        alias: Option<String>,
    },
    /// An aggregate over a column (`None` means `*`).
    Aggregate {
        /// The aggregate.
        func: AggregateFunction,
        /// Aggregated column.
        field: Option<String>,
        /// Output alias.
        alias: String,
    },
    /// A parsed expression.
    Expression {
        /// The expression.
        expr: Expr,
        /// Output alias.
        alias: String,
    },
}

impl SelectField {
    /// Creates an unaliased column.
    #[must_use]
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column {
            name: name.into(),
            alias: None,
        }
    }

    /// Returns the output column name.
    #[must_use]
    pub fn output_name(&self) -> &str {
        match self {
            Self::Column { alias: Some(alias), .. }
            | Self::Aggregate { alias, .. }
            | Self::Expression { alias, .. } => alias,
            Self::Column { name, alias: None } => name,
        }
    }

    fn render(
        &self,
        dialect: SqlDialect,
        column: &dyn Fn(&str) -> UqmResult<String>,
    ) -> UqmResult<(String, Option<&str>)> {
        match self {
            Self::Column { name, alias } => Ok((column(name)?, alias.as_deref())),
            Self::Aggregate { func, field, alias } => {
                let inner = match field {
                    Some(field) => column(field)?,
                    None => "*".to_string(),
                };
                let sql = match func {
                    AggregateFunction::CountDistinct => format!("COUNT(DISTINCT {inner})"),
                    other => format!("{}({inner})", other.sql_name()),
                };
                Ok((sql, Some(alias)))
            }
            Self::Expression { expr, alias } => {
                Ok((render_expr_with(expr, dialect, column)?, Some(alias)))
            }
        }
    }

    fn is_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Expression { expr, .. } => expr.contains_aggregate(),
            Self::Column { .. } => false,
        }
    }
}

/// SQL join types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    /// `INNER JOIN`
    #[default]
    Inner,
    /// `LEFT JOIN`
    Left,
    /// `RIGHT JOIN`
    Right,
    /// `FULL JOIN`
    #[serde(alias = "outer")]
    Full,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inner => write!(f, "INNER"),
            Self::Left => write!(f, "LEFT"),
            Self::Right => write!(f, "RIGHT"),
            Self::Full => write!(f, "FULL"),
        }
    }
}

impl FromStr for JoinType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" => Ok(Self::Inner),
            "left" | "left_outer" => Ok(Self::Left),
            "right" | "right_outer" => Ok(Self::Right),
            "full" | "outer" | "full_outer" => Ok(Self::Full),
            _ => Err(ParseError::new(format!("Unknown join type '{s}'"))),
        }
    }
}

/// A join equality `left = right` between qualified columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOn {
    /// Column of the left side.
    pub left: String,
    /// Column of the joined table.
    pub right: String,
}

impl JoinOn {
    /// Parses `"a.id = b.id"`.
    ///
    /// # Errors
    ///
    /// Returns a parse error for anything but a single equality.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let (left, right) = text
            .split_once('=')
            .filter(|(_, right)| !right.contains('='))
            .ok_or_else(|| {
                ParseError::new(format!("join condition must be 'left = right', got '{text}'"))
            })?;
        Ok(Self {
            left: left.trim().to_string(),
            right: right.trim().to_string(),
        })
    }
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    /// Join type.
    pub join_type: JoinType,
    /// Joined table.
    pub table: String,
    /// Table alias.
    pub alias: Option<String>,
    /// Equality conditions, ANDed.
    pub on: Vec<JoinOn>,
}

/// An ORDER BY key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    /// Field or output alias.
    pub field: String,
    /// Descending order.
    pub descending: bool,
}

impl OrderBy {
    /// Parses `"field"`, `"field ASC"` or `"field DESC"`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut parts = text.split_whitespace();
        let field = parts.next().unwrap_or_default().to_string();
        let descending = parts
            .next()
            .is_some_and(|dir| dir.eq_ignore_ascii_case("desc"));
        Self { field, descending }
    }
}

/// Structured description of a SELECT statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectSpec {
    /// SELECT list; empty means `*`.
    pub fields: Vec<SelectField>,
    /// Base table.
    pub from: String,
    /// Base table alias.
    pub from_alias: Option<String>,
    /// JOIN clauses.
    pub joins: Vec<JoinClause>,
    /// WHERE tree.
    pub filter: Option<FilterNode>,
    /// GROUP BY columns.
    pub group_by: Vec<String>,
    /// HAVING tree; fields may name aggregate aliases.
    pub having: Option<FilterNode>,
    /// ORDER BY keys.
    pub order_by: Vec<OrderBy>,
    /// Row limit.
    pub limit: Option<u64>,
    /// Row offset.
    pub offset: Option<u64>,
    /// SELECT DISTINCT.
    pub distinct: bool,
}

impl SelectSpec {
    /// Creates a spec selecting from a table.
    #[must_use]
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            ..Self::default()
        }
    }

    /// Sets the SELECT list.
    #[must_use]
    pub fn with_fields(mut self, fields: Vec<SelectField>) -> Self {
        self.fields = fields;
        self
    }

    /// Sets the WHERE tree.
    #[must_use]
    pub fn with_filter(mut self, filter: Option<FilterNode>) -> Self {
        self.filter = filter;
        self
    }

    /// Sets GROUP BY.
    #[must_use]
    pub fn with_group_by(mut self, group_by: Vec<String>) -> Self {
        self.group_by = group_by;
        self
    }

    /// Sets ORDER BY.
    #[must_use]
    pub fn with_order_by(mut self, order_by: Vec<OrderBy>) -> Self {
        self.order_by = order_by;
        self
    }

    /// Sets limit and offset.
    #[must_use]
    pub fn with_pagination(mut self, limit: Option<u64>, offset: Option<u64>) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Returns true when the result is grouped (or deduplicated), so a
    /// count must count groups rather than rows.
    #[must_use]
    pub fn is_grouped(&self) -> bool {
        self.distinct || !self.group_by.is_empty()
    }

    fn output_aliases(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|f| match f {
            SelectField::Column { alias, .. } => alias.as_deref(),
            SelectField::Aggregate { alias, .. } | SelectField::Expression { alias, .. } => {
                Some(alias.as_str())
            }
        })
    }

    fn head(&self, dialect: SqlDialect) -> UqmResult<Vec<String>> {
        let column = |name: &str| identifier(name).map(str::to_string);

        let select_list = if self.fields.is_empty() {
            "*".to_string()
        } else {
            self.fields
                .iter()
                .map(|field| -> UqmResult<String> {
                    let (sql, alias) = field.render(dialect, &column)?;
                    Ok(match alias {
                        Some(alias) => format!("{sql} AS {}", identifier(alias)?),
                        None => sql,
                    })
                })
                .collect::<UqmResult<Vec<_>>>()?
                .join(", ")
        };
        let distinct = if self.distinct { "DISTINCT " } else { "" };

        let mut lines = vec![format!("SELECT {distinct}{select_list}")];

        let mut from = format!("FROM {}", identifier(&self.from)?);
        if let Some(alias) = &self.from_alias {
            from.push_str(&format!(" AS {}", identifier(alias)?));
        }
        lines.push(from);

        for join in &self.joins {
            if join.on.is_empty() {
                return Err(ExecutionError::new(format!(
                    "Join with '{}' has no condition",
                    join.table
                ))
                .into());
            }
            let mut line = format!("{} JOIN {}", join.join_type, identifier(&join.table)?);
            if let Some(alias) = &join.alias {
                line.push_str(&format!(" AS {}", identifier(alias)?));
            }
            let on = join
                .on
                .iter()
                .map(|on| -> UqmResult<String> {
                    Ok(format!("{} = {}", identifier(&on.left)?, identifier(&on.right)?))
                })
                .collect::<UqmResult<Vec<_>>>()?;
            line.push_str(&format!(" ON {}", on.join(" AND ")));
            lines.push(line);
        }

        if let Some(filter) = &self.filter {
            lines.push(format!("WHERE {}", filter.to_sql(dialect)?));
        }

        if !self.group_by.is_empty() {
            let columns = self
                .group_by
                .iter()
                .map(|c| identifier(c).map(str::to_string))
                .collect::<UqmResult<Vec<_>>>()?;
            lines.push(format!("GROUP BY {}", columns.join(", ")));
        }

        if let Some(having) = &self.having {
            let resolve = |name: &str| -> UqmResult<String> {
                match self
                    .fields
                    .iter()
                    .find(|f| f.is_aggregate() && f.output_name() == name)
                {
                    Some(field) => field.render(dialect, &column).map(|(sql, _)| sql),
                    None => column(name),
                }
            };
            lines.push(format!("HAVING {}", having.to_sql_with(dialect, &resolve)?));
        }

        Ok(lines)
    }

    fn order_clause(&self) -> UqmResult<Option<String>> {
        if self.order_by.is_empty() {
            return Ok(None);
        }
        let keys = self
            .order_by
            .iter()
            .map(|key| -> UqmResult<String> {
                let field = if self.output_aliases().any(|alias| alias == key.field) {
                    key.field.clone()
                } else {
                    identifier(&key.field)?.to_string()
                };
                Ok(format!("{field} {}", if key.descending { "DESC" } else { "ASC" }))
            })
            .collect::<UqmResult<Vec<_>>>()?;
        Ok(Some(format!("ORDER BY {}", keys.join(", "))))
    }
}

/// Builds a SELECT statement, one clause per line.
///
/// # Errors
///
/// Returns an execution error for invalid identifiers or malformed filters.
pub fn build_select(spec: &SelectSpec, dialect: SqlDialect) -> UqmResult<String> {
    let mut lines = spec.head(dialect)?;

    let pagination = dialect.pagination(spec.limit, spec.offset);
    match spec.order_clause()? {
        Some(order) => lines.push(order),
        None if pagination.is_some() && dialect.requires_order_for_pagination() => {
            lines.push("ORDER BY (SELECT NULL)".to_string());
        }
        None => {}
    }
    lines.extend(pagination);

    Ok(lines.join("\n"))
}

/// Builds a COUNT statement for the rows `spec` would return, ignoring
/// ORDER BY and pagination.
///
/// Grouped or distinct queries are wrapped so groups are counted.
///
/// # Errors
///
/// Returns an execution error for invalid identifiers or malformed filters.
pub fn build_count(spec: &SelectSpec, dialect: SqlDialect) -> UqmResult<String> {
    let base = SelectSpec {
        order_by: Vec::new(),
        limit: None,
        offset: None,
        ..spec.clone()
    };

    if base.is_grouped() {
        let inner = base.head(dialect)?.join("\n");
        return Ok(format!(
            "SELECT COUNT(*) AS total_count\nFROM ({inner}) AS grouped_count"
        ));
    }

    let mut lines = base.head(dialect)?;
    lines[0] = "SELECT COUNT(*) AS total_count".to_string();
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterOperator;
    use pretty_assertions::assert_eq;

    fn sales() -> SelectSpec {
        SelectSpec::new("sales")
            .with_fields(vec![
                SelectField::column("region"),
                SelectField::Aggregate {
                    func: AggregateFunction::Sum,
                    field: Some("amount".into()),
                    alias: "total".into(),
                },
            ])
            .with_group_by(vec!["region".into()])
    }

    #[test]
    fn test_minimal_select() {
        let spec = SelectSpec::new("t")
            .with_fields(vec![SelectField::column("id")])
            .with_filter(Some(FilterNode::and(vec![FilterNode::leaf(
                "a",
                FilterOperator::Eq,
                1,
            )])));
        assert_eq!(
            build_select(&spec, SqlDialect::Generic).unwrap(),
            "SELECT id\nFROM t\nWHERE a = 1"
        );
    }

    #[test]
    fn test_grouped_select_with_having_and_order() {
        let mut spec = sales()
            .with_order_by(vec![OrderBy::parse("total DESC")])
            .with_pagination(Some(10), Some(20));
        spec.having = Some(FilterNode::leaf("total", FilterOperator::Gt, 1000));

        assert_eq!(
            build_select(&spec, SqlDialect::Postgres).unwrap(),
            "SELECT region, SUM(amount) AS total\nFROM sales\nGROUP BY region\n\
             HAVING SUM(amount) > 1000\nORDER BY total DESC\nLIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_joins() {
        let mut spec = SelectSpec::new("orders").with_fields(vec![
            SelectField::column("orders.id"),
            SelectField::Column {
                name: "customers.name".into(),
                alias: Some("customer".into()),
            },
        ]);
        spec.joins.push(JoinClause {
            join_type: JoinType::Left,
            table: "customers".into(),
            alias: None,
            on: vec![JoinOn::parse("orders.customer_id = customers.id").unwrap()],
        });

        assert_eq!(
            build_select(&spec, SqlDialect::Generic).unwrap(),
            "SELECT orders.id, customers.name AS customer\nFROM orders\n\
             LEFT JOIN customers ON orders.customer_id = customers.id"
        );
    }

    #[test]
    fn test_sql_server_pagination_injects_order() {
        let spec = SelectSpec::new("t").with_pagination(Some(5), None);
        assert_eq!(
            build_select(&spec, SqlDialect::SqlServer).unwrap(),
            "SELECT *\nFROM t\nORDER BY (SELECT NULL)\nOFFSET 0 ROWS FETCH NEXT 5 ROWS ONLY"
        );
    }

    #[test]
    fn test_count_queries() {
        let plain = SelectSpec::new("t")
            .with_filter(Some(FilterNode::leaf("a", FilterOperator::Eq, 1)))
            .with_order_by(vec![OrderBy::parse("a")])
            .with_pagination(Some(10), None);
        assert_eq!(
            build_count(&plain, SqlDialect::Generic).unwrap(),
            "SELECT COUNT(*) AS total_count\nFROM t\nWHERE a = 1"
        );

        let grouped = sales().with_pagination(Some(10), Some(10));
        assert_eq!(
            build_count(&grouped, SqlDialect::Generic).unwrap(),
            "SELECT COUNT(*) AS total_count\nFROM (SELECT region, SUM(amount) AS total\n\
             FROM sales\nGROUP BY region) AS grouped_count"
        );
    }

    #[test]
    fn test_rejects_injection() {
        let spec = SelectSpec::new("t; DROP TABLE users");
        assert!(build_select(&spec, SqlDialect::Generic).is_err());
        assert!(JoinOn::parse("a.id").is_err());
    }
}
