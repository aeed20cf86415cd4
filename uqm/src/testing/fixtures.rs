//! Fixtures for pipeline tests.

use serde_json::{json, Value as Json};

use super::mocks::StaticConnector;
use crate::core::{rows_from_json, RowSet};

/// Builds rows from a JSON array literal.
///
/// # Panics
///
/// Panics when the value is not an array of objects.
#[must_use]
pub fn rows(value: Json) -> RowSet {
    rows_from_json(&value).unwrap_or_else(|err| panic!("invalid test rows: {err}"))
}

/// Six sales rows across three regions.
#[must_use]
pub fn sales_rows() -> RowSet {
    rows(json!([
        {"id": 1, "region": "EU", "product": "widget", "amount": 10, "status": "paid"},
        {"id": 2, "region": "EU", "product": "gadget", "amount": 20, "status": "paid"},
        {"id": 3, "region": "US", "product": "widget", "amount": 5, "status": "paid"},
        {"id": 4, "region": "US", "product": "gadget", "amount": 7, "status": "open"},
        {"id": 5, "region": "APAC", "product": "widget", "amount": 3, "status": "paid"},
        {"id": 6, "region": "APAC", "product": "gadget", "amount": null, "status": "paid"}
    ]))
}

/// A connector serving [`sales_rows`] as `sales` and a `regions` table.
#[must_use]
pub fn sales_connector() -> StaticConnector {
    StaticConnector::new().with_table("sales", sales_rows()).with_table(
        "regions",
        rows(json!([
            {"code": "EU", "label": "Europe"},
            {"code": "US", "label": "United States"},
            {"code": "APAC", "label": "Asia Pacific"}
        ])),
    )
}

/// A query step definition.
#[must_use]
pub fn query_step(name: &str, config: Json) -> Json {
    json!({"name": name, "type": "query", "config": config})
}

/// A pipeline document named `test` with the given steps and output.
#[must_use]
pub fn pipeline_doc(steps: Json, output: &str) -> Json {
    json!({
        "metadata": {"name": "test", "description": "test pipeline", "version": "1.0.0"},
        "steps": steps,
        "output": output
    })
}
