//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use uqm::core::{row_from_pairs, Parameters, Value};
use uqm::engine::PipelineEngine;
use uqm::config::{EngineConfig, ExecutionOptions};
use uqm::expr::{evaluate, parse_expression, EvalContext};
use uqm::testing::{pipeline_doc, query_step, rows, StaticConnector};

fn sales(n: usize) -> serde_json::Value {
    let regions = ["EU", "US", "APAC", "LATAM"];
    serde_json::Value::Array(
        (0..n)
            .map(|i| json!({"id": i, "region": regions[i % regions.len()], "amount": i % 97}))
            .collect(),
    )
}

fn expression_benchmark(c: &mut Criterion) {
    let text = "CASE WHEN amount * 1.2 > 50 AND region IN ('EU', 'US') THEN 'high' ELSE 'low' END";
    c.bench_function("expr_parse", |b| b.iter(|| parse_expression(black_box(text))));

    let expr = parse_expression(text).unwrap();
    let row = row_from_pairs([("amount", Value::Int(60)), ("region", Value::from("EU"))]);
    c.bench_function("expr_evaluate", |b| {
        b.iter(|| evaluate(black_box(&expr), &EvalContext::new().with_row(&row)))
    });
}

fn pipeline_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let connector = Arc::new(StaticConnector::new().with_table("sales", rows(sales(10_000))));
    let engine = PipelineEngine::new(EngineConfig::default().with_step_cache(false).with_pipeline_cache(false))
        .with_connector(connector);
    let doc = pipeline_doc(
        json!([
            query_step("raw", json!({"data_source": "sales"})),
            query_step("totals", json!({
                "data_source": "raw",
                "dimensions": ["region"],
                "metrics": [
                    {"name": "total", "field": "amount", "aggregation": "sum"},
                    {"name": "orders", "aggregation": "count"}
                ],
                "calculated_fields": [{"name": "avg_order", "expression": "total / orders"}],
                "order_by": "total DESC"
            }))
        ]),
        "totals",
    );

    c.bench_function("grouped_pipeline_10k", |b| {
        b.iter(|| {
            runtime
                .block_on(engine.execute(black_box(&doc), Parameters::new(), ExecutionOptions::new()))
                .unwrap()
        })
    });
}

criterion_group!(benches, expression_benchmark, pipeline_benchmark);
criterion_main!(benches);
