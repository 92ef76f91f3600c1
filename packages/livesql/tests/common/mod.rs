//! Shared helpers for the integration tests: engine setup, row pushing,
//! and result inspection in terms of plain JSON values.

#![allow(dead_code)]

use livesql::engine::runtime::Engine;
use livesql::engine::source::{KeySpec, SourceOptions};
use livesql::engine::types::{Row, Value};
use serde_json::Value as JsonValue;

pub fn engine() -> Engine {
    Engine::new()
}

/// Create a source keyed by its `id` column.
pub fn source(engine: &mut Engine, name: &str) {
    engine
        .create_source(name, KeySpec::column("id"), SourceOptions::default())
        .expect("create source");
}

pub fn source_with_max(engine: &mut Engine, name: &str, max_rows: usize) {
    engine
        .create_source(
            name,
            KeySpec::column("id"),
            SourceOptions {
                max_rows: Some(max_rows),
            },
        )
        .expect("create source");
}

pub fn push(engine: &mut Engine, table: &str, rows: Vec<JsonValue>) {
    engine.push_json(table, rows).expect("push");
}

/// View results as JSON objects, sorted by their serialized form so
/// assertions are order-independent.
pub fn rows_of(engine: &Engine, view: &str) -> Vec<JsonValue> {
    let mut rows: Vec<JsonValue> = engine
        .results(view)
        .expect("view exists")
        .into_iter()
        .map(JsonValue::from)
        .collect();
    rows.sort_by_key(|r| r.to_string());
    rows
}

/// A single column of a view, sorted.
pub fn column_i64(engine: &Engine, view: &str, column: &str) -> Vec<i64> {
    let mut out: Vec<i64> = engine
        .results(view)
        .expect("view exists")
        .iter()
        .filter_map(|r| r.get(column).and_then(Value::as_i64))
        .collect();
    out.sort_unstable();
    out
}

pub fn column_strings(engine: &Engine, view: &str, column: &str) -> Vec<String> {
    let mut out: Vec<String> = engine
        .results(view)
        .expect("view exists")
        .iter()
        .filter_map(|r| r.get(column).and_then(|v| v.as_str().map(String::from)))
        .collect();
    out.sort();
    out
}

pub fn row_json(v: JsonValue) -> Row {
    Row::from(v)
}
