//! View lifecycle: readiness and retry, back-loading, delta
//! subscriptions, batching, pruning, disposal, and the coordinator.

mod common;

use common::*;
use livesql::engine::types::{Value, ZSet};
use livesql::engine::view::ViewOptions;
use livesql::sql::ast::*;
use serde_json::json;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::rc::Rc;

fn filter_query(table: &str, min_v: i64) -> Query {
    Select {
        filter: Some(Expr::gt(Expr::col("v"), Expr::lit(min_v))),
        ..Select::from_table(table)
    }
    .into_query()
}

#[test]
fn view_waits_for_upstream_schema() {
    let mut e = engine();
    source(&mut e, "t");
    e.create_view("v", filter_query("t", 0), ViewOptions::default())
        .unwrap();
    // The source exists but has no schema yet.
    assert!(!e.view_ready("v"));

    push(&mut e, "t", vec![json!({"id": 1, "v": 5})]);
    assert!(e.view_ready("v"));
    assert_eq!(column_i64(&e, "v", "v"), vec![5]);
}

#[test]
fn view_over_missing_table_recovers_when_created() {
    let mut e = engine();
    e.create_view("v", filter_query("late", 0), ViewOptions::default())
        .unwrap();
    assert!(!e.view_ready("v"));
    assert!(e.view_error("v").unwrap().contains("unknown table"));

    source(&mut e, "late");
    push(&mut e, "late", vec![json!({"id": 1, "v": 2})]);
    assert!(e.view_ready("v"));
    assert_eq!(column_i64(&e, "v", "v"), vec![2]);
}

#[test]
fn invalid_names_are_config_errors() {
    let mut e = engine();
    assert!(e
        .create_view("not a name", filter_query("t", 0), ViewOptions::default())
        .is_err());
}

#[test]
fn source_update_emits_retract_then_assert() {
    let mut e = engine();
    source(&mut e, "t");
    push(&mut e, "t", vec![json!({"id": 1, "v": "old"})]);

    let seen: Rc<RefCell<Vec<(String, i64)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    e.subscribe_source("t", move |delta: &ZSet| {
        for (_, row, w) in delta.iter() {
            let v = row.get("v").and_then(|v| v.as_str()).unwrap_or("").to_string();
            sink.borrow_mut().push((v, w));
        }
    })
    .unwrap();

    // Same key, same content: the net delta is zero, but both halves are
    // delivered so stateful consumers observe the update.
    push(&mut e, "t", vec![json!({"id": 1, "v": "old"})]);
    assert_eq!(
        *seen.borrow(),
        vec![("old".to_string(), -1), ("old".to_string(), 1)]
    );
}

#[test]
fn view_reemits_deltas_for_chaining() {
    let mut e = engine();
    source(&mut e, "t");
    e.create_view("v", filter_query("t", 10), ViewOptions::default())
        .unwrap();

    let weights: Rc<RefCell<Vec<i64>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&weights);
    push(&mut e, "t", vec![json!({"id": 1, "v": 50})]);
    e.subscribe_view("v", move |delta: &ZSet| {
        for (_, _, w) in delta.iter() {
            sink.borrow_mut().push(w);
        }
    })
    .unwrap();

    push(&mut e, "t", vec![json!({"id": 2, "v": 60})]);
    e.remove("t", &[SmolStr::new("2")]).unwrap();
    assert_eq!(*weights.borrow(), vec![1, -1]);
}

#[test]
fn max_rows_prunes_oldest_with_retractions() {
    let mut e = engine();
    source(&mut e, "t");
    e.create_view(
        "v",
        filter_query("t", 0),
        ViewOptions {
            max_rows: Some(2),
            ..ViewOptions::default()
        },
    )
    .unwrap();

    let retracted: Rc<RefCell<i64>> = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&retracted);
    e.subscribe_view("v", move |delta: &ZSet| {
        for (_, _, w) in delta.iter() {
            if w < 0 {
                *sink.borrow_mut() += 1;
            }
        }
    })
    .unwrap();

    for i in 1..=4 {
        push(&mut e, "t", vec![json!({"id": i, "v": i})]);
    }
    assert_eq!(e.count("v").unwrap(), 2);
    assert_eq!(*retracted.borrow(), 2);
    assert_eq!(column_i64(&e, "v", "v"), vec![3, 4]);
}

#[test]
fn batched_view_flushes_on_pump() {
    let mut e = engine();
    source(&mut e, "t");
    e.create_view(
        "v",
        filter_query("t", 0),
        ViewOptions {
            batch_interval_ms: Some(16),
            ..ViewOptions::default()
        },
    )
    .unwrap();

    // The first push makes the view ready (back-load runs unbatched).
    push(&mut e, "t", vec![json!({"id": 1, "v": 1})]);
    assert_eq!(e.count("v").unwrap(), 1);

    // Steady-state deltas queue until the deadline passes.
    push(&mut e, "t", vec![json!({"id": 2, "v": 2})]);
    push(&mut e, "t", vec![json!({"id": 3, "v": 3})]);
    assert_eq!(e.count("v").unwrap(), 1);
    e.pump(10);
    assert_eq!(e.count("v").unwrap(), 1);
    e.pump(20);
    assert_eq!(column_i64(&e, "v", "v"), vec![1, 2, 3]);
}

#[test]
fn flush_drains_batches_immediately() {
    let mut e = engine();
    source(&mut e, "t");
    e.create_view(
        "v",
        filter_query("t", 0),
        ViewOptions {
            batch_interval_ms: Some(1_000),
            ..ViewOptions::default()
        },
    )
    .unwrap();
    push(&mut e, "t", vec![json!({"id": 1, "v": 1})]);
    assert_eq!(e.count("v").unwrap(), 1);
    push(&mut e, "t", vec![json!({"id": 2, "v": 2})]);
    assert_eq!(e.count("v").unwrap(), 1);
    e.flush();
    assert_eq!(e.count("v").unwrap(), 2);
}

#[test]
fn coordinator_versions_coalesce() {
    let mut e = engine();
    source(&mut e, "t");
    e.create_view("v", filter_query("t", 0), ViewOptions::default())
        .unwrap();

    let versions: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&versions);
    e.coordinator().subscribe(move |v| sink.borrow_mut().push(v));

    push(&mut e, "t", vec![json!({"id": 1, "v": 1})]);
    push(&mut e, "t", vec![json!({"id": 2, "v": 2})]);
    // Two changes, one broadcast.
    e.pump(100);
    assert_eq!(*versions.borrow(), vec![1]);

    // No changes since: pumping again stays silent.
    e.pump(500);
    assert_eq!(*versions.borrow(), vec![1]);
}

#[test]
fn dispose_view_releases_and_unreadies_dependents() {
    let mut e = engine();
    source(&mut e, "t");
    e.create_view("base", filter_query("t", 0), ViewOptions::default())
        .unwrap();
    e.create_view("downstream", filter_query("base", 5), ViewOptions::default())
        .unwrap();
    push(&mut e, "t", vec![json!({"id": 1, "v": 10})]);
    assert!(e.view_ready("downstream"));

    e.dispose_view("base").unwrap();
    assert!(!e.view_ready("downstream"));
    assert!(e.results("base").is_err());
}

#[test]
fn recreated_view_changes_identity() {
    let mut e = engine();
    source(&mut e, "t");
    push(&mut e, "t", vec![json!({"id": 1, "v": 1})]);
    e.create_view("v", filter_query("t", 0), ViewOptions::default())
        .unwrap();
    let first = e.view_snapshot("v").unwrap().identity;
    e.create_view("v", filter_query("t", 0), ViewOptions::default())
        .unwrap();
    let second = e.view_snapshot("v").unwrap().identity;
    assert_ne!(first, second);
}

#[test]
fn registry_graph_tracks_wiring() {
    let mut e = engine();
    source(&mut e, "t");
    push(&mut e, "t", vec![json!({"id": 1, "v": 1})]);
    e.create_view("v", filter_query("t", 0), ViewOptions::default())
        .unwrap();

    let graph = e.registry_graph();
    let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
    assert!(names.contains(&"t"));
    assert!(names.contains(&"v"));
    assert!(graph
        .edges
        .iter()
        .any(|(from, to)| from == "t" && to == "v"));
}

#[test]
fn runtime_faults_keep_the_circuit_alive() {
    let mut e = engine();
    source(&mut e, "t");
    let q = Select {
        items: vec![
            SelectItem::expr(Expr::col("id")),
            SelectItem::aliased(
                Expr::binary(Expr::lit(100i64), BinaryOp::Div, Expr::col("d")),
                "ratio",
            ),
        ],
        ..Select::from_table("t")
    }
    .into_query();
    e.create_view("ratios", q, ViewOptions::default()).unwrap();

    push(
        &mut e,
        "t",
        vec![
            json!({"id": 1, "d": 4}),
            json!({"id": 2, "d": 0}),
            json!({"id": 3, "d": 5}),
        ],
    );
    // The poisoned row still flows, with a NULL where the division blew
    // up; the healthy rows are untouched.
    let rows = rows_of(&e, "ratios");
    assert_eq!(rows.len(), 3);
    assert!(rows.contains(&json!({"id": 2, "ratio": null})));
    assert!(rows.contains(&json!({"id": 1, "ratio": 25})));

    let row = e
        .results("ratios")
        .unwrap()
        .into_iter()
        .find(|r| r.get("id") == Some(&Value::Int(3)))
        .unwrap();
    assert_eq!(row.get("ratio"), Some(&Value::Int(20)));
}
