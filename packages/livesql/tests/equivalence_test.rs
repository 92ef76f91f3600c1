//! Property-style invariants: for randomized operation sequences the
//! integrated view state must equal the query run from scratch over the
//! integrated source state, and the emitted deltas must integrate to
//! exactly that state.

mod common;

use common::*;
use livesql::engine::types::{Value, ZSet};
use livesql::engine::view::ViewOptions;
use livesql::sql::ast::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const CATS: [&str; 3] = ["a", "b", "c"];

#[test]
fn incremental_equivalence_under_random_ops() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut e = engine();
    source(&mut e, "data");

    let filtered = Select {
        filter: Some(Expr::gt(Expr::col("v"), Expr::lit(50i64))),
        ..Select::from_table("data")
    }
    .into_query();
    e.create_view("filtered", filtered, ViewOptions::default()).unwrap();

    let grouped = Select {
        items: vec![
            SelectItem::expr(Expr::col("cat")),
            SelectItem::aliased(Expr::agg(AggFunc::Sum, Expr::col("v")), "total"),
        ],
        from: Some(TableRef::table("data")),
        group_by: vec![Expr::col("cat")],
        ..Select::default()
    }
    .into_query();
    e.create_view("totals", grouped, ViewOptions::default()).unwrap();

    // Seed push so both views compile and back-load (empty for the
    // filter: v = 0 fails it), then watch every delta from here on.
    let mut mirror: HashMap<i64, (String, i64)> = HashMap::new();
    push(&mut e, "data", vec![json!({"id": 0, "cat": "a", "v": 0})]);
    mirror.insert(0, ("a".to_string(), 0));

    // Integrate the filtered view's deltas on the side: delta
    // conservation says they must land exactly on the view state.
    let integrated: Rc<RefCell<HashMap<String, i64>>> = Rc::new(RefCell::new(HashMap::new()));
    let sink = Rc::clone(&integrated);
    e.subscribe_view("filtered", move |delta: &ZSet| {
        let mut acc = sink.borrow_mut();
        for (key, _, w) in delta.iter() {
            let slot = acc.entry(key.to_string()).or_insert(0);
            *slot += w;
            if *slot == 0 {
                acc.remove(key.as_str());
            }
        }
    })
    .unwrap();

    for step in 0..300 {
        let id = rng.random_range(0..25i64);
        match rng.random_range(0..10u32) {
            // Mostly upserts, some deletes.
            0..=7 => {
                let cat = CATS[rng.random_range(0..CATS.len())].to_string();
                let v = rng.random_range(0..100i64);
                push(&mut e, "data", vec![json!({"id": id, "cat": cat, "v": v})]);
                mirror.insert(id, (cat, v));
            }
            _ => {
                e.remove("data", &[SmolStr::new(id.to_string())]).unwrap();
                mirror.remove(&id);
            }
        }
        if step % 25 == 0 || step == 299 {
            check_filtered(&e, &mirror);
            check_totals(&e, &mirror);
        }
    }

    check_filtered(&e, &mirror);
    check_totals(&e, &mirror);

    // Delta conservation: the integrated subscription equals the view.
    let acc = integrated.borrow();
    assert_eq!(acc.len(), e.count("filtered").unwrap());
    assert!(acc.values().all(|w| *w == 1));
}

fn check_filtered(e: &livesql::engine::runtime::Engine, mirror: &HashMap<i64, (String, i64)>) {
    let mut expected: Vec<i64> = mirror
        .iter()
        .filter(|(_, (_, v))| *v > 50)
        .map(|(id, _)| *id)
        .collect();
    expected.sort_unstable();
    assert_eq!(column_i64(e, "filtered", "id"), expected);
}

fn check_totals(e: &livesql::engine::runtime::Engine, mirror: &HashMap<i64, (String, i64)>) {
    let mut expected: HashMap<String, i64> = HashMap::new();
    for (cat, v) in mirror.values() {
        *expected.entry(cat.clone()).or_insert(0) += v;
    }
    let mut got: Vec<(String, i64)> = e
        .results("totals")
        .unwrap()
        .iter()
        .map(|r| {
            (
                r.get("cat").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                r.get("total").and_then(Value::as_i64).unwrap_or(0),
            )
        })
        .collect();
    got.sort();
    let mut want: Vec<(String, i64)> = expected.into_iter().collect();
    want.sort();
    assert_eq!(got, want);
}

#[test]
fn inner_join_is_symmetric() {
    let mut e = engine();
    source(&mut e, "l");
    source(&mut e, "r");
    let mut rng = StdRng::seed_from_u64(7);
    let l_rows: Vec<_> = (0..40)
        .map(|i| json!({"id": i, "k": rng.random_range(0..6i64)}))
        .collect();
    let r_rows: Vec<_> = (0..40)
        .map(|i| json!({"id": i, "k": rng.random_range(0..6i64)}))
        .collect();
    push(&mut e, "l", l_rows);
    push(&mut e, "r", r_rows);

    let join_view = |left: &str, right: &str| {
        Select {
            items: vec![
                SelectItem::aliased(Expr::qcol("l", "id"), "lid"),
                SelectItem::aliased(Expr::qcol("r", "id"), "rid"),
            ],
            from: Some(TableRef::aliased(left, if left == "l" { "l" } else { "r" })),
            joins: vec![Join {
                kind: JoinKind::Inner,
                relation: TableRef::aliased(right, if right == "l" { "l" } else { "r" }),
                on: Some(Expr::eq(Expr::qcol("l", "k"), Expr::qcol("r", "k"))),
            }],
            ..Select::default()
        }
        .into_query()
    };
    e.create_view("lr", join_view("l", "r"), ViewOptions::default()).unwrap();
    e.create_view("rl", join_view("r", "l"), ViewOptions::default()).unwrap();

    let mut pairs_lr: Vec<String> = e
        .results("lr")
        .unwrap()
        .into_iter()
        .map(|r| serde_json::Value::from(r).to_string())
        .collect();
    let mut pairs_rl: Vec<String> = e
        .results("rl")
        .unwrap()
        .into_iter()
        .map(|r| serde_json::Value::from(r).to_string())
        .collect();
    pairs_lr.sort();
    pairs_rl.sort();
    assert_eq!(pairs_lr, pairs_rl);
    assert!(!pairs_lr.is_empty());
}
