//! End-to-end scenarios: each builds a small schema, pushes deltas and
//! checks the integrated view state after every change.

mod common;

use common::*;
use livesql::engine::view::{JoinModeSpec, ViewOptions};
use livesql::sql::ast::*;
use serde_json::json;
use smol_str::SmolStr;

#[test]
fn three_way_inner_join() {
    let mut e = engine();
    source(&mut e, "orders");
    source(&mut e, "customers");
    source(&mut e, "products");

    // SELECT o.id, c.name, p.title FROM orders o
    //   JOIN customers c ON o.customer_id = c.id
    //   JOIN products p ON o.product_id = p.id
    let query = Select {
        items: vec![
            SelectItem::expr(Expr::qcol("o", "id")),
            SelectItem::expr(Expr::qcol("c", "name")),
            SelectItem::expr(Expr::qcol("p", "title")),
        ],
        from: Some(TableRef::aliased("orders", "o")),
        joins: vec![
            Join {
                kind: JoinKind::Inner,
                relation: TableRef::aliased("customers", "c"),
                on: Some(Expr::eq(
                    Expr::qcol("o", "customer_id"),
                    Expr::qcol("c", "id"),
                )),
            },
            Join {
                kind: JoinKind::Inner,
                relation: TableRef::aliased("products", "p"),
                on: Some(Expr::eq(
                    Expr::qcol("o", "product_id"),
                    Expr::qcol("p", "id"),
                )),
            },
        ],
        ..Select::default()
    }
    .into_query();
    e.create_view("order_details", query, ViewOptions::default())
        .unwrap();

    push(&mut e, "orders", vec![json!({"id": 1, "customer_id": 10, "product_id": 100})]);
    push(&mut e, "customers", vec![json!({"id": 10, "name": "Alice"})]);
    push(&mut e, "products", vec![json!({"id": 100, "title": "Widget"})]);

    assert_eq!(
        rows_of(&e, "order_details"),
        vec![json!({"id": 1, "name": "Alice", "title": "Widget"})]
    );

    // Retract the customer: the joined row disappears.
    e.remove("customers", &[SmolStr::new("10")]).unwrap();
    assert!(rows_of(&e, "order_details").is_empty());
}

#[test]
fn grouped_aggregation_under_retract_with_having() {
    let mut e = engine();
    source(&mut e, "sales");

    // SELECT product, SUM(amount) AS total FROM sales
    //   GROUP BY product HAVING SUM(amount) > 100
    let query = Select {
        items: vec![
            SelectItem::expr(Expr::col("product")),
            SelectItem::aliased(Expr::agg(AggFunc::Sum, Expr::col("amount")), "total"),
        ],
        from: Some(TableRef::table("sales")),
        group_by: vec![Expr::col("product")],
        having: Some(Expr::gt(
            Expr::agg(AggFunc::Sum, Expr::col("amount")),
            Expr::lit(100i64),
        )),
        ..Select::default()
    }
    .into_query();
    e.create_view("big_sales", query, ViewOptions::default()).unwrap();

    push(
        &mut e,
        "sales",
        vec![
            json!({"id": 1, "product": "A", "amount": 50}),
            json!({"id": 2, "product": "A", "amount": 60}),
            json!({"id": 3, "product": "B", "amount": 30}),
            json!({"id": 4, "product": "C", "amount": 200}),
        ],
    );
    assert_eq!(
        rows_of(&e, "big_sales"),
        vec![
            json!({"product": "A", "total": 110}),
            json!({"product": "C", "total": 200}),
        ]
    );

    // Delete (A, 60): A falls under the HAVING bar and retracts.
    e.remove("sales", &[SmolStr::new("2")]).unwrap();
    assert_eq!(
        rows_of(&e, "big_sales"),
        vec![json!({"product": "C", "total": 200})]
    );

    // A back to exactly 100: still suppressed.
    push(&mut e, "sales", vec![json!({"id": 5, "product": "A", "amount": 50})]);
    assert_eq!(
        rows_of(&e, "big_sales"),
        vec![json!({"product": "C", "total": 200})]
    );
}

#[test]
fn window_rolling_sum() {
    let mut e = engine();
    source(&mut e, "events");

    // SELECT id, SUM(v) OVER (ORDER BY id
    //   ROWS BETWEEN 2 PRECEDING AND CURRENT ROW) AS rolling FROM events
    let query = Select {
        items: vec![
            SelectItem::expr(Expr::col("id")),
            SelectItem::aliased(
                Expr::Window(Box::new(WindowExpr {
                    func: WindowFunc::Sum,
                    args: vec![Expr::col("v")],
                    partition_by: vec![],
                    order_by: vec![(Expr::col("id"), false)],
                    frame: Some(Frame {
                        start: FrameBound::Preceding(2),
                        end: FrameBound::CurrentRow,
                    }),
                })),
                "rolling",
            ),
        ],
        from: Some(TableRef::table("events")),
        ..Select::default()
    }
    .into_query();
    e.create_view("rolling_sums", query, ViewOptions::default())
        .unwrap();

    push(
        &mut e,
        "events",
        vec![
            json!({"id": 1, "v": 10}),
            json!({"id": 2, "v": 20}),
            json!({"id": 3, "v": 30}),
            json!({"id": 4, "v": 40}),
        ],
    );
    assert_eq!(column_i64(&e, "rolling_sums", "rolling"), vec![10, 30, 60, 90]);
}

#[test]
fn top_k_stays_exact_under_inserts() {
    let mut e = engine();
    source(&mut e, "t");

    let query = Select {
        order_by: vec![OrderByExpr::desc(Expr::col("v"))],
        limit: Some(3),
        ..Select::from_table("t")
    }
    .into_query();
    e.create_view("top3", query, ViewOptions::default()).unwrap();

    for (i, v) in [5, 2, 8, 1, 9, 4, 7].iter().enumerate() {
        push(&mut e, "t", vec![json!({"id": i, "v": v})]);
    }
    assert_eq!(column_i64(&e, "top3", "v"), vec![7, 8, 9]);

    // Delete the maximum: the next value slides in.
    e.remove("t", &[SmolStr::new("4")]).unwrap();
    assert_eq!(column_i64(&e, "top3", "v"), vec![5, 7, 8]);
}

#[test]
fn chained_views_propagate_updates() {
    let mut e = engine();
    source(&mut e, "orders");

    // pending = SELECT * FROM orders WHERE status = 'P'
    let pending = Select {
        filter: Some(Expr::eq(Expr::col("status"), Expr::lit("P"))),
        ..Select::from_table("orders")
    }
    .into_query();
    e.create_view("pending", pending, ViewOptions::default()).unwrap();

    // pending_by_c = SELECT customer, SUM(amount) AS total FROM pending
    //   GROUP BY customer
    let by_customer = Select {
        items: vec![
            SelectItem::expr(Expr::col("customer")),
            SelectItem::aliased(Expr::agg(AggFunc::Sum, Expr::col("amount")), "total"),
        ],
        from: Some(TableRef::table("pending")),
        group_by: vec![Expr::col("customer")],
        ..Select::default()
    }
    .into_query();
    e.create_view("pending_by_c", by_customer, ViewOptions::default())
        .unwrap();

    push(
        &mut e,
        "orders",
        vec![json!({"id": 1, "customer": "X", "amount": 10, "status": "P"})],
    );
    assert_eq!(
        rows_of(&e, "pending_by_c"),
        vec![json!({"customer": "X", "total": 10})]
    );

    // The order completes: the group retracts all the way down the chain.
    push(
        &mut e,
        "orders",
        vec![json!({"id": 1, "customer": "X", "amount": 10, "status": "F"})],
    );
    assert!(rows_of(&e, "pending_by_c").is_empty());
}

#[test]
fn chained_view_equals_view_over_materialized_state() {
    let mut e = engine();
    source(&mut e, "data");
    let filtered = Select {
        filter: Some(Expr::gt(Expr::col("v"), Expr::lit(10i64))),
        ..Select::from_table("data")
    }
    .into_query();
    e.create_view("filtered", filtered, ViewOptions::default()).unwrap();

    push(
        &mut e,
        "data",
        (0..30).map(|i| json!({"id": i, "v": i})).collect(),
    );

    // A view created after the fact back-loads from the chained view's
    // integrated state and matches a freshly computed equivalent.
    let downstream = Select {
        items: vec![SelectItem::aliased(Expr::count_star(), "n")],
        from: Some(TableRef::table("filtered")),
        group_by: vec![],
        having: None,
        ..Select::default()
    }
    .into_query();
    e.create_view("filtered_count", downstream, ViewOptions::default())
        .unwrap();
    assert_eq!(rows_of(&e, "filtered_count"), vec![json!({"n": 19})]);

    e.remove("data", &[SmolStr::new("29")]).unwrap();
    assert_eq!(rows_of(&e, "filtered_count"), vec![json!({"n": 18})]);
}

#[test]
fn append_only_join_counts_pairs() {
    let mut e = engine();
    source(&mut e, "l");
    source(&mut e, "r");

    let query = Select {
        from: Some(TableRef::table("l")),
        joins: vec![Join {
            kind: JoinKind::Inner,
            relation: TableRef::table("r"),
            on: Some(Expr::eq(Expr::qcol("l", "k"), Expr::qcol("r", "k"))),
        }],
        ..Select::default()
    }
    .into_query();
    e.create_view(
        "matches",
        query,
        ViewOptions {
            join_mode: JoinModeSpec::AppendOnly,
            ..ViewOptions::default()
        },
    )
    .unwrap();

    // 100 rows per side over 10 join keys: 10 * 10 * 10 pairs.
    push(
        &mut e,
        "l",
        (0..100).map(|i| json!({"id": i, "k": i % 10})).collect(),
    );
    push(
        &mut e,
        "r",
        (0..100).map(|i| json!({"id": i, "k": i % 10})).collect(),
    );

    let snapshot = e.view_snapshot("matches").unwrap();
    let pair_count = snapshot
        .operators
        .iter()
        .find_map(|op| op.get("pair_count").and_then(|v| v.as_i64()))
        .unwrap();
    assert_eq!(pair_count, 1000);

    // Deletes are ignored in append-only mode; the count stands.
    e.remove("l", &[SmolStr::new("0")]).unwrap();
    let snapshot = e.view_snapshot("matches").unwrap();
    let pair_count = snapshot
        .operators
        .iter()
        .find_map(|op| op.get("pair_count").and_then(|v| v.as_i64()))
        .unwrap();
    assert_eq!(pair_count, 1000);
}
