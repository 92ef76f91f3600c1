//! Subquery-backed predicates and scalar subqueries.
//!
//! The compiler turns `x IN (SELECT …)` / `EXISTS (SELECT …)` into a
//! `SemiJoinOp` whose second input is the compiled subquery, and a scalar
//! subquery in the SELECT list into a `ScalarApplyOp` that holds the
//! subquery's latest single value and re-projects outer rows when it
//! moves. Only uncorrelated subqueries are supported.

use crate::engine::circuit::StatefulOperator;
use crate::engine::eval::{eval_expr, EvalCtx, FaultFlag};
use crate::engine::types::{FastMap, OrdValue, Row, RowKey, Value, Weight, ZSet};
use crate::sql::ast::Expr;
use serde_json::json;
use smol_str::SmolStr;
use std::collections::BTreeMap;

pub enum SemiJoinKind {
    /// `expr [NOT] IN (subquery)`, with SQL's null-aware semantics: a
    /// NULL probe is never definite, and NOT IN is defeated by any NULL
    /// in the subquery.
    In { expr: Expr, negated: bool },
    /// `[NOT] EXISTS (subquery)`.
    Exists { negated: bool },
}

pub struct SemiJoinOp {
    kind: SemiJoinKind,
    outer: FastMap<RowKey, (Row, Weight)>,
    members: BTreeMap<OrdValue, Weight>,
    null_count: Weight,
    total: Weight,
    emitted: FastMap<RowKey, (Row, Weight)>,
    faults: FaultFlag,
}

impl SemiJoinOp {
    pub fn new(kind: SemiJoinKind) -> Self {
        SemiJoinOp {
            kind,
            outer: FastMap::default(),
            members: BTreeMap::new(),
            null_count: 0,
            total: 0,
            emitted: FastMap::default(),
            faults: FaultFlag::new("semi_join"),
        }
    }

    fn passes(&self, row: &Row) -> bool {
        match &self.kind {
            SemiJoinKind::Exists { negated } => (self.total > 0) != *negated,
            SemiJoinKind::In { expr, negated } => {
                let ctx = EvalCtx::with_faults(row, &self.faults);
                let v = eval_expr(expr, &ctx);
                if v.is_null() {
                    return false;
                }
                let hit = self
                    .members
                    .get(&OrdValue(v))
                    .map(|w| *w > 0)
                    .unwrap_or(false);
                if *negated {
                    // Any NULL in the subquery makes NOT IN unknown.
                    !hit && self.null_count <= 0
                } else {
                    hit
                }
            }
        }
    }

    /// Bring one key's emission in line with its integrated state.
    fn sync_key(&mut self, key: &RowKey, out: &mut ZSet) {
        let desired = match self.outer.get(key) {
            Some((row, w)) if *w > 0 && self.passes(row) => Some((row.clone(), *w)),
            _ => None,
        };
        let current = self.emitted.get(key).cloned();
        match (current, desired) {
            (None, Some((row, w))) => {
                out.push(key.clone(), row.clone(), w);
                self.emitted.insert(key.clone(), (row, w));
            }
            (Some((old, w)), None) => {
                out.push(key.clone(), old, -w);
                self.emitted.remove(key);
            }
            (Some((old, ow)), Some((new, nw))) => {
                if old != new || ow != nw {
                    out.push(key.clone(), old, -ow);
                    out.push(key.clone(), new.clone(), nw);
                    self.emitted.insert(key.clone(), (new, nw));
                }
            }
            (None, None) => {}
        }
    }
}

impl StatefulOperator for SemiJoinOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        let (outer_delta, sub_delta) = (inputs[0], inputs[1]);

        let membership_moved = !sub_delta.is_empty();
        for (_, row, w) in sub_delta.iter() {
            self.total += w;
            let value = row
                .iter()
                .next()
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            if value.is_null() {
                self.null_count += w;
            } else {
                let slot = self.members.entry(OrdValue(value.clone())).or_insert(0);
                *slot += w;
                if *slot == 0 {
                    self.members.remove(&OrdValue(value));
                }
            }
        }

        let mut touched: Vec<RowKey> = Vec::new();
        for (key, row, w) in outer_delta.iter() {
            let entry = self
                .outer
                .entry(key.clone())
                .or_insert_with(|| (row.clone(), 0));
            entry.1 += w;
            if w > 0 {
                entry.0 = row.clone();
            }
            if entry.1 <= 0 {
                self.outer.remove(key);
            }
            if !touched.contains(key) {
                touched.push(key.clone());
            }
        }

        let mut out = ZSet::new();
        if membership_moved {
            // The predicate itself changed: every integrated outer row
            // may flip.
            let keys: Vec<RowKey> = self.outer.keys().cloned().collect();
            for key in keys {
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
            let stale: Vec<RowKey> = self
                .emitted
                .keys()
                .filter(|k| !touched.contains(*k))
                .cloned()
                .collect();
            touched.extend(stale);
        }
        for key in touched {
            self.sync_key(&key, &mut out);
        }
        out
    }

    fn reset(&mut self) {
        self.outer.clear();
        self.members.clear();
        self.null_count = 0;
        self.total = 0;
        self.emitted.clear();
    }

    fn stats(&self) -> Option<serde_json::Value> {
        Some(json!({
            "operator": "semi_join",
            "outer_rows": self.outer.len(),
            "member_values": self.members.len(),
            "faults": self.faults.count(),
        }))
    }
}

/// Applies the SELECT projection for a query whose items reference scalar
/// subqueries (`ScalarRef` slots). Holds the latest value of each
/// sub-circuit; when one moves, every integrated outer row re-projects
/// and only the changed outputs are emitted.
pub struct ScalarApplyOp {
    /// `(output column, expression)`; expressions may use `ScalarRef`.
    items: Vec<(SmolStr, Expr)>,
    scalar_count: usize,
    scalars: Vec<Value>,
    scalar_state: Vec<FastMap<RowKey, (Row, Weight)>>,
    outer: FastMap<RowKey, (Row, Weight)>,
    emitted: FastMap<RowKey, (Row, Weight)>,
    faults: FaultFlag,
}

impl ScalarApplyOp {
    pub fn new(items: Vec<(SmolStr, Expr)>, scalar_count: usize) -> Self {
        ScalarApplyOp {
            items,
            scalar_count,
            scalars: vec![Value::Null; scalar_count],
            scalar_state: (0..scalar_count).map(|_| FastMap::default()).collect(),
            outer: FastMap::default(),
            emitted: FastMap::default(),
            faults: FaultFlag::new("scalar_apply"),
        }
    }

    fn project(&self, row: &Row) -> Row {
        let ctx = EvalCtx {
            row,
            scalars: &self.scalars,
            aggs: &[],
            faults: Some(&self.faults),
        };
        let mut out = Row::with_capacity(self.items.len());
        for (name, expr) in &self.items {
            out.set(name.clone(), eval_expr(expr, &ctx));
        }
        out
    }
}

impl StatefulOperator for ScalarApplyOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        let outer_delta = inputs[0];
        let mut scalars_moved = false;

        for slot in 0..self.scalar_count {
            let delta = inputs.get(slot + 1).copied();
            let Some(delta) = delta else { continue };
            if delta.is_empty() {
                continue;
            }
            let state = &mut self.scalar_state[slot];
            for (key, row, w) in delta.iter() {
                let entry = state.entry(key.clone()).or_insert_with(|| (row.clone(), 0));
                entry.1 += w;
                if w > 0 {
                    entry.0 = row.clone();
                }
                if entry.1 <= 0 {
                    state.remove(key);
                }
            }
            if state.len() > 1 {
                self.faults
                    .report("scalar subquery produced more than one row");
            }
            let value = state
                .values()
                .next()
                .and_then(|(row, _)| row.iter().next().map(|(_, v)| v.clone()))
                .unwrap_or(Value::Null);
            if self.scalars[slot] != value {
                self.scalars[slot] = value;
                scalars_moved = true;
            }
        }

        let mut out = ZSet::new();

        if scalars_moved {
            // Retract-reassert every integrated row whose projection the
            // new scalar changes.
            let keys: Vec<RowKey> = self.outer.keys().cloned().collect();
            for key in keys {
                let Some((row, w)) = self.outer.get(&key).cloned() else { continue };
                let new_row = self.project(&row);
                if let Some((old_row, old_w)) = self.emitted.get(&key).cloned() {
                    if old_row != new_row {
                        out.push(key.clone(), old_row, -old_w);
                        out.push(key.clone(), new_row.clone(), w);
                        self.emitted.insert(key, (new_row, w));
                    }
                }
            }
        }

        for (key, row, w) in outer_delta.iter() {
            let entry = self
                .outer
                .entry(key.clone())
                .or_insert_with(|| (row.clone(), 0));
            entry.1 += w;
            if w > 0 {
                entry.0 = row.clone();
            }
            let gone = entry.1 <= 0;
            if gone {
                self.outer.remove(key);
            }

            let projected = self.project(row);
            out.push(key.clone(), projected.clone(), w);
            let slot = self.emitted.entry(key.clone()).or_insert_with(|| (projected.clone(), 0));
            slot.1 += w;
            if w > 0 {
                slot.0 = projected;
            }
            if slot.1 <= 0 {
                self.emitted.remove(key);
            }
        }

        out
    }

    fn reset(&mut self) {
        self.scalars = vec![Value::Null; self.scalar_count];
        for s in &mut self.scalar_state {
            s.clear();
        }
        self.outer.clear();
        self.emitted.clear();
    }

    fn stats(&self) -> Option<serde_json::Value> {
        Some(json!({
            "operator": "scalar_apply",
            "outer_rows": self.outer.len(),
            "faults": self.faults.count(),
        }))
    }
}

#[cfg(test)]
mod subquery_tests {
    use super::*;
    use serde_json::json;

    fn delta(rows: &[(&str, serde_json::Value, Weight)]) -> ZSet {
        ZSet::from_entries(
            rows.iter()
                .map(|(k, v, w)| (SmolStr::new(*k), Row::from(v.clone()), *w)),
        )
    }

    #[test]
    fn in_subquery_membership_flips_rows() {
        let mut op = SemiJoinOp::new(SemiJoinKind::In {
            expr: Expr::col("c"),
            negated: false,
        });
        let outer = delta(&[
            ("o1", json!({"c": "x"}), 1),
            ("o2", json!({"c": "y"}), 1),
        ]);
        let out = op.eval(&[&outer, &ZSet::new()]);
        assert!(out.is_empty());

        // "x" appears in the subquery: o1 passes.
        let sub = delta(&[("s1", json!({"v": "x"}), 1)]);
        let out = op.eval(&[&ZSet::new(), &sub]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.weight_of("o1"), 1);

        // "x" disappears again: o1 retracts.
        let out = op.eval(&[&ZSet::new(), &delta(&[("s1", json!({"v": "x"}), -1)])]);
        assert_eq!(out.weight_of("o1"), -1);
    }

    #[test]
    fn not_in_defeated_by_null_member() {
        let mut op = SemiJoinOp::new(SemiJoinKind::In {
            expr: Expr::col("c"),
            negated: true,
        });
        let outer = delta(&[("o1", json!({"c": "x"}), 1)]);
        let out = op.eval(&[&outer, &ZSet::new()]);
        assert_eq!(out.weight_of("o1"), 1);

        let out = op.eval(&[&ZSet::new(), &delta(&[("s1", json!({"v": null}), 1)])]);
        assert_eq!(out.weight_of("o1"), -1);
    }

    #[test]
    fn exists_tracks_subquery_cardinality() {
        let mut op = SemiJoinOp::new(SemiJoinKind::Exists { negated: false });
        let outer = delta(&[("o1", json!({"a": 1}), 1)]);
        assert!(op.eval(&[&outer, &ZSet::new()]).is_empty());
        let out = op.eval(&[&ZSet::new(), &delta(&[("s1", json!({"x": 1}), 1)])]);
        assert_eq!(out.weight_of("o1"), 1);
    }

    #[test]
    fn scalar_change_reprojects_existing_rows() {
        let mut op = ScalarApplyOp::new(
            vec![
                ("id".into(), Expr::col("id")),
                ("flag".into(), Expr::gt(Expr::col("v"), Expr::ScalarRef(0))),
            ],
            1,
        );
        let outer = delta(&[("o1", json!({"id": 1, "v": 10}), 1)]);
        let out = op.eval(&[&outer, &ZSet::new()]);
        assert_eq!(out.len(), 1);

        // Threshold arrives: flag flips from NULL-comparison to false.
        let sub = delta(&[("t", json!({"limit": 20}), 1)]);
        let out = op.eval(&[&ZSet::new(), &sub]);
        assert_eq!(out.len(), 2);
        let asserted = out
            .iter()
            .find(|(_, _, w)| *w > 0)
            .map(|(_, r, _)| r.clone())
            .unwrap();
        assert_eq!(asserted.get("flag"), Some(&Value::Bool(false)));
    }
}
