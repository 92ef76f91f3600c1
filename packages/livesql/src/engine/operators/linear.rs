//! Linear operators: pointwise lifts of row functions, plus the two
//! stateful set-shaped ones (distinct, intersect/except).

use crate::engine::circuit::StatefulOperator;
use crate::engine::eval::{eval_predicate, EvalCtx, FaultFlag};
use crate::engine::types::{FastMap, FastSet, Row, RowKey, Weight, ZSet};
use crate::sql::ast::Expr;
use serde_json::json;

/// Three-valued WHERE: a row passes only on definite TRUE.
pub fn filter_delta(delta: &ZSet, predicate: &Expr, faults: &FaultFlag) -> ZSet {
    delta.filter(|row| {
        let ctx = EvalCtx {
            row,
            scalars: &[],
            aggs: &[],
            faults: Some(faults),
        };
        eval_predicate(predicate, &ctx) == Some(true)
    })
}

/// Union at the Z-set layer: order-preserving concatenation. `UNION ALL`
/// and `UNION` differ only by the distinct stage the compiler appends.
pub fn union_delta(inputs: &[&ZSet]) -> ZSet {
    let mut out = ZSet::new();
    for z in inputs {
        out = out.concat(z);
    }
    out
}

/// Emits each key once: +1 when its integrated weight turns positive,
/// -1 when it returns to zero.
#[derive(Default)]
pub struct DistinctOp {
    state: FastMap<RowKey, (Row, Weight)>,
}

impl DistinctOp {
    pub fn new() -> Self {
        DistinctOp::default()
    }
}

impl StatefulOperator for DistinctOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        let mut out = ZSet::new();
        for (key, row, weight) in inputs[0].iter() {
            let entry = self.state.entry(key.clone()).or_insert_with(|| (row.clone(), 0));
            let old = entry.1;
            entry.1 += weight;
            entry.0 = row.clone();
            let new = entry.1;
            if old <= 0 && new > 0 {
                out.push(key.clone(), row.clone(), 1);
            } else if old > 0 && new <= 0 {
                out.push(key.clone(), row.clone(), -1);
            }
            if new == 0 {
                self.state.remove(key);
            }
        }
        out
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Intersect,
    Except,
}

/// INTERSECT / EXCEPT over positive-weight membership, integrated on both
/// sides. With `all` the multiset semantics are `min(l, r)` and
/// `max(l - r, 0)`; without, 0/1 membership (the implicit DISTINCT).
pub struct SetOp {
    kind: SetOpKind,
    all: bool,
    left: FastMap<RowKey, Weight>,
    right: FastMap<RowKey, Weight>,
    rows: FastMap<RowKey, Row>,
}

impl SetOp {
    pub fn new(kind: SetOpKind, all: bool) -> Self {
        SetOp {
            kind,
            all,
            left: FastMap::default(),
            right: FastMap::default(),
            rows: FastMap::default(),
        }
    }

    fn multiplicity(&self, l: Weight, r: Weight) -> Weight {
        let l = l.max(0);
        let r = r.max(0);
        match (self.kind, self.all) {
            (SetOpKind::Intersect, true) => l.min(r),
            (SetOpKind::Intersect, false) => (l > 0 && r > 0) as Weight,
            (SetOpKind::Except, true) => (l - r).max(0),
            (SetOpKind::Except, false) => (l > 0 && r == 0) as Weight,
        }
    }
}

impl StatefulOperator for SetOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        let mut touched: FastSet<RowKey> = FastSet::default();
        let mut before: FastMap<RowKey, Weight> = FastMap::default();

        let mut apply = |side: &mut FastMap<RowKey, Weight>,
                         rows: &mut FastMap<RowKey, Row>,
                         delta: &ZSet,
                         touched: &mut FastSet<RowKey>,
                         before: &mut FastMap<RowKey, Weight>,
                         other: &FastMap<RowKey, Weight>,
                         left_side: bool,
                         mult: &dyn Fn(Weight, Weight) -> Weight| {
            for (key, row, weight) in delta.iter() {
                if touched.insert(key.clone()) {
                    let l = if left_side {
                        side.get(key).copied().unwrap_or(0)
                    } else {
                        other.get(key).copied().unwrap_or(0)
                    };
                    let r = if left_side {
                        other.get(key).copied().unwrap_or(0)
                    } else {
                        side.get(key).copied().unwrap_or(0)
                    };
                    before.insert(key.clone(), mult(l, r));
                }
                rows.entry(key.clone()).or_insert_with(|| row.clone());
                let w = side.entry(key.clone()).or_insert(0);
                *w += weight;
                if *w == 0 {
                    side.remove(key);
                }
            }
        };

        let kind = self.kind;
        let all = self.all;
        let mult = move |l: Weight, r: Weight| {
            let l = l.max(0);
            let r = r.max(0);
            match (kind, all) {
                (SetOpKind::Intersect, true) => l.min(r),
                (SetOpKind::Intersect, false) => (l > 0 && r > 0) as Weight,
                (SetOpKind::Except, true) => (l - r).max(0),
                (SetOpKind::Except, false) => (l > 0 && r == 0) as Weight,
            }
        };

        apply(
            &mut self.left,
            &mut self.rows,
            inputs[0],
            &mut touched,
            &mut before,
            &self.right,
            true,
            &mult,
        );
        apply(
            &mut self.right,
            &mut self.rows,
            inputs[1],
            &mut touched,
            &mut before,
            &self.left,
            false,
            &mult,
        );

        let mut out = ZSet::new();
        for key in touched {
            let l = self.left.get(&key).copied().unwrap_or(0);
            let r = self.right.get(&key).copied().unwrap_or(0);
            let after = self.multiplicity(l, r);
            let prior = before.get(&key).copied().unwrap_or(0);
            if after != prior {
                if let Some(row) = self.rows.get(&key) {
                    out.push(key.clone(), row.clone(), after - prior);
                }
            }
            if l == 0 && r == 0 {
                self.rows.remove(&key);
            }
        }
        out
    }

    fn reset(&mut self) {
        self.left.clear();
        self.right.clear();
        self.rows.clear();
    }

    fn stats(&self) -> Option<serde_json::Value> {
        Some(json!({
            "operator": "set_op",
            "left_keys": self.left.len(),
            "right_keys": self.right.len(),
        }))
    }
}

#[cfg(test)]
mod linear_tests {
    use super::*;
    use smol_str::SmolStr;

    fn entry(key: &str, v: i64, w: Weight) -> (RowKey, Row, Weight) {
        (SmolStr::new(key), Row::from(json!({ "v": v })), w)
    }

    #[test]
    fn distinct_emits_transitions_only() {
        let mut op = DistinctOp::new();
        let d1 = ZSet::from_entries([entry("a", 1, 1), entry("a", 1, 1)]);
        let out = op.eval(&[&d1]);
        assert_eq!(out.weight_of("a"), 1);

        // Second insert of the same key: no emission.
        let d2 = ZSet::from_entries([entry("a", 1, 1)]);
        assert!(op.eval(&[&d2]).is_empty());

        // Drop to zero across two steps: one retraction at the end.
        let d3 = ZSet::from_entries([entry("a", 1, -2)]);
        assert!(op.eval(&[&d3]).is_empty());
        let d4 = ZSet::from_entries([entry("a", 1, -1)]);
        assert_eq!(op.eval(&[&d4]).weight_of("a"), -1);
    }

    #[test]
    fn distinct_update_pair_reemits() {
        let mut op = DistinctOp::new();
        let d1 = ZSet::from_entries([entry("a", 1, 1)]);
        op.eval(&[&d1]);
        // Retract-then-assert in one delta: both transitions observable.
        let mut upd = ZSet::new();
        let (k, r, _) = entry("a", 1, 0);
        upd.push(k.clone(), r.clone(), -1);
        upd.push(k, r, 1);
        let out = op.eval(&[&upd]);
        assert_eq!(out.len(), 2);
        assert!(out.is_zero());
    }

    #[test]
    fn intersect_distinct_membership() {
        let mut op = SetOp::new(SetOpKind::Intersect, false);
        let l = ZSet::from_entries([entry("a", 1, 2), entry("b", 2, 1)]);
        let r = ZSet::from_entries([entry("a", 1, 1)]);
        let out = op.eval(&[&l, &r]);
        assert_eq!(out.weight_of("a"), 1);
        assert_eq!(out.weight_of("b"), 0);

        // Removing the right copy retracts membership.
        let retract = ZSet::from_entries([entry("a", 1, -1)]);
        let out2 = op.eval(&[&ZSet::new(), &retract]);
        assert_eq!(out2.weight_of("a"), -1);
    }

    #[test]
    fn except_all_tracks_difference() {
        let mut op = SetOp::new(SetOpKind::Except, true);
        let l = ZSet::from_entries([entry("a", 1, 3)]);
        let r = ZSet::from_entries([entry("a", 1, 1)]);
        let out = op.eval(&[&l, &r]);
        assert_eq!(out.weight_of("a"), 2);
    }
}
