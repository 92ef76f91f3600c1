//! Hash-indexed incremental joins.
//!
//! Both sides keep an index from join-key to the rows carrying it. The
//! two deltas arriving in one step are serialized to keep new-meets-new
//! pairs counted exactly once: ΔR probes the pre-step left index, ΔR
//! positives enter the right index, ΔL probes the now-updated right
//! index, ΔL positives enter the left index. Negative entries leave
//! their own index before probing.

use crate::engine::circuit::StatefulOperator;
use crate::engine::eval::{eval_expr, eval_predicate, EvalCtx, FaultFlag};
use crate::engine::external::JoinSink;
use crate::engine::types::{FastMap, FastSet, Row, RowKey, Value, Weight, ZSet};
use crate::sql::ast::Expr;
use rustc_hash::FxHasher;
use serde_json::json;
use smol_str::SmolStr;
use std::hash::Hasher;

/// Separator inside composite output keys; never appears in key reprs.
const PAIR_SEP: char = '\u{2}';
/// Stand-in for the missing side of a null-extended row key.
const NULL_SIDE: &str = "~";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

/// What the operator stores beyond its indexes.
pub enum JoinMode {
    /// Indexes and a pair count only; deletes are ignored.
    AppendOnly,
    /// Emitted rows kept, capped. At the cap new matches stop emitting
    /// and the statistics flag trips; retractions keep working.
    Materialized { max_results: usize },
    /// Joined rows handed to a paginated external sink.
    External(Box<dyn JoinSink>),
}

/// Column mapping applied to each matched pair: `(source column, output
/// column)` per side. A missing side fills its columns with NULL, which
/// is also how outer-join null extension is produced.
#[derive(Debug, Clone, Default)]
pub struct JoinProjector {
    pub left: Vec<(SmolStr, SmolStr)>,
    pub right: Vec<(SmolStr, SmolStr)>,
}

impl JoinProjector {
    /// Qualify every column with its relation alias: the projector used
    /// between pipeline stages, where the final SELECT runs later.
    pub fn qualify(
        left_alias: &str,
        left_cols: &[SmolStr],
        right_alias: &str,
        right_cols: &[SmolStr],
    ) -> Self {
        let qualify_side = |alias: &str, cols: &[SmolStr]| {
            cols.iter()
                .map(|c| {
                    let out = if c.contains('.') {
                        // Already qualified by an upstream join.
                        c.clone()
                    } else {
                        SmolStr::new(format!("{}.{}", alias, c))
                    };
                    (c.clone(), out)
                })
                .collect()
        };
        JoinProjector {
            left: qualify_side(left_alias, left_cols),
            right: qualify_side(right_alias, right_cols),
        }
    }

    pub fn project(&self, left: Option<&Row>, right: Option<&Row>) -> Row {
        let mut out = Row::with_capacity(self.left.len() + self.right.len());
        for (src, name) in &self.left {
            let v = left
                .and_then(|r| r.get(src.as_str()).cloned())
                .unwrap_or(Value::Null);
            out.set(name.clone(), v);
        }
        for (src, name) in &self.right {
            let v = right
                .and_then(|r| r.get(src.as_str()).cloned())
                .unwrap_or(Value::Null);
            out.set(name.clone(), v);
        }
        out
    }
}

struct IndexEntry {
    key: RowKey,
    jkey: SmolStr,
    row: Row,
    weight: Weight,
}

#[derive(Default)]
struct JoinIndex {
    buckets: FastMap<u64, Vec<IndexEntry>>,
    rows: usize,
}

impl JoinIndex {
    fn insert(&mut self, hash: u64, key: &RowKey, jkey: &SmolStr, row: &Row, weight: Weight) {
        let bucket = self.buckets.entry(hash).or_default();
        if let Some(e) = bucket.iter_mut().find(|e| e.key == *key) {
            e.weight += weight;
            if e.weight <= 0 {
                bucket.retain(|e| e.key != *key);
                self.rows -= 1;
                if bucket.is_empty() {
                    self.buckets.remove(&hash);
                }
            }
        } else if weight > 0 {
            bucket.push(IndexEntry {
                key: key.clone(),
                jkey: jkey.clone(),
                row: row.clone(),
                weight,
            });
            self.rows += 1;
        }
    }

    /// Collect matches for a join key; the clone releases the borrow so
    /// emission can mutate the operator.
    fn matches(&self, hash: u64, jkey: &str) -> Vec<(RowKey, Row, Weight)> {
        match self.buckets.get(&hash) {
            Some(bucket) => bucket
                .iter()
                .filter(|e| e.jkey.as_str() == jkey)
                .map(|e| (e.key.clone(), e.row.clone(), e.weight))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Per-row outer-join bookkeeping: the null-extended row exists exactly
/// while the row is present with zero matches.
struct OuterState {
    present: Weight,
    matches: Weight,
    null_emitted: bool,
    row: Row,
}

pub struct JoinOp {
    kind: JoinKind,
    mode: JoinMode,
    /// Join-key expressions; None is a constant key (cross join).
    left_key: Option<Expr>,
    right_key: Option<Expr>,
    /// Non-equality residue of the ON clause, evaluated per candidate
    /// pair over the projected row.
    residual: Option<Expr>,
    projector: JoinProjector,

    left: JoinIndex,
    right: JoinIndex,
    left_outer: FastMap<RowKey, OuterState>,
    right_outer: FastMap<RowKey, OuterState>,
    /// Materialized-mode result store.
    emitted: FastMap<RowKey, Weight>,
    pair_count: i64,
    at_capacity: bool,
    faults: FaultFlag,
}

impl JoinOp {
    pub fn new(
        kind: JoinKind,
        mode: JoinMode,
        left_key: Option<Expr>,
        right_key: Option<Expr>,
        residual: Option<Expr>,
        projector: JoinProjector,
    ) -> Self {
        JoinOp {
            kind,
            mode,
            left_key,
            right_key,
            residual,
            projector,
            left: JoinIndex::default(),
            right: JoinIndex::default(),
            left_outer: FastMap::default(),
            right_outer: FastMap::default(),
            emitted: FastMap::default(),
            pair_count: 0,
            at_capacity: false,
            faults: FaultFlag::new("join"),
        }
    }

    pub fn inner(left_key: Expr, right_key: Expr, projector: JoinProjector) -> Self {
        JoinOp::new(
            JoinKind::Inner,
            JoinMode::Materialized {
                max_results: usize::MAX,
            },
            Some(left_key),
            Some(right_key),
            None,
            projector,
        )
    }

    pub fn pair_count(&self) -> i64 {
        self.pair_count
    }

    pub fn at_capacity(&self) -> bool {
        self.at_capacity
    }

    fn join_key(&self, row: &Row, expr: &Option<Expr>) -> Option<(u64, SmolStr)> {
        let value = match expr {
            Some(e) => {
                let ctx = EvalCtx::with_faults(row, &self.faults);
                let v = eval_expr(e, &ctx);
                if v.is_null() {
                    // NULL never equi-matches.
                    return None;
                }
                v
            }
            None => Value::Int(0),
        };
        let repr = value.key_repr();
        let mut hasher = FxHasher::default();
        hasher.write(repr.as_bytes());
        Some((hasher.finish(), repr))
    }

    fn residual_passes(&self, merged: &Row) -> bool {
        match &self.residual {
            Some(pred) => {
                let ctx = EvalCtx::with_faults(merged, &self.faults);
                eval_predicate(pred, &ctx) == Some(true)
            }
            None => true,
        }
    }

    fn pair_key(lkey: &str, rkey: &str) -> RowKey {
        SmolStr::new(format!("{}{}{}", lkey, PAIR_SEP, rkey))
    }

    fn tracks_left(&self) -> bool {
        matches!(self.kind, JoinKind::Left | JoinKind::Full)
    }

    fn tracks_right(&self) -> bool {
        matches!(self.kind, JoinKind::Right | JoinKind::Full)
    }

    /// Pass an emission through the mode's result policy; false means the
    /// materialized cap swallowed it (or its insert was swallowed before).
    fn record(&mut self, key: &RowKey, weight: Weight) -> bool {
        match &mut self.mode {
            JoinMode::AppendOnly | JoinMode::External(_) => true,
            JoinMode::Materialized { max_results } => {
                let existing = self.emitted.contains_key(key);
                if !existing {
                    if weight <= 0 {
                        return false;
                    }
                    if self.emitted.len() >= *max_results {
                        self.at_capacity = true;
                        return false;
                    }
                }
                let w = self.emitted.entry(key.clone()).or_insert(0);
                *w += weight;
                if *w <= 0 {
                    self.emitted.remove(key);
                }
                true
            }
        }
    }

    fn emit_pair(
        &mut self,
        out: &mut ZSet,
        dedup: &mut FastSet<RowKey>,
        lkey: &str,
        lrow: &Row,
        rkey: &str,
        rrow: &Row,
        jkey: &str,
        weight: Weight,
    ) {
        let pair = Self::pair_key(lkey, rkey);
        if weight > 0 && !dedup.insert(pair.clone()) {
            return;
        }
        if self.record(&pair, weight) {
            self.pair_count += weight;
            if weight > 0 {
                if let JoinMode::External(sink) = &mut self.mode {
                    sink.add(lrow, rrow, jkey);
                }
            }
            out.push(pair, self.projector.project(Some(lrow), Some(rrow)), weight);
        }
    }

    /// Apply presence/match-count changes for a row on a null-extending
    /// side and emit the null-row transition when it crosses.
    fn outer_update(
        &mut self,
        out: &mut ZSet,
        left_side: bool,
        key: &str,
        row: &Row,
        d_present: Weight,
        d_matches: Weight,
    ) {
        let tracked = if left_side {
            self.tracks_left()
        } else {
            self.tracks_right()
        };
        if !tracked {
            return;
        }
        let states = if left_side {
            &mut self.left_outer
        } else {
            &mut self.right_outer
        };
        let state = states.entry(SmolStr::new(key)).or_insert_with(|| OuterState {
            present: 0,
            matches: 0,
            null_emitted: false,
            row: row.clone(),
        });
        state.present += d_present;
        state.matches += d_matches;
        if d_present > 0 {
            state.row = row.clone();
        }
        let desired = state.present > 0 && state.matches <= 0;
        let flip = if desired && !state.null_emitted {
            state.null_emitted = true;
            Some(1)
        } else if !desired && state.null_emitted {
            state.null_emitted = false;
            Some(-1)
        } else {
            None
        };
        let gone = state.present <= 0 && !state.null_emitted;
        let null_row = flip.map(|_| state.row.clone());
        if gone {
            let k = SmolStr::new(key);
            if left_side {
                self.left_outer.remove(&k);
            } else {
                self.right_outer.remove(&k);
            }
        }
        if let Some(w) = flip {
            let null_key = if left_side {
                Self::pair_key(key, NULL_SIDE)
            } else {
                Self::pair_key(NULL_SIDE, key)
            };
            let projected = if left_side {
                self.projector.project(Some(&null_row.unwrap_or_else(|| row.clone())), None)
            } else {
                self.projector.project(None, Some(&null_row.unwrap_or_else(|| row.clone())))
            };
            if self.record(&null_key, w) {
                out.push(null_key, projected, w);
            }
        }
    }
}

impl StatefulOperator for JoinOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        let (dl, dr) = (inputs[0], inputs[1]);
        let mut out = ZSet::new();
        let mut dedup: FastSet<RowKey> = FastSet::default();
        let append_only = matches!(self.mode, JoinMode::AppendOnly);

        // Phase A: ΔR against the pre-step left index.
        let mut right_inserts: Vec<(u64, RowKey, SmolStr, Row, Weight)> = Vec::new();
        for (rkey, rrow, w) in dr.iter() {
            if w < 0 && append_only {
                continue;
            }
            let keyed = self.join_key(rrow, &self.right_key);
            let mut matched_lw = 0;
            if let Some((hash, jkey)) = &keyed {
                if w < 0 {
                    self.right.insert(*hash, rkey, jkey, rrow, w);
                }
                for (lkey, lrow, lw) in self.left.matches(*hash, jkey) {
                    let merged = self.projector.project(Some(&lrow), Some(rrow));
                    if !self.residual_passes(&merged) {
                        continue;
                    }
                    matched_lw += lw;
                    self.outer_update(&mut out, true, &lkey, &lrow, 0, w);
                    self.emit_pair(&mut out, &mut dedup, &lkey, &lrow, rkey, rrow, jkey, lw * w);
                }
                if w > 0 {
                    right_inserts.push((*hash, rkey.clone(), jkey.clone(), rrow.clone(), w));
                }
            }
            // Presence change for the right row itself (NULL-keyed rows
            // included: they are present and unmatched).
            let d_matches = if w > 0 { matched_lw } else { 0 };
            self.outer_update(&mut out, false, rkey, rrow, w, d_matches);
        }

        // Phase B: ΔR positives enter the right index.
        for (hash, key, jkey, row, w) in right_inserts {
            self.right.insert(hash, &key, &jkey, &row, w);
        }

        // Phase C: ΔL against the now-updated right index; positives
        // enter the left index afterwards (phase D, inlined).
        for (lkey, lrow, w) in dl.iter() {
            if w < 0 && append_only {
                continue;
            }
            let keyed = self.join_key(lrow, &self.left_key);
            let mut matched_rw = 0;
            if let Some((hash, jkey)) = &keyed {
                if w < 0 {
                    self.left.insert(*hash, lkey, jkey, lrow, w);
                }
                for (rkey, rrow, rw) in self.right.matches(*hash, jkey) {
                    let merged = self.projector.project(Some(lrow), Some(&rrow));
                    if !self.residual_passes(&merged) {
                        continue;
                    }
                    matched_rw += rw;
                    self.outer_update(&mut out, false, &rkey, &rrow, 0, w);
                    self.emit_pair(&mut out, &mut dedup, lkey, lrow, &rkey, &rrow, jkey, w * rw);
                }
                if w > 0 {
                    self.left.insert(*hash, lkey, jkey, lrow, w);
                }
            }
            let d_matches = if w > 0 { matched_rw } else { 0 };
            self.outer_update(&mut out, true, lkey, lrow, w, d_matches);
        }

        out
    }

    fn reset(&mut self) {
        self.left = JoinIndex::default();
        self.right = JoinIndex::default();
        self.left_outer.clear();
        self.right_outer.clear();
        self.emitted.clear();
        self.pair_count = 0;
        self.at_capacity = false;
        if let JoinMode::External(sink) = &mut self.mode {
            sink.dispose();
        }
    }

    fn stats(&self) -> Option<serde_json::Value> {
        Some(json!({
            "operator": "join",
            "pair_count": self.pair_count,
            "left_index_rows": self.left.rows,
            "right_index_rows": self.right.rows,
            "materialized_rows": self.emitted.len(),
            "at_capacity": self.at_capacity,
            "faults": self.faults.count(),
        }))
    }
}

#[cfg(test)]
mod join_tests {
    use super::*;
    use serde_json::json;

    fn delta(rows: &[(&str, serde_json::Value, Weight)]) -> ZSet {
        ZSet::from_entries(
            rows.iter()
                .map(|(k, v, w)| (SmolStr::new(*k), Row::from(v.clone()), *w)),
        )
    }

    fn projector() -> JoinProjector {
        JoinProjector {
            left: vec![("id".into(), "l.id".into()), ("k".into(), "l.k".into())],
            right: vec![("id".into(), "r.id".into()), ("k".into(), "r.k".into())],
        }
    }

    fn inner_join() -> JoinOp {
        JoinOp::inner(Expr::col("k"), Expr::col("k"), projector())
    }

    #[test]
    fn matches_across_steps() {
        let mut op = inner_join();
        let l = delta(&[("l1", json!({"id": 1, "k": "a"}), 1)]);
        let out = op.eval(&[&l, &ZSet::new()]);
        assert!(out.is_empty());

        let r = delta(&[("r1", json!({"id": 2, "k": "a"}), 1)]);
        let out = op.eval(&[&ZSet::new(), &r]);
        assert_eq!(out.len(), 1);
        let (_, row, w) = out.iter().next().map(|(k, r, w)| (k.clone(), r.clone(), w)).unwrap();
        assert_eq!(w, 1);
        assert_eq!(row.get("l.id"), Some(&Value::Int(1)));
        assert_eq!(row.get("r.id"), Some(&Value::Int(2)));
    }

    #[test]
    fn same_step_new_meets_new_counted_once() {
        let mut op = inner_join();
        let l = delta(&[("l1", json!({"id": 1, "k": "a"}), 1)]);
        let r = delta(&[("r1", json!({"id": 2, "k": "a"}), 1)]);
        let out = op.eval(&[&l, &r]);
        assert_eq!(out.consolidated().len(), 1);
        assert_eq!(op.pair_count(), 1);
    }

    #[test]
    fn delete_retracts_pairs() {
        let mut op = inner_join();
        let l = delta(&[("l1", json!({"id": 1, "k": "a"}), 1)]);
        let r = delta(&[
            ("r1", json!({"id": 2, "k": "a"}), 1),
            ("r2", json!({"id": 3, "k": "a"}), 1),
        ]);
        op.eval(&[&l, &r]);
        assert_eq!(op.pair_count(), 2);

        let out = op.eval(&[&delta(&[("l1", json!({"id": 1, "k": "a"}), -1)]), &ZSet::new()]);
        let total: Weight = out.iter().map(|(_, _, w)| w).sum();
        assert_eq!(total, -2);
        assert_eq!(op.pair_count(), 0);
    }

    #[test]
    fn left_outer_null_row_transitions() {
        let mut op = JoinOp::new(
            JoinKind::Left,
            JoinMode::Materialized {
                max_results: usize::MAX,
            },
            Some(Expr::col("k")),
            Some(Expr::col("k")),
            None,
            projector(),
        );
        // Unmatched left row: null-extended immediately.
        let l = delta(&[("l1", json!({"id": 1, "k": "a"}), 1)]);
        let out = op.eval(&[&l, &ZSet::new()]);
        assert_eq!(out.len(), 1);
        let (_, row, w) = out.iter().next().map(|(k, r, w)| (k.clone(), r.clone(), w)).unwrap();
        assert_eq!(w, 1);
        assert_eq!(row.get("r.id"), Some(&Value::Null));

        // First match retracts the null row and asserts the pair.
        let r = delta(&[("r1", json!({"id": 2, "k": "a"}), 1)]);
        let out = op.eval(&[&ZSet::new(), &r]);
        assert_eq!(out.len(), 2);
        let weights: Vec<Weight> = out.iter().map(|(_, _, w)| w).collect();
        assert!(weights.contains(&-1) && weights.contains(&1));

        // Match disappears: null row comes back, exactly once.
        let out = op.eval(&[&ZSet::new(), &delta(&[("r1", json!({"id": 2, "k": "a"}), -1)])]);
        assert_eq!(out.len(), 2);
        let null_reasserts: Vec<_> = out
            .iter()
            .filter(|(_, row, w)| *w > 0 && row.get("r.id") == Some(&Value::Null))
            .collect();
        assert_eq!(null_reasserts.len(), 1);
    }

    #[test]
    fn append_only_ignores_deletes() {
        let mut op = JoinOp::new(
            JoinKind::Inner,
            JoinMode::AppendOnly,
            Some(Expr::col("k")),
            Some(Expr::col("k")),
            None,
            projector(),
        );
        let l = delta(&[("l1", json!({"id": 1, "k": "a"}), 1)]);
        let r = delta(&[("r1", json!({"id": 2, "k": "a"}), 1)]);
        op.eval(&[&l, &r]);
        let out = op.eval(&[&delta(&[("l1", json!({"id": 1, "k": "a"}), -1)]), &ZSet::new()]);
        assert!(out.is_empty());
        assert_eq!(op.pair_count(), 1);
    }

    #[test]
    fn materialized_cap_stops_new_matches() {
        let mut op = JoinOp::new(
            JoinKind::Inner,
            JoinMode::Materialized { max_results: 1 },
            Some(Expr::col("k")),
            Some(Expr::col("k")),
            None,
            projector(),
        );
        let l = delta(&[
            ("l1", json!({"id": 1, "k": "a"}), 1),
            ("l2", json!({"id": 2, "k": "a"}), 1),
        ]);
        let r = delta(&[("r1", json!({"id": 9, "k": "a"}), 1)]);
        let out = op.eval(&[&l, &r]);
        assert_eq!(out.len(), 1);
        assert!(op.at_capacity());

        // The recorded pair still retracts correctly.
        let out = op.eval(&[&delta(&[("l1", json!({"id": 1, "k": "a"}), -1)]), &ZSet::new()]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.iter().next().map(|(_, _, w)| w), Some(-1));
    }

    #[test]
    fn residual_between_filters_pairs() {
        let mut op = JoinOp::new(
            JoinKind::Inner,
            JoinMode::Materialized {
                max_results: usize::MAX,
            },
            Some(Expr::col("k")),
            Some(Expr::col("k")),
            Some(Expr::Between {
                expr: Box::new(Expr::col("r.id")),
                low: Box::new(Expr::col("l.id")),
                high: Box::new(Expr::lit(5i64)),
                negated: false,
            }),
            projector(),
        );
        let l = delta(&[("l1", json!({"id": 1, "k": "a"}), 1)]);
        let r = delta(&[
            ("r1", json!({"id": 3, "k": "a"}), 1),
            ("r2", json!({"id": 9, "k": "a"}), 1),
        ]);
        let out = op.eval(&[&l, &r]);
        assert_eq!(out.len(), 1);
    }
}
