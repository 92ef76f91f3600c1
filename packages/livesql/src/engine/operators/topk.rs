//! `ORDER BY … LIMIT n OFFSET k` as a bounded sorted buffer with
//! differential emission: after each step the `[k, k+n)` window is
//! re-extracted and only its difference against the previous window is
//! emitted.

use crate::engine::circuit::StatefulOperator;
use crate::engine::eval::compare_rows_by;
use crate::engine::types::{FastMap, Row, RowKey, ZSet};
use crate::sql::ast::Expr;
use serde_json::json;

const MIN_BUFFER: usize = 500;

pub struct TopKOp {
    order_by: Vec<(Expr, bool)>,
    limit: usize,
    offset: usize,
    cap: usize,
    buffer: Vec<(RowKey, Row)>,
    emitted: FastMap<RowKey, Row>,
    /// Set when deletions may have exposed rows already evicted from the
    /// bounded buffer; the window can under-fill from then on.
    underflow: bool,
}

impl TopKOp {
    pub fn new(order_by: Vec<(Expr, bool)>, limit: usize, offset: usize) -> Self {
        let cap = (3 * (limit + offset)).max(MIN_BUFFER);
        TopKOp {
            order_by,
            limit,
            offset,
            cap,
            buffer: Vec::new(),
            emitted: FastMap::default(),
            underflow: false,
        }
    }

    fn position_for(&self, row: &Row, key: &RowKey) -> usize {
        self.buffer
            .binary_search_by(|(probe_key, probe_row)| {
                compare_rows_by(probe_row, row, &self.order_by)
                    .then_with(|| probe_key.cmp(key))
            })
            .unwrap_or_else(|p| p)
    }
}

impl StatefulOperator for TopKOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        for (key, row, weight) in inputs[0].iter() {
            if weight > 0 {
                let pos = self.position_for(row, key);
                self.buffer.insert(pos, (key.clone(), row.clone()));
                if self.buffer.len() > self.cap {
                    self.buffer.pop();
                }
            } else if weight < 0 {
                if let Some(pos) = self.buffer.iter().position(|(k, _)| k == key) {
                    self.buffer.remove(pos);
                    if self.buffer.len() + 1 >= self.cap {
                        self.underflow = true;
                    }
                }
            }
        }

        let lo = self.offset.min(self.buffer.len());
        let hi = (self.offset + self.limit).min(self.buffer.len());
        let window = &self.buffer[lo..hi];

        let mut out = ZSet::new();
        let mut next: FastMap<RowKey, Row> = FastMap::default();
        for (key, row) in window {
            next.insert(key.clone(), row.clone());
            match self.emitted.get(key) {
                Some(old) if old == row => {}
                Some(old) => {
                    out.push(key.clone(), old.clone(), -1);
                    out.push(key.clone(), row.clone(), 1);
                }
                None => out.push(key.clone(), row.clone(), 1),
            }
        }
        for (key, old) in &self.emitted {
            if !next.contains_key(key) {
                out.push(key.clone(), old.clone(), -1);
            }
        }
        self.emitted = next;
        out
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.emitted.clear();
        self.underflow = false;
    }

    fn stats(&self) -> Option<serde_json::Value> {
        Some(json!({
            "operator": "top_k",
            "buffered": self.buffer.len(),
            "emitted": self.emitted.len(),
            "underflow": self.underflow,
        }))
    }
}

#[cfg(test)]
mod topk_tests {
    use super::*;
    use crate::engine::types::{Value, Weight};
    use serde_json::json;
    use smol_str::SmolStr;

    fn delta(rows: &[(&str, i64, Weight)]) -> ZSet {
        ZSet::from_entries(
            rows.iter()
                .map(|(k, v, w)| (SmolStr::new(*k), Row::from(json!({"v": v})), *w)),
        )
    }

    fn top3_desc() -> TopKOp {
        TopKOp::new(vec![(Expr::col("v"), true)], 3, 0)
    }

    fn window_values(op: &TopKOp) -> Vec<i64> {
        let mut vals: Vec<i64> = op
            .emitted
            .values()
            .map(|r| r.get("v").and_then(Value::as_i64).unwrap())
            .collect();
        vals.sort_unstable_by(|a, b| b.cmp(a));
        vals
    }

    #[test]
    fn maintains_top_three() {
        let mut op = top3_desc();
        for (i, v) in [5, 2, 8, 1, 9, 4, 7].iter().enumerate() {
            op.eval(&[&delta(&[(&format!("r{i}"), *v, 1)])]);
        }
        assert_eq!(window_values(&op), vec![9, 8, 7]);
    }

    #[test]
    fn emits_only_window_difference() {
        let mut op = top3_desc();
        op.eval(&[&delta(&[("a", 5, 1), ("b", 2, 1), ("c", 8, 1)])]);
        // 9 enters, 2 leaves: exactly one insert and one retract.
        let out = op.eval(&[&delta(&[("d", 9, 1)])]);
        let mut weights: Vec<Weight> = out.iter().map(|(_, _, w)| w).collect();
        weights.sort_unstable();
        assert_eq!(weights, vec![-1, 1]);
    }

    #[test]
    fn delete_pulls_in_replacement() {
        let mut op = top3_desc();
        op.eval(&[&delta(&[
            ("a", 5, 1),
            ("b", 2, 1),
            ("c", 8, 1),
            ("d", 9, 1),
        ])]);
        assert_eq!(window_values(&op), vec![9, 8, 5]);
        let out = op.eval(&[&delta(&[("d", 9, -1)])]);
        assert_eq!(window_values(&op), vec![8, 5, 2]);
        assert!(out.iter().any(|(k, _, w)| k.as_str() == "d" && w < 0));
        assert!(out.iter().any(|(k, _, w)| k.as_str() == "b" && w > 0));
    }

    #[test]
    fn offset_shifts_window() {
        let mut op = TopKOp::new(vec![(Expr::col("v"), true)], 2, 1);
        op.eval(&[&delta(&[("a", 10, 1), ("b", 20, 1), ("c", 30, 1)])]);
        assert_eq!(window_values(&op), vec![20, 10]);
    }
}
