//! Global and grouped aggregation with per-group accumulators.
//!
//! Every delta entry folds into the group's accumulators with its weight;
//! each affected group then retracts its previously emitted row and
//! asserts the new one. MIN/MAX keep the full value multiset because a
//! retracted maximum cannot be recovered from running totals.

use crate::engine::circuit::StatefulOperator;
use crate::engine::eval::{eval_expr, eval_predicate, EvalCtx, FaultFlag};
use crate::engine::types::{FastMap, OrdValue, Row, RowKey, Value, Weight, ZSet, KEY_SEP};
use crate::sql::ast::Expr;
use serde_json::json;
use smol_str::SmolStr;
use std::collections::BTreeMap;

const GLOBAL_KEY: &str = "<global>";

#[derive(Debug, Clone)]
pub enum AggKind {
    CountStar,
    Count { expr: Expr, distinct: bool },
    Sum { expr: Expr, distinct: bool },
    Avg { expr: Expr, distinct: bool },
    Min { expr: Expr },
    Max { expr: Expr },
}

#[derive(Debug, Clone)]
pub struct AggSpec {
    /// Output column carrying this aggregate's value.
    pub name: SmolStr,
    pub kind: AggKind,
}

/// Running numeric total that stays integral until a float is seen.
#[derive(Debug, Default, Clone)]
struct SumState {
    int: i64,
    float: f64,
    saw_float: bool,
    non_null: Weight,
}

impl SumState {
    fn apply(&mut self, v: &Value, w: Weight) {
        match v {
            Value::Int(i) => {
                self.int += i * w;
                self.non_null += w;
            }
            Value::Float(f) => {
                self.float += f * (w as f64);
                self.saw_float = true;
                self.non_null += w;
            }
            _ => {}
        }
    }

    fn sum(&self) -> Value {
        if self.non_null <= 0 {
            Value::Null
        } else if self.saw_float {
            Value::Float(self.int as f64 + self.float)
        } else {
            Value::Int(self.int)
        }
    }

    fn avg(&self) -> Value {
        if self.non_null <= 0 {
            Value::Null
        } else {
            Value::Float((self.int as f64 + self.float) / self.non_null as f64)
        }
    }
}

enum Acc {
    CountStar,
    Count { non_null: Weight },
    Sum(SumState),
    Avg(SumState),
    MinMax { min: bool, values: BTreeMap<OrdValue, Weight> },
    /// Weighted value map; positive-weight entries are the distinct set.
    Distinct { values: BTreeMap<OrdValue, Weight> },
}

impl Acc {
    fn new(kind: &AggKind) -> Self {
        match kind {
            AggKind::CountStar => Acc::CountStar,
            AggKind::Count { distinct: true, .. }
            | AggKind::Sum { distinct: true, .. }
            | AggKind::Avg { distinct: true, .. } => Acc::Distinct {
                values: BTreeMap::new(),
            },
            AggKind::Count { .. } => Acc::Count { non_null: 0 },
            AggKind::Sum { .. } => Acc::Sum(SumState::default()),
            AggKind::Avg { .. } => Acc::Avg(SumState::default()),
            AggKind::Min { .. } => Acc::MinMax {
                min: true,
                values: BTreeMap::new(),
            },
            AggKind::Max { .. } => Acc::MinMax {
                min: false,
                values: BTreeMap::new(),
            },
        }
    }

    fn apply(&mut self, v: &Value, w: Weight) {
        match self {
            Acc::CountStar => {}
            Acc::Count { non_null } => {
                if !v.is_null() {
                    *non_null += w;
                }
            }
            Acc::Sum(s) | Acc::Avg(s) => s.apply(v, w),
            Acc::MinMax { values, .. } | Acc::Distinct { values } => {
                if !v.is_null() {
                    let slot = values.entry(OrdValue(v.clone())).or_insert(0);
                    *slot += w;
                    if *slot == 0 {
                        values.remove(&OrdValue(v.clone()));
                    }
                }
            }
        }
    }

    fn value(&self, kind: &AggKind, group_count: Weight) -> Value {
        match self {
            Acc::CountStar => Value::Int(group_count.max(0)),
            Acc::Count { non_null } => Value::Int((*non_null).max(0)),
            Acc::Sum(s) => s.sum(),
            Acc::Avg(s) => s.avg(),
            Acc::MinMax { min, values } => {
                let mut present = values.iter().filter(|(_, w)| **w > 0);
                let found = if *min {
                    present.next()
                } else {
                    present.next_back()
                };
                found.map(|(v, _)| v.0.clone()).unwrap_or(Value::Null)
            }
            Acc::Distinct { values } => {
                let present = values.iter().filter(|(_, w)| **w > 0);
                match kind {
                    AggKind::Count { .. } => Value::Int(present.count() as i64),
                    AggKind::Sum { .. } | AggKind::Avg { .. } => {
                        let mut sum = SumState::default();
                        let mut n = 0i64;
                        for (v, _) in present {
                            sum.apply(&v.0, 1);
                            n += 1;
                        }
                        if matches!(kind, AggKind::Sum { .. }) {
                            sum.sum()
                        } else if n > 0 {
                            sum.avg()
                        } else {
                            Value::Null
                        }
                    }
                    _ => Value::Null,
                }
            }
        }
    }
}

struct Group {
    key_values: Vec<Value>,
    count: Weight,
    accs: Vec<Acc>,
    /// The row currently visible downstream; None when HAVING suppressed
    /// the group or nothing was emitted yet.
    last: Option<Row>,
}

pub struct AggregateOp {
    /// `(output column, grouping expression)`; empty means global.
    group_by: Vec<(SmolStr, Expr)>,
    aggs: Vec<AggSpec>,
    /// Evaluated over the aggregated row with `AggRef` slots bound.
    having: Option<Expr>,
    groups: FastMap<RowKey, Group>,
    faults: FaultFlag,
}

impl AggregateOp {
    pub fn new(group_by: Vec<(SmolStr, Expr)>, aggs: Vec<AggSpec>, having: Option<Expr>) -> Self {
        AggregateOp {
            group_by,
            aggs,
            having,
            groups: FastMap::default(),
            faults: FaultFlag::new("aggregate"),
        }
    }

    fn group_key(&self, values: &[Value]) -> RowKey {
        if values.is_empty() {
            return SmolStr::new_static(GLOBAL_KEY);
        }
        let mut out = String::new();
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                out.push(KEY_SEP);
            }
            out.push_str(v.key_repr().as_str());
        }
        SmolStr::new(out)
    }

    fn output_row(&self, group: &Group) -> (Row, Vec<Value>) {
        let mut row = Row::with_capacity(self.group_by.len() + self.aggs.len());
        for ((name, _), v) in self.group_by.iter().zip(&group.key_values) {
            row.set(name.clone(), v.clone());
        }
        let mut agg_values = Vec::with_capacity(self.aggs.len());
        for (spec, acc) in self.aggs.iter().zip(&group.accs) {
            let v = acc.value(&spec.kind, group.count);
            row.set(spec.name.clone(), v.clone());
            agg_values.push(v);
        }
        (row, agg_values)
    }

    fn passes_having(&self, row: &Row, agg_values: &[Value]) -> bool {
        match &self.having {
            Some(pred) => {
                let ctx = EvalCtx {
                    row,
                    scalars: &[],
                    aggs: agg_values,
                    faults: Some(&self.faults),
                };
                eval_predicate(pred, &ctx) == Some(true)
            }
            None => true,
        }
    }
}

impl StatefulOperator for AggregateOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        let mut touched: Vec<RowKey> = Vec::new();

        for (_, row, weight) in inputs[0].iter() {
            let ctx = EvalCtx::with_faults(row, &self.faults);
            let key_values: Vec<Value> = self
                .group_by
                .iter()
                .map(|(_, e)| eval_expr(e, &ctx))
                .collect();
            let key = self.group_key(&key_values);
            if !touched.contains(&key) {
                touched.push(key.clone());
            }

            let aggs = &self.aggs;
            let group = self.groups.entry(key).or_insert_with(|| Group {
                key_values,
                count: 0,
                accs: aggs.iter().map(|s| Acc::new(&s.kind)).collect(),
                last: None,
            });
            group.count += weight;
            for (spec, acc) in self.aggs.iter().zip(group.accs.iter_mut()) {
                let arg = match &spec.kind {
                    AggKind::CountStar => Value::Null,
                    AggKind::Count { expr, .. }
                    | AggKind::Sum { expr, .. }
                    | AggKind::Avg { expr, .. }
                    | AggKind::Min { expr }
                    | AggKind::Max { expr } => eval_expr(expr, &ctx),
                };
                acc.apply(&arg, weight);
            }
        }

        let mut out = ZSet::new();
        for key in touched {
            let Some(group) = self.groups.get(&key) else { continue };
            if group.count <= 0 {
                if let Some(group) = self.groups.remove(&key) {
                    if let Some(old) = group.last {
                        out.push(key.clone(), old, -1);
                    }
                }
                continue;
            }
            let (row, agg_values) = self.output_row(group);
            let visible = self.passes_having(&row, &agg_values);
            let Some(group) = self.groups.get_mut(&key) else { continue };
            match (&group.last, visible) {
                (Some(old), true) if *old == row => {}
                (Some(old), true) => {
                    out.push(key.clone(), old.clone(), -1);
                    out.push(key.clone(), row.clone(), 1);
                    group.last = Some(row);
                }
                (Some(old), false) => {
                    // HAVING now fails: only the retract, symmetric with
                    // the suppressed assert.
                    out.push(key.clone(), old.clone(), -1);
                    group.last = None;
                }
                (None, true) => {
                    out.push(key.clone(), row.clone(), 1);
                    group.last = Some(row);
                }
                (None, false) => {}
            }
        }
        out
    }

    fn reset(&mut self) {
        self.groups.clear();
    }

    fn stats(&self) -> Option<serde_json::Value> {
        Some(json!({
            "operator": "aggregate",
            "groups": self.groups.len(),
            "faults": self.faults.count(),
        }))
    }
}

#[cfg(test)]
mod aggregate_tests {
    use super::*;
    use serde_json::json;

    fn delta(rows: &[(&str, serde_json::Value, Weight)]) -> ZSet {
        ZSet::from_entries(
            rows.iter()
                .map(|(k, v, w)| (SmolStr::new(*k), Row::from(v.clone()), *w)),
        )
    }

    fn sum_by_product() -> AggregateOp {
        AggregateOp::new(
            vec![("product".into(), Expr::col("product"))],
            vec![AggSpec {
                name: "total".into(),
                kind: AggKind::Sum {
                    expr: Expr::col("amount"),
                    distinct: false,
                },
            }],
            None,
        )
    }

    #[test]
    fn grouped_sum_retract_reassert() {
        let mut op = sum_by_product();
        let out = op.eval(&[&delta(&[
            ("1", json!({"product": "A", "amount": 50}), 1),
            ("2", json!({"product": "A", "amount": 60}), 1),
        ])]);
        assert_eq!(out.len(), 1);
        let (_, row, w) = out.iter().next().map(|(k, r, w)| (k.clone(), r.clone(), w)).unwrap();
        assert_eq!(w, 1);
        assert_eq!(row.get("total"), Some(&Value::Int(110)));

        let out = op.eval(&[&delta(&[("2", json!({"product": "A", "amount": 60}), -1)])]);
        assert_eq!(out.len(), 2);
        let mut weights: Vec<Weight> = out.iter().map(|(_, _, w)| w).collect();
        weights.sort_unstable();
        assert_eq!(weights, vec![-1, 1]);
        let new_total = out
            .iter()
            .find(|(_, _, w)| *w > 0)
            .and_then(|(_, r, _)| r.get("total").cloned());
        assert_eq!(new_total, Some(Value::Int(50)));
    }

    #[test]
    fn group_vanishes_at_zero_count() {
        let mut op = sum_by_product();
        op.eval(&[&delta(&[("1", json!({"product": "A", "amount": 50}), 1)])]);
        let out = op.eval(&[&delta(&[("1", json!({"product": "A", "amount": 50}), -1)])]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.iter().next().map(|(_, _, w)| w), Some(-1));
        let out = op.eval(&[&delta(&[("2", json!({"product": "B", "amount": 1}), 1)])]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn min_survives_retraction_of_max() {
        let mut op = AggregateOp::new(
            vec![],
            vec![
                AggSpec {
                    name: "lo".into(),
                    kind: AggKind::Min {
                        expr: Expr::col("v"),
                    },
                },
                AggSpec {
                    name: "hi".into(),
                    kind: AggKind::Max {
                        expr: Expr::col("v"),
                    },
                },
            ],
            None,
        );
        op.eval(&[&delta(&[
            ("1", json!({"v": 5}), 1),
            ("2", json!({"v": 9}), 1),
            ("3", json!({"v": 2}), 1),
        ])]);
        let out = op.eval(&[&delta(&[("2", json!({"v": 9}), -1)])]);
        let new_row = out
            .iter()
            .find(|(_, _, w)| *w > 0)
            .map(|(_, r, _)| r.clone())
            .unwrap();
        assert_eq!(new_row.get("lo"), Some(&Value::Int(2)));
        assert_eq!(new_row.get("hi"), Some(&Value::Int(5)));
    }

    #[test]
    fn count_distinct_round_trip() {
        let mut op = AggregateOp::new(
            vec![],
            vec![AggSpec {
                name: "n".into(),
                kind: AggKind::Count {
                    expr: Expr::col("c"),
                    distinct: true,
                },
            }],
            None,
        );
        op.eval(&[&delta(&[
            ("1", json!({"c": "x"}), 1),
            ("2", json!({"c": "x"}), 1),
            ("3", json!({"c": "y"}), 1),
        ])]);
        // Full retract then reinsert lands on the same value.
        op.eval(&[&delta(&[
            ("1", json!({"c": "x"}), -1),
            ("2", json!({"c": "x"}), -1),
            ("3", json!({"c": "y"}), -1),
        ])]);
        let out = op.eval(&[&delta(&[
            ("1", json!({"c": "x"}), 1),
            ("2", json!({"c": "x"}), 1),
            ("3", json!({"c": "y"}), 1),
        ])]);
        let row = out
            .iter()
            .find(|(_, _, w)| *w > 0)
            .map(|(_, r, _)| r.clone())
            .unwrap();
        assert_eq!(row.get("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn having_applies_to_retract_too() {
        let mut op = AggregateOp::new(
            vec![("product".into(), Expr::col("product"))],
            vec![AggSpec {
                name: "total".into(),
                kind: AggKind::Sum {
                    expr: Expr::col("amount"),
                    distinct: false,
                },
            }],
            Some(Expr::gt(Expr::AggRef(0), Expr::lit(100i64))),
        );
        // A:110 passes, C:200 passes, B:30 suppressed.
        let out = op.eval(&[&delta(&[
            ("1", json!({"product": "A", "amount": 50}), 1),
            ("2", json!({"product": "A", "amount": 60}), 1),
            ("3", json!({"product": "B", "amount": 30}), 1),
            ("4", json!({"product": "C", "amount": 200}), 1),
        ])]);
        assert_eq!(out.len(), 2);

        // A falls to 50: the 110 row retracts, nothing replaces it.
        let out = op.eval(&[&delta(&[("2", json!({"product": "A", "amount": 60}), -1)])]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.iter().next().map(|(_, _, w)| w), Some(-1));

        // A rises to 100: still under HAVING, nothing appears.
        let out = op.eval(&[&delta(&[("5", json!({"product": "A", "amount": 50}), 1)])]);
        assert!(out.is_empty());
    }
}
