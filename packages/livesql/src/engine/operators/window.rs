//! Partitioned window functions.
//!
//! Two execution paths. The general path keeps each partition as an
//! ordered row sequence, recomputes the partition's function columns on
//! any change and emits only the rows whose output differs from what was
//! last emitted. The streaming fast path applies when every function is
//! a running aggregate over a trailing frame, LAG without a default, or
//! ROW_NUMBER without ORDER BY: partition state collapses to running
//! accumulators plus a bounded ring buffer, and each new row emits an
//! insert only.

use crate::engine::circuit::StatefulOperator;
use crate::engine::eval::{compare_rows_by, eval_expr, EvalCtx, FaultFlag};
use crate::engine::types::{
    compare_values, FastMap, Row, RowKey, Value, Weight, ZSet, KEY_SEP,
};
use crate::sql::ast::{Expr, Frame, FrameBound, WindowFunc};
use serde_json::json;
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct WindowSpec {
    /// Output column carrying this function's value.
    pub name: SmolStr,
    pub func: WindowFunc,
    pub args: Vec<Expr>,
    pub frame: Option<Frame>,
}

pub struct WindowOp {
    partition_by: Vec<Expr>,
    order_by: Vec<(Expr, bool)>,
    specs: Vec<WindowSpec>,
    fast: bool,
    partitions: FastMap<RowKey, Partition>,
    /// General path: last emitted output per input row.
    emitted: FastMap<RowKey, Row>,
    faults: FaultFlag,
}

struct PartRow {
    key: RowKey,
    row: Row,
}

#[derive(Default)]
struct Partition {
    /// General path: sorted by ORDER BY key, row key as tiebreak.
    rows: Vec<PartRow>,
    /// Fast path accumulators, one per spec.
    accs: Vec<FastAcc>,
    seen: i64,
}

enum FastAcc {
    /// UNBOUNDED PRECEDING .. CURRENT ROW running aggregate.
    Running {
        sum: f64,
        non_null: i64,
        min: Option<Value>,
        max: Option<Value>,
    },
    /// N PRECEDING .. CURRENT ROW ring of the trailing frame.
    Ring {
        cap: usize,
        values: VecDeque<Value>,
        /// Monotonic deques for MIN/MAX: (insertion seq, value).
        mono_min: VecDeque<(i64, Value)>,
        mono_max: VecDeque<(i64, Value)>,
        seq: i64,
    },
    /// LAG without a default: last `offset + 1` values.
    Lag { offset: usize, ring: VecDeque<Value> },
    /// ROW_NUMBER without ORDER BY: the partition counter suffices.
    RowNum,
}

impl WindowOp {
    pub fn new(
        partition_by: Vec<Expr>,
        order_by: Vec<(Expr, bool)>,
        specs: Vec<WindowSpec>,
    ) -> Self {
        let fast = specs.iter().all(|s| Self::spec_is_streaming(s, &order_by));
        WindowOp {
            partition_by,
            order_by,
            specs,
            fast,
            partitions: FastMap::default(),
            emitted: FastMap::default(),
            faults: FaultFlag::new("window"),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.fast
    }

    fn spec_is_streaming(spec: &WindowSpec, order_by: &[(Expr, bool)]) -> bool {
        match spec.func {
            WindowFunc::Sum
            | WindowFunc::Avg
            | WindowFunc::Count
            | WindowFunc::Min
            | WindowFunc::Max => match spec.frame {
                None => true,
                Some(Frame {
                    start: FrameBound::UnboundedPreceding,
                    end: FrameBound::CurrentRow,
                })
                | Some(Frame {
                    start: FrameBound::Preceding(_),
                    end: FrameBound::CurrentRow,
                }) => true,
                _ => false,
            },
            // LAG qualifies only without a default value.
            WindowFunc::Lag => spec.args.len() <= 2,
            WindowFunc::RowNumber => order_by.is_empty(),
            _ => false,
        }
    }

    fn partition_key(&self, row: &Row) -> RowKey {
        if self.partition_by.is_empty() {
            return SmolStr::new_static("<all>");
        }
        let ctx = EvalCtx::with_faults(row, &self.faults);
        let mut out = String::new();
        for (i, e) in self.partition_by.iter().enumerate() {
            if i > 0 {
                out.push(KEY_SEP);
            }
            out.push_str(eval_expr(e, &ctx).key_repr().as_str());
        }
        SmolStr::new(out)
    }

    fn arg_value(&self, spec: &WindowSpec, row: &Row) -> Value {
        match spec.args.first() {
            Some(e) => {
                let ctx = EvalCtx::with_faults(row, &self.faults);
                eval_expr(e, &ctx)
            }
            None => Value::Int(1),
        }
    }

    // --- fast path -----------------------------------------------------

    fn fresh_accs(&self) -> Vec<FastAcc> {
        self.specs
            .iter()
            .map(|spec| match spec.func {
                WindowFunc::RowNumber => FastAcc::RowNum,
                WindowFunc::Lag => {
                    let offset = spec
                        .args
                        .get(1)
                        .and_then(|e| match e {
                            Expr::Literal(v) => v.as_i64(),
                            _ => None,
                        })
                        .unwrap_or(1)
                        .max(0) as usize;
                    FastAcc::Lag {
                        offset,
                        ring: VecDeque::with_capacity(offset + 1),
                    }
                }
                _ => match spec.frame {
                    Some(Frame {
                        start: FrameBound::Preceding(n),
                        ..
                    }) => FastAcc::Ring {
                        cap: n + 1,
                        values: VecDeque::with_capacity(n + 1),
                        mono_min: VecDeque::new(),
                        mono_max: VecDeque::new(),
                        seq: 0,
                    },
                    _ => FastAcc::Running {
                        sum: 0.0,
                        non_null: 0,
                        min: None,
                        max: None,
                    },
                },
            })
            .collect()
    }

    fn step_fast(&mut self, delta: &ZSet) -> ZSet {
        let mut out = ZSet::new();
        for (key, row, weight) in delta.iter() {
            // The streaming path is append-only; retractions are not
            // replayed into closed frames.
            if weight <= 0 {
                continue;
            }
            let pkey = self.partition_key(row);
            let arg_values: Vec<Value> = self
                .specs
                .iter()
                .map(|s| self.arg_value(s, row))
                .collect();
            let specs = &self.specs;
            let accs = self.fresh_accs();
            let part = self.partitions.entry(pkey).or_insert_with(|| Partition {
                rows: Vec::new(),
                accs,
                seen: 0,
            });
            part.seen += 1;

            let mut out_row = row.clone();
            for ((spec, acc), value) in specs.iter().zip(part.accs.iter_mut()).zip(&arg_values) {
                let result = match acc {
                    FastAcc::RowNum => Value::Int(part.seen),
                    FastAcc::Lag { offset, ring } => {
                        let lagged = if ring.len() >= *offset && *offset > 0 {
                            ring.get(ring.len() - *offset).cloned().unwrap_or(Value::Null)
                        } else if *offset == 0 {
                            value.clone()
                        } else {
                            Value::Null
                        };
                        ring.push_back(value.clone());
                        if ring.len() > *offset + 1 {
                            ring.pop_front();
                        }
                        lagged
                    }
                    FastAcc::Running {
                        sum,
                        non_null,
                        min,
                        max,
                    } => {
                        if !value.is_null() {
                            if let Some(f) = value.as_f64() {
                                *sum += f;
                            }
                            *non_null += 1;
                            let better_min = min
                                .as_ref()
                                .map(|m| compare_values(value, m) == Ordering::Less)
                                .unwrap_or(true);
                            if better_min {
                                *min = Some(value.clone());
                            }
                            let better_max = max
                                .as_ref()
                                .map(|m| compare_values(value, m) == Ordering::Greater)
                                .unwrap_or(true);
                            if better_max {
                                *max = Some(value.clone());
                            }
                        }
                        match spec.func {
                            WindowFunc::Sum => {
                                if *non_null > 0 {
                                    Value::Float(*sum)
                                } else {
                                    Value::Null
                                }
                            }
                            WindowFunc::Avg => {
                                if *non_null > 0 {
                                    Value::Float(*sum / *non_null as f64)
                                } else {
                                    Value::Null
                                }
                            }
                            WindowFunc::Count => {
                                if spec.args.is_empty() {
                                    Value::Int(part.seen)
                                } else {
                                    Value::Int(*non_null)
                                }
                            }
                            WindowFunc::Min => min.clone().unwrap_or(Value::Null),
                            WindowFunc::Max => max.clone().unwrap_or(Value::Null),
                            _ => Value::Null,
                        }
                    }
                    FastAcc::Ring {
                        cap,
                        values,
                        mono_min,
                        mono_max,
                        seq,
                    } => {
                        *seq += 1;
                        values.push_back(value.clone());
                        if values.len() > *cap {
                            values.pop_front();
                        }
                        if !value.is_null() {
                            while mono_min
                                .back()
                                .map(|(_, v)| compare_values(v, value) != Ordering::Less)
                                .unwrap_or(false)
                            {
                                mono_min.pop_back();
                            }
                            mono_min.push_back((*seq, value.clone()));
                            while mono_max
                                .back()
                                .map(|(_, v)| compare_values(v, value) != Ordering::Greater)
                                .unwrap_or(false)
                            {
                                mono_max.pop_back();
                            }
                            mono_max.push_back((*seq, value.clone()));
                        }
                        let window_start = *seq - *cap as i64 + 1;
                        while mono_min.front().map(|(s, _)| *s < window_start).unwrap_or(false) {
                            mono_min.pop_front();
                        }
                        while mono_max.front().map(|(s, _)| *s < window_start).unwrap_or(false) {
                            mono_max.pop_front();
                        }
                        frame_agg_over(spec, values.iter())
                            .unwrap_or_else(|| match spec.func {
                                WindowFunc::Min => {
                                    mono_min.front().map(|(_, v)| v.clone()).unwrap_or(Value::Null)
                                }
                                WindowFunc::Max => {
                                    mono_max.front().map(|(_, v)| v.clone()).unwrap_or(Value::Null)
                                }
                                _ => Value::Null,
                            })
                    }
                };
                out_row.set(spec.name.clone(), result);
            }
            out.push(key.clone(), out_row, 1);
        }
        out
    }

    // --- general path --------------------------------------------------

    fn step_general(&mut self, delta: &ZSet) -> ZSet {
        let mut affected: Vec<RowKey> = Vec::new();
        let mut removed: Vec<RowKey> = Vec::new();

        for (key, row, weight) in delta.iter() {
            let pkey = self.partition_key(row);
            if !affected.contains(&pkey) {
                affected.push(pkey.clone());
            }
            let part = self.partitions.entry(pkey).or_default();
            if weight > 0 {
                let pos = part
                    .rows
                    .binary_search_by(|probe| {
                        compare_rows_by(&probe.row, row, &self.order_by)
                            .then_with(|| probe.key.cmp(key))
                    })
                    .unwrap_or_else(|p| p);
                part.rows.insert(
                    pos,
                    PartRow {
                        key: key.clone(),
                        row: row.clone(),
                    },
                );
                // A delete-then-insert at one key is an update, not a
                // removal.
                removed.retain(|k| k != key);
            } else if weight < 0 {
                if let Some(pos) = part.rows.iter().position(|r| r.key == *key) {
                    part.rows.remove(pos);
                }
                removed.push(key.clone());
            }
        }

        let mut out = ZSet::new();
        for pkey in affected {
            let Some(part) = self.partitions.get(&pkey) else { continue };
            if part.rows.is_empty() {
                self.partitions.remove(&pkey);
                continue;
            }
            let outputs = self.compute_partition(part);
            for (key, new_row) in outputs {
                match self.emitted.get(&key) {
                    Some(old) if *old == new_row => {}
                    Some(old) => {
                        out.push(key.clone(), old.clone(), -1);
                        out.push(key.clone(), new_row.clone(), 1);
                        self.emitted.insert(key, new_row);
                    }
                    None => {
                        out.push(key.clone(), new_row.clone(), 1);
                        self.emitted.insert(key, new_row);
                    }
                }
            }
        }
        for key in removed {
            if let Some(old) = self.emitted.remove(&key) {
                out.push(key, old, -1);
            }
        }
        out
    }

    /// Evaluate all window columns for every row of a partition.
    fn compute_partition(&self, part: &Partition) -> Vec<(RowKey, Row)> {
        let n = part.rows.len();
        let sort_eq = |a: &PartRow, b: &PartRow| {
            compare_rows_by(&a.row, &b.row, &self.order_by) == Ordering::Equal
        };

        // Rank assignments shared by the ranking family.
        let mut rank = vec![0i64; n];
        let mut dense = vec![0i64; n];
        let mut current_rank = 0i64;
        let mut current_dense = 0i64;
        for i in 0..n {
            if i == 0 || !sort_eq(&part.rows[i - 1], &part.rows[i]) {
                current_rank = i as i64 + 1;
                current_dense += 1;
            }
            rank[i] = current_rank;
            dense[i] = current_dense;
        }

        let mut outputs = Vec::with_capacity(n);
        for (i, part_row) in part.rows.iter().enumerate() {
            let mut out_row = part_row.row.clone();
            for spec in &self.specs {
                let value = match spec.func {
                    WindowFunc::RowNumber => Value::Int(i as i64 + 1),
                    WindowFunc::Rank => Value::Int(rank[i]),
                    WindowFunc::DenseRank => Value::Int(dense[i]),
                    WindowFunc::PercentRank => {
                        if n <= 1 {
                            Value::Float(0.0)
                        } else {
                            Value::Float((rank[i] - 1) as f64 / (n - 1) as f64)
                        }
                    }
                    WindowFunc::CumeDist => {
                        let mut last = i;
                        while last + 1 < n && sort_eq(&part.rows[last + 1], &part.rows[i]) {
                            last += 1;
                        }
                        Value::Float((last + 1) as f64 / n as f64)
                    }
                    WindowFunc::Ntile => {
                        let buckets = spec
                            .args
                            .first()
                            .map(|e| {
                                let ctx = EvalCtx::with_faults(&part_row.row, &self.faults);
                                eval_expr(e, &ctx).as_i64().unwrap_or(1).max(1)
                            })
                            .unwrap_or(1) as usize;
                        Value::Int(ntile_bucket(i, n, buckets))
                    }
                    WindowFunc::Lag | WindowFunc::Lead => {
                        let offset = spec
                            .args
                            .get(1)
                            .map(|e| {
                                let ctx = EvalCtx::with_faults(&part_row.row, &self.faults);
                                eval_expr(e, &ctx).as_i64().unwrap_or(1)
                            })
                            .unwrap_or(1);
                        let target = if spec.func == WindowFunc::Lag {
                            i as i64 - offset
                        } else {
                            i as i64 + offset
                        };
                        if target >= 0 && (target as usize) < n {
                            spec.args
                                .first()
                                .map(|e| {
                                    let ctx = EvalCtx::with_faults(
                                        &part.rows[target as usize].row,
                                        &self.faults,
                                    );
                                    eval_expr(e, &ctx)
                                })
                                .unwrap_or(Value::Null)
                        } else {
                            // Out of range: the declared default, or NULL.
                            spec.args
                                .get(2)
                                .map(|e| {
                                    let ctx =
                                        EvalCtx::with_faults(&part_row.row, &self.faults);
                                    eval_expr(e, &ctx)
                                })
                                .unwrap_or(Value::Null)
                        }
                    }
                    WindowFunc::Sum
                    | WindowFunc::Avg
                    | WindowFunc::Count
                    | WindowFunc::Min
                    | WindowFunc::Max => {
                        let (lo, hi) = self.frame_bounds(spec, i, n);
                        let values = part.rows[lo..=hi].iter().map(|r| {
                            match spec.args.first() {
                                Some(e) => {
                                    let ctx = EvalCtx::with_faults(&r.row, &self.faults);
                                    eval_expr(e, &ctx)
                                }
                                None => Value::Int(1),
                            }
                        });
                        frame_agg(spec.func, spec.args.is_empty(), values)
                    }
                };
                out_row.set(spec.name.clone(), value);
            }
            outputs.push((part_row.key.clone(), out_row));
        }
        outputs
    }

    fn frame_bounds(&self, spec: &WindowSpec, i: usize, n: usize) -> (usize, usize) {
        let frame = match spec.frame {
            Some(f) => f,
            // Default: trailing unbounded frame with ORDER BY, the whole
            // partition without.
            None => {
                if self.order_by.is_empty() {
                    Frame {
                        start: FrameBound::UnboundedPreceding,
                        end: FrameBound::UnboundedFollowing,
                    }
                } else {
                    Frame {
                        start: FrameBound::UnboundedPreceding,
                        end: FrameBound::CurrentRow,
                    }
                }
            }
        };
        let lo = match frame.start {
            FrameBound::UnboundedPreceding => 0,
            FrameBound::Preceding(k) => i.saturating_sub(k),
            FrameBound::CurrentRow => i,
            FrameBound::Following(k) => (i + k).min(n - 1),
            FrameBound::UnboundedFollowing => n - 1,
        };
        let hi = match frame.end {
            FrameBound::UnboundedPreceding => 0,
            FrameBound::Preceding(k) => i.saturating_sub(k),
            FrameBound::CurrentRow => i,
            FrameBound::Following(k) => (i + k).min(n - 1),
            FrameBound::UnboundedFollowing => n - 1,
        };
        (lo.min(hi), hi.max(lo))
    }
}

fn ntile_bucket(i: usize, n: usize, buckets: usize) -> i64 {
    let base = n / buckets;
    let remainder = n % buckets;
    let big = remainder * (base + 1);
    if i < big {
        (i / (base + 1)) as i64 + 1
    } else if base > 0 {
        ((i - big) / base) as i64 + remainder as i64 + 1
    } else {
        i as i64 + 1
    }
}

/// Null-skipping aggregate over a frame's argument values.
fn frame_agg(func: WindowFunc, count_star: bool, values: impl Iterator<Item = Value>) -> Value {
    let mut sum = 0.0;
    let mut all_int = true;
    let mut int_sum = 0i64;
    let mut non_null = 0i64;
    let mut total = 0i64;
    let mut min: Option<Value> = None;
    let mut max: Option<Value> = None;
    for v in values {
        total += 1;
        if v.is_null() {
            continue;
        }
        non_null += 1;
        match &v {
            Value::Int(i) => {
                int_sum += i;
                sum += *i as f64;
            }
            Value::Float(f) => {
                all_int = false;
                sum += f;
            }
            _ => {}
        }
        if min
            .as_ref()
            .map(|m| compare_values(&v, m) == Ordering::Less)
            .unwrap_or(true)
        {
            min = Some(v.clone());
        }
        if max
            .as_ref()
            .map(|m| compare_values(&v, m) == Ordering::Greater)
            .unwrap_or(true)
        {
            max = Some(v);
        }
    }
    match func {
        WindowFunc::Sum => {
            if non_null == 0 {
                Value::Null
            } else if all_int {
                Value::Int(int_sum)
            } else {
                Value::Float(sum)
            }
        }
        WindowFunc::Avg => {
            if non_null == 0 {
                Value::Null
            } else {
                Value::Float(sum / non_null as f64)
            }
        }
        WindowFunc::Count => Value::Int(if count_star { total } else { non_null }),
        WindowFunc::Min => min.unwrap_or(Value::Null),
        WindowFunc::Max => max.unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Fast-path framed SUM/AVG/COUNT computed over the ring; MIN/MAX fall
/// back to the monotonic deques (returns None for those).
fn frame_agg_over<'a>(spec: &WindowSpec, values: impl Iterator<Item = &'a Value>) -> Option<Value> {
    match spec.func {
        WindowFunc::Sum | WindowFunc::Avg | WindowFunc::Count => Some(frame_agg(
            spec.func,
            spec.args.is_empty(),
            values.cloned(),
        )),
        _ => None,
    }
}

impl StatefulOperator for WindowOp {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet {
        if self.fast {
            self.step_fast(inputs[0])
        } else {
            self.step_general(inputs[0])
        }
    }

    fn reset(&mut self) {
        self.partitions.clear();
        self.emitted.clear();
    }

    fn stats(&self) -> Option<serde_json::Value> {
        Some(json!({
            "operator": "window",
            "streaming": self.fast,
            "partitions": self.partitions.len(),
            "faults": self.faults.count(),
        }))
    }
}
