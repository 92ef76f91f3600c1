//! Views bind a compiled circuit to upstream streams, integrate the
//! output delta into a readable materialization, and re-emit their deltas
//! so views chain like sources.

use super::circuit::Circuit;
use super::types::{FastMap, FastSet, Row, RowKey, Schema, Weight, ZSet};
use crate::error::{EngineError, Result};
use crate::sql::ast::Query;
use crate::sql::compile::{compile_query, CompileOptions};
use lazy_static::lazy_static;
use regex::Regex;
use smol_str::SmolStr;
use std::collections::VecDeque;
use ulid::Ulid;

lazy_static! {
    static ref IDENT_RE: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// What the view's join machinery stores; parsed from the caller-facing
/// mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinModeSpec {
    AppendOnly,
    #[default]
    Materialized,
    External,
}

impl JoinModeSpec {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "append-only" => Ok(JoinModeSpec::AppendOnly),
            "materialized" => Ok(JoinModeSpec::Materialized),
            "external" => Ok(JoinModeSpec::External),
            other => Err(EngineError::config(format!("unknown join mode '{other}'"))),
        }
    }
}

pub struct ViewOptions {
    pub join_mode: JoinModeSpec,
    /// Cap on materialized join results per join operator.
    pub max_join_results: Option<usize>,
    /// Prune the view's own materialization to the newest N rows,
    /// retracting downstream.
    pub max_rows: Option<usize>,
    /// When set, upstream deltas queue and flush as one atomic step when
    /// the engine pump passes the deadline. Unset means immediate steps.
    pub batch_interval_ms: Option<u64>,
    /// Factory for externally-indexed join sinks.
    pub sink_factory: Option<Box<dyn Fn() -> Box<dyn super::external::JoinSink>>>,
}

impl Default for ViewOptions {
    fn default() -> Self {
        ViewOptions {
            join_mode: JoinModeSpec::Materialized,
            max_join_results: None,
            max_rows: None,
            batch_interval_ms: None,
            sink_factory: None,
        }
    }
}

struct MatEntry {
    row: Row,
    weight: Weight,
    slot: usize,
}

/// Insertion-ordered dense store: O(1) insert, delete and iterate, with a
/// free-index list instead of compaction.
#[derive(Default)]
pub struct Materialization {
    slots: Vec<Option<RowKey>>,
    free: Vec<usize>,
    map: FastMap<RowKey, MatEntry>,
}

impl Materialization {
    pub fn apply(&mut self, delta: &ZSet) {
        for (key, row, weight) in delta.iter() {
            match self.map.get_mut(key) {
                Some(entry) => {
                    entry.weight += weight;
                    if weight > 0 {
                        entry.row = row.clone();
                    }
                    if entry.weight <= 0 {
                        let slot = entry.slot;
                        self.slots[slot] = None;
                        self.free.push(slot);
                        self.map.remove(key);
                    }
                }
                None if weight > 0 => {
                    let slot = match self.free.pop() {
                        Some(s) => {
                            self.slots[s] = Some(key.clone());
                            s
                        }
                        None => {
                            self.slots.push(Some(key.clone()));
                            self.slots.len() - 1
                        }
                    };
                    self.map.insert(
                        key.clone(),
                        MatEntry {
                            row: row.clone(),
                            weight,
                            slot,
                        },
                    );
                }
                None => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.map.get(key).filter(|e| e.weight > 0).map(|e| &e.row)
    }

    /// Rows in slot (insertion) order, positive weights only.
    pub fn rows(&self) -> Vec<Row> {
        self.slots
            .iter()
            .flatten()
            .filter_map(|k| self.get(k.as_str()).cloned())
            .collect()
    }

    pub fn keys(&self) -> Vec<RowKey> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub fn integrated(&self) -> ZSet {
        ZSet::from_entries(self.slots.iter().flatten().filter_map(|k| {
            self.map
                .get(k)
                .filter(|e| e.weight > 0)
                .map(|e| (k.clone(), e.row.clone(), e.weight))
        }))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.map.clear();
    }

    /// Content hash over the held keys, for cheap snapshot comparison.
    pub fn result_hash(&self) -> String {
        let mut keys = self.keys();
        keys.sort_unstable();
        let mut hasher = blake3::Hasher::new();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ViewSnapshot {
    pub identity: String,
    pub name: String,
    pub count: usize,
    pub ready: bool,
    pub result_hash: String,
    pub operators: Vec<serde_json::Value>,
}

struct PendingBatch {
    deltas: FastMap<SmolStr, ZSet>,
    deadline_ms: u64,
}

pub struct View {
    name: SmolStr,
    /// Regenerated on every (re)creation so downstream subscriptions
    /// rebuild.
    identity: String,
    sql: Query,
    options: ViewOptions,
    circuit: Option<Circuit>,
    upstreams: Vec<SmolStr>,
    schema: Option<Schema>,
    mat: Materialization,
    order: VecDeque<RowKey>,
    batch: Option<PendingBatch>,
    last_error: Option<String>,
}

impl View {
    pub fn new(name: impl Into<SmolStr>, sql: Query, options: ViewOptions) -> Result<Self> {
        let name = name.into();
        if !IDENT_RE.is_match(name.as_str()) {
            return Err(EngineError::config(format!(
                "view name '{name}' is not a valid identifier"
            )));
        }
        Ok(View {
            name,
            identity: Ulid::new().to_string(),
            sql,
            options,
            circuit: None,
            upstreams: Vec::new(),
            schema: None,
            mat: Materialization::default(),
            order: VecDeque::new(),
            batch: None,
            last_error: None,
        })
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn ready(&self) -> bool {
        self.circuit.is_some()
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn upstreams(&self) -> &[SmolStr] {
        &self.upstreams
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn batch_interval_ms(&self) -> Option<u64> {
        self.options.batch_interval_ms
    }

    /// Attempt compilation against the currently known upstream schemas.
    /// Transient failures leave the view not-ready for a later retry.
    pub fn try_compile(
        &mut self,
        schemas: &FastMap<SmolStr, Schema>,
        known: &FastSet<SmolStr>,
    ) -> Result<()> {
        let opts = CompileOptions {
            join_mode: self.options.join_mode,
            max_join_results: self.options.max_join_results,
            sink_factory: self.options.sink_factory.as_deref(),
        };
        match compile_query(&self.sql, schemas, known, &opts) {
            Ok(compiled) => {
                self.upstreams = compiled
                    .circuit
                    .input_names()
                    .cloned()
                    .collect();
                if !compiled.schema.columns.is_empty() {
                    self.schema = Some(compiled.schema);
                }
                self.circuit = Some(compiled.circuit);
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                if !e.is_transient() {
                    tracing::warn!(view = %self.name, error = %e, "view compilation failed");
                }
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// One atomic circuit step; the returned delta has already been
    /// integrated (including any max-rows pruning retractions) and is
    /// what downstream consumers should see.
    pub fn step(&mut self, inputs: &FastMap<SmolStr, ZSet>) -> ZSet {
        let Some(circuit) = self.circuit.as_mut() else {
            return ZSet::new();
        };
        let output = circuit.step(inputs);
        self.apply_output(output)
    }

    fn apply_output(&mut self, output: ZSet) -> ZSet {
        if output.is_empty() {
            return output;
        }
        if self.schema.is_none() {
            if let Some((_, row, _)) = output.iter().next() {
                self.schema = Some(Schema::from_row(row));
            }
        }
        // Track insertion order of fresh keys for max-rows pruning.
        for (key, _, weight) in output.iter() {
            if weight > 0 && self.mat.get(key.as_str()).is_none() {
                self.order.push_back(key.clone());
            }
        }
        self.mat.apply(&output);
        self.order.retain(|k| self.mat.get(k.as_str()).is_some());

        let mut combined = output;
        if let Some(max) = self.options.max_rows {
            let mut pruned = ZSet::new();
            let mut excess = self.mat.len().saturating_sub(max);
            while excess > 0 {
                let Some(oldest) = self.order.pop_front() else { break };
                if let Some(row) = self.mat.get(oldest.as_str()).cloned() {
                    pruned.push(oldest, row, -1);
                    excess -= 1;
                }
            }
            if !pruned.is_empty() {
                self.mat.apply(&pruned);
                combined = combined.concat(&pruned);
            }
        }
        combined
    }

    pub fn results(&self) -> Vec<Row> {
        self.mat.rows()
    }

    pub fn count(&self) -> usize {
        self.mat.len()
    }

    pub fn integrated(&self) -> ZSet {
        self.mat.integrated()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            identity: self.identity.clone(),
            name: self.name.to_string(),
            count: self.mat.len(),
            ready: self.ready(),
            result_hash: self.mat.result_hash(),
            operators: self
                .circuit
                .as_ref()
                .map(|c| c.operator_stats())
                .unwrap_or_default(),
        }
    }

    // --- batching ------------------------------------------------------

    pub fn enqueue(&mut self, upstream: &SmolStr, delta: &ZSet, now_ms: u64, interval: u64) {
        let batch = self.batch.get_or_insert_with(|| PendingBatch {
            deltas: FastMap::default(),
            deadline_ms: now_ms + interval,
        });
        let slot = batch.deltas.entry(upstream.clone()).or_default();
        *slot = slot.concat(delta);
    }

    pub fn batch_due(&self, now_ms: u64) -> bool {
        self.batch
            .as_ref()
            .map(|b| now_ms >= b.deadline_ms)
            .unwrap_or(false)
    }

    pub fn has_batch(&self) -> bool {
        self.batch.is_some()
    }

    pub fn take_batch(&mut self) -> Option<FastMap<SmolStr, ZSet>> {
        self.batch.take().map(|b| b.deltas)
    }

    // -------------------------------------------------------------------

    /// Release all operator state and the materialization.
    pub fn dispose(&mut self) {
        if let Some(c) = self.circuit.as_mut() {
            c.reset();
        }
        self.circuit = None;
        self.mat.clear();
        self.order.clear();
        self.batch = None;
    }

    /// Tear down for recompilation after an upstream was recreated; the
    /// identity changes so subscribers notice.
    pub fn invalidate(&mut self) {
        self.dispose();
        self.identity = Ulid::new().to_string();
    }
}

#[cfg(test)]
mod materialization_tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, v: i64, w: Weight) -> (RowKey, Row, Weight) {
        (SmolStr::new(key), Row::from(json!({"v": v})), w)
    }

    #[test]
    fn slots_reuse_freed_indices() {
        let mut m = Materialization::default();
        m.apply(&ZSet::from_entries([entry("a", 1, 1), entry("b", 2, 1)]));
        assert_eq!(m.len(), 2);
        m.apply(&ZSet::from_entries([entry("a", 1, -1)]));
        assert_eq!(m.len(), 1);
        m.apply(&ZSet::from_entries([entry("c", 3, 1)]));
        // "c" reuses a's slot; iteration stays hole-free.
        assert_eq!(m.slots.len(), 2);
        assert_eq!(m.rows().len(), 2);
    }

    #[test]
    fn update_pair_keeps_single_row() {
        let mut m = Materialization::default();
        m.apply(&ZSet::from_entries([entry("a", 1, 1)]));
        let mut upd = ZSet::new();
        upd.push(SmolStr::new("a"), Row::from(json!({"v": 1})), -1);
        upd.push(SmolStr::new("a"), Row::from(json!({"v": 2})), 1);
        m.apply(&upd);
        assert_eq!(m.len(), 1);
        assert_eq!(
            m.get("a").and_then(|r| r.get("v").cloned()),
            Some(crate::engine::types::Value::Int(2))
        );
    }

    #[test]
    fn result_hash_is_order_independent() {
        let mut a = Materialization::default();
        a.apply(&ZSet::from_entries([entry("x", 1, 1), entry("y", 2, 1)]));
        let mut b = Materialization::default();
        b.apply(&ZSet::from_entries([entry("y", 2, 1), entry("x", 1, 1)]));
        assert_eq!(a.result_hash(), b.result_hash());
    }
}
