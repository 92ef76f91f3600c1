//! Input tables. A source owns the integrated state of one named stream:
//! keyed upsert rows, an insertion-order queue for FIFO eviction, and the
//! schema inferred from the first push (or declared via CREATE TABLE).

use super::types::{FastMap, Row, RowKey, Schema, ZSet, KEY_SEP};
use crate::error::{EngineError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use smol_str::SmolStr;
use std::collections::VecDeque;
use ulid::Ulid;

lazy_static! {
    static ref IDENT_RE: Regex = Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Batches above this size are sliced so the coordinator can run between
/// chunks.
pub const LARGE_BATCH: usize = 5_000;
pub const BATCH_CHUNK: usize = 2_000;

/// How row identity is derived from a row.
pub enum KeySpec {
    Column(SmolStr),
    Columns(Vec<SmolStr>),
    Fn(Box<dyn Fn(&Row) -> RowKey>),
}

impl KeySpec {
    pub fn column(name: impl Into<SmolStr>) -> Self {
        KeySpec::Column(name.into())
    }

    pub fn columns(names: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        KeySpec::Columns(names.into_iter().map(Into::into).collect())
    }

    fn derive(&self, row: &Row) -> Option<RowKey> {
        match self {
            KeySpec::Column(c) => row.get(c.as_str()).map(|v| v.key_repr()),
            KeySpec::Columns(cols) => {
                let mut out = String::new();
                for (i, c) in cols.iter().enumerate() {
                    let v = row.get(c.as_str())?;
                    if i > 0 {
                        out.push(KEY_SEP);
                    }
                    out.push_str(v.key_repr().as_str());
                }
                Some(SmolStr::new(out))
            }
            KeySpec::Fn(f) => Some(f(row)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub max_rows: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceSnapshot {
    pub identity: String,
    pub name: String,
    pub count: usize,
    pub ready: bool,
    pub pushed: u64,
    pub evicted: u64,
    pub skipped: u64,
}

pub struct Source {
    name: SmolStr,
    /// Fresh per construction so downstream subscriptions rebuild when a
    /// source is recreated under the same name.
    identity: String,
    key: KeySpec,
    max_rows: Option<usize>,
    rows: FastMap<RowKey, Row>,
    order: VecDeque<RowKey>,
    schema: Option<Schema>,
    pushed: u64,
    evicted: u64,
    skipped: u64,
}

impl Source {
    pub fn new(name: impl Into<SmolStr>, key: KeySpec, options: SourceOptions) -> Result<Self> {
        let name = name.into();
        if !IDENT_RE.is_match(name.as_str()) {
            return Err(EngineError::config(format!(
                "source name '{name}' is not a valid identifier"
            )));
        }
        if let KeySpec::Columns(cols) = &key {
            if cols.is_empty() {
                return Err(EngineError::config("source key must name a column"));
            }
        }
        Ok(Source {
            name,
            identity: Ulid::new().to_string(),
            key,
            max_rows: options.max_rows,
            rows: FastMap::default(),
            order: VecDeque::new(),
            schema: None,
            pushed: 0,
            evicted: 0,
            skipped: 0,
        })
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Declared shape (CREATE TABLE) instead of first-push inference.
    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = Some(schema);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Upsert a batch. Returns one delta per chunk; the chunk boundary is
    /// the cooperative yield point for large batches.
    pub fn push(&mut self, rows: Vec<Row>) -> Vec<ZSet> {
        let chunked = rows.len() > LARGE_BATCH;
        let chunk_size = if chunked { BATCH_CHUNK } else { rows.len().max(1) };
        let mut deltas = Vec::new();
        let mut iter = rows.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<Row> = iter.by_ref().take(chunk_size).collect();
            let delta = self.push_chunk(chunk);
            if !delta.is_empty() {
                deltas.push(delta);
            }
        }
        deltas
    }

    fn push_chunk(&mut self, rows: Vec<Row>) -> ZSet {
        let mut delta = ZSet::with_capacity(rows.len());
        for row in rows {
            let Some(key) = self.key.derive(&row) else {
                self.skipped += 1;
                tracing::warn!(source = %self.name, "row missing key column, skipped");
                continue;
            };
            if self.schema.is_none() {
                self.schema = Some(Schema::from_row(&row));
            }
            self.pushed += 1;
            if let Some(old) = self.rows.insert(key.clone(), row.clone()) {
                // Update: retract-then-assert at the same key, and the
                // key becomes the most recently seen again.
                delta.push(key.clone(), old, -1);
                delta.push(key.clone(), row, 1);
                if let Some(pos) = self.order.iter().position(|k| *k == key) {
                    self.order.remove(pos);
                }
                self.order.push_back(key);
            } else {
                delta.push(key.clone(), row, 1);
                self.order.push_back(key);
            }
        }
        self.evict();
        delta
    }

    /// FIFO eviction is silent: no retraction is emitted, so downstream
    /// aggregates stay stable over recent data.
    fn evict(&mut self) {
        let Some(max) = self.max_rows else { return };
        while self.rows.len() > max {
            let Some(oldest) = self.order.pop_front() else { break };
            if self.rows.remove(&oldest).is_some() {
                self.evicted += 1;
            }
        }
    }

    pub fn remove(&mut self, keys: &[RowKey]) -> ZSet {
        let mut delta = ZSet::new();
        for key in keys {
            if let Some(row) = self.rows.remove(key) {
                if let Some(pos) = self.order.iter().position(|k| k == key) {
                    self.order.remove(pos);
                }
                delta.push(key.clone(), row, -1);
            }
        }
        delta
    }

    pub fn clear(&mut self) -> ZSet {
        let mut delta = ZSet::new();
        for key in std::mem::take(&mut self.order) {
            if let Some(row) = self.rows.remove(&key) {
                delta.push(key, row, -1);
            }
        }
        self.rows.clear();
        delta
    }

    /// Current contents as a +1 Z-set (view back-load).
    pub fn integrated(&self) -> ZSet {
        ZSet::from_rows(
            self.order
                .iter()
                .filter_map(|k| self.rows.get(k).map(|r| (k.clone(), r.clone()))),
        )
    }

    pub fn snapshot(&self) -> SourceSnapshot {
        SourceSnapshot {
            identity: self.identity.clone(),
            name: self.name.to_string(),
            count: self.rows.len(),
            ready: self.schema.is_some(),
            pushed: self.pushed,
            evicted: self.evicted,
            skipped: self.skipped,
        }
    }
}

#[cfg(test)]
mod source_tests {
    use super::*;
    use serde_json::json;

    fn source(max: Option<usize>) -> Source {
        Source::new("t", KeySpec::column("id"), SourceOptions { max_rows: max }).unwrap()
    }

    #[test]
    fn rejects_bad_name() {
        assert!(Source::new("1bad", KeySpec::column("id"), SourceOptions::default()).is_err());
        assert!(Source::new("has space", KeySpec::column("id"), SourceOptions::default()).is_err());
    }

    #[test]
    fn upsert_emits_retract_then_assert() {
        let mut s = source(None);
        let d = s.push(vec![Row::from(json!({"id": 1, "v": "a"}))]);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].len(), 1);

        let d = s.push(vec![Row::from(json!({"id": 1, "v": "b"}))]);
        let entries: Vec<_> = d[0].iter().map(|(k, r, w)| (k.clone(), r.clone(), w)).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].2, -1);
        assert_eq!(entries[1].2, 1);
        assert_eq!(entries[0].0, entries[1].0);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn fifo_eviction_is_silent_and_keeps_most_recent() {
        let mut s = source(Some(2));
        for i in 0..4 {
            let deltas = s.push(vec![Row::from(json!({"id": i}))]);
            // Every delta carries only the pushed row, never an eviction.
            assert!(deltas.iter().all(|d| d.iter().all(|(_, _, w)| w == 1)));
        }
        assert_eq!(s.len(), 2);
        assert!(s.get("2").is_some());
        assert!(s.get("3").is_some());
    }

    #[test]
    fn repush_refreshes_fifo_position() {
        let mut s = source(Some(2));
        s.push(vec![Row::from(json!({"id": "a"}))]);
        s.push(vec![Row::from(json!({"id": "b"}))]);
        // Touch "a" again, then push a third key: "b" is now the oldest.
        s.push(vec![Row::from(json!({"id": "a", "touched": true}))]);
        s.push(vec![Row::from(json!({"id": "c"}))]);
        assert!(s.get("a").is_some());
        assert!(s.get("c").is_some());
        assert!(s.get("b").is_none());
    }

    #[test]
    fn large_batch_is_chunked() {
        let mut s = source(None);
        let rows: Vec<Row> = (0..LARGE_BATCH + 1)
            .map(|i| Row::from(json!({"id": i})))
            .collect();
        let deltas = s.push(rows);
        assert!(deltas.len() > 1);
        let total: usize = deltas.iter().map(|d| d.len()).sum();
        assert_eq!(total, LARGE_BATCH + 1);
    }

    #[test]
    fn clear_retracts_everything() {
        let mut s = source(None);
        s.push(vec![
            Row::from(json!({"id": 1})),
            Row::from(json!({"id": 2})),
        ]);
        let d = s.clear();
        assert_eq!(d.len(), 2);
        assert!(d.iter().all(|(_, _, w)| w == -1));
        assert!(s.is_empty());
    }
}
