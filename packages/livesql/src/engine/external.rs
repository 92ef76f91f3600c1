//! Contracts for the optional external collaborators the core delegates
//! to. The engine never depends on more than these interfaces; the
//! in-memory implementations exist for tests and small deployments.

use super::types::{FastMap, Row};

/// Paginated store for joined rows in externally-indexed join mode. No
/// ordering guarantees beyond insertion order.
pub trait JoinSink {
    fn init(&mut self);
    fn add(&mut self, left: &Row, right: &Row, join_key: &str);
    fn page(&self, offset: usize, limit: usize) -> Vec<(Row, Row)>;
    fn count(&self) -> usize;
    fn dispose(&mut self);
}

#[derive(Default)]
pub struct MemoryJoinSink {
    rows: Vec<(Row, Row)>,
}

impl MemoryJoinSink {
    pub fn new() -> Self {
        MemoryJoinSink::default()
    }
}

impl JoinSink for MemoryJoinSink {
    fn init(&mut self) {
        self.rows.clear();
    }

    fn add(&mut self, left: &Row, right: &Row, _join_key: &str) {
        self.rows.push((left.clone(), right.clone()));
    }

    fn page(&self, offset: usize, limit: usize) -> Vec<(Row, Row)> {
        self.rows.iter().skip(offset).take(limit).cloned().collect()
    }

    fn count(&self) -> usize {
        self.rows.len()
    }

    fn dispose(&mut self) {
        self.rows.clear();
    }
}

/// Bounded staleness-aware queue a source may front its input with:
/// overflow drops the oldest, expiry drops the stale, dequeues are
/// batched.
pub trait FreshnessQueue {
    fn enqueue(&mut self, row: Row, now_ms: u64);
    /// Up to `max_batch` messages that are still fresh at `now_ms`.
    fn drain(&mut self, now_ms: u64, max_batch: usize) -> Vec<Row>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MemoryFreshnessQueue {
    capacity: usize,
    max_age_ms: u64,
    items: std::collections::VecDeque<(u64, Row)>,
    dropped: u64,
}

impl MemoryFreshnessQueue {
    pub fn new(capacity: usize, max_age_ms: u64) -> Self {
        MemoryFreshnessQueue {
            capacity,
            max_age_ms,
            items: std::collections::VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn expire(&mut self, now_ms: u64) {
        while let Some((at, _)) = self.items.front() {
            if now_ms.saturating_sub(*at) > self.max_age_ms {
                self.items.pop_front();
                self.dropped += 1;
            } else {
                break;
            }
        }
    }
}

impl FreshnessQueue for MemoryFreshnessQueue {
    fn enqueue(&mut self, row: Row, now_ms: u64) {
        self.expire(now_ms);
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back((now_ms, row));
    }

    fn drain(&mut self, now_ms: u64, max_batch: usize) -> Vec<Row> {
        self.expire(now_ms);
        let take = self.items.len().min(max_batch);
        self.items.drain(..take).map(|(_, row)| row).collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Read-only projection of the registry for visualization consumers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryGraph {
    pub nodes: Vec<RegistryNode>,
    pub edges: Vec<(String, String)>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryNode {
    pub identity: String,
    pub name: String,
    pub kind: String,
    pub ready: bool,
}

impl RegistryGraph {
    pub fn node_index(&self) -> FastMap<String, usize> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect()
    }
}

#[cfg(test)]
mod external_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn freshness_queue_drops_oldest_on_overflow() {
        let mut q = MemoryFreshnessQueue::new(2, 1_000);
        q.enqueue(Row::from(json!({"n": 1})), 0);
        q.enqueue(Row::from(json!({"n": 2})), 1);
        q.enqueue(Row::from(json!({"n": 3})), 2);
        assert_eq!(q.dropped(), 1);
        let batch = q.drain(3, 10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].get("n"), Some(&crate::engine::types::Value::Int(2)));
    }

    #[test]
    fn freshness_queue_expires_stale() {
        let mut q = MemoryFreshnessQueue::new(10, 100);
        q.enqueue(Row::from(json!({"n": 1})), 0);
        q.enqueue(Row::from(json!({"n": 2})), 90);
        let batch = q.drain(150, 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn sink_pages_in_insertion_order() {
        let mut sink = MemoryJoinSink::new();
        sink.init();
        for i in 0..5 {
            sink.add(&Row::from(json!({"l": i})), &Row::from(json!({"r": i})), "k");
        }
        assert_eq!(sink.count(), 5);
        let page = sink.page(2, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].0.get("l"), Some(&crate::engine::types::Value::Int(2)));
    }
}
