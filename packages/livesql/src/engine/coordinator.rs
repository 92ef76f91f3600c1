//! The process-wide notification hub. High-frequency internal changes
//! coalesce behind an adaptive throttle derived from how fast observers
//! actually consume, then broadcast as a single version bump.

use std::collections::VecDeque;

const CONSUME_WINDOW: usize = 64;
const MIN_INTERVAL_MS: u64 = 16;
const MAX_INTERVAL_MS: u64 = 200;

pub type SubscriptionId = u64;

#[derive(Default)]
pub struct Coordinator {
    version: u64,
    dirty: bool,
    last_broadcast_ms: u64,
    consume_times: VecDeque<f64>,
    subscribers: Vec<(SubscriptionId, Box<dyn FnMut(u64)>)>,
    next_sub: SubscriptionId,
}

impl Coordinator {
    pub fn new() -> Self {
        Coordinator::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Any source or view that changed state calls this; the broadcast
    /// happens later, on the pump.
    pub fn notify_change(&mut self) {
        self.dirty = true;
    }

    /// Observers report how long they took to consume a broadcast; the
    /// 90th percentile (plus 20% buffer) becomes the throttle interval.
    pub fn record_consume_time(&mut self, ms: f64) {
        if self.consume_times.len() >= CONSUME_WINDOW {
            self.consume_times.pop_front();
        }
        self.consume_times.push_back(ms);
    }

    pub fn throttle_ms(&self) -> u64 {
        if self.consume_times.is_empty() {
            return MIN_INTERVAL_MS;
        }
        let mut sorted: Vec<f64> = self.consume_times.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let idx = ((sorted.len() as f64) * 0.9) as usize;
        let p90 = sorted[idx.min(sorted.len() - 1)];
        ((p90 * 1.2) as u64).clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS)
    }

    /// Broadcast if dirty and the throttle window has elapsed. Empty
    /// steps never mark dirty, so they never bump the version.
    pub fn pump(&mut self, now_ms: u64) -> Option<u64> {
        if !self.dirty {
            return None;
        }
        if now_ms.saturating_sub(self.last_broadcast_ms) < self.throttle_ms() {
            return None;
        }
        Some(self.broadcast(now_ms))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Immediate broadcast, throttle ignored (flush path).
    pub fn broadcast(&mut self, now_ms: u64) -> u64 {
        self.dirty = false;
        self.last_broadcast_ms = now_ms;
        self.version += 1;
        let version = self.version;
        for (_, cb) in &mut self.subscribers {
            cb(version);
        }
        version
    }

    pub fn subscribe(&mut self, callback: impl FnMut(u64) + 'static) -> SubscriptionId {
        let id = self.next_sub;
        self.next_sub += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|(sub, _)| *sub != id);
    }
}
