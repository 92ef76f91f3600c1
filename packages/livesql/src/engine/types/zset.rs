use super::row::{Row, RowKey};
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::hash::BuildHasherDefault;

pub type Weight = i64;
pub type FastMap<K, V> = std::collections::HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastSet<K> = std::collections::HashSet<K, BuildHasherDefault<FxHasher>>;

/// A weighted multiset of rows, keyed by row identity.
///
/// Entries are kept in emission order: a delta carrying `(row, -1)` then
/// `(row', +1)` under the same key is an update, and stateful consumers
/// must observe both halves in that order. `consolidate` collapses to the
/// canonical group representation (summed weights, zeros dropped), which
/// is what the algebraic laws are stated over; the integrated state of a
/// stream is always consolidated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZSet {
    entries: Vec<(RowKey, Row, Weight)>,
}

impl ZSet {
    pub fn new() -> Self {
        ZSet { entries: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        ZSet {
            entries: Vec::with_capacity(cap),
        }
    }

    /// Each row enters with weight +1.
    pub fn from_rows(rows: impl IntoIterator<Item = (RowKey, Row)>) -> Self {
        ZSet {
            entries: rows.into_iter().map(|(k, r)| (k, r, 1)).collect(),
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (RowKey, Row, Weight)>) -> Self {
        ZSet {
            entries: entries.into_iter().filter(|(_, _, w)| *w != 0).collect(),
        }
    }

    /// Append an entry, preserving emission order.
    pub fn push(&mut self, key: RowKey, row: Row, weight: Weight) {
        if weight != 0 {
            self.entries.push((key, row, weight));
        }
    }

    /// No entries at all. An update pair that nets to zero still counts as
    /// non-empty: both halves are observable.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Net-empty under the group interpretation.
    pub fn is_zero(&self) -> bool {
        self.consolidated().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &Row, Weight)> {
        self.entries.iter().map(|(k, r, w)| (k, r, *w))
    }

    pub fn into_entries(self) -> Vec<(RowKey, Row, Weight)> {
        self.entries
    }

    /// Net weight of a key across all entries.
    pub fn weight_of(&self, key: &str) -> Weight {
        self.entries
            .iter()
            .filter(|(k, _, _)| k.as_str() == key)
            .map(|(_, _, w)| *w)
            .sum()
    }

    /// The group operation: weights of equal keys sum, zeros vanish.
    pub fn add(&self, other: &ZSet) -> ZSet {
        let mut out = self.clone();
        out.entries.extend(other.entries.iter().cloned());
        out.consolidate();
        out
    }

    /// Order-preserving concatenation; the stream-level union. Unlike
    /// `add`, update pairs inside either operand survive.
    pub fn concat(&self, other: &ZSet) -> ZSet {
        let mut out = self.clone();
        out.entries.extend(other.entries.iter().cloned());
        out
    }

    pub fn negate(&self) -> ZSet {
        ZSet {
            entries: self
                .entries
                .iter()
                .map(|(k, r, w)| (k.clone(), r.clone(), -w))
                .collect(),
        }
    }

    pub fn subtract(&self, other: &ZSet) -> ZSet {
        self.add(&other.negate())
    }

    /// Map every entry to a new `(key, row)`, keeping its weight. Entries
    /// mapping to the same key accumulate on consolidation.
    pub fn map(&self, mut f: impl FnMut(&Row) -> (RowKey, Row)) -> ZSet {
        ZSet {
            entries: self
                .entries
                .iter()
                .map(|(_, r, w)| {
                    let (k2, r2) = f(r);
                    (k2, r2, *w)
                })
                .collect(),
        }
    }

    pub fn filter(&self, mut pred: impl FnMut(&Row) -> bool) -> ZSet {
        ZSet {
            entries: self
                .entries
                .iter()
                .filter(|(_, r, _)| pred(r))
                .cloned()
                .collect(),
        }
    }

    /// Collapse to canonical form: one entry per key, summed weight,
    /// zero-weight keys removed. First-seen order is kept for the
    /// surviving keys; the last row observed for a key wins.
    pub fn consolidate(&mut self) {
        if self.entries.len() < 2 {
            if let Some((_, _, w)) = self.entries.first() {
                if *w == 0 {
                    self.entries.clear();
                }
            }
            return;
        }
        let mut acc: IndexMap<RowKey, (Row, Weight)> = IndexMap::with_capacity(self.entries.len());
        for (key, row, weight) in self.entries.drain(..) {
            match acc.entry(key) {
                indexmap::map::Entry::Occupied(mut e) => {
                    let slot = e.get_mut();
                    slot.0 = row;
                    slot.1 += weight;
                }
                indexmap::map::Entry::Vacant(e) => {
                    e.insert((row, weight));
                }
            }
        }
        self.entries = acc
            .into_iter()
            .filter(|(_, (_, w))| *w != 0)
            .map(|(k, (r, w))| (k, r, w))
            .collect();
    }

    pub fn consolidated(&self) -> ZSet {
        let mut out = self.clone();
        out.consolidate();
        out
    }
}

impl FromIterator<(RowKey, Row, Weight)> for ZSet {
    fn from_iter<T: IntoIterator<Item = (RowKey, Row, Weight)>>(iter: T) -> Self {
        ZSet::from_entries(iter)
    }
}

#[cfg(test)]
mod zset_tests {
    use super::*;
    use serde_json::json;
    use smol_str::SmolStr;

    fn row(v: serde_json::Value) -> Row {
        Row::from(v)
    }

    #[test]
    fn add_is_commutative() {
        let a = ZSet::from_entries([
            (SmolStr::new("1"), row(json!({"v": 1})), 1),
            (SmolStr::new("2"), row(json!({"v": 2})), 2),
        ]);
        let b = ZSet::from_entries([
            (SmolStr::new("2"), row(json!({"v": 2})), -1),
            (SmolStr::new("3"), row(json!({"v": 3})), 1),
        ]);
        let ab = a.add(&b);
        let ba = b.add(&a);
        for key in ["1", "2", "3"] {
            assert_eq!(ab.weight_of(key), ba.weight_of(key));
        }
        assert_eq!(ab.weight_of("2"), 1);
    }

    #[test]
    fn add_negation_is_empty() {
        let a = ZSet::from_entries([
            (SmolStr::new("1"), row(json!({"v": 1})), 3),
            (SmolStr::new("2"), row(json!({"v": 2})), -2),
        ]);
        assert!(a.add(&a.negate()).is_empty());
    }

    #[test]
    fn zero_weight_unobservable() {
        let mut z = ZSet::new();
        z.push(SmolStr::new("k"), row(json!({"v": 1})), 1);
        z.push(SmolStr::new("k"), row(json!({"v": 1})), -1);
        let c = z.consolidated();
        assert!(c.is_empty());
        // But the raw delta still shows both halves of the update.
        assert_eq!(z.len(), 2);
        assert!(!z.is_empty());
        assert!(z.is_zero());
    }

    #[test]
    fn map_accumulates_collisions() {
        let z = ZSet::from_entries([
            (SmolStr::new("1"), row(json!({"v": 1, "g": "a"})), 1),
            (SmolStr::new("2"), row(json!({"v": 2, "g": "a"})), 1),
        ]);
        let projected = z
            .map(|r| {
                let mut out = Row::new();
                out.set("g", r.get("g").cloned().unwrap_or_default());
                (out.content_key(), out)
            })
            .consolidated();
        assert_eq!(projected.len(), 1);
        let (_, _, w) = projected.iter().next().map(|(k, r, w)| (k.clone(), r.clone(), w)).unwrap();
        assert_eq!(w, 2);
    }
}
