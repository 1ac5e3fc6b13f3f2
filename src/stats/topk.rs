//! Bounded top-K counter ranking
//!
//! Counts grow unbounded between flushes; the reduction to the K highest
//! entries happens only when a snapshot is taken. Ties are broken by
//! first-seen insertion order so rankings are reproducible across runs.

use std::collections::HashMap;
use std::hash::Hash;

/// Counter map with a deterministic reduction to the top `limit` entries
#[derive(Debug, Clone)]
pub struct TopKTracker<K: Eq + Hash + Clone> {
    counts: HashMap<K, u64>,
    first_seen: HashMap<K, u64>,
    next_seq: u64,
    limit: usize,
}

impl<K: Eq + Hash + Clone> TopKTracker<K> {
    pub fn new(limit: usize) -> Self {
        Self {
            counts: HashMap::new(),
            first_seen: HashMap::new(),
            next_seq: 0,
            limit,
        }
    }

    /// Add `amount` to a key's count, registering insertion order on first sight
    pub fn add(&mut self, key: K, amount: u64) {
        if !self.counts.contains_key(&key) {
            self.first_seen.insert(key.clone(), self.next_seq);
            self.next_seq += 1;
        }
        *self.counts.entry(key).or_insert(0) += amount;
    }

    /// Number of distinct keys tracked (pre-trim)
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.first_seen.clear();
        self.next_seq = 0;
    }

    /// The top `limit` entries, descending by count, first-seen wins ties
    pub fn top(&self) -> Vec<(K, u64)> {
        let mut entries: Vec<(K, u64)> = self
            .counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| {
            b.1.cmp(&a.1).then_with(|| {
                let sa = self.first_seen.get(&a.0).copied().unwrap_or(u64::MAX);
                let sb = self.first_seen.get(&b.0).copied().unwrap_or(u64::MAX);
                sa.cmp(&sb)
            })
        });
        entries.truncate(self.limit);
        entries
    }
}

impl<K: Eq + Hash + Clone + ToString> TopKTracker<K> {
    /// Trimmed entries as an ordered JSON object (highest count first)
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.top()
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::from(v)))
            .collect()
    }
}
