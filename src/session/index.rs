//! Look-aside indices over a session's records.
//!
//! None of these own a record. They map keys to [`RecordId`]s that the
//! session resolves through its slot table, and are pruned explicitly
//! whenever reconciliation drops a record.

use std::collections::HashMap;

use crate::model::record::RecordId;

/// Multimap from a string key (message-id or subject) to records.
#[derive(Debug, Default, Clone)]
pub struct HashIndex {
    map: HashMap<String, Vec<RecordId>>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, id: RecordId) {
        self.map.entry(key.to_string()).or_default().push(id);
    }

    /// Drop one record under `key`; the key goes once it maps to nothing.
    pub fn remove(&mut self, key: &str, id: RecordId) {
        if let Some(ids) = self.map.get_mut(key) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.map.remove(key);
            }
        }
    }

    /// First record inserted under `key`.
    pub fn find(&self, key: &str) -> Option<RecordId> {
        self.map.get(key).and_then(|ids| ids.first().copied())
    }

    pub fn get(&self, key: &str) -> &[RecordId] {
        self.map.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.map.values().any(|ids| ids.contains(&id))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

/// Per-label message counts (`X-Label`).
#[derive(Debug, Default, Clone)]
pub struct LabelIndex {
    counts: HashMap<String, usize>,
}

impl LabelIndex {
    pub fn add(&mut self, labels: &[String]) {
        for label in labels {
            *self.counts.entry(label.clone()).or_insert(0) += 1;
        }
    }

    pub fn remove(&mut self, labels: &[String]) {
        for label in labels {
            if let Some(n) = self.counts.get_mut(label) {
                *n -= 1;
                if *n == 0 {
                    self.counts.remove(label);
                }
            }
        }
    }

    pub fn count(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }

    /// Labels in use, sorted.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.counts.keys().map(String::as_str).collect();
        labels.sort_unstable();
        labels
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
