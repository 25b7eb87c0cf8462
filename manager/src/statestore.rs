//! Ephemeral shared state: atomic counters, round-robin cursors, and
//! scheduler marks with expiry.
//!
//! This mirrors the semantics of a TTL-capable key-value store so a
//! networked backend can be dropped in behind the same API. The concurrency
//! check-and-increment is a single atomic operation, matching the
//! compare-and-increment script the predicates rely on.

use dashmap::DashMap;
use gridmesh_common::{AccessKey, RoundRobinState};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub fn keypair_concurrency_key(access_key: &AccessKey) -> String {
    format!("keypair.concurrency_used.{access_key}")
}

#[derive(Debug, Clone)]
struct MarkEntry {
    data: BTreeMap<String, String>,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    counters: DashMap<String, i64>,
    roundrobin: DashMap<(String, String), RoundRobinState>,
    marks: DashMap<String, MarkEntry>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically increment `key` unless it has reached `limit`.
    /// Returns `(allowed, value_after)`. A limit of 0 means unlimited.
    pub fn check_and_increment(&self, key: &str, limit: i64) -> (bool, i64) {
        let mut entry = self.counters.entry(key.to_owned()).or_insert(0);
        if limit > 0 && *entry >= limit {
            return (false, *entry);
        }
        *entry += 1;
        (true, *entry)
    }

    pub fn decrement(&self, key: &str) -> i64 {
        let mut entry = self.counters.entry(key.to_owned()).or_insert(0);
        *entry = (*entry - 1).max(0);
        *entry
    }

    pub fn get_counter(&self, key: &str) -> i64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn set_counter(&self, key: &str, value: i64) {
        self.counters.insert(key.to_owned(), value);
    }

    pub fn get_roundrobin(
        &self,
        resource_group: &str,
        architecture: &str,
    ) -> Option<RoundRobinState> {
        self.roundrobin
            .get(&(resource_group.to_owned(), architecture.to_owned()))
            .map(|v| *v)
    }

    pub fn put_roundrobin(&self, resource_group: &str, architecture: &str, state: RoundRobinState) {
        self.roundrobin
            .insert((resource_group.to_owned(), architecture.to_owned()), state);
    }

    /// Replace a scheduler mark wholesale, with an optional TTL.
    pub fn replace_mark(
        &self,
        key: &str,
        data: BTreeMap<String, String>,
        ttl: Option<Duration>,
    ) {
        self.marks.insert(
            key.to_owned(),
            MarkEntry {
                data,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Merge fields into an existing mark, keeping its TTL.
    pub fn merge_mark(&self, key: &str, update: BTreeMap<String, String>) {
        let mut entry = self.marks.entry(key.to_owned()).or_insert(MarkEntry {
            data: BTreeMap::new(),
            expires_at: None,
        });
        entry.data.extend(update);
    }

    pub fn get_mark(&self, key: &str) -> Option<BTreeMap<String, String>> {
        let entry = self.marks.get(key)?;
        if let Some(deadline) = entry.expires_at {
            if Instant::now() >= deadline {
                drop(entry);
                self.marks.remove(key);
                return None;
            }
        }
        Some(entry.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_and_increment_stops_at_the_limit() {
        let store = StateStore::new();
        assert_eq!(store.check_and_increment("c", 2), (true, 1));
        assert_eq!(store.check_and_increment("c", 2), (true, 2));
        assert_eq!(store.check_and_increment("c", 2), (false, 2));
        store.decrement("c");
        assert_eq!(store.check_and_increment("c", 2), (true, 2));
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let store = StateStore::new();
        for expected in 1..=100 {
            assert_eq!(store.check_and_increment("c", 0), (true, expected));
        }
    }

    #[test]
    fn decrement_never_goes_negative() {
        let store = StateStore::new();
        assert_eq!(store.decrement("missing"), 0);
    }

    #[test]
    fn expired_marks_vanish() {
        let store = StateStore::new();
        store.replace_mark(
            "m",
            [("k".to_owned(), "v".to_owned())].into_iter().collect(),
            Some(Duration::from_secs(0)),
        );
        assert!(store.get_mark("m").is_none());
    }
}
