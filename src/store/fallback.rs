use std::collections::{BTreeMap, HashMap};

/// Per-identifier request counter for one fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Requests observed in the current window.
    pub count: u32,
    /// Epoch millis at which the window rolls over.
    pub reset_at_ms: u64,
}

impl Bucket {
    /// A window has expired once `now` reaches `reset_at_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.reset_at_ms <= now_ms
    }
}

#[derive(Debug)]
struct Slot {
    bucket: Bucket,
    seq: u64,
}

/// Bounded, insertion-ordered map from identifier to [`Bucket`].
///
/// Overwriting an existing key keeps its original position. [`prune`](Self::prune)
/// drops expired windows first, then the oldest insertions until the map is at or
/// under `max_keys`. Nothing prunes on a timer.
#[derive(Debug)]
pub struct FallbackStore {
    slots: HashMap<String, Slot>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
    max_keys: usize,
}

impl FallbackStore {
    /// Create an empty store capped at `max_keys` (at least one).
    pub fn new(max_keys: usize) -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            max_keys: max_keys.max(1),
        }
    }

    /// Look up the bucket for `key`.
    pub fn get(&self, key: &str) -> Option<Bucket> {
        self.slots.get(key).map(|slot| slot.bucket)
    }

    /// Insert or overwrite the bucket for `key`.
    pub fn set(&mut self, key: &str, bucket: Bucket) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.bucket = bucket;
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.to_owned());
        self.slots.insert(key.to_owned(), Slot { bucket, seq });
    }

    /// Remove the bucket for `key`, if any.
    pub fn remove(&mut self, key: &str) -> Option<Bucket> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.bucket)
    }

    /// Drop expired buckets, then evict oldest-inserted buckets down to the cap.
    pub fn prune(&mut self, now_ms: u64) {
        if self.slots.is_empty() {
            return;
        }

        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.bucket.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }

        while self.slots.len() > self.max_keys {
            let Some((_, key)) = self.order.pop_first() else { break };
            self.slots.remove(&key);
        }
    }

    /// Number of tracked identifiers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Configured cap.
    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Forget every bucket.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(reset_at_ms: u64) -> Bucket {
        Bucket { count: 1, reset_at_ms }
    }

    #[test]
    fn prune_removes_expired_first() {
        let mut store = FallbackStore::new(10);
        store.set("old", bucket(100));
        store.set("fresh", bucket(500));
        store.prune(100);
        assert!(store.get("old").is_none());
        assert_eq!(store.get("fresh"), Some(bucket(500)));
    }

    #[test]
    fn prune_evicts_oldest_insertions_over_cap() {
        let mut store = FallbackStore::new(2);
        for key in ["a", "b", "c", "d"] {
            store.set(key, bucket(1_000));
        }
        store.prune(0);
        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_none());
        assert!(store.get("b").is_none());
        assert!(store.get("c").is_some());
        assert!(store.get("d").is_some());
    }

    #[test]
    fn overwrite_keeps_insertion_position() {
        let mut store = FallbackStore::new(1);
        store.set("first", bucket(1_000));
        store.set("second", bucket(1_000));
        store.set("first", Bucket { count: 5, reset_at_ms: 1_000 });
        store.prune(0);
        assert!(store.get("first").is_none());
        assert!(store.get("second").is_some());
    }

    #[test]
    fn expired_entries_count_toward_cap_before_eviction() {
        let mut store = FallbackStore::new(2);
        store.set("a", bucket(1_000));
        store.set("stale", bucket(10));
        store.set("b", bucket(1_000));
        store.prune(50);
        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_some());
    }

    #[test]
    fn removed_key_reinserts_at_the_back() {
        let mut store = FallbackStore::new(1);
        store.set("a", bucket(1_000));
        store.set("b", bucket(1_000));
        store.remove("a");
        store.set("a", bucket(1_000));
        store.prune(0);
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
    }

    #[test]
    fn zero_cap_is_clamped() {
        let mut store = FallbackStore::new(0);
        assert_eq!(store.max_keys(), 1);
        store.set("a", bucket(1_000));
        store.prune(0);
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }
}
