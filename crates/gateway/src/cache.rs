//! Bounded, expiring key-value store shared by every echo cache.
//!
//! Each entry carries its own deadline; reads treat an expired entry as
//! absent and drop it.  When full, an insert first purges expired entries
//! and then evicts the least recently used one.  Time comes from
//! `tokio::time::Instant`, so tests can drive expiry with a paused clock.

use std::borrow::Borrow;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

struct Slot<V> {
    value: V,
    expires_at: Instant,
    /// Recency stamp; key into `order`.
    tick: u64,
}

pub struct ExpiringLru<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<K, Slot<V>>,
    /// tick → key, oldest first.
    order: BTreeMap<u64, K>,
    tick: u64,
}

impl<K, V> ExpiringLru<K, V>
where
    K: Hash + Eq + Clone,
{
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace `key` with the default TTL.
    pub fn insert(&mut self, key: K, value: V) {
        let ttl = self.ttl;
        self.insert_with_ttl(key, value, ttl);
    }

    pub fn insert_with_ttl(&mut self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.tick);
        } else {
            self.make_room();
        }
        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            Slot {
                value,
                expires_at: now + ttl,
                tick,
            },
        );
    }

    /// Live value for `key`, refreshing its recency (not its TTL).
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.touch(key) {
            return None;
        }
        self.entries.get(key).map(|s| &s.value)
    }

    /// Live value for `key` without touching recency.
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|s| s.expires_at > now)
            .map(|s| &s.value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.peek(key).is_some()
    }

    /// Mutable access to the live value for `key`, inserting `default()`
    /// when absent or expired.  Either way the entry's TTL restarts and it
    /// becomes the most recently used.
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        let now = Instant::now();
        let live = self.entries.get(&key).is_some_and(|s| s.expires_at > now);
        if !live {
            self.remove(&key);
            self.make_room();
        }

        let tick = self.next_tick();
        let expires_at = now + self.ttl;
        let slot = match self.entries.entry(key.clone()) {
            Entry::Occupied(o) => {
                let slot = o.into_mut();
                self.order.remove(&slot.tick);
                slot.tick = tick;
                slot.expires_at = expires_at;
                slot
            }
            Entry::Vacant(v) => v.insert(Slot {
                value: default(),
                expires_at,
                tick,
            }),
        };
        self.order.insert(tick, key);
        &mut slot.value
    }

    /// Remove `key`.  The value is returned only if it had not expired; an
    /// expired slot is dropped all the same.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.tick);
        (slot.expires_at > Instant::now()).then_some(slot.value)
    }

    /// Drop every expired entry.  Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    /// Live entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(move |(_, s)| s.expires_at > now)
            .map(|(k, s)| (k, &s.value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Refresh recency of a live entry.  Expired entries are removed and
    /// `false` is returned.
    fn touch<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return false,
            Some(s) if s.expires_at <= now => {
                self.remove(key);
                return false;
            }
            Some(_) => {}
        }

        let tick = self.next_tick();
        let Some(slot) = self.entries.get_mut(key) else {
            return false;
        };
        let old = std::mem::replace(&mut slot.tick, tick);
        if let Some(k) = self.order.remove(&old) {
            self.order.insert(tick, k);
        }
        true
    }

    fn make_room(&mut self) {
        if self.entries.len() < self.capacity {
            return;
        }
        self.purge_expired();
        while self.entries.len() >= self.capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let mut cache = ExpiringLru::new(10, Duration::from_secs(5));
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), Some(&1));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.contains_key("a"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_least_recently_used() {
        let mut cache = ExpiringLru::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Reading "a" makes "b" the oldest.
        assert_eq!(cache.get("a"), Some(&1));
        cache.insert("c", 3);

        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
        assert!(cache.contains_key("c"));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_prefers_purging_expired() {
        let mut cache = ExpiringLru::new(2, Duration::from_secs(60));
        cache.insert_with_ttl("short", 1, Duration::from_secs(1));
        cache.insert("long", 2);
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.insert("new", 3);
        assert!(cache.contains_key("long"));
        assert!(cache.contains_key("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_insert_with_restarts_ttl() {
        let mut cache: ExpiringLru<String, Vec<u32>> =
            ExpiringLru::new(10, Duration::from_secs(10));
        cache.get_or_insert_with("u".into(), Vec::new).push(1);

        tokio::time::advance(Duration::from_secs(8)).await;
        cache.get_or_insert_with("u".into(), Vec::new).push(2);

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.peek("u"), Some(&vec![1, 2]));

        tokio::time::advance(Duration::from_secs(3)).await;
        // Expired: a fresh value replaces the old one.
        cache.get_or_insert_with("u".into(), Vec::new).push(3);
        assert_eq!(cache.peek("u"), Some(&vec![3]));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_drops_but_does_not_return_expired_values() {
        let mut cache = ExpiringLru::new(10, Duration::from_secs(5));
        cache.insert("live", 1);
        cache.insert_with_ttl("stale", 2, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.remove("stale"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove("live"), Some(1));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_counts_removals() {
        let mut cache = ExpiringLru::new(10, Duration::from_secs(1));
        cache.insert(1, ());
        cache.insert(2, ());
        cache.insert_with_ttl(3, (), Duration::from_secs(30));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.iter().count(), 1);
    }
}
