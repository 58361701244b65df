//! Shared token-value cache
//!
//! Two-tier design: each unit of work carries a private staging map
//! ([`UnitOfWorkCache`]) layered over a process-wide bounded LRU map
//! protected by a mutex. Staged entries become visible to other workers
//! only when the owning transaction commits and calls
//! [`TokenValueCache::publish`]; a rolled-back unit of work calls
//! [`TokenValueCache::discard`] and leaves the shared tier untouched.
//!
//! The lock around the shared tier is held only for the duration of a
//! map operation, never across I/O.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

/// Bounded map with true LRU eviction: reads refresh recency and the
/// least-recently-used entry is evicted when an insert overflows the
/// fixed capacity.
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::with_capacity(capacity.max(1)),
            order: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let value = self.map.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    pub fn put(&mut self, key: K, value: V) {
        if self.map.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }

        self.order.push_back(key);
        while self.map.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    /// Merge a batch of entries, preserving the iteration order so the
    /// most recently staged entries end up most recent here too.
    pub fn update<I: IntoIterator<Item = (K, V)>>(&mut self, entries: I) {
        for (key, value) in entries {
            self.put(key, value);
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.clone());
    }
}

/// Key for the token-value tier: a code-system string paired with a
/// token within that system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub code_system: String,
    pub token_value: String,
}

impl TokenKey {
    pub fn new(code_system: impl Into<String>, token_value: impl Into<String>) -> Self {
        Self {
            code_system: code_system.into(),
            token_value: token_value.into(),
        }
    }
}

/// Private staging tier for one unit of work. Created at transaction
/// start, published or discarded at transaction end. Insertion order is
/// kept so publishing preserves recency in the shared LRU.
#[derive(Default)]
pub struct UnitOfWorkCache {
    staged: HashMap<TokenKey, i64>,
    order: Vec<TokenKey>,
}

impl UnitOfWorkCache {
    pub fn get(&self, key: &TokenKey) -> Option<i64> {
        self.staged.get(key).copied()
    }

    pub fn put(&mut self, key: TokenKey, id: i64) {
        if self.staged.insert(key.clone(), id).is_none() {
            self.order.push(key);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    fn drain(&mut self) -> Vec<(TokenKey, i64)> {
        let staged = std::mem::take(&mut self.staged);
        self.order
            .drain(..)
            .filter_map(|key| staged.get(&key).map(|id| (key.clone(), *id)))
            .collect()
    }
}

/// The shared, process-wide tier.
pub struct TokenValueCache {
    shared: Mutex<LruCache<TokenKey, i64>>,
}

impl TokenValueCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Create the staging handle for a new unit of work.
    pub fn begin(&self) -> UnitOfWorkCache {
        UnitOfWorkCache::default()
    }

    /// Lookup order: staging map, then shared map under lock. A shared
    /// hit is copied into the staging map so the unit of work can
    /// re-read it without taking the lock again.
    pub fn get(&self, uow: &mut UnitOfWorkCache, key: &TokenKey) -> Option<i64> {
        if let Some(id) = uow.get(key) {
            return Some(id);
        }

        let id = self.shared.lock().unwrap().get(key)?;
        uow.put(key.clone(), id);
        Some(id)
    }

    /// Promote a committed unit of work's staged entries into the
    /// shared tier. Clears the handle so it can be reused.
    pub fn publish(&self, uow: &mut UnitOfWorkCache) {
        let entries = uow.drain();
        if entries.is_empty() {
            return;
        }
        self.shared.lock().unwrap().update(entries);
    }

    /// Drop a rolled-back unit of work's staged entries without
    /// touching the shared tier.
    pub fn discard(&self, uow: &mut UnitOfWorkCache) {
        uow.staged.clear();
        uow.order.clear();
    }

    /// Clear both tiers. Staging handles are owned by callers; this
    /// clears the shared tier (used for test isolation).
    pub fn reset(&self) {
        self.shared.lock().unwrap().clear();
    }

    /// Seed the shared tier with known values without a unit of work.
    pub fn prefill<I: IntoIterator<Item = (TokenKey, i64)>>(&self, entries: I) {
        self.shared.lock().unwrap().update(entries);
    }

    pub fn shared_len(&self) -> usize {
        self.shared.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> TokenKey {
        TokenKey::new("sys", s)
    }

    #[test]
    fn test_lru_evicts_oldest_on_overflow() {
        let mut lru = LruCache::new(2);
        lru.put("a", 1);
        lru.put("b", 2);
        lru.put("c", 3);

        assert_eq!(lru.len(), 2);
        assert_eq!(lru.get(&"a"), None);
        assert_eq!(lru.get(&"b"), Some(2));
        assert_eq!(lru.get(&"c"), Some(3));
    }

    #[test]
    fn test_lru_read_refreshes_recency() {
        let mut lru = LruCache::new(2);
        lru.put("a", 1);
        lru.put("b", 2);

        // Touch "a" so "b" becomes the eviction candidate
        assert_eq!(lru.get(&"a"), Some(1));
        lru.put("c", 3);

        assert_eq!(lru.get(&"a"), Some(1));
        assert_eq!(lru.get(&"b"), None);
    }

    #[test]
    fn test_lru_put_existing_updates_value() {
        let mut lru = LruCache::new(2);
        lru.put("a", 1);
        lru.put("a", 5);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get(&"a"), Some(5));
    }

    #[test]
    fn test_staged_entry_invisible_until_publish() {
        let cache = TokenValueCache::new(10);
        let mut writer = cache.begin();
        writer.put(key("t1"), 42);

        // A different unit of work must not see the staged value
        let mut reader = cache.begin();
        assert_eq!(cache.get(&mut reader, &key("t1")), None);

        cache.publish(&mut writer);
        assert_eq!(cache.get(&mut reader, &key("t1")), Some(42));
    }

    #[test]
    fn test_discard_never_pollutes_shared_tier() {
        let cache = TokenValueCache::new(10);
        let mut writer = cache.begin();
        writer.put(key("t1"), 42);
        cache.discard(&mut writer);

        let mut reader = cache.begin();
        assert_eq!(cache.get(&mut reader, &key("t1")), None);
        assert_eq!(cache.shared_len(), 0);

        // And the discarded handle is empty if reused
        cache.publish(&mut writer);
        assert_eq!(cache.shared_len(), 0);
    }

    #[test]
    fn test_shared_hit_copied_into_staging() {
        let cache = TokenValueCache::new(10);
        cache.prefill(vec![(key("t1"), 7)]);

        let mut uow = cache.begin();
        assert_eq!(cache.get(&mut uow, &key("t1")), Some(7));
        // Now visible without the shared tier
        cache.reset();
        assert_eq!(cache.get(&mut uow, &key("t1")), Some(7));
    }

    #[test]
    fn test_publish_respects_capacity() {
        let cache = TokenValueCache::new(2);
        let mut uow = cache.begin();
        uow.put(key("a"), 1);
        uow.put(key("b"), 2);
        uow.put(key("c"), 3);
        cache.publish(&mut uow);

        assert_eq!(cache.shared_len(), 2);
        let mut reader = cache.begin();
        // "a" was staged first, so it is the LRU victim
        assert_eq!(cache.get(&mut reader, &key("a")), None);
        assert_eq!(cache.get(&mut reader, &key("c")), Some(3));
    }

    #[test]
    fn test_reset_clears_shared_tier() {
        let cache = TokenValueCache::new(10);
        cache.prefill(vec![(key("a"), 1), (key("b"), 2)]);
        assert_eq!(cache.shared_len(), 2);
        cache.reset();
        assert_eq!(cache.shared_len(), 0);
    }
}
