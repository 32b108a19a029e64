//! Expiring key/value store used to bound the call rate to backends.
//!
//! Entries carry an absolute expiry instant. Expired entries are purged lazily
//! on read, or in bulk by `cleanup()`; an expired value is never handed out.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
pub struct ResourceCache<V, K = String> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<V: Clone, K: Eq + Hash> ResourceCache<V, K> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().insert(key, entry);
    }

    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Sweeps every expired entry and returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone, K: Eq + Hash> Default for ResourceCache<V, K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn value_visible_until_ttl_elapses() {
        let cache: ResourceCache<u32> = ResourceCache::new();
        cache.set("pods:infra".to_string(), 7, Duration::from_secs(15));

        assert_eq!(cache.get("pods:infra"), Some(7));

        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(cache.get("pods:infra"), Some(7));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("pods:infra"), None);
        // lazy purge already removed it
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.cleanup(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_sweeps_only_expired_entries() {
        let cache: ResourceCache<&'static str> = ResourceCache::new();
        cache.set("short".to_string(), "a", Duration::from_secs(5));
        cache.set("long".to_string(), "b", Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long"), Some("b"));
        assert_eq!(cache.get("short"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_and_clear_invalidate_immediately() {
        let cache: ResourceCache<bool> = ResourceCache::new();
        cache.set("availability".to_string(), true, Duration::from_secs(5));
        cache.set("health".to_string(), true, Duration::from_secs(5));

        assert!(cache.delete("availability"));
        assert!(!cache.delete("availability"));
        assert_eq!(cache.get("availability"), None);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_value_and_expiry() {
        let cache: ResourceCache<u8> = ResourceCache::new();
        cache.set("k".to_string(), 1, Duration::from_secs(2));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("k".to_string(), 2, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k"), Some(2));
    }
}
