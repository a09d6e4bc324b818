//! In-memory caching for classification results and service lookups

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

struct CacheEntry<V> {
    value: V,
    inserted_at: SystemTime,
    expires_at: Option<SystemTime>,
}

/// Bounded in-memory cache with optional TTL.
///
/// When the capacity is reached the oldest entry (by insertion time) is
/// evicted. Readers take the lock briefly; no lock is held across I/O.
pub struct BoundedCache<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    capacity: usize,
    default_ttl: Option<Duration>,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    /// Cache with a size cap and no expiry.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            default_ttl: None,
        }
    }

    /// Cache with a size cap and a TTL applied to every entry.
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            default_ttl: Some(ttl),
        }
    }

    /// Get cached value if present and not expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        match entry.expires_at {
            Some(expires_at) if SystemTime::now() >= expires_at => None,
            _ => Some(entry.value.clone()),
        }
    }

    /// Insert a value, evicting the oldest entry when at capacity.
    pub fn set(&self, key: K, value: V) {
        let now = SystemTime::now();
        let entry = CacheEntry {
            value,
            inserted_at: now,
            expires_at: self.default_ttl.map(|ttl| now + ttl),
        };

        if let Ok(mut entries) = self.entries.write() {
            if !entries.contains_key(&key) && entries.len() >= self.capacity {
                // Expired entries first, then the oldest live one.
                entries.retain(|_, e| match e.expires_at {
                    Some(expires_at) => now < expires_at,
                    None => true,
                });
                if entries.len() >= self.capacity {
                    if let Some(oldest) = entries
                        .iter()
                        .min_by_key(|(_, e)| e.inserted_at)
                        .map(|(k, _)| k.clone())
                    {
                        entries.remove(&oldest);
                    }
                }
            }
            entries.insert(key, entry);
        }
    }

    /// Remove a single entry.
    pub fn invalidate(&self, key: &K) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Drop all entries.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_get_set() {
        let cache: BoundedCache<String, String> = BoundedCache::with_capacity(10);
        cache.set("k1".to_string(), "v1".to_string());
        assert_eq!(cache.get(&"k1".to_string()), Some("v1".to_string()));
        assert_eq!(cache.get(&"k2".to_string()), None);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache: BoundedCache<u32, u32> = BoundedCache::with_capacity(2);
        cache.set(1, 10);
        std::thread::sleep(Duration::from_millis(5));
        cache.set(2, 20);
        std::thread::sleep(Duration::from_millis(5));
        cache.set(3, 30);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn ttl_expiry() {
        let cache: BoundedCache<u32, u32> =
            BoundedCache::with_capacity_and_ttl(10, Duration::from_millis(50));
        cache.set(1, 10);
        assert_eq!(cache.get(&1), Some(10));
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache: BoundedCache<u32, u32> = BoundedCache::with_capacity(10);
        cache.set(1, 10);
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn overwriting_does_not_evict() {
        let cache: BoundedCache<u32, u32> = BoundedCache::with_capacity(2);
        cache.set(1, 10);
        cache.set(2, 20);
        cache.set(1, 11);
        assert_eq!(cache.get(&1), Some(11));
        assert_eq!(cache.get(&2), Some(20));
    }
}
