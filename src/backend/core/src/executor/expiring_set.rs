//! Concurrent set whose entries expire after a fixed TTL.

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Set of values remembered for `ttl` after insertion.
///
/// Expired entries are dropped lazily on lookup and in bulk by
/// [`ExpiringSet::purge_expired`].
#[derive(Debug)]
pub struct ExpiringSet<T>
where
    T: Eq + Hash,
{
    entries: DashMap<T, Instant>,
    ttl: Duration,
}

impl<T> ExpiringSet<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh a value.
    pub fn insert(&self, value: T) {
        self.entries.insert(value, Instant::now() + self.ttl);
    }

    pub fn contains(&self, value: &T) -> bool {
        let expired = match self.entries.get(value) {
            Some(expires_at) => *expires_at <= Instant::now(),
            None => return false,
        };
        if expired {
            // Only remove if nobody refreshed it in between.
            self.entries
                .remove_if(value, |_, expires_at| *expires_at <= Instant::now());
            return false;
        }
        true
    }

    pub fn remove(&self, value: &T) -> bool {
        self.entries.remove(value).is_some()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Entries currently stored, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_and_contains() {
        let set = ExpiringSet::new(Duration::from_secs(60));
        set.insert("key-1".to_string());
        assert!(set.contains(&"key-1".to_string()));
        assert!(!set.contains(&"key-2".to_string()));
        assert!(set.remove(&"key-1".to_string()));
        assert!(!set.contains(&"key-1".to_string()));
    }

    #[test]
    fn test_entries_expire() {
        let set = ExpiringSet::new(Duration::from_millis(20));
        set.insert(7u32);
        assert!(set.contains(&7));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!set.contains(&7));
        assert!(set.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let set = ExpiringSet::new(Duration::from_millis(20));
        set.insert(1u32);
        set.insert(2u32);
        std::thread::sleep(Duration::from_millis(40));
        set.insert(3u32);

        assert_eq!(set.purge_expired(), 2);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&3));
    }

    #[test]
    fn test_concurrent_inserts() {
        let set = Arc::new(ExpiringSet::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let set = Arc::clone(&set);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        set.insert(t * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.len(), 800);
    }
}
