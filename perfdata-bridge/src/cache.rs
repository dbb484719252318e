//! Resource existence cache shared by the workers
//!
//! Advisory only: a miss costs one redundant `create_resource` call, which
//! the store answers with "already exists".

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait ResourceCache: Send + Sync {
    /// Whether the resource is known to exist in the store.
    fn contains(&self, resource_id: &str) -> bool;

    fn insert(&self, resource_id: &str);
}

pub type SharedResourceCache = Arc<dyn ResourceCache>;

/// In-process cache whose entries expire after `ttl`.
pub struct MemoryResourceCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryResourceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResourceCache for MemoryResourceCache {
    fn contains(&self, resource_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(resource_id) {
            Some(inserted) if inserted.elapsed() < self.ttl => true,
            Some(_) => {
                entries.remove(resource_id);
                false
            }
            None => false,
        }
    }

    fn insert(&self, resource_id: &str) {
        let mut entries = self.entries.lock();
        // expired entries are otherwise only dropped on lookup
        let ttl = self.ttl;
        entries.retain(|_, inserted| inserted.elapsed() < ttl);
        entries.insert(resource_id.to_string(), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_contains() {
        let cache = MemoryResourceCache::new(Duration::from_secs(60));
        assert!(!cache.contains("a"));
        cache.insert("a");
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_entries_expire() {
        let cache = MemoryResourceCache::new(Duration::ZERO);
        cache.insert("a");
        assert!(!cache.contains("a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shared_between_threads() {
        let cache: SharedResourceCache = Arc::new(MemoryResourceCache::new(Duration::from_secs(60)));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.insert(&format!("r{}", i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!((0..4).all(|i| cache.contains(&format!("r{}", i))));
    }
}
