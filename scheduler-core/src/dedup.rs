use dashmap::DashSet;

use crate::error::SchedulerResult;
use crate::store::TaskStore;

/// In-memory set of recently-processed grouping keys (spec §4.3).
///
/// `DashSet` gives exact membership with concurrent readers/writers, unlike
/// a Bloom filter — correctness of suppression depends on `has` being exact.
#[derive(Default)]
pub struct DedupCache {
    keys: DashSet<Vec<u8>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, key: &[u8]) -> bool {
        self.keys.contains(key)
    }

    pub fn set(&self, key: Vec<u8>) {
        self.keys.insert(key);
    }

    /// Populate the cache from the store's durable processed-key records.
    /// Failures abort startup (spec §4.3 "Warm-up").
    pub async fn warm_up<S: TaskStore>(&self, store: &S) -> SchedulerResult<usize> {
        let keys = store.get_processed().await?;
        let count = keys.len();
        for key in keys {
            self.keys.insert(key);
        }
        Ok(count)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn warm_up_populates_from_store() {
        let store = MemoryStore::new();
        store.insert_processed(b"notify_a_2024-01-01 10").await.unwrap();
        store.insert_processed(b"notify_b_2024-01-01 11").await.unwrap();

        let cache = DedupCache::new();
        let n = cache.warm_up(&store).await.unwrap();
        assert_eq!(n, 2);
        assert!(cache.has(b"notify_a_2024-01-01 10"));
        assert!(!cache.has(b"notify_c_2024-01-01 10"));
    }

    #[test]
    fn has_and_set() {
        let cache = DedupCache::new();
        assert!(!cache.has(b"k"));
        cache.set(b"k".to_vec());
        assert!(cache.has(b"k"));
        assert_eq!(cache.len(), 1);
    }
}
