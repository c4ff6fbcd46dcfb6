use std::time::Duration;

use moka::sync::Cache;

use crate::fingerprint::Fingerprint;

/// Bounded, TTL-limited view of the last fingerprint seen per key.
///
/// Strictly a latency shortcut for back-to-back duplicates: absence here
/// proves nothing, and past the TTL window the durable store stays the only
/// authority for a drop decision. Nothing in here may block or fail the
/// decision path; anything going wrong degrades to a cache miss.
///
/// Entries are scoped to a partition. Different partitions own independent
/// key spaces, so the same document id on two partitions must not collide.
#[derive(Clone)]
pub struct RecencyCache {
    cache: Cache<String, Fingerprint>,
}

impl RecencyCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(max_entries)
            .build();

        Self { cache }
    }

    fn make_key(partition: i32, key: &str) -> String {
        format!("{partition}:{key}")
    }

    pub fn get(&self, partition: i32, key: &str) -> Option<Fingerprint> {
        self.cache.get(&Self::make_key(partition, key))
    }

    pub fn put(&self, partition: i32, key: &str, fingerprint: Fingerprint) {
        self.cache.insert(Self::make_key(partition, key), fingerprint);
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl std::fmt::Debug for RecencyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecencyCache")
            .field("cache", &"<moka cache>")
            .finish()
    }
}
