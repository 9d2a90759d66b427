//! In-memory response cache with least-frequently-used eviction.
//!
//! [`FrequencyCache`] stores opaque payloads (plus the content type they were
//! served with) keyed by request path, bounded by the total number of payload
//! bytes. When a new entry does not fit, the entry read the fewest times is
//! evicted until it does.
//!
//! Every operation, reads included, takes the same lock: a successful
//! [`get`](FrequencyCache::get) bumps the entry's frequency, so it mutates.
//! Nothing under the lock performs I/O.
//!
//! ## Eviction order
//!
//! Candidates come from a binary min-heap on frequency. Ties between entries
//! with equal frequency are resolved by heap position, which is deterministic
//! for a given history of operations but not otherwise specified.
//!
//! Finding an entry's heap slot on a read is a linear scan over live entries
//! followed by a logarithmic re-sift. A key-to-slot side table would make the
//! read logarithmic without changing which entry gets evicted.
//!
//! ## Re-insertion
//!
//! Putting a key that is already cached replaces the old entry: its bytes are
//! released and its heap record is dropped before the new entry goes in with
//! frequency zero. A key therefore never has more than one heap record.

mod heap;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use heap::{FrequencyHeap, Record};

/// A cached response body and the content type it was served with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedData {
    pub content_type: String,
    pub data: Bytes,
}

impl CachedData {
    /// Creates a cache value. An empty payload is a zero-length payload.
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Point-in-time occupancy of a [`FrequencyCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Number of live entries.
    pub entries: usize,
    /// Sum of live payload sizes in bytes.
    pub size: usize,
    /// Configured capacity in bytes.
    pub max_size: usize,
}

// Everything the lock protects.
#[derive(Debug, Default)]
struct Store {
    data: HashMap<String, CachedData>,
    lfu: FrequencyHeap,
    size: usize,
}

impl Store {
    // Evicts the least frequently read entry. Returns `false` if empty.
    fn evict_lfu(&mut self) -> bool {
        let Some(record) = self.lfu.pop() else {
            return false;
        };
        self.data.remove(&record.key);
        self.size -= record.size;
        debug!(
            key = %record.key,
            size = record.size,
            frequency = record.frequency,
            entries = self.data.len(),
            "cache: evicted"
        );
        true
    }

    // Drops the entry for `key`, if any, releasing its bytes.
    fn remove(&mut self, key: &str) {
        let Some(slot) = self.lfu.position(key) else {
            return;
        };
        if let Some(record) = self.lfu.remove(slot) {
            self.data.remove(&record.key);
            self.size -= record.size;
            debug!(key = %record.key, size = record.size, "cache: replaced");
        }
    }

    fn insert(&mut self, key: String, value: CachedData) {
        let size = value.len();
        self.lfu.push(Record {
            key: key.clone(),
            size,
            frequency: 0,
        });
        self.data.insert(key.clone(), value);
        self.size += size;
        debug!(key = %key, size, entries = self.data.len(), "cache: added");
    }
}

/// A byte-bounded, least-frequently-used cache safe to share across tasks.
///
/// # Examples
///
/// ```
/// use sss::cache::{CachedData, FrequencyCache};
///
/// let cache = FrequencyCache::new(2048);
/// cache.put("/index.html", CachedData::new("text/html", &b"<h1>hi</h1>"[..]));
///
/// let hit = cache.get("/index.html").expect("cached");
/// assert_eq!(hit.content_type, "text/html");
/// assert_eq!(cache.size(), 11);
/// assert!(cache.get("/missing").is_none());
/// ```
#[derive(Debug)]
pub struct FrequencyCache {
    max_size: usize,
    store: Mutex<Store>,
}

impl FrequencyCache {
    /// Creates an empty cache holding at most `max_size` payload bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            store: Mutex::new(Store::default()),
        }
    }

    /// Configured capacity in bytes.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Sum of live payload sizes in bytes.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry count, size, and capacity read under one lock acquisition.
    pub fn stats(&self) -> CacheStats {
        let store = self.lock();
        CacheStats {
            entries: store.data.len(),
            size: store.size,
            max_size: self.max_size,
        }
    }

    /// Returns the cached value for `key` and counts the read toward its
    /// frequency. A miss changes nothing.
    pub fn get(&self, key: &str) -> Option<CachedData> {
        let mut store = self.lock();
        let value = store.data.get(key)?.clone();
        store.lfu.increment(key);
        Some(value)
    }

    /// Stores `value` under `key`, evicting least-frequently-read entries
    /// until it fits.
    ///
    /// A payload larger than the whole capacity is dropped without touching
    /// the cache, including any existing entry for `key`.
    pub fn put(&self, key: impl Into<String>, value: CachedData) {
        let key = key.into();
        let incoming = value.len();
        if incoming > self.max_size {
            debug!(key = %key, size = incoming, max_size = self.max_size, "cache: too large, skipped");
            return;
        }

        let mut store = self.lock();
        store.remove(&key);
        while store.size + incoming > self.max_size {
            if !store.evict_lfu() {
                break;
            }
        }
        store.insert(key, value);
    }

    // The store is consistent at every point that can panic, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn constant(size: usize, value: u8) -> CachedData {
        CachedData::new("text/plain", vec![value; size])
    }

    fn get_or_fail(cache: &FrequencyCache, key: &str) -> CachedData {
        cache
            .get(key)
            .unwrap_or_else(|| panic!("data not present for key: {key}"))
    }

    fn frequency(cache: &FrequencyCache, key: &str) -> Option<u64> {
        let store = cache.lock();
        let slot = store.lfu.position(key)?;
        Some(store.lfu.records()[slot].frequency)
    }

    fn live_sum(cache: &FrequencyCache) -> usize {
        cache.lock().data.values().map(CachedData::len).sum()
    }

    #[test]
    fn starts_empty() {
        let cache = FrequencyCache::new(2048);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        assert_eq!(
            cache.stats(),
            CacheStats {
                entries: 0,
                size: 0,
                max_size: 2048
            }
        );
    }

    #[test]
    fn hit_replays_payload_and_content_type() {
        let cache = FrequencyCache::new(1024);
        cache.put("/a", CachedData::new("text/plain", &b"payload"[..]));
        let hit = cache.get("/a").unwrap();
        assert_eq!(hit, CachedData::new("text/plain", &b"payload"[..]));
    }

    #[test]
    fn miss_does_not_mutate() {
        let cache = FrequencyCache::new(1024);
        cache.put("/a", constant(10, 1));
        cache.get("/a");
        let before = cache.lock().lfu.records().to_vec();

        assert!(cache.get("/nope").is_none());

        assert_eq!(cache.lock().lfu.records(), &before[..]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 10);
    }

    #[test]
    fn new_entries_start_at_zero_and_reads_count_by_one() {
        let cache = FrequencyCache::new(1024);
        cache.put("/a", constant(1, 1));
        assert_eq!(frequency(&cache, "/a"), Some(0));
        cache.get("/a");
        cache.get("/a");
        assert_eq!(frequency(&cache, "/a"), Some(2));
    }

    #[test]
    fn evicts_lower_frequency() {
        let cache = FrequencyCache::new(2048);
        cache.put("A", constant(1024, 1));
        cache.put("B", constant(1024, 2));
        for _ in 0..3 {
            get_or_fail(&cache, "A");
        }
        get_or_fail(&cache, "B");

        cache.put("C", constant(1024, 3));

        assert!(cache.get("B").is_none());
        assert_eq!(get_or_fail(&cache, "A"), constant(1024, 1));
        assert_eq!(get_or_fail(&cache, "C"), constant(1024, 3));
        assert_eq!(cache.size(), 2048);
    }

    #[test]
    fn eviction_follows_read_counts_over_time() {
        let cache = FrequencyCache::new(2048);
        let (d1, d2, d3) = (constant(1024, 1), constant(1024, 2), constant(1024, 3));

        cache.put("data1", d1.clone());
        cache.put("data2", d2.clone());
        assert_eq!(get_or_fail(&cache, "data1"), d1); // 1
        assert_eq!(get_or_fail(&cache, "data2"), d2); // 1

        get_or_fail(&cache, "data1"); // 2
        get_or_fail(&cache, "data1"); // 3
        get_or_fail(&cache, "data1"); // 4
        get_or_fail(&cache, "data2"); // 2
        get_or_fail(&cache, "data2"); // 3

        // data2 has the lower count
        cache.put("data3", d3.clone());
        assert_eq!(cache.size(), 2048);
        assert_eq!(get_or_fail(&cache, "data1"), d1); // 5
        assert_eq!(get_or_fail(&cache, "data3"), d3); // 1
        assert!(cache.get("data2").is_none());

        // data3 is now the lower count
        cache.put("data2", d2.clone());
        assert_eq!(cache.size(), 2048);
        assert_eq!(get_or_fail(&cache, "data1"), d1); // 6
        assert_eq!(get_or_fail(&cache, "data2"), d2); // 1
        assert!(cache.get("data3").is_none());

        for _ in 0..6 {
            get_or_fail(&cache, "data2"); // 7
        }

        cache.put("data3", d3.clone());
        assert_eq!(cache.size(), 2048);
        assert_eq!(get_or_fail(&cache, "data2"), d2);
        assert_eq!(get_or_fail(&cache, "data3"), d3);
        assert!(cache.get("data1").is_none());
    }

    #[test]
    fn oversized_put_leaves_cache_untouched() {
        let cache = FrequencyCache::new(100);
        cache.put("/a", constant(60, 1));
        cache.get("/a");
        let before = cache.lock().lfu.records().to_vec();

        cache.put("/big", constant(101, 2));
        cache.put("/a", constant(101, 3));

        assert_eq!(cache.lock().lfu.records(), &before[..]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 60);
        assert_eq!(cache.get("/a").unwrap(), constant(60, 1));
        assert!(cache.get("/big").is_none());
    }

    #[test]
    fn exact_capacity_fits() {
        let cache = FrequencyCache::new(100);
        cache.put("/a", constant(100, 1));
        assert_eq!(cache.size(), 100);
        cache.put("/b", constant(100, 2));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("/b").is_some());
    }

    #[test]
    fn empty_payload_is_zero_length_entry() {
        let cache = FrequencyCache::new(0);
        cache.put("/empty", CachedData::new("text/plain", Bytes::new()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 0);
        assert!(cache.get("/empty").unwrap().is_empty());
    }

    #[test]
    fn reinsertion_replaces_instead_of_duplicating() {
        let cache = FrequencyCache::new(2048);
        cache.put("A", constant(1024, 1));
        cache.get("A");
        cache.put("A", constant(1024, 9));

        // one record, fresh frequency, old bytes released
        assert_eq!(cache.lock().lfu.len(), 1);
        assert_eq!(frequency(&cache, "A"), Some(0));
        assert_eq!(cache.size(), 1024);

        // B fits next to the newer A; with a stale record for A still in
        // the heap this put would have evicted A's mapping
        cache.put("B", constant(1024, 2));
        assert_eq!(cache.len(), 2);
        assert_eq!(get_or_fail(&cache, "A"), constant(1024, 9));

        // the next eviction picks B (frequency 0 < A's 1) and A survives
        cache.put("C", constant(1024, 3));
        assert!(cache.get("B").is_none());
        assert_eq!(get_or_fail(&cache, "A"), constant(1024, 9));
        assert_eq!(cache.size(), live_sum(&cache));
    }

    #[test]
    fn concurrent_access_keeps_invariants() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(FrequencyCache::new(4096));
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("/k{}", (t * 7 + i) % 13);
                        if i % 3 == 0 {
                            cache.put(key, constant(100 + (i % 5) * 200, t as u8));
                        } else {
                            cache.get(&key);
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert!(cache.size() <= 4096);
        assert_eq!(cache.size(), live_sum(&cache));
        let store = cache.lock();
        assert_eq!(store.lfu.len(), store.data.len());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, usize),
        Get(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, 0usize..700).prop_map(|(k, n)| Op::Put(k, n)),
            (0u8..6).prop_map(Op::Get),
        ]
    }

    proptest! {
        #[test]
        fn size_tracks_live_entries(ops in prop::collection::vec(op(), 1..80)) {
            let cache = FrequencyCache::new(1024);
            for op in ops {
                match op {
                    Op::Put(k, n) => {
                        let before = cache.stats();
                        cache.put(format!("/{k}"), constant(n, k));
                        if n > 1024 {
                            prop_assert_eq!(cache.stats(), before);
                        }
                    }
                    Op::Get(k) => {
                        cache.get(&format!("/{k}"));
                    }
                }
                let store = cache.lock();
                let sum: usize = store.data.values().map(CachedData::len).sum();
                prop_assert_eq!(store.size, sum);
                prop_assert!(store.size <= cache.max_size);
                prop_assert_eq!(store.lfu.len(), store.data.len());
                for key in store.data.keys() {
                    let records = store.lfu.records().iter().filter(|r| &r.key == key).count();
                    prop_assert_eq!(records, 1);
                }
            }
        }

        #[test]
        fn last_put_that_fits_is_retrievable(k in 0u8..4, n in 0usize..=1024) {
            let cache = FrequencyCache::new(1024);
            cache.put("/x", constant(512, 7));
            cache.put(format!("/{k}"), constant(n, k));
            prop_assert_eq!(cache.get(&format!("/{k}")), Some(constant(n, k)));
        }
    }
}
