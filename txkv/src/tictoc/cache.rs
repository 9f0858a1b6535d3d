use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::tictoc::stamp::AtomicStamp;

/// Preallocation is clamped to 2^16 slots; the map grows on demand beyond
/// that, so larger log_slots values only serve as an upper-bound hint.
const MAX_PREALLOC_LOG_SLOTS: u8 = 16;

/// A key's entry in the stamp cache: the shared timestamp word plus the
/// number of live transaction entries pointing at it. Slots are handed out
/// as `Arc`s, so a slot never moves or frees while referenced.
#[derive(Debug, Default)]
pub struct Slot {
    /// The key's timestamp word.
    pub stamp: AtomicStamp,

    /// Number of live rw-entries referencing this slot.
    refs: AtomicU64,
}

/// The timestamp cache: a concurrent map from user keys to timestamp-word
/// slots, scoped to keys currently referenced by some live transaction.
///
/// Slots are reference counted. insert_or_get() installs a fresh zeroed slot
/// or bumps the refcount of an existing one; release() drops a reference and
/// removes the slot once nothing references it, forgetting the key's
/// timestamps. The refcount bookkeeping happens under the map's internal
/// shard lock, so a concurrent insert_or_get either sees a slot before its
/// removal (and keeps it alive) or inserts a fresh one.
///
/// With the `keep-all-keys` feature, refcounting and removal are disabled
/// and slots live forever. That trades unbounded memory for never losing a
/// key's timestamp history; only useful for benchmarks.
pub struct StampCache {
    slots: DashMap<Vec<u8>, Arc<Slot>>,
}

impl StampCache {
    /// Creates a cache sized by a log2 slot-count hint.
    pub fn with_log_slots(log_slots: u8) -> Self {
        let capacity = 1usize << log_slots.min(MAX_PREALLOC_LOG_SLOTS);
        StampCache { slots: DashMap::with_capacity(capacity) }
    }

    /// Returns the slot for the given key, installing a fresh zeroed slot if
    /// absent, and takes a reference on it. The flag is true if this call
    /// created the slot; with N concurrent callers on one key, all N get the
    /// same slot and exactly one sees true.
    pub fn insert_or_get(&self, key: &[u8]) -> (Arc<Slot>, bool) {
        match self.slots.entry(key.to_vec()) {
            Entry::Occupied(entry) => {
                let slot = entry.get().clone();
                if !cfg!(feature = "keep-all-keys") {
                    slot.refs.fetch_add(1, Ordering::SeqCst);
                }
                (slot, false)
            }
            Entry::Vacant(entry) => {
                let slot = Arc::new(Slot::default());
                if !cfg!(feature = "keep-all-keys") {
                    slot.refs.store(1, Ordering::SeqCst);
                }
                entry.insert(slot.clone());
                (slot, true)
            }
        }
    }

    /// Drops a reference on the key's slot, removing the slot when the count
    /// reaches zero. The caller must hold a reference from insert_or_get().
    pub fn release(&self, key: &[u8]) {
        if cfg!(feature = "keep-all-keys") {
            return;
        }
        // The decrement runs under the shard lock so it cannot interleave
        // with an insert_or_get() increment on the same key.
        self.slots.remove_if(key, |_, slot| slot.refs.fetch_sub(1, Ordering::SeqCst) == 1);
    }

    /// The number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tictoc::stamp::Stamp;

    #[test]
    #[cfg(not(feature = "keep-all-keys"))]
    fn insert_get_release() {
        let cache = StampCache::with_log_slots(4);
        assert!(cache.is_empty());

        let (slot, is_new) = cache.insert_or_get(b"a");
        assert!(is_new);
        assert_eq!(slot.stamp.load(), Stamp::ZERO);
        assert_eq!(cache.len(), 1);

        // A second taker shares the same slot.
        let (slot2, is_new) = cache.insert_or_get(b"a");
        assert!(!is_new);
        assert!(Arc::ptr_eq(&slot, &slot2));

        // The slot survives the first release and goes away on the last.
        cache.release(b"a");
        assert_eq!(cache.len(), 1);
        cache.release(b"a");
        assert!(cache.is_empty());
    }

    #[test]
    #[cfg(not(feature = "keep-all-keys"))]
    /// A reinstalled key gets a fresh slot with zeroed timestamps.
    fn removal_forgets_timestamps() {
        let cache = StampCache::with_log_slots(4);

        let (slot, _) = cache.insert_or_get(b"a");
        assert!(slot.stamp.cas(Stamp::ZERO, Stamp::new(9, 0, false)));
        cache.release(b"a");

        let (slot, is_new) = cache.insert_or_get(b"a");
        assert!(is_new);
        assert_eq!(slot.stamp.load(), Stamp::ZERO);
        cache.release(b"a");
    }

    #[test]
    #[cfg(feature = "keep-all-keys")]
    /// Slots are immortal in keep-all-keys mode.
    fn keep_all_keys_never_removes() {
        let cache = StampCache::with_log_slots(4);
        let (slot, is_new) = cache.insert_or_get(b"a");
        assert!(is_new);
        cache.release(b"a");
        assert_eq!(cache.len(), 1);

        let (slot2, is_new) = cache.insert_or_get(b"a");
        assert!(!is_new);
        assert!(Arc::ptr_eq(&slot, &slot2));
    }

    #[test]
    #[cfg(not(feature = "keep-all-keys"))]
    /// N concurrent takers of one key all get the same slot, exactly one of
    /// them creates it, and N releases empty the cache again.
    fn concurrent_insert_or_get() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 100;

        let cache = StampCache::with_log_slots(4);
        for _ in 0..ROUNDS {
            let results: Vec<(Arc<Slot>, bool)> = std::thread::scope(|s| {
                let handles: Vec<_> =
                    (0..THREADS).map(|_| s.spawn(|| cache.insert_or_get(b"hot"))).collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(results.iter().filter(|(_, is_new)| *is_new).count(), 1);
            let (first, _) = &results[0];
            assert!(results.iter().all(|(slot, _)| Arc::ptr_eq(slot, first)));

            for _ in 0..THREADS {
                cache.release(b"hot");
            }
            assert!(cache.is_empty());
        }
    }
}
