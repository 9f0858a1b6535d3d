use std::cmp::{max, Ordering};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CResult, Error};
use crate::storage::data::DataConfig;
use crate::storage::engine::Engine;
use crate::tictoc::cache::{Slot, StampCache};
use crate::tictoc::entry::{Message, RwEntry};
use crate::tictoc::stamp::Stamp;
use crate::tictoc::Timestamp;

/// Bound on the number of distinct keys one transaction may touch.
pub const MAX_RW_ENTRIES: usize = 1024;

/// Back-off before restarting write-lock acquisition after a conflict.
const LOCK_RETRY_BACKOFF: Duration = Duration::from_micros(1);

/// A serializable transaction over a shared storage engine.
///
/// Reads and writes never touch the engine until commit: writes buffer as
/// messages in the transaction's rw-set, and reads sample the key's
/// timestamp word from the shared stamp cache alongside the value. commit()
/// then locks the write keys in sorted order, derives a commit timestamp,
/// revalidates the reads at that timestamp, and applies the buffered writes,
/// as described on [`super::TicToc`].
///
/// A transaction belongs to one thread. Dropping it without committing
/// behaves like abort(): all buffered state and stamp-cache references are
/// released.
pub struct Transaction<E: Engine> {
    /// The underlying engine, shared by all transactions.
    engine: Arc<Mutex<E>>,

    /// The shared timestamp cache.
    cache: Arc<StampCache>,

    /// The data config: key ordering, key size bound, update merging.
    data: Arc<dyn DataConfig>,

    /// Live-transaction count on the owning handle, for status and the
    /// close-time assertion.
    active_txns: Arc<AtomicU64>,

    /// One entry per distinct key touched, in first-touch order.
    entries: Vec<RwEntry>,

    /// Set once the transaction has committed, aborted, or been dropped.
    done: bool,
}

impl<E: Engine> Transaction<E> {
    /// Begins a fresh transaction against the shared state.
    pub(crate) fn begin(
        engine: Arc<Mutex<E>>,
        cache: Arc<StampCache>,
        data: Arc<dyn DataConfig>,
        active_txns: Arc<AtomicU64>,
    ) -> CResult<Self> {
        active_txns.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Transaction { engine, cache, data, active_txns, entries: Vec::new(), done: false })
    }

    /// Buffers a write setting the key to the given value.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> CResult<()> {
        self.local_write(key, Message::Insert(value.to_vec()))
    }

    /// Buffers a merge-update of the key with the given delta.
    pub fn update(&mut self, key: &[u8], delta: &[u8]) -> CResult<()> {
        self.local_write(key, Message::Update(delta.to_vec()))
    }

    /// Buffers a deletion of the key.
    pub fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.local_write(key, Message::Delete)
    }

    /// Reads a key, seeing this transaction's own buffered writes first.
    ///
    /// The value and the timestamp sample must agree, but the engine cannot
    /// be consulted while holding any lock. So the read sandwiches the value
    /// fetch between two snapshots of the timestamp word and retries until
    /// both snapshots match with the lock bit clear, seqlock style.
    pub fn lookup(&mut self, user_key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let i = self.rw_entry(user_key, true)?;
        let slot = self.install_slot(i);

        loop {
            let v1 = slot.stamp.load();

            let value = if let Some(msg) = &self.entries[i].msg {
                // Read own writes: serve from the buffered message. A
                // pending update reads as the folded accumulator.
                match msg {
                    Message::Insert(value) | Message::Update(value) => Some(value.clone()),
                    Message::Delete => None,
                }
            } else {
                self.engine.lock()?.get(user_key)?
            };

            let v2 = slot.stamp.load();
            if v1 == v2 && !v1.locked() {
                let entry = &mut self.entries[i];
                entry.wts = v1.wts();
                entry.rts = v1.rts();
                return Ok(value);
            }
            std::hint::spin_loop();
        }
    }

    /// Commits the transaction, returning its commit timestamp.
    /// On `Err(Error::Abort)` the transaction lost a conflict and left no
    /// trace; the caller may retry it from scratch. All resources are
    /// released either way.
    pub fn commit(mut self) -> CResult<Timestamp> {
        let result = self.try_commit();
        self.finish();
        result
    }

    /// Rolls the transaction back. Nothing was applied, so this only
    /// releases buffered state; on an empty transaction it is a no-op.
    pub fn abort(mut self) -> CResult<()> {
        self.finish();
        Ok(())
    }

    /// The commit protocol:
    ///
    /// 1. Split the rw-set into reads and writes; seed the commit timestamp
    ///    with the largest write timestamp observed by a read.
    /// 2. Sort the write set by key; locking in one global order rules out
    ///    deadlock between writers.
    /// 3. Take the lock bit on every write key, no-wait: on conflict release
    ///    everything taken this attempt, back off ~1µs, start over.
    /// 4. Raise the commit timestamp above every locked key's read
    ///    timestamp, so this write is newer than any observed read.
    /// 5. Revalidate reads whose sampled rts no longer covers the commit
    ///    timestamp: the version must be unchanged and not locked by
    ///    another writer, and its rts is extended up to the commit
    ///    timestamp by CAS.
    /// 6. Apply the buffered writes to the engine and stamp each written
    ///    key with the commit timestamp, releasing its lock.
    fn try_commit(&mut self) -> CResult<Timestamp> {
        let mut commit_ts: Timestamp = 0;
        let mut reads = Vec::new();
        let mut writes = Vec::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.is_write() {
                writes.push(i);
            }
            if entry.is_read {
                reads.push(i);
                let mut wts = entry.wts;
                if cfg!(feature = "silo") {
                    wts += 1;
                }
                commit_ts = max(commit_ts, wts);
            }
        }

        writes.sort_by(|&a, &b| self.data.key_compare(&self.entries[a].key, &self.entries[b].key));

        'lock: loop {
            for (n, &i) in writes.iter().enumerate() {
                let slot = self.install_slot(i);
                if !slot.stamp.try_lock() {
                    for &j in &writes[..n] {
                        self.slot_ref(j).stamp.unlock();
                    }
                    std::thread::sleep(LOCK_RETRY_BACKOFF);
                    continue 'lock;
                }
            }
            break;
        }

        for &i in &writes {
            commit_ts = max(commit_ts, self.slot_ref(i).stamp.load().rts() + 1);
        }

        let mut aborted = false;
        'validate: for &i in &reads {
            let entry = &self.entries[i];
            if entry.rts >= commit_ts {
                continue;
            }
            let slot = entry.slot.as_ref().expect("read entry without a stamp slot");
            loop {
                let v1 = slot.stamp.load();
                // A changed wts means a conflicting writer already
                // committed; a lock held by someone else means one is about
                // to. Our own write locks don't count.
                if v1.wts() != entry.wts
                    || (v1.rts() <= commit_ts && v1.locked() && !entry.is_write())
                {
                    aborted = true;
                    break 'validate;
                }
                if v1.rts() > commit_ts {
                    break;
                }
                if slot.stamp.cas(v1, v1.extended(commit_ts)) {
                    break;
                }
            }
        }

        if aborted {
            for &i in &writes {
                self.slot_ref(i).stamp.unlock();
            }
            log::debug!("transaction aborted at commit timestamp {}", commit_ts);
            return Err(Error::Abort);
        }

        for &i in &writes {
            let entry = &self.entries[i];
            let msg = entry.msg.as_ref().expect("write entry without a message");
            let rc = {
                let mut engine =
                    self.engine.lock().expect("storage engine mutex poisoned during commit");
                match msg {
                    Message::Insert(value) => engine.set(&entry.key, value.clone()),
                    Message::Update(delta) => engine.apply(&entry.key, delta, self.data.as_ref()),
                    Message::Delete => engine.delete(&entry.key),
                }
            };
            // The writes were locked and validated; a store that cannot
            // apply them is broken.
            assert!(rc.is_ok(), "storage apply failed during commit: {:?}", rc.err());

            let slot = entry.slot.as_ref().expect("write entry without a stamp slot");
            loop {
                let v1 = slot.stamp.load();
                if slot.stamp.cas(v1, Stamp::committed(commit_ts)) {
                    break;
                }
            }
        }

        Ok(commit_ts)
    }

    /// Returns the rw-entry index for a user key, creating one on first
    /// touch. At most one entry exists per distinct key.
    fn rw_entry(&mut self, user_key: &[u8], is_read: bool) -> CResult<usize> {
        if user_key.len() > self.data.max_key_len() {
            return Err(Error::Value(format!(
                "key length {} exceeds maximum {}",
                user_key.len(),
                self.data.max_key_len()
            )));
        }

        let index = self
            .entries
            .iter()
            .position(|entry| self.data.key_compare(&entry.key, user_key) == Ordering::Equal);
        let index = match index {
            Some(i) => i,
            None => {
                if self.entries.len() >= MAX_RW_ENTRIES {
                    return Err(Error::Value(format!(
                        "transaction touches more than {} keys",
                        MAX_RW_ENTRIES
                    )));
                }
                self.entries.push(RwEntry::new(user_key.to_vec()));
                self.entries.len() - 1
            }
        };

        self.entries[index].is_read |= is_read;
        Ok(index)
    }

    /// Ensures the entry holds a stamp-cache slot, taking the reference at
    /// most once, and returns it.
    fn install_slot(&mut self, i: usize) -> Arc<Slot> {
        if let Some(slot) = &self.entries[i].slot {
            return slot.clone();
        }
        let (slot, _) = self.cache.insert_or_get(&self.entries[i].key);
        self.entries[i].slot = Some(slot.clone());
        slot
    }

    fn slot_ref(&self, i: usize) -> &Arc<Slot> {
        self.entries[i].slot.as_ref().expect("stamp slot not installed")
    }

    /// Buffers a write message for the key, folding it into any pending
    /// message per the merge rules: inserts and deletes are definitive and
    /// replace what came before; updates merge via the data config.
    ///
    /// Updates and deletes depend on the key's current value, so they
    /// install the stamp slot right away and sample its timestamps into the
    /// entry; the sampled window joins the read set and is validated at
    /// commit. A blind insert needs neither: the lock/apply path orders it.
    fn local_write(&mut self, user_key: &[u8], msg: Message) -> CResult<()> {
        let i = self.rw_entry(user_key, false)?;

        if matches!(msg, Message::Update(_) | Message::Delete) {
            let slot = self.install_slot(i);
            let v = slot.stamp.load();
            let entry = &mut self.entries[i];
            entry.wts = v.wts();
            entry.rts = v.rts();
            entry.is_read = true;
        }

        let entry = &mut self.entries[i];
        match entry.msg.take() {
            None => entry.msg = Some(msg),
            Some(_) if msg.is_definitive() => entry.msg = Some(msg),
            Some(old) => {
                let delta = match msg {
                    Message::Update(delta) => delta,
                    _ => unreachable!("non-update messages are definitive"),
                };
                entry.msg = Some(match old {
                    Message::Insert(base) => {
                        Message::Insert(self.data.merge(&entry.key, Some(&base), &delta)?)
                    }
                    Message::Update(prev) => {
                        Message::Update(self.data.merge(&entry.key, Some(&prev), &delta)?)
                    }
                    Message::Delete => panic!("update buffered on top of a pending delete"),
                });
            }
        }
        Ok(())
    }

    /// Releases every rw-entry's stamp-cache reference and marks the
    /// transaction finished. Runs exactly once across commit, abort, and
    /// drop.
    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        for entry in self.entries.drain(..) {
            if entry.slot.is_some() {
                self.cache.release(&entry.key);
            }
        }
        self.active_txns.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

impl<E: Engine> Drop for Transaction<E> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data::{Additive, Bytewise};
    use crate::storage::memory::Memory;
    use crate::tictoc::tictoc::{Config, TicToc};

    fn setup() -> CResult<TicToc<Memory>> {
        TicToc::new(Memory::new(), Config::default())
    }

    fn setup_additive() -> CResult<TicToc<Memory>> {
        TicToc::new(Memory::new(), Config { data: Arc::new(Additive), ..Config::default() })
    }

    #[test]
    /// Touching the same key repeatedly reuses one rw-entry.
    fn rw_entries_deduplicate() -> CResult<()> {
        let db = setup()?;
        let mut txn = db.begin()?;
        txn.insert(b"a", b"1")?;
        txn.lookup(b"a")?;
        txn.insert(b"a", b"2")?;
        txn.insert(b"b", b"3")?;
        assert_eq!(txn.entries.len(), 2);
        assert!(txn.entries[0].is_read && txn.entries[0].is_write());
        txn.abort()?;
        Ok(())
    }

    #[test]
    /// Inserts and deletes replace pending messages; updates fold into them.
    fn message_merge_rules() -> CResult<()> {
        let db = setup_additive()?;

        let mut txn = db.begin()?;
        txn.insert(b"a", &Additive::encode(10))?;
        txn.update(b"a", &Additive::encode(5))?;
        assert_eq!(txn.entries[0].msg, Some(Message::Insert(Additive::encode(15))));

        txn.update(b"b", &Additive::encode(1))?;
        txn.update(b"b", &Additive::encode(2))?;
        assert_eq!(txn.entries[1].msg, Some(Message::Update(Additive::encode(3))));

        // A definitive message throws away what came before.
        txn.delete(b"a")?;
        assert_eq!(txn.entries[0].msg, Some(Message::Delete));
        txn.insert(b"a", &Additive::encode(1))?;
        assert_eq!(txn.entries[0].msg, Some(Message::Insert(Additive::encode(1))));

        txn.abort()?;
        Ok(())
    }

    #[test]
    #[should_panic(expected = "pending delete")]
    fn update_on_pending_delete_panics() {
        let db = setup_additive().unwrap();
        let mut txn = db.begin().unwrap();
        txn.delete(b"a").unwrap();
        txn.update(b"a", &Additive::encode(1)).unwrap();
    }

    #[test]
    /// Updates and deletes sample the key's timestamps and join the read
    /// set; blind inserts do neither.
    fn writes_sample_timestamps() -> CResult<()> {
        let db = setup()?;

        let mut txn = db.begin()?;
        txn.insert(b"i", b"v")?;
        assert!(!txn.entries[0].is_read);
        assert!(txn.entries[0].slot.is_none());

        txn.delete(b"d")?;
        assert!(txn.entries[1].is_read);
        assert!(txn.entries[1].slot.is_some());

        txn.update(b"u", b"v")?;
        assert!(txn.entries[2].is_read);
        assert!(txn.entries[2].slot.is_some());

        txn.abort()?;
        Ok(())
    }

    #[test]
    fn oversized_key_is_rejected() -> CResult<()> {
        let db = setup()?;
        let mut txn = db.begin()?;
        let key = vec![0u8; Bytewise.max_key_len() + 1];
        assert!(matches!(txn.insert(&key, b"v"), Err(Error::Value(_))));
        txn.abort()?;
        Ok(())
    }

    #[test]
    fn rw_set_is_bounded() -> CResult<()> {
        let db = setup()?;
        let mut txn = db.begin()?;
        for i in 0..MAX_RW_ENTRIES {
            txn.insert(&(i as u64).to_be_bytes(), b"v")?;
        }
        assert!(matches!(txn.insert(b"one too many", b"v"), Err(Error::Value(_))));
        txn.abort()?;
        Ok(())
    }
}
