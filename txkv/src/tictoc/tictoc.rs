//! This mod implements serializable transactions over a key-value engine
//! with the TicToc protocol: optimistic concurrency control ordered by
//! data-driven timestamps, with no multi-versioning. Writes overwrite values
//! in place; all the ordering state lives in an in-memory timestamp cache.
//!
//!
//! TIMESTAMPS
//! ==========
//! Every key currently touched by some live transaction has a timestamp word
//! in the shared stamp cache, packed as `{ lock_bit:1, delta:15, wts:48 }`:
//!
//! * `wts` is the logical time of the key's most recent committed write.
//! * `rts = wts + delta` is the latest logical time at which the current
//!   value was observed by a committed read.
//! * the lock bit is a writer's exclusive intent, only held inside commit.
//!
//! A committed transaction behaves as if it executed atomically at its
//! commit timestamp: every value it read was current over `[wts, rts]`
//! covering that timestamp, and every value it wrote carries it as the new
//! `wts`. Timestamps are not assigned from a global counter up front; they
//! fall out of the data each transaction touched, which is what lets
//! non-conflicting transactions commit in parallel without coordination.
//!
//!
//! READS AND WRITES
//! ================
//! A running transaction never touches the engine for writes. insert, update
//! and delete buffer messages in a per-transaction rw-set; updates fold into
//! earlier buffered messages through the data config's merge function.
//! lookup serves the transaction's own buffered write if there is one, and
//! otherwise reads the engine between two snapshots of the key's timestamp
//! word, retrying until the word was stable and unlocked around the read.
//! Either way it samples `(wts, rts)` into the rw-entry; that sample is the
//! read the commit step later validates.
//!
//!
//! COMMIT
//! ======
//! Commit derives the transaction's place in the serial order and checks it:
//!
//! 1. `commit_ts` starts at the largest `wts` any read observed.
//! 2. Write keys are locked in sorted key order. Lock conflicts don't
//!    block: everything taken so far is released and the whole lock pass
//!    restarts after ~1µs, so writers cannot deadlock.
//! 3. Each locked key raises `commit_ts` above its `rts`: the new write
//!    must be strictly newer than every committed read of the old value.
//! 4. Each read whose sampled `rts` does not reach `commit_ts` is
//!    revalidated against the live word. If the key's `wts` changed, or
//!    another writer holds its lock, the snapshot cannot be extended and
//!    the transaction aborts, releasing its locks and leaving no trace.
//!    Otherwise the key's `rts` is pushed up to `commit_ts` by CAS,
//!    recording that the old value was still current then. A delta beyond
//!    its 15 bits shifts `wts` forward to absorb the excess.
//! 5. The buffered writes go to the engine, and each written key's word
//!    becomes `{ wts = commit_ts, delta = 0, unlocked }`.
//!
//! Aborted transactions may leave extended `rts` values behind. That is
//! harmless: an extension only records a read that really happened.
//!
//! The timestamp cache holds words only for keys some live transaction
//! references, so its size tracks the active working set, not the database.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::storage::bitcask::Bitcask;
use crate::storage::data::{Bytewise, DataConfig};
use crate::storage::engine::Engine;
use crate::tictoc::cache::StampCache;
use crate::tictoc::transaction::Transaction;

/// Default log2 of the stamp-cache slot-count hint.
const DEFAULT_TSCACHE_LOG_SLOTS: u8 = 29;

/// Transaction isolation levels. The field is stored for callers that want
/// to declare intent, but the protocol always runs serializable; weaker
/// levels are silently promoted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadCommitted,
    Snapshot,
    Serializable,
}

impl IsolationLevel {
    fn to_u8(self) -> u8 {
        match self {
            IsolationLevel::ReadCommitted => 0,
            IsolationLevel::Snapshot => 1,
            IsolationLevel::Serializable => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => IsolationLevel::ReadCommitted,
            1 => IsolationLevel::Snapshot,
            2 => IsolationLevel::Serializable,
            _ => unreachable!("invalid isolation level {}", v),
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::Serializable
    }
}

/// Configuration for a transactional store.
#[derive(Clone)]
pub struct Config {
    /// The requested isolation level; see [`IsolationLevel`].
    pub isolation: IsolationLevel,

    /// log2 of the stamp-cache slot-count hint.
    pub tscache_log_slots: u8,

    /// Key ordering, key size bound, and update merge semantics.
    pub data: Arc<dyn DataConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            isolation: IsolationLevel::default(),
            tscache_log_slots: DEFAULT_TSCACHE_LOG_SLOTS,
            data: Arc::new(Bytewise),
        }
    }
}

/// Transactional store status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Number of currently live transactions.
    pub active_txns: u64,

    /// Number of keys currently tracked by the stamp cache.
    pub tracked_keys: u64,

    /// Number of currently registered threads.
    pub registered_threads: u64,

    /// The storage engine.
    pub storage: crate::storage::Status,
}

/// A TicToc-transactional wrapper around a storage engine. It owns the
/// engine (behind a mutex shared with all transactions) and the timestamp
/// cache. Clones share the same store.
pub struct TicToc<E: Engine> {
    engine: Arc<Mutex<E>>,
    cache: Arc<StampCache>,
    data: Arc<dyn DataConfig>,
    isolation: Arc<AtomicU8>,
    active_txns: Arc<AtomicU64>,
    registered_threads: Arc<AtomicU64>,
}

impl<E: Engine> TicToc<E> {
    /// Wraps a storage engine in a transactional envelope.
    pub fn new(engine: E, config: Config) -> CResult<Self> {
        log::info!(
            "opening transactional store over {} (tscache 2^{} slots, silo={}, keep_all_keys={})",
            engine,
            config.tscache_log_slots,
            cfg!(feature = "silo"),
            cfg!(feature = "keep-all-keys"),
        );
        Ok(TicToc {
            engine: Arc::new(Mutex::new(engine)),
            cache: Arc::new(StampCache::with_log_slots(config.tscache_log_slots)),
            data: config.data,
            isolation: Arc::new(AtomicU8::new(config.isolation.to_u8())),
            active_txns: Arc::new(AtomicU64::new(0)),
            registered_threads: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> CResult<Transaction<E>> {
        Transaction::begin(
            self.engine.clone(),
            self.cache.clone(),
            self.data.clone(),
            self.active_txns.clone(),
        )
    }

    /// Registers the calling thread with the store, forwarding to the
    /// engine's hook. The returned guard deregisters on drop, on every exit
    /// path. Threads must be registered while they run transactions.
    pub fn register_thread(&self) -> CResult<ThreadRegistration<E>> {
        self.registered_threads.fetch_add(1, Ordering::SeqCst);
        self.engine.lock()?.register_thread();
        Ok(ThreadRegistration {
            engine: self.engine.clone(),
            registered_threads: self.registered_threads.clone(),
        })
    }

    /// Stores the requested isolation level. The protocol itself always
    /// runs serializable; a weaker requested level is accepted and silently
    /// promoted.
    pub fn set_isolation_level(&self, level: IsolationLevel) {
        self.isolation.store(level.to_u8(), Ordering::SeqCst);
    }

    /// The most recently requested isolation level.
    pub fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::from_u8(self.isolation.load(Ordering::SeqCst))
    }

    /// Returns store status.
    pub fn status(&self) -> CResult<Status> {
        Ok(Status {
            active_txns: self.active_txns.load(Ordering::SeqCst),
            tracked_keys: self.cache.len() as u64,
            registered_threads: self.registered_threads.load(Ordering::SeqCst),
            storage: self.engine.lock()?.status()?,
        })
    }

    /// Closes the store, flushing the engine. No transactions may be live
    /// and no threads registered.
    pub fn close(self) -> CResult<()> {
        debug_assert_eq!(
            self.active_txns.load(Ordering::SeqCst),
            0,
            "live transactions at close"
        );
        debug_assert_eq!(
            self.registered_threads.load(Ordering::SeqCst),
            0,
            "registered threads at close"
        );
        if !cfg!(feature = "keep-all-keys") {
            debug_assert!(self.cache.is_empty(), "stamp cache not empty at close");
        }
        self.engine.lock()?.flush()?;
        Ok(())
    }
}

impl TicToc<Bitcask> {
    /// Creates a new on-disk transactional store at the given path, which
    /// must not exist yet.
    pub fn create(path: std::path::PathBuf, config: Config) -> CResult<Self> {
        if path.try_exists()? {
            return Err(Error::Value(format!("{} already exists", path.display())));
        }
        Self::new(Bitcask::new(path)?, config)
    }

    /// Opens an existing on-disk transactional store at the given path.
    pub fn open(path: std::path::PathBuf, config: Config) -> CResult<Self> {
        if !path.try_exists()? {
            return Err(Error::Value(format!("{} does not exist", path.display())));
        }
        Self::new(Bitcask::new(path)?, config)
    }
}

impl<E: Engine> Clone for TicToc<E> {
    fn clone(&self) -> Self {
        TicToc {
            engine: self.engine.clone(),
            cache: self.cache.clone(),
            data: self.data.clone(),
            isolation: self.isolation.clone(),
            active_txns: self.active_txns.clone(),
            registered_threads: self.registered_threads.clone(),
        }
    }
}

/// A thread's registration with the store; deregisters on drop.
pub struct ThreadRegistration<E: Engine> {
    engine: Arc<Mutex<E>>,
    registered_threads: Arc<AtomicU64>,
}

impl<E: Engine> Drop for ThreadRegistration<E> {
    fn drop(&mut self) {
        if let Ok(mut engine) = self.engine.lock() {
            engine.deregister_thread();
        }
        self.registered_threads.fetch_sub(1, Ordering::SeqCst);
    }
}
