use std::sync::atomic::{AtomicU64, Ordering};

use crate::tictoc::Timestamp;

/// Number of bits for the write timestamp.
const WTS_BITS: u32 = 48;
/// Number of bits for the read-timestamp delta.
const DELTA_BITS: u32 = 15;

const WTS_MASK: u64 = (1 << WTS_BITS) - 1;
/// Largest representable delta; also the split mask for rts extension.
const DELTA_MASK: u64 = (1 << DELTA_BITS) - 1;
const LOCK_BIT: u64 = 1 << (WTS_BITS + DELTA_BITS);

/// A snapshot of a key's timestamp word: a write timestamp (48 bits), a
/// delta to the read timestamp (15 bits), and a lock bit, packed into one
/// u64 so the whole envelope moves under a single compare-and-swap.
///
/// The read timestamp rts = wts + delta is the latest logical time at which
/// the key's current value was observed; it is never stored directly, only
/// as the delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stamp(u64);

impl Stamp {
    /// The zero stamp: unwritten, unread, unlocked.
    pub const ZERO: Stamp = Stamp(0);

    /// Packs a stamp. The wts and delta must fit their fields.
    pub fn new(wts: Timestamp, delta: u64, locked: bool) -> Self {
        debug_assert!(wts <= WTS_MASK, "write timestamp overflows 48 bits");
        debug_assert!(delta <= DELTA_MASK, "delta overflows 15 bits");
        Stamp(wts | (delta << WTS_BITS) | if locked { LOCK_BIT } else { 0 })
    }

    /// The write timestamp: logical time of the most recent committed writer.
    pub fn wts(self) -> Timestamp {
        self.0 & WTS_MASK
    }

    /// The gap from wts to the read-timestamp envelope.
    pub fn delta(self) -> u64 {
        (self.0 >> WTS_BITS) & DELTA_MASK
    }

    /// The read timestamp, rts = wts + delta.
    pub fn rts(self) -> Timestamp {
        self.wts() + self.delta()
    }

    /// Whether the lock bit is set (exclusive write intent).
    pub fn locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    /// This stamp with the lock bit set.
    pub fn with_lock(self) -> Self {
        Stamp(self.0 | LOCK_BIT)
    }

    /// This stamp with the lock bit cleared, wts and delta preserved.
    pub fn without_lock(self) -> Self {
        Stamp(self.0 & !LOCK_BIT)
    }

    /// The stamp a committed write leaves behind: rts collapses onto the new
    /// wts and the lock is released.
    pub fn committed(commit_ts: Timestamp) -> Self {
        Stamp::new(commit_ts, 0, false)
    }

    /// Extends the read timestamp to cover commit_ts, preserving the lock
    /// bit. A delta beyond 15 bits cannot be stored directly, so the excess
    /// shifts wts forward while the remainder stays in the delta field; the
    /// resulting rts lands exactly on commit_ts.
    pub fn extended(self, commit_ts: Timestamp) -> Self {
        debug_assert!(commit_ts >= self.wts());
        let delta = commit_ts - self.wts();
        let shift = delta & !DELTA_MASK;
        Stamp::new(self.wts() + shift, delta - shift, self.locked())
    }
}

/// A key's shared timestamp word. All accesses go through atomic loads and
/// single-word compare-and-swaps of the full 64-bit payload; the AtomicU64
/// guarantees the 8-byte alignment the protocol needs.
#[derive(Debug, Default)]
pub struct AtomicStamp(AtomicU64);

impl AtomicStamp {
    /// Atomically loads a snapshot of the word.
    pub fn load(&self) -> Stamp {
        Stamp(self.0.load(Ordering::SeqCst))
    }

    /// Atomically replaces `current` with `new`. Returns false if the word
    /// no longer holds `current`.
    pub fn cas(&self, current: Stamp, new: Stamp) -> bool {
        self.0.compare_exchange(current.0, new.0, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    /// Tries to take the lock bit. Fails if the word is already locked or
    /// changes concurrently; no waiting.
    pub fn try_lock(&self) -> bool {
        let v = self.load();
        if v.locked() {
            return false;
        }
        self.cas(v, v.with_lock())
    }

    /// Releases the lock bit, preserving wts and delta. Loops until the CAS
    /// lands, since readers may extend the delta concurrently.
    pub fn unlock(&self) {
        loop {
            let v = self.load();
            if self.cas(v, v.without_lock()) {
                return;
            }
        }
    }
}
