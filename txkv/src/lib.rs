//! `txkv` wraps a key-value storage engine in serializable transactions,
//! using timestamp-ordered optimistic concurrency control
//! (TicToc). Transactions buffer their writes and sample per-key timestamps
//! while running; commit locks the write keys in order, validates the reads
//! at a derived commit timestamp, and applies the writes. There is no
//! multi-versioning and no global timestamp counter; conflicting
//! transactions abort and retry. [Author fengyang]
//!
//! Two storage engines are provided: an in-memory BTreeMap engine, and a
//! bitcask-style append-only log engine with an in-memory index.
//!
//! ## Getting started
//!
//! ```rust
//! use txkv::error::CResult;
//! use txkv::storage::memory::Memory;
//! use txkv::tictoc::{Config, TicToc};
//!
//! fn main() -> CResult<()> {
//!     let db = TicToc::new(Memory::new(), Config::default())?;
//!
//!     let mut txn = db.begin()?;
//!     txn.insert(b"hello", b"world")?;
//!     // A transaction reads its own buffered writes.
//!     assert_eq!(txn.lookup(b"hello")?, Some(b"world".to_vec()));
//!     txn.commit()?;
//!
//!     let mut txn = db.begin()?;
//!     assert_eq!(txn.lookup(b"hello")?, Some(b"world".to_vec()));
//!     txn.commit()?;
//!
//!     db.close()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod storage;
pub mod tictoc;

#[cfg(test)]
mod test {
    use crate::error::CResult;
    use crate::tictoc::{Config, TicToc};

    #[test]
    fn run() -> CResult<()> {
        let dir = tempdir::TempDir::new("txkv")?;
        let path = dir.path().join("whosdb");

        let db = TicToc::create(path.clone(), Config::default())?;

        let mut txn = db.begin()?;
        txn.insert(b"b", &[0x01])?;
        txn.insert(b"b", &[0x02])?;
        txn.insert(b"e", &[0x05])?;
        txn.delete(b"e")?;
        txn.insert(b"a", &[0x01])?;
        txn.commit()?;

        let mut txn = db.begin()?;
        assert_eq!(txn.lookup(b"a")?, Some(vec![0x01]));
        assert_eq!(txn.lookup(b"b")?, Some(vec![0x02]));
        assert_eq!(txn.lookup(b"e")?, None);
        txn.commit()?;

        db.close()?;

        Ok(())
    }
}
