use crate::error::CResult;
use crate::storage::data::DataConfig;
use crate::storage::Status;

/// The key/value store the transaction layer wraps. Keys and values are
/// arbitrary byte strings; point reads and writes are all the commit
/// protocol needs, and all this trait asks for.
///
/// Engines do no concurrency control of their own: every method takes
/// `&mut self`, and the transaction layer serializes access behind a mutex
/// that is never held across timestamp work. Conflicts between transactions
/// are resolved by the timestamp protocol before a write ever reaches the
/// engine, so by the time set/apply/delete is called the write has already
/// won its key.
pub trait Engine: std::fmt::Display + Send + Sync {
    /// Gets the value of a key, if any.
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>>;

    /// Sets a key to a value, replacing any existing value.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()>;

    /// Merge-applies an update delta onto the stored value via the data
    /// config, writing the merged result back. A missing key merges the
    /// delta onto nothing.
    fn apply(&mut self, key: &[u8], delta: &[u8], data: &dyn DataConfig) -> CResult<()> {
        let old = self.get(key)?;
        let merged = data.merge(key, old.as_deref(), delta)?;
        self.set(key, merged)
    }

    /// Deletes a key, or does nothing if it does not exist.
    fn delete(&mut self, key: &[u8]) -> CResult<()>;

    /// Flushes any buffered data to the underlying storage medium.
    fn flush(&mut self) -> CResult<()>;

    /// Returns engine status.
    fn status(&mut self) -> CResult<Status>;

    /// Called when a thread starts using the engine. Engines with
    /// per-thread state hook in here; the default does nothing.
    fn register_thread(&mut self) {}

    /// Called when a thread is done with the engine.
    fn deregister_thread(&mut self) {}
}
