pub mod cache;
pub mod entry;
pub mod stamp;
pub mod tictoc;
pub mod transaction;


/// A logical timestamp. Lives in the 48-bit wts field of a key's timestamp
/// word; commit timestamps are derived from the timestamps of the data each
/// transaction touched rather than from a global counter.
pub type Timestamp = u64;

pub use tictoc::{Config, IsolationLevel, Status, ThreadRegistration, TicToc};
pub use transaction::Transaction;
