pub mod bitcask;
pub mod data;
pub mod engine;
pub mod memory;

use serde_derive::{Deserialize, Serialize};

/// Storage engine status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the storage engine.
    pub name: String,

    /// The number of live keys.
    pub keys: u64,

    /// The logical size of the live key/value pairs.
    pub size: u64,

    /// Bytes on disk, live and garbage. Zero for volatile engines.
    pub disk_size: u64,

    /// Bytes on disk occupied by live entries.
    pub live_disk_size: u64,
}

impl Status {
    /// Bytes on disk occupied by replaced values and tombstones.
    pub fn garbage_disk_size(&self) -> u64 {
        self.disk_size - self.live_disk_size
    }
}
