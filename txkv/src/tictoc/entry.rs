use std::sync::Arc;

use crate::tictoc::cache::Slot;
use crate::tictoc::Timestamp;

/// A buffered write: what a transaction wants done to a key at commit.
/// Dispatch on the variant happens only in the commit apply step.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Set the key to this value.
    Insert(Vec<u8>),
    /// Merge this delta onto the key's value via the data config.
    Update(Vec<u8>),
    /// Remove the key.
    Delete,
}

impl Message {
    /// Definitive messages replace any earlier buffered message for the key;
    /// only updates compose.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, Message::Update(_))
    }
}

/// A transaction's record of one accessed key: the owned key, any buffered
/// write, the timestamps sampled when the key was read, and a reference into
/// the stamp cache. Holding the `Arc<Slot>` is holding the cache refcount;
/// the slot stays pinned until the entry releases it.
pub struct RwEntry {
    /// Owned copy of the user key.
    pub key: Vec<u8>,

    /// The buffered write, if any. An entry with a message is a write.
    pub msg: Option<Message>,

    /// Write timestamp sampled when this entry last read the key.
    pub wts: Timestamp,

    /// Read timestamp sampled alongside wts.
    pub rts: Timestamp,

    /// The key's stamp-cache slot; None until installed.
    pub slot: Option<Arc<Slot>>,

    /// Whether this entry observed the key's value; read entries are
    /// validated at commit.
    pub is_read: bool,
}

impl RwEntry {
    pub fn new(key: Vec<u8>) -> Self {
        RwEntry { key, msg: None, wts: 0, rts: 0, slot: None, is_read: false }
    }

    pub fn is_write(&self) -> bool {
        self.msg.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitive_messages() {
        assert!(Message::Insert(vec![1]).is_definitive());
        assert!(Message::Delete.is_definitive());
        assert!(!Message::Update(vec![1]).is_definitive());
    }

    #[test]
    fn fresh_entry_is_neither_read_nor_write() {
        let entry = RwEntry::new(b"k".to_vec());
        assert!(!entry.is_read);
        assert!(!entry.is_write());
        assert!(entry.slot.is_none());
        assert_eq!((entry.wts, entry.rts), (0, 0));
    }
}
