use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::storage::engine::Engine;
use crate::storage::Status;

/// Record tag: the key carries a value.
const RECORD_PUT: u8 = 0x01;
/// Record tag: the key was deleted; no value follows.
const RECORD_TOMBSTONE: u8 = 0x00;
/// Fixed record header: tag byte, key length, value length.
const RECORD_HEADER: usize = 1 + 4 + 4;

/// A bitcask-flavored log-structured engine: one append-only log file, with
/// an in-memory index from live keys to their latest value's position. All
/// live keys must fit in memory.
///
/// Each log record is a 9-byte header followed by the key and value bytes:
///
/// - tag: u8, 0x01 for a put, 0x00 for a tombstone.
/// - key length: little-endian u32.
/// - value length: little-endian u32, zero for tombstones.
///
/// Overwritten values and tombstones accumulate as garbage until compact()
/// rewrites the log with only live records. A tombstone is appended only
/// when the deleted key is actually live, so deleting an absent key leaves
/// the log untouched. An exclusive file lock guards the log against a
/// second process.
pub struct Bitcask {
    /// Path to the log file.
    path: PathBuf,

    /// The open, locked log file.
    file: std::fs::File,

    /// Live keys and where their current values sit in the log.
    index: BTreeMap<Vec<u8>, ValueLocation>,
}

/// Position and length of a value inside the log file.
#[derive(Clone, Copy)]
struct ValueLocation {
    pos: u64,
    len: u32,
}

impl Bitcask {
    /// Opens the log at the given path, creating it if absent, and rebuilds
    /// the index by replaying it.
    pub fn new(path: PathBuf) -> CResult<Self> {
        let file = Self::open_locked(&path)?;
        let mut engine = Bitcask { path, file, index: BTreeMap::new() };
        engine.replay()?;
        Ok(engine)
    }

    /// Rewrites the log with only live records, dropping all garbage, and
    /// atomically swaps it in.
    pub fn compact(&mut self) -> CResult<()> {
        let mut tmp = self.path.clone();
        tmp.set_extension("rewrite");

        let mut file = Self::open_locked(&tmp)?;
        file.set_len(0)?; // a leftover rewrite from a crashed compaction
        let mut index = BTreeMap::new();
        let mut pos: u64 = 0;
        for (key, location) in &self.index {
            let value = Self::read_value(&mut self.file, *location)?;
            let record = encode_record(key, Some(&value));
            file.write_all(&record)?;
            index.insert(
                key.clone(),
                ValueLocation {
                    pos: pos + RECORD_HEADER as u64 + key.len() as u64,
                    len: value.len() as u32,
                },
            );
            pos += record.len() as u64;
        }
        file.sync_all()?;

        std::fs::rename(&tmp, &self.path)
            .map_err(|err| Error::Internal(format!("compaction rename failed: {}", err)))?;
        self.file = file;
        self.index = index;
        Ok(())
    }

    /// Opens a log file read-write, creating parent directories as needed,
    /// and takes an exclusive lock on it.
    fn open_locked(path: &Path) -> CResult<std::fs::File> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(path)?;
        file.try_lock_exclusive()?;
        Ok(file)
    }

    /// Replays the log from the start, rebuilding the index. A record cut
    /// short by a crash mid-append ends the replay; the file is truncated
    /// there and everything before it is kept.
    fn replay(&mut self) -> CResult<()> {
        let file_len = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut pos: u64 = 0;

        while pos < file_len {
            match decode_record(&mut reader, pos) {
                Ok((key, Some(location), end)) => {
                    self.index.insert(key, location);
                    pos = end;
                }
                Ok((key, None, end)) => {
                    self.index.remove(&key);
                    pos = end;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!(
                        "truncating torn record at offset {} in {}",
                        pos,
                        self.path.display()
                    );
                    drop(reader);
                    self.file.set_len(pos)?;
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Appends one record to the log, returning where its value landed.
    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<ValueLocation> {
        let pos = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&encode_record(key, value))?;
        Ok(ValueLocation {
            pos: pos + RECORD_HEADER as u64 + key.len() as u64,
            len: value.map_or(0, |v| v.len() as u32),
        })
    }

    /// Reads a value back from the log.
    fn read_value(file: &mut std::fs::File, location: ValueLocation) -> CResult<Vec<u8>> {
        let mut value = vec![0; location.len as usize];
        file.seek(SeekFrom::Start(location.pos))?;
        file.read_exact(&mut value)?;
        Ok(value)
    }
}

/// Encodes a record: the fixed header, then the key and value bytes. The
/// whole record is built in one buffer and appended with a single write.
fn encode_record(key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let value_len = value.map_or(0, |v| v.len());
    let mut record = Vec::with_capacity(RECORD_HEADER + key.len() + value_len);
    record.push(if value.is_some() { RECORD_PUT } else { RECORD_TOMBSTONE });
    record.extend_from_slice(&(key.len() as u32).to_le_bytes());
    record.extend_from_slice(&(value_len as u32).to_le_bytes());
    record.extend_from_slice(key);
    if let Some(value) = value {
        record.extend_from_slice(value);
    }
    record
}

/// Decodes one record starting at pos, returning the key, the value's
/// location (None for a tombstone), and the offset just past the record.
/// A record running past the end of the input reports UnexpectedEof.
fn decode_record<R: BufRead>(
    reader: &mut R,
    pos: u64,
) -> std::io::Result<(Vec<u8>, Option<ValueLocation>, u64)> {
    let mut header = [0u8; RECORD_HEADER];
    reader.read_exact(&mut header)?;
    let key_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let value_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);

    let mut key = vec![0; key_len as usize];
    reader.read_exact(&mut key)?;
    let value_pos = pos + RECORD_HEADER as u64 + key_len as u64;

    match header[0] {
        RECORD_TOMBSTONE => Ok((key, None, value_pos)),
        RECORD_PUT => {
            // Skip over the value without giving up the read buffer.
            let skipped =
                std::io::copy(&mut reader.by_ref().take(value_len as u64), &mut std::io::sink())?;
            if skipped < value_len as u64 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "record value cut short",
                ));
            }
            let location = ValueLocation { pos: value_pos, len: value_len };
            Ok((key, Some(location), value_pos + value_len as u64))
        }
        tag => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown record tag {}", tag),
        )),
    }
}

impl std::fmt::Display for Bitcask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bitcask")
    }
}

impl Engine for Bitcask {
    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        match self.index.get(key) {
            Some(&location) => Ok(Some(Self::read_value(&mut self.file, location)?)),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let location = self.append(key, Some(&value))?;
        self.index.insert(key.to_vec(), location);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> CResult<()> {
        // Only live keys need a tombstone; deleting a key that was never
        // written leaves the log untouched.
        if self.index.remove(key).is_some() {
            self.append(key, None)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.index.len() as u64;
        let size = self
            .index
            .iter()
            .map(|(key, location)| key.len() as u64 + location.len as u64)
            .sum::<u64>();
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            disk_size: self.file.metadata()?.len(),
            live_disk_size: size + RECORD_HEADER as u64 * keys,
        })
    }
}

/// Flush on close; the log is otherwise only synced when asked.
impl Drop for Bitcask {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::error!("bitcask flush on close failed: {}", err);
        }
    }
}
