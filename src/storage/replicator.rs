//! Replication contract and log entry format
//!
//! [`LogEntry`] is the unit shipped through both logs the engine touches:
//! the base table's write-ahead log that recovery replays, and the
//! aggregate-side log that every flushed bucket is appended to.
//!
//! # Entry Payload Format
//!
//! ```text
//! ┌──────┬───────────┬──────┬───────┬─────────┬──────────────┬─────────┐
//! │ term │ log_index │ type │ ts_ms │ dim_cnt │ dimensions.. │ value   │
//! │  8B  │    8B     │  1B  │  8B   │   2B    │ idx+len+key  │ len+raw │
//! └──────┴───────────┴──────┴───────┴─────────┴──────────────┴─────────┘
//! ```
//!
//! All integers little-endian. Checksummed record framing is applied by
//! the segment writer, not here.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::BinlogError;
use crate::types::Dimension;

/// Kind of mutation carried by a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Row insert
    Put = 1,
    /// Row delete; the aggregator skips these with a warning
    Delete = 2,
}

impl TryFrom<u8> for EntryType {
    type Error = BinlogError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EntryType::Put),
            2 => Ok(EntryType::Delete),
            _ => Err(BinlogError::CorruptedRecord {
                offset: 0,
                reason: format!("unknown entry type: {}", value),
            }),
        }
    }
}

/// One replicated mutation of a table
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Leader term the entry was written under
    pub term: u64,
    /// Monotonic log offset of the write
    pub log_index: u64,
    /// Mutation kind
    pub entry_type: EntryType,
    /// Wall-clock milliseconds when the entry was appended
    pub ts_ms: i64,
    /// Index routing of the row
    pub dimensions: Vec<Dimension>,
    /// Encoded row bytes
    pub value: Bytes,
}

impl LogEntry {
    /// Create a `Put` entry
    pub fn put(
        term: u64,
        log_index: u64,
        ts_ms: i64,
        dimensions: Vec<Dimension>,
        value: Bytes,
    ) -> Self {
        Self {
            term,
            log_index,
            entry_type: EntryType::Put,
            ts_ms,
            dimensions,
            value,
        }
    }

    /// Create a `Delete` entry for `key`
    pub fn delete(term: u64, log_index: u64, ts_ms: i64, dimensions: Vec<Dimension>) -> Self {
        Self {
            term,
            log_index,
            entry_type: EntryType::Delete,
            ts_ms,
            dimensions,
            value: Bytes::new(),
        }
    }

    /// Serialize the entry payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(35 + self.value.len());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.log_index.to_le_bytes());
        buf.push(self.entry_type as u8);
        buf.extend_from_slice(&self.ts_ms.to_le_bytes());
        buf.extend_from_slice(&(self.dimensions.len() as u16).to_le_bytes());
        for dim in &self.dimensions {
            buf.extend_from_slice(&dim.idx.to_le_bytes());
            buf.extend_from_slice(&(dim.key.len() as u16).to_le_bytes());
            buf.extend_from_slice(dim.key.as_bytes());
        }
        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Deserialize an entry payload
    pub fn from_bytes(data: &[u8]) -> Result<Self, BinlogError> {
        let mut cursor = Cursor { data, pos: 0 };
        let term = u64::from_le_bytes(cursor.take::<8>()?);
        let log_index = u64::from_le_bytes(cursor.take::<8>()?);
        let entry_type = EntryType::try_from(cursor.take::<1>()?[0])?;
        let ts_ms = i64::from_le_bytes(cursor.take::<8>()?);
        let dim_cnt = u16::from_le_bytes(cursor.take::<2>()?) as usize;
        let mut dimensions = Vec::with_capacity(dim_cnt);
        for _ in 0..dim_cnt {
            let idx = u32::from_le_bytes(cursor.take::<4>()?);
            let key_len = u16::from_le_bytes(cursor.take::<2>()?) as usize;
            let key = String::from_utf8(cursor.take_slice(key_len)?.to_vec()).map_err(|_| {
                BinlogError::CorruptedRecord {
                    offset: 0,
                    reason: "dimension key is not UTF-8".to_string(),
                }
            })?;
            dimensions.push(Dimension { idx, key });
        }
        let value_len = u32::from_le_bytes(cursor.take::<4>()?) as usize;
        let value = Bytes::copy_from_slice(cursor.take_slice(value_len)?);
        Ok(Self {
            term,
            log_index,
            entry_type,
            ts_ms,
            dimensions,
            value,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], BinlogError> {
        let slice = self.take_slice(N)?;
        Ok(slice.try_into().expect("length checked"))
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], BinlogError> {
        if self.data.len() < self.pos + len {
            return Err(BinlogError::CorruptedRecord {
                offset: self.pos as u64,
                reason: format!(
                    "payload truncated: need {} bytes, have {}",
                    len,
                    self.data.len() - self.pos
                ),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

/// Append-side contract of a replicated log
///
/// Implementations are internally thread-safe; the engine appends from
/// many writer threads.
pub trait Replicator: Send + Sync {
    /// Append one entry
    fn append_entry(&self, entry: &LogEntry) -> Result<(), BinlogError>;

    /// Wake followers; called after appends when configured
    fn notify(&self);

    /// Current leader term stamped onto appended entries
    fn leader_term(&self) -> u64;
}

/// In-memory replicator for unit tests and embedded use
#[derive(Default)]
pub struct MemReplicator {
    entries: RwLock<Vec<LogEntry>>,
    notified: AtomicU64,
    term: AtomicU64,
}

impl MemReplicator {
    /// Create an empty replicator at term 1
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            notified: AtomicU64::new(0),
            term: AtomicU64::new(1),
        }
    }

    /// Number of appended entries
    pub fn entry_cnt(&self) -> usize {
        self.entries.read().len()
    }

    /// Copy of all appended entries
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().clone()
    }

    /// Number of `notify` calls observed
    pub fn notified_cnt(&self) -> u64 {
        self.notified.load(Ordering::Relaxed)
    }
}

impl Replicator for MemReplicator {
    fn append_entry(&self, entry: &LogEntry) -> Result<(), BinlogError> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    fn notify(&self) {
        self.notified.fetch_add(1, Ordering::Relaxed);
    }

    fn leader_term(&self) -> u64 {
        self.term.load(Ordering::Relaxed)
    }
}
