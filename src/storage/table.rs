//! Core trait definitions for the aggregate-table collaborator

use bytes::Bytes;

use crate::error::StorageError;
use crate::types::Dimension;

/// Contract the engine requires from the aggregate table
///
/// Implementations must be internally thread-safe with respect to
/// concurrent `put` calls; the engine issues them from many writer
/// threads without external locking.
pub trait Table: Send + Sync {
    /// Table name, for logs
    fn name(&self) -> &str;

    /// Store one encoded row
    ///
    /// `time_ms` is the wall-clock row timestamp. When the targeted index
    /// declares a ts column, the row is positioned by the value of that
    /// column decoded from `row`, not by `time_ms`. A second put with the
    /// same (key, ts) supersedes the earlier row on read while still
    /// counting toward [`Table::record_cnt`].
    fn put(&self, time_ms: i64, row: Bytes, dimensions: &[Dimension]) -> Result<(), StorageError>;

    /// Open a traversal over `index`
    fn traverse_iter(&self, index: u32) -> Result<Box<dyn TraverseIterator>, StorageError>;

    /// Total number of rows ever put (superseded rows included)
    fn record_cnt(&self) -> u64;
}

/// Ordered traversal over one table index
///
/// Keys are visited in ascending order; rows within a key in descending
/// timestamp order, newest first.
pub trait TraverseIterator: Send {
    /// Position at the newest row of the first key
    fn seek_to_first(&mut self);

    /// Position within `key` at the row whose timestamp is exactly `ts`,
    /// or at the nearest lower timestamp when no row has `ts`
    ///
    /// This contract is load-bearing for out-of-order repair: seeking to
    /// `ts + 1` lands on the bucket row whose start is at or below `ts`.
    /// If the key has no row at or below `ts`, the iterator becomes
    /// invalid.
    fn seek(&mut self, key: &str, ts: i64);

    /// True while the iterator points at a row
    fn valid(&self) -> bool;

    /// Advance to the next row, crossing into the next key when the
    /// current key is exhausted
    fn next(&mut self);

    /// Skip the remaining rows of the current key and position at the
    /// newest row of the next key
    fn next_pk(&mut self);

    /// Key of the current row
    fn pk(&self) -> &str;

    /// Index timestamp of the current row
    fn ts(&self) -> i64;

    /// Encoded bytes of the current row
    fn value(&self) -> &[u8];
}
