//! Storage collaborators of the pre-aggregation engine
//!
//! The engine does not own durable storage. This module defines the
//! contracts it consumes, plus reference implementations used by the
//! enclosing service and the test suite:
//!
//! - [`Table`] / [`TraverseIterator`]: the aggregate-table contract
//! - [`MemTable`]: in-memory table with last-writer-wins per (key, ts)
//! - [`Replicator`]: the append-side replication contract
//! - [`Binlog`] / [`BinlogReader`]: segmented on-disk log with CRC32
//!   checked records, used as the base-table write-ahead log during
//!   recovery and as the aggregate-side replication sink

pub mod binlog;
pub mod mem_table;
pub mod replicator;
pub mod table;

pub use binlog::{Binlog, BinlogConfig, BinlogReader, LogPart};
pub use mem_table::MemTable;
pub use replicator::{EntryType, LogEntry, MemReplicator, Replicator};
pub use table::{Table, TraverseIterator};
