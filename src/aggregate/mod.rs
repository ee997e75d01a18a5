//! Pre-aggregation engine
//!
//! Sits between a base time-series table and an aggregate table: as rows
//! are appended to the base table, the engine maintains per-key bucketed
//! aggregates in memory, flushes completed buckets as compact rows into
//! the aggregate table, and rebuilds its state after a restart from the
//! aggregate table plus a replay of the base table's binlog.
//!
//! # Data Flow
//!
//! ```text
//! base writer ──▶ update(key, row, offset)
//!                      │
//!                      ▼
//!          ┌─────────────────────────┐   bucket full   ┌──────────────┐
//!          │ per-key AggrBuffer      │ ───────────────▶│ flush bucket │
//!          │ (one live bucket each)  │    (snapshot)   │ row + append │
//!          └─────────────────────────┘                 └──────────────┘
//!                      │ late row                             │
//!                      ▼                                       ▼
//!          ┌─────────────────────────┐                 aggregate table
//!          │ out-of-order repair     │ ───────────────▶ + replicator
//!          └─────────────────────────┘   (supersedes)
//! ```
//!
//! # Locking
//!
//! The key→buffer map is a sharded concurrent map whose internal locks
//! are held only for the lookup. Each buffer has its own mutex, acquired
//! strictly after the map shard is released and never nested with another
//! buffer's. A separate mutex guards the shared row encoder. The per-key
//! lock is released around the flush so that a slow aggregate-table write
//! never blocks writers of other keys, and writers of the same key can
//! already fill the next bucket.

pub mod buffer;
pub mod factory;
pub mod func;

pub use buffer::{AggrBuffer, AggrStat, AggrValue};
pub use factory::{create_aggregator, default_aggr_schema, parse_bucket_size};
pub use func::AggrType;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec::{RowBuilder, RowView};
use crate::error::{AggrError, CodecError, StorageError};
use crate::metrics;
use crate::storage::binlog::Binlog;
use crate::storage::replicator::{EntryType, LogEntry, Replicator};
use crate::storage::table::Table;
use crate::types::{DataType, Dimension, Schema};

/// How a bucket decides it is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// Bucket closes after a fixed number of rows
    RowsNum,
    /// Bucket covers a fixed span of event time in milliseconds
    RowsRange,
}

/// Window kind plus its size (row count or milliseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDef {
    /// Row-count or time-range window
    pub window_type: WindowType,
    /// Rows per bucket, or bucket span in milliseconds
    pub size: u64,
}

// The aggregate table exposes a single traversable index.
const AGGR_TABLE_INDEX: u32 = 0;

/// Streaming pre-aggregator for one (table, key, function, window) definition
///
/// Shared across writer threads behind an `Arc`; all public operations
/// take `&self`.
pub struct Aggregator {
    base_schema: Arc<Schema>,
    aggr_schema: Arc<Schema>,
    aggr_table: Arc<dyn Table>,
    aggr_replicator: Arc<dyn Replicator>,
    index_pos: u32,
    pub(crate) aggr_col: String,
    pub(crate) aggr_col_idx: Option<usize>,
    pub(crate) aggr_col_type: DataType,
    ts_col_idx: usize,
    ts_col_type: DataType,
    pub(crate) aggr_type: AggrType,
    window: WindowDef,
    pub(crate) count_all: bool,
    filter_col_idx: Option<usize>,
    buffers: DashMap<String, Arc<Mutex<AggrBuffer>>>,
    status: AtomicU8,
    row_builder: Mutex<RowBuilder>,
    notify_on_put: bool,
}

impl Aggregator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        base_schema: Arc<Schema>,
        aggr_schema: Arc<Schema>,
        aggr_table: Arc<dyn Table>,
        aggr_replicator: Arc<dyn Replicator>,
        index_pos: u32,
        aggr_col: String,
        aggr_type: AggrType,
        ts_col: String,
        window: WindowDef,
        filter_col: Option<String>,
        notify_on_put: bool,
    ) -> Result<Self, AggrError> {
        let ts_col_idx = base_schema
            .index_of(&ts_col)
            .ok_or_else(|| AggrError::SchemaMismatch(ts_col.clone()))?;
        let ts_col_type = base_schema.col(ts_col_idx).data_type;
        if !matches!(ts_col_type, DataType::BigInt | DataType::Timestamp) {
            return Err(AggrError::UnsupportedType {
                data_type: ts_col_type,
                context: "timestamp column".to_string(),
            });
        }

        let count_all = matches!(aggr_type, AggrType::Count | AggrType::CountWhere)
            && aggr_col == "*";
        let (aggr_col_idx, aggr_col_type) = if count_all {
            (None, DataType::BigInt)
        } else {
            let idx = base_schema
                .index_of(&aggr_col)
                .ok_or_else(|| AggrError::SchemaMismatch(aggr_col.clone()))?;
            let data_type = base_schema.col(idx).data_type;
            if !aggr_type.supports_column(data_type) {
                return Err(AggrError::UnsupportedType {
                    data_type,
                    context: format!("{} column", aggr_type.as_str()),
                });
            }
            (Some(idx), data_type)
        };

        let filter_col_idx = match &filter_col {
            Some(col) => Some(
                base_schema
                    .index_of(col)
                    .ok_or_else(|| AggrError::SchemaMismatch(col.clone()))?,
            ),
            None => None,
        };

        if aggr_schema.len() != 7 {
            return Err(AggrError::SchemaMismatch(format!(
                "aggregate table schema has {} columns, expected 7",
                aggr_schema.len()
            )));
        }

        Ok(Self {
            base_schema,
            aggr_schema: aggr_schema.clone(),
            aggr_table,
            aggr_replicator,
            index_pos,
            aggr_col,
            aggr_col_idx,
            aggr_col_type,
            ts_col_idx,
            ts_col_type,
            aggr_type,
            window,
            count_all,
            filter_col_idx,
            buffers: DashMap::new(),
            status: AtomicU8::new(AggrStat::Uninit as u8),
            row_builder: Mutex::new(RowBuilder::new(aggr_schema)),
            notify_on_put,
        })
    }

    /// Current lifecycle status
    pub fn status(&self) -> AggrStat {
        AggrStat::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: AggrStat) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Aggregate function of this instance
    pub fn aggr_type(&self) -> AggrType {
        self.aggr_type
    }

    /// Window kind
    pub fn window_type(&self) -> WindowType {
        self.window.window_type
    }

    /// Rows per bucket, or bucket span in milliseconds
    pub fn window_size(&self) -> u64 {
        self.window.size
    }

    /// Recover state and transition to `Inited`
    ///
    /// Seeds one buffer per key from the aggregate table, then replays the
    /// base binlog from the lowest persisted offset. Fails (and resets to
    /// `Uninit`) when the base binlog is absent or ends before the offsets
    /// the aggregate table has already persisted, since that means base
    /// writes feeding the persisted aggregates were lost.
    pub fn init(&self, base_binlog: Option<&Binlog>) -> Result<(), AggrError> {
        self.set_status(AggrStat::Recovering);
        match self.recover(base_binlog) {
            Ok(()) => {
                self.set_status(AggrStat::Inited);
                Ok(())
            }
            Err(e) => {
                error!(aggr_func = self.aggr_type.as_str(), "recovery failed: {}", e);
                self.set_status(AggrStat::Uninit);
                Err(e)
            }
        }
    }

    fn recover(&self, base_binlog: Option<&Binlog>) -> Result<(), AggrError> {
        let mut recovery_offset = u64::MAX;
        let mut aggr_latest_offset = 0u64;
        let mut seeded = 0usize;

        let mut it = self.aggr_table.traverse_iter(AGGR_TABLE_INDEX)?;
        it.seek_to_first();
        while it.valid() {
            let aggr_key = it.pk().to_string();
            let view = RowView::new(&self.aggr_schema, it.value())?;
            let key_end = view
                .get_bytes(0)?
                .map(|pk| pk.len())
                .unwrap_or(aggr_key.len());
            let mut buffer = AggrBuffer::new(self.aggr_col_type, key_end);
            self.load_buffer_from_row(&view, &mut buffer)?;
            buffer.binlog_offset = view.get_i64(5)?.unwrap_or(0) as u64;

            recovery_offset = recovery_offset.min(buffer.binlog_offset);
            aggr_latest_offset = aggr_latest_offset.max(buffer.binlog_offset);

            // The persisted bucket is complete; the live buffer starts on
            // the range right after it, exactly as a normal bucket close
            // would have left it.
            buffer.advance_window(&self.window);
            self.buffers
                .insert(aggr_key, Arc::new(Mutex::new(buffer)));
            seeded += 1;
            it.next_pk();
        }
        if seeded == 0 {
            recovery_offset = 0;
        }
        metrics::LIVE_BUFFERS.set(self.buffers.len() as f64);

        let Some(binlog) = base_binlog else {
            if seeded > 0 {
                return Err(AggrError::RecoveryInconsistency {
                    replayed: 0,
                    persisted: aggr_latest_offset,
                });
            }
            return Ok(());
        };

        let mut reader = binlog.reader()?;
        reader.set_offset(recovery_offset)?;
        let mut cur_offset = 0u64;
        let mut replayed = 0u64;
        loop {
            match reader.read_next_record()? {
                Some(entry) => {
                    cur_offset = entry.log_index;
                    if entry.entry_type == EntryType::Delete {
                        warn!(
                            log_index = entry.log_index,
                            "delete is not supported by pre-aggregation, skipping"
                        );
                        metrics::DELETES_SKIPPED_TOTAL.inc();
                        continue;
                    }
                    for dim in entry.dimensions.iter().filter(|d| d.idx == self.index_pos) {
                        self.update(&dim.key, &entry.value, entry.log_index, true)?;
                        replayed += 1;
                    }
                    metrics::RECOVERY_REPLAYED_TOTAL.inc();
                }
                None => {
                    if !reader.roll_next_file()? {
                        break;
                    }
                }
            }
        }

        if cur_offset < aggr_latest_offset {
            return Err(AggrError::RecoveryInconsistency {
                replayed: cur_offset,
                persisted: aggr_latest_offset,
            });
        }
        info!(
            aggr_func = self.aggr_type.as_str(),
            seeded, replayed, cur_offset, "recovery complete"
        );
        Ok(())
    }

    /// Fold one base row into its bucket
    ///
    /// `key` is the base primary key, `row` the encoded base row, `offset`
    /// the base-log offset of the write. With `recover` set, duplicate
    /// offsets and rows belonging to already-flushed ranges are silently
    /// accepted instead of being treated as errors, which makes binlog
    /// replay idempotent.
    pub fn update(
        &self,
        key: &str,
        row: &[u8],
        offset: u64,
        recover: bool,
    ) -> Result<(), AggrError> {
        if !recover {
            let status = self.status();
            if status != AggrStat::Inited {
                return Err(AggrError::InvalidState {
                    expected: AggrStat::Inited.as_str().to_string(),
                    actual: status.as_str().to_string(),
                });
            }
        }

        let view = RowView::new(&self.base_schema, row)?;
        let cur_ts = match self.ts_col_type {
            DataType::BigInt => view.get_i64(self.ts_col_idx)?,
            DataType::Timestamp => view.get_timestamp(self.ts_col_idx)?,
            data_type => {
                return Err(AggrError::UnsupportedType {
                    data_type,
                    context: "timestamp column".to_string(),
                })
            }
        };
        let Some(cur_ts) = cur_ts else {
            return Err(AggrError::Storage(StorageError::CorruptedRow(
                "timestamp column is NULL".to_string(),
            )));
        };

        let aggr_key = match self.filter_col_idx {
            Some(filter_idx) => {
                let filter_val = view.get_value(filter_idx)?;
                let mut composite = String::with_capacity(key.len() + 8);
                composite.push_str(key);
                composite.push_str(&filter_val.string_form());
                composite
            }
            None => key.to_string(),
        };

        // Map shard lock is held only for this lookup; the buffer mutex is
        // taken after the shard is released.
        let buffer_lock = {
            let created = !self.buffers.contains_key(&aggr_key);
            let entry = self.buffers.entry(aggr_key.clone()).or_insert_with(|| {
                Arc::new(Mutex::new(AggrBuffer::new(self.aggr_col_type, key.len())))
            });
            let lock = entry.value().clone();
            drop(entry);
            if created {
                metrics::LIVE_BUFFERS.set(self.buffers.len() as f64);
            }
            lock
        };

        let mut buffer = buffer_lock.lock();
        if buffer.ts_begin == -1 {
            buffer.ts_begin = cur_ts;
            if self.window.window_type == WindowType::RowsRange {
                buffer.ts_end = cur_ts + self.window.size as i64 - 1;
            }
        }

        if self.window_filled(cur_ts, &buffer) {
            let snapshot = buffer.clone();
            buffer.advance_window(&self.window);
            // Flush does table and replicator I/O; release the per-key
            // lock so writers of this key keep filling the next bucket.
            drop(buffer);
            self.flush_buffer(&aggr_key, &snapshot)?;
            buffer = buffer_lock.lock();
        }

        if offset < buffer.binlog_offset {
            if recover {
                return Ok(());
            }
            return Err(AggrError::OffsetRegression {
                offset,
                buffer_offset: buffer.binlog_offset,
            });
        }

        if cur_ts < buffer.ts_begin {
            if recover {
                return Ok(());
            }
            let key_end = buffer.key_end;
            drop(buffer);
            return self.update_flushed_buffer(&aggr_key, key_end, &view, cur_ts, offset);
        }

        buffer.aggr_cnt += 1;
        buffer.binlog_offset = offset;
        if self.window.window_type == WindowType::RowsNum {
            buffer.ts_end = cur_ts;
        }
        self.update_aggr_val(&view, &mut buffer)
    }

    fn window_filled(&self, cur_ts: i64, buffer: &AggrBuffer) -> bool {
        match self.window.window_type {
            WindowType::RowsRange => cur_ts > buffer.ts_end,
            WindowType::RowsNum => buffer.aggr_cnt as u64 >= self.window.size,
        }
    }

    /// Fold a row whose timestamp precedes the live bucket
    ///
    /// The row belongs to a bucket already flushed to the aggregate table.
    /// The bucket row is located by its range, refreshed with the late
    /// row, and rewritten; the rewrite supersedes the earlier row under
    /// the table's last-writer-wins-per-ts policy. The live buffer is not
    /// touched.
    fn update_flushed_buffer(
        &self,
        aggr_key: &str,
        key_end: usize,
        view: &RowView<'_>,
        cur_ts: i64,
        offset: u64,
    ) -> Result<(), AggrError> {
        let mut it = self.aggr_table.traverse_iter(AGGR_TABLE_INDEX)?;
        // seek to just past cur_ts: lands on the bucket starting at or
        // below it
        it.seek(aggr_key, cur_ts + 1);

        let mut bucket = AggrBuffer::new(self.aggr_col_type, key_end);
        if it.valid() {
            let aggr_view = RowView::new(&self.aggr_schema, it.value())?;
            self.load_buffer_from_row(&aggr_view, &mut bucket)?;
            if cur_ts < bucket.ts_begin || cur_ts > bucket.ts_end {
                return Err(AggrError::CorruptedBucket {
                    ts: cur_ts,
                    ts_begin: bucket.ts_begin,
                    ts_end: bucket.ts_end,
                });
            }
            bucket.aggr_cnt += 1;
            bucket.binlog_offset = offset;
        } else {
            // no bucket covers the row: record it as a singleton range
            bucket.ts_begin = cur_ts;
            bucket.ts_end = cur_ts;
            bucket.aggr_cnt = 1;
            bucket.binlog_offset = offset;
        }

        self.update_aggr_val(view, &mut bucket)?;
        self.flush_buffer(aggr_key, &bucket)?;
        metrics::OUT_OF_ORDER_FOLDS_TOTAL.inc();
        debug!(key = aggr_key, ts = cur_ts, "late row folded into flushed bucket");
        Ok(())
    }

    // Rebuild range, count and accumulator from a persisted bucket row.
    fn load_buffer_from_row(
        &self,
        view: &RowView<'_>,
        buffer: &mut AggrBuffer,
    ) -> Result<(), AggrError> {
        buffer.ts_begin = view.get_timestamp(1)?.unwrap_or(-1);
        buffer.ts_end = view.get_timestamp(2)?.unwrap_or(-1);
        buffer.aggr_cnt = view.get_i32(3)?.unwrap_or(0);
        let raw = view.get_bytes(4)?;
        self.decode_aggr_val(raw, buffer)
    }

    /// Write one closed bucket to the aggregate table and its replicator
    ///
    /// Called with no per-key lock held.
    fn flush_buffer(&self, aggr_key: &str, buffer: &AggrBuffer) -> Result<(), AggrError> {
        let agg_val = self.encode_aggr_val(buffer)?;
        let key_end = buffer.key_end.min(aggr_key.len());
        let (pk, filter_key) = aggr_key.split_at(key_end);

        let row = {
            let mut builder = self.row_builder.lock();
            match build_aggr_row(&mut builder, pk, filter_key, buffer, agg_val.as_deref()) {
                Ok(row) => row,
                Err(e) => {
                    builder.reset();
                    return Err(e.into());
                }
            }
        };

        let time = Utc::now().timestamp_millis();
        let dimensions = vec![Dimension::new(AGGR_TABLE_INDEX, aggr_key)];
        if let Err(e) = self.aggr_table.put(time, row.clone(), &dimensions) {
            error!(
                key = aggr_key,
                table = self.aggr_table.name(),
                "aggregate table put failed: {}",
                e
            );
            return Err(e.into());
        }

        let entry = LogEntry::put(
            self.aggr_replicator.leader_term(),
            buffer.binlog_offset,
            time,
            dimensions,
            row,
        );
        self.aggr_replicator.append_entry(&entry)?;
        if self.notify_on_put {
            self.aggr_replicator.notify();
        }

        metrics::AGGR_FLUSHES_TOTAL
            .with_label_values(&[self.aggr_type.as_str()])
            .inc();
        debug!(
            key = aggr_key,
            ts_begin = buffer.ts_begin,
            ts_end = buffer.ts_end,
            num_rows = buffer.aggr_cnt,
            "bucket flushed"
        );
        Ok(())
    }

    /// Flush every non-empty live buffer
    ///
    /// Used at shutdown and on schema boundaries. Each flushed buffer is
    /// advanced past its range first, so a flush cannot repeat if more
    /// rows arrive afterwards.
    pub fn flush_all(&self) -> Result<(), AggrError> {
        let live: Vec<(String, Arc<Mutex<AggrBuffer>>)> = self
            .buffers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (aggr_key, buffer_lock) in live {
            let snapshot = {
                let mut buffer = buffer_lock.lock();
                if buffer.is_unused() {
                    None
                } else {
                    let snapshot = buffer.clone();
                    buffer.advance_window(&self.window);
                    Some(snapshot)
                }
            };
            if let Some(snapshot) = snapshot {
                self.flush_buffer(&aggr_key, &snapshot)?;
            }
        }
        Ok(())
    }

    /// Read-through of a live buffer, for tests and diagnostics
    ///
    /// `key` is the aggregation key: the base primary key, with the filter
    /// value appended for `count_where`.
    pub fn aggr_buffer(&self, key: &str) -> Option<AggrBuffer> {
        self.buffers.get(key).map(|e| e.value().lock().clone())
    }
}

fn build_aggr_row(
    builder: &mut RowBuilder,
    pk: &str,
    filter_key: &str,
    buffer: &AggrBuffer,
    agg_val: Option<&[u8]>,
) -> Result<Bytes, CodecError> {
    builder.append_str(pk)?;
    builder.append_timestamp(buffer.ts_begin)?;
    builder.append_timestamp(buffer.ts_end)?;
    builder.append_i32(buffer.aggr_cnt)?;
    match agg_val {
        Some(raw) => builder.append_bytes(raw)?,
        None => builder.append_null()?,
    }
    builder.append_i64(buffer.binlog_offset as i64)?;
    if filter_key.is_empty() {
        builder.append_null()?;
    } else {
        builder.append_str(filter_key)?;
    }
    builder.finish()
}
