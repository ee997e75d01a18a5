//! In-memory reference implementation of the [`Table`] contract
//!
//! Rows are kept per key in a timestamp-ordered map. Multiple puts at the
//! same (key, ts) are retained as versions; reads and traversals serve the
//! latest version, which gives the last-writer-wins-per-ts semantics the
//! aggregator relies on when it rewrites a bucket row.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::codec::RowView;
use crate::error::StorageError;
use crate::types::{Dimension, Schema, Value};

use super::table::{Table, TraverseIterator};

// key -> ts -> row versions, newest version last
type Rows = BTreeMap<String, BTreeMap<i64, Vec<Bytes>>>;

/// In-memory table with one traversable index
pub struct MemTable {
    name: String,
    schema: Arc<Schema>,
    ts_col_idx: Option<usize>,
    rows: RwLock<Rows>,
    record_cnt: AtomicU64,
}

impl MemTable {
    /// Create a table over `schema`
    ///
    /// When `ts_col` names a column, puts are positioned by that column's
    /// value decoded from the row; otherwise by the put-time argument.
    pub fn new(
        name: impl Into<String>,
        schema: Arc<Schema>,
        ts_col: Option<&str>,
    ) -> Result<Self, StorageError> {
        let ts_col_idx = match ts_col {
            Some(col) => Some(schema.index_of(col).ok_or_else(|| {
                StorageError::PutFailed(format!("index ts column '{}' not in schema", col))
            })?),
            None => None,
        };
        Ok(Self {
            name: name.into(),
            schema: schema.clone(),
            ts_col_idx,
            rows: RwLock::new(BTreeMap::new()),
            record_cnt: AtomicU64::new(0),
        })
    }

    fn index_ts(&self, time_ms: i64, row: &[u8]) -> Result<i64, StorageError> {
        let Some(idx) = self.ts_col_idx else {
            return Ok(time_ms);
        };
        let view = RowView::new(&self.schema, row)
            .map_err(|e| StorageError::CorruptedRow(e.to_string()))?;
        match view
            .get_value(idx)
            .map_err(|e| StorageError::CorruptedRow(e.to_string()))?
        {
            Value::Timestamp(ts) | Value::BigInt(ts) => Ok(ts),
            other => Err(StorageError::CorruptedRow(format!(
                "index ts column holds {:?}",
                other
            ))),
        }
    }
}

impl Table for MemTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, time_ms: i64, row: Bytes, dimensions: &[Dimension]) -> Result<(), StorageError> {
        let ts = self.index_ts(time_ms, &row)?;
        let mut stored = false;
        {
            let mut rows = self.rows.write();
            for dim in dimensions.iter().filter(|d| d.idx == 0) {
                rows.entry(dim.key.clone())
                    .or_default()
                    .entry(ts)
                    .or_default()
                    .push(row.clone());
                stored = true;
            }
        }
        if !stored {
            return Err(StorageError::PutFailed(
                "no dimension targets index 0".to_string(),
            ));
        }
        self.record_cnt.fetch_add(1, Ordering::Relaxed);
        debug!(table = %self.name, ts, "row stored");
        Ok(())
    }

    fn traverse_iter(&self, index: u32) -> Result<Box<dyn TraverseIterator>, StorageError> {
        if index != 0 {
            return Err(StorageError::IndexNotFound(index));
        }
        // Snapshot the latest version per (key, ts), keys ascending and
        // timestamps descending within each key.
        let rows = self.rows.read();
        let entries: Vec<(String, Vec<(i64, Bytes)>)> = rows
            .iter()
            .map(|(key, by_ts)| {
                let versions: Vec<(i64, Bytes)> = by_ts
                    .iter()
                    .rev()
                    .map(|(ts, v)| (*ts, v.last().expect("version list never empty").clone()))
                    .collect();
                (key.clone(), versions)
            })
            .collect();
        Ok(Box::new(MemTableIterator {
            entries,
            key_idx: 0,
            row_idx: 0,
        }))
    }

    fn record_cnt(&self) -> u64 {
        self.record_cnt.load(Ordering::Relaxed)
    }
}

struct MemTableIterator {
    entries: Vec<(String, Vec<(i64, Bytes)>)>,
    key_idx: usize,
    row_idx: usize,
}

impl MemTableIterator {
    fn invalidate(&mut self) {
        self.key_idx = self.entries.len();
        self.row_idx = 0;
    }
}

impl TraverseIterator for MemTableIterator {
    fn seek_to_first(&mut self) {
        self.key_idx = 0;
        self.row_idx = 0;
    }

    fn seek(&mut self, key: &str, ts: i64) {
        let Ok(key_idx) = self.entries.binary_search_by(|(k, _)| k.as_str().cmp(key)) else {
            self.invalidate();
            return;
        };
        // rows are descending; first position with row ts <= target
        let rows = &self.entries[key_idx].1;
        match rows.iter().position(|(row_ts, _)| *row_ts <= ts) {
            Some(row_idx) => {
                self.key_idx = key_idx;
                self.row_idx = row_idx;
            }
            None => self.invalidate(),
        }
    }

    fn valid(&self) -> bool {
        self.key_idx < self.entries.len() && self.row_idx < self.entries[self.key_idx].1.len()
    }

    fn next(&mut self) {
        if !self.valid() {
            return;
        }
        self.row_idx += 1;
        if self.row_idx >= self.entries[self.key_idx].1.len() {
            self.key_idx += 1;
            self.row_idx = 0;
        }
    }

    fn next_pk(&mut self) {
        if self.key_idx < self.entries.len() {
            self.key_idx += 1;
            self.row_idx = 0;
        }
    }

    fn pk(&self) -> &str {
        &self.entries[self.key_idx].0
    }

    fn ts(&self) -> i64 {
        self.entries[self.key_idx].1[self.row_idx].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.key_idx].1[self.row_idx].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RowBuilder;
    use crate::types::{ColumnDesc, DataType};

    fn kv_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            ColumnDesc::new("key", DataType::String),
            ColumnDesc::new("ts", DataType::Timestamp),
            ColumnDesc::new("val", DataType::Int),
        ]))
    }

    fn encode(schema: &Arc<Schema>, key: &str, ts: i64, val: i32) -> Bytes {
        let mut rb = RowBuilder::new(schema.clone());
        rb.append_str(key).unwrap();
        rb.append_timestamp(ts).unwrap();
        rb.append_i32(val).unwrap();
        rb.finish().unwrap()
    }

    fn put(table: &MemTable, schema: &Arc<Schema>, key: &str, ts: i64, val: i32) {
        let row = encode(schema, key, ts, val);
        table
            .put(0, row, &[Dimension::new(0, key)])
            .expect("put should succeed");
    }

    #[test]
    fn test_traversal_order() {
        let schema = kv_schema();
        let table = MemTable::new("t", schema.clone(), Some("ts")).unwrap();
        put(&table, &schema, "b", 10, 1);
        put(&table, &schema, "a", 20, 2);
        put(&table, &schema, "a", 30, 3);

        let mut it = table.traverse_iter(0).unwrap();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push((it.pk().to_string(), it.ts()));
            it.next();
        }
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), 30),
                ("a".to_string(), 20),
                ("b".to_string(), 10)
            ]
        );
    }

    #[test]
    fn test_seek_nearest_lower() {
        let schema = kv_schema();
        let table = MemTable::new("t", schema.clone(), Some("ts")).unwrap();
        put(&table, &schema, "k", 1000, 1);
        put(&table, &schema, "k", 2000, 2);

        let mut it = table.traverse_iter(0).unwrap();
        it.seek("k", 1500);
        assert!(it.valid());
        assert_eq!(it.ts(), 1000);

        it.seek("k", 2000);
        assert!(it.valid());
        assert_eq!(it.ts(), 2000);

        it.seek("k", 500);
        assert!(!it.valid());

        it.seek("missing", 1500);
        assert!(!it.valid());
    }

    #[test]
    fn test_last_writer_wins_per_ts() {
        let schema = kv_schema();
        let table = MemTable::new("t", schema.clone(), Some("ts")).unwrap();
        put(&table, &schema, "k", 1000, 1);
        put(&table, &schema, "k", 1000, 7);

        assert_eq!(table.record_cnt(), 2);
        let mut it = table.traverse_iter(0).unwrap();
        it.seek_to_first();
        assert!(it.valid());
        let view = RowView::new(&schema, it.value()).unwrap();
        assert_eq!(view.get_i32(2).unwrap(), Some(7));
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn test_next_pk() {
        let schema = kv_schema();
        let table = MemTable::new("t", schema.clone(), Some("ts")).unwrap();
        put(&table, &schema, "a", 10, 1);
        put(&table, &schema, "a", 20, 2);
        put(&table, &schema, "b", 30, 3);

        let mut it = table.traverse_iter(0).unwrap();
        it.seek_to_first();
        assert_eq!(it.pk(), "a");
        it.next_pk();
        assert_eq!(it.pk(), "b");
        it.next_pk();
        assert!(!it.valid());
    }
}
