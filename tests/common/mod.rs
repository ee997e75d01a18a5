//! Shared fixtures for the integration tests

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::{Arc, Once};

use bytes::Bytes;

use rollup_tsdb::aggregate::{create_aggregator, default_aggr_schema, Aggregator};
use rollup_tsdb::codec::{RowBuilder, RowView};
use rollup_tsdb::config::EngineConfig;
use rollup_tsdb::storage::{MemReplicator, MemTable, Replicator, Table};
use rollup_tsdb::types::{ColumnDesc, DataType, Schema};

/// Primary key every default row carries
pub const PK: &str = "id1|id2";

static TRACING: Once = Once::new();

/// Install the test subscriber once per process so the engine's `warn!`
/// and `error!` output shows up in failing test runs; `RUST_LOG`
/// overrides the default level
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Base table schema used across the suite
pub fn base_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ColumnDesc::new("id1", DataType::String),
        ColumnDesc::new("id2", DataType::String),
        ColumnDesc::new("ts_col", DataType::Timestamp),
        ColumnDesc::new("col3", DataType::Int),
        ColumnDesc::new("col4", DataType::SmallInt),
        ColumnDesc::new("col5", DataType::BigInt),
        ColumnDesc::new("col6", DataType::Float),
        ColumnDesc::new("col7", DataType::Double),
        ColumnDesc::new("col8", DataType::Date),
        ColumnDesc::new("col9", DataType::String),
        ColumnDesc::new("col_null", DataType::Int),
    ]))
}

/// Encode one base row; every numeric column carries `i`, `col9` carries
/// `text`, `col_null` is always NULL
pub fn base_row(schema: &Arc<Schema>, ts: i64, i: i64, text: &str) -> Bytes {
    let mut rb = RowBuilder::new(schema.clone());
    rb.append_str("id1").unwrap();
    rb.append_str("id2").unwrap();
    rb.append_timestamp(ts).unwrap();
    rb.append_i32(i as i32).unwrap();
    rb.append_i16(i as i16).unwrap();
    rb.append_i64(i).unwrap();
    rb.append_f32(i as f32).unwrap();
    rb.append_f64(i as f64).unwrap();
    rb.append_date(i as i32).unwrap();
    rb.append_str(text).unwrap();
    rb.append_null().unwrap();
    rb.finish().unwrap()
}

/// An aggregator wired to fresh in-memory collaborators
pub struct Fixture {
    pub aggr: Arc<Aggregator>,
    pub table: Arc<MemTable>,
    pub replicator: Arc<MemReplicator>,
}

/// Build an aggregator over in-memory collaborators and bring it to
/// `Inited` with nothing to recover
pub fn setup(aggr_col: &str, aggr_func: &str, bucket_size: &str, filter_col: Option<&str>) -> Fixture {
    let fixture = setup_uninit(aggr_col, aggr_func, bucket_size, filter_col);
    fixture.aggr.init(None).expect("init on empty state");
    fixture
}

/// Like [`setup`] but without running recovery
pub fn setup_uninit(
    aggr_col: &str,
    aggr_func: &str,
    bucket_size: &str,
    filter_col: Option<&str>,
) -> Fixture {
    let aggr_schema = Arc::new(default_aggr_schema());
    let table = Arc::new(
        MemTable::new("pre_aggr_1", aggr_schema.clone(), Some("ts_start")).unwrap(),
    );
    setup_on(table, aggr_col, aggr_func, bucket_size, filter_col)
        .expect("aggregator should build")
}

/// Build an aggregator over an existing aggregate table, without recovery
pub fn setup_on(
    table: Arc<MemTable>,
    aggr_col: &str,
    aggr_func: &str,
    bucket_size: &str,
    filter_col: Option<&str>,
) -> Result<Fixture, rollup_tsdb::error::AggrError> {
    init_tracing();
    let replicator = Arc::new(MemReplicator::new());
    let table_handle: Arc<dyn Table> = table.clone();
    let replicator_handle: Arc<dyn Replicator> = replicator.clone();
    let aggr = create_aggregator(
        base_schema(),
        Arc::new(default_aggr_schema()),
        table_handle,
        replicator_handle,
        0,
        aggr_col,
        aggr_func,
        "ts_col",
        bucket_size,
        filter_col,
        &EngineConfig::default(),
    )?;
    Ok(Fixture {
        aggr,
        table,
        replicator,
    })
}

/// Attempt to build an aggregator, surfacing construction errors
pub fn try_setup(
    aggr_col: &str,
    aggr_func: &str,
    bucket_size: &str,
    filter_col: Option<&str>,
) -> Result<Fixture, rollup_tsdb::error::AggrError> {
    let aggr_schema = Arc::new(default_aggr_schema());
    let table = Arc::new(
        MemTable::new("pre_aggr_1", aggr_schema.clone(), Some("ts_start")).unwrap(),
    );
    setup_on(table, aggr_col, aggr_func, bucket_size, filter_col)
}

/// Feed rows 0..=100 at timestamps `i * window_size / 2`, mirroring the
/// canonical two-rows-per-bucket ingestion pattern
pub fn ingest_series(fixture: &Fixture) {
    let schema = base_schema();
    let window = fixture.aggr.window_size() as i64;
    for i in 0..=100i64 {
        let row = base_row(&schema, i * window / 2, i, "abc");
        fixture
            .aggr
            .update(PK, &row, i as u64, false)
            .expect("update should succeed");
    }
}

/// One decoded aggregate-table row
pub struct AggRow {
    pub key: String,
    pub ts_start: i64,
    pub ts_end: i64,
    pub num_rows: i32,
    pub agg_val: Option<Vec<u8>>,
    pub binlog_offset: i64,
    pub filter_key: Option<String>,
}

/// Decode every aggregate row in traversal order (keys ascending,
/// timestamps descending within a key)
pub fn read_agg_rows(table: &MemTable) -> Vec<AggRow> {
    let schema = default_aggr_schema();
    let mut it = table.traverse_iter(0).unwrap();
    it.seek_to_first();
    let mut rows = Vec::new();
    while it.valid() {
        let view = RowView::new(&schema, it.value()).unwrap();
        rows.push(AggRow {
            key: String::from_utf8(view.get_bytes(0).unwrap().unwrap().to_vec()).unwrap(),
            ts_start: view.get_timestamp(1).unwrap().unwrap(),
            ts_end: view.get_timestamp(2).unwrap().unwrap(),
            num_rows: view.get_i32(3).unwrap().unwrap(),
            agg_val: view.get_bytes(4).unwrap().map(|b| b.to_vec()),
            binlog_offset: view.get_i64(5).unwrap().unwrap(),
            filter_key: view
                .get_bytes(6)
                .unwrap()
                .map(|b| String::from_utf8(b.to_vec()).unwrap()),
        });
        it.next();
    }
    rows
}

pub fn as_i64(raw: &[u8]) -> i64 {
    i64::from_le_bytes(raw.try_into().expect("8-byte payload"))
}

pub fn as_i32(raw: &[u8]) -> i32 {
    i32::from_le_bytes(raw.try_into().expect("4-byte payload"))
}

pub fn as_i16(raw: &[u8]) -> i16 {
    i16::from_le_bytes(raw.try_into().expect("2-byte payload"))
}

pub fn as_f32(raw: &[u8]) -> f32 {
    f32::from_le_bytes(raw.try_into().expect("4-byte payload"))
}

pub fn as_f64(raw: &[u8]) -> f64 {
    f64::from_le_bytes(raw.try_into().expect("8-byte payload"))
}
