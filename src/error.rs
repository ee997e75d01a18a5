//! Error types for the engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Aggregation error
    #[error("Aggregation error: {0}")]
    Aggr(#[from] AggrError),

    /// Row codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Binlog error
    #[error("Binlog error: {0}")]
    Binlog(#[from] BinlogError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the pre-aggregation state machine
#[derive(Error, Debug)]
pub enum AggrError {
    /// Column type outside the supported matrix for the operation
    #[error("Unsupported type {data_type} for {context}")]
    UnsupportedType {
        /// The offending column type
        data_type: crate::types::DataType,
        /// What the type was used for (ts column, aggregated column, ...)
        context: String,
    },

    /// Aggregate function name not recognized
    #[error("Unsupported aggregate function: {0}")]
    UnsupportedFunction(String),

    /// A named column is missing from the base schema
    #[error("Column '{0}' not found in base table schema")]
    SchemaMismatch(String),

    /// Operation attempted while the aggregator is not in the required state
    #[error("Invalid aggregator state: expected {expected}, got {actual}")]
    InvalidState {
        /// Required status
        expected: String,
        /// Observed status
        actual: String,
    },

    /// Binlog offset moved backwards for a key outside of recovery
    #[error("Binlog offset regression for key: offset {offset} < buffer offset {buffer_offset}")]
    OffsetRegression {
        /// Offset carried by the incoming row
        offset: u64,
        /// Offset already folded into the buffer
        buffer_offset: u64,
    },

    /// An out-of-order row does not fall inside the bucket found for it
    #[error("Corrupted bucket for late row: ts {ts} outside [{ts_begin}, {ts_end}]")]
    CorruptedBucket {
        /// Timestamp of the late row
        ts: i64,
        /// Start of the bucket found by the seek
        ts_begin: i64,
        /// End of the bucket found by the seek
        ts_end: i64,
    },

    /// After replay the base log is still behind the persisted aggregates
    #[error("Recovery inconsistency: replayed up to offset {replayed}, aggregates at {persisted}")]
    RecoveryInconsistency {
        /// Highest offset observed while replaying the base log
        replayed: u64,
        /// Highest offset persisted in the aggregate table
        persisted: u64,
    },

    /// Bucket size string could not be parsed
    #[error("Invalid bucket size '{0}': {1}")]
    WindowParse(String, String),

    /// Underlying table failure
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Row decode failure
    #[error("Codec failure: {0}")]
    Codec(#[from] CodecError),

    /// Base binlog failure during recovery
    #[error("Binlog failure: {0}")]
    Binlog(#[from] BinlogError),
}

/// Errors raised by the binary row codec
#[derive(Error, Debug)]
pub enum CodecError {
    /// Row bytes end before the schema is satisfied
    #[error("Truncated row: need {need} bytes at offset {offset}, have {have}")]
    TruncatedRow {
        /// Bytes required by the next field
        need: usize,
        /// Offset the decoder was at
        offset: usize,
        /// Bytes remaining
        have: usize,
    },

    /// Requested column index is outside the schema
    #[error("Column index {idx} out of range (schema has {len} columns)")]
    ColumnOutOfRange {
        /// Requested index
        idx: usize,
        /// Schema width
        len: usize,
    },

    /// Accessor type does not match the declared column type
    #[error("Type mismatch on column {idx}: declared {declared}, requested {requested}")]
    TypeMismatch {
        /// Column index
        idx: usize,
        /// Declared column type
        declared: crate::types::DataType,
        /// Type the accessor asked for
        requested: &'static str,
    },

    /// Builder called out of column order or after completion
    #[error("Row builder misuse: {0}")]
    BuilderMisuse(String),
}

/// Errors raised by table implementations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Write rejected by the table
    #[error("Put failed: {0}")]
    PutFailed(String),

    /// Requested index does not exist on the table
    #[error("Index {0} not found")]
    IndexNotFound(u32),

    /// Stored row failed to decode
    #[error("Corrupted row: {0}")]
    CorruptedRow(String),
}

/// Errors raised by the segmented binlog
#[derive(Error, Debug)]
pub enum BinlogError {
    /// I/O error on a segment file
    #[error("Binlog I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment header magic did not match
    #[error("Invalid binlog magic bytes")]
    InvalidMagic,

    /// Segment format version not understood
    #[error("Unsupported binlog version: {0}")]
    UnsupportedVersion(u8),

    /// Record checksum did not match its payload
    #[error("Checksum mismatch for record at offset {offset}")]
    ChecksumMismatch {
        /// File offset of the record
        offset: u64,
    },

    /// Record could not be decoded
    #[error("Corrupted binlog record at offset {offset}: {reason}")]
    CorruptedRecord {
        /// File offset of the record
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Invalid binlog configuration
    #[error("Invalid binlog configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
