//! Rollup TSDB - incremental pre-aggregation engine for time-series tables
//!
//! This library maintains bucketed aggregates (sum, min, max, count,
//! count_where, avg) over a base time-series table as it is written:
//! - Per-key streaming buckets, closed by row count or by time range
//! - Out-of-order writes folded into already-flushed buckets
//! - Compact binary bucket rows in an aggregate table
//! - Deterministic crash recovery from the aggregate table plus a replay
//!   of the base table's binlog

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-export main types
pub use aggregate::{create_aggregator, AggrBuffer, AggrStat, AggrType, Aggregator, WindowType};
pub use config::EngineConfig;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_sanity() {
        assert_eq!(2 + 2, 4);
    }
}
