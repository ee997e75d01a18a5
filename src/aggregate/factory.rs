//! Aggregator construction
//!
//! Parses the aggregate function name and bucket-size string and wires up
//! the right [`Aggregator`] instance.

use std::sync::Arc;

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::AggrError;
use crate::storage::replicator::Replicator;
use crate::storage::table::Table;
use crate::types::{ColumnDesc, DataType, Schema};

use super::func::AggrType;
use super::{Aggregator, WindowDef, WindowType};

/// Parse a bucket-size string
///
/// A pure decimal integer selects a row-count window of that many rows;
/// an integer with a trailing unit (`s`, `m`, `h`, `d`) selects a time
/// window of that span, converted to milliseconds.
pub fn parse_bucket_size(bucket_size: &str) -> Result<WindowDef, AggrError> {
    if bucket_size.is_empty() {
        return Err(AggrError::WindowParse(
            bucket_size.to_string(),
            "bucket size is empty".to_string(),
        ));
    }

    if bucket_size.bytes().all(|b| b.is_ascii_digit()) {
        let size = bucket_size.parse::<u64>().map_err(|e| {
            AggrError::WindowParse(bucket_size.to_string(), e.to_string())
        })?;
        if size == 0 {
            return Err(AggrError::WindowParse(
                bucket_size.to_string(),
                "bucket size must be positive".to_string(),
            ));
        }
        return Ok(WindowDef {
            window_type: WindowType::RowsNum,
            size,
        });
    }

    let unit = bucket_size.chars().next_back().expect("checked non-empty");
    let prefix = &bucket_size[..bucket_size.len() - unit.len_utf8()];
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AggrError::WindowParse(
            bucket_size.to_string(),
            "bucket size is not a number".to_string(),
        ));
    }
    let count = prefix
        .parse::<u64>()
        .map_err(|e| AggrError::WindowParse(bucket_size.to_string(), e.to_string()))?;
    if count == 0 {
        return Err(AggrError::WindowParse(
            bucket_size.to_string(),
            "bucket size must be positive".to_string(),
        ));
    }
    let unit_ms: u64 = match unit {
        's' => 1_000,
        'm' => 60 * 1_000,
        'h' => 60 * 60 * 1_000,
        'd' => 24 * 60 * 60 * 1_000,
        _ => {
            return Err(AggrError::WindowParse(
                bucket_size.to_string(),
                format!("unsupported time unit '{}'", unit),
            ))
        }
    };
    Ok(WindowDef {
        window_type: WindowType::RowsRange,
        size: count * unit_ms,
    })
}

/// Schema of the rows the engine writes to the aggregate table
pub fn default_aggr_schema() -> Schema {
    Schema::new(vec![
        ColumnDesc::new("key", DataType::String),
        ColumnDesc::new("ts_start", DataType::Timestamp),
        ColumnDesc::new("ts_end", DataType::Timestamp),
        ColumnDesc::new("num_rows", DataType::Int),
        ColumnDesc::new("agg_val", DataType::String),
        ColumnDesc::new("binlog_offset", DataType::BigInt),
        ColumnDesc::new("filter_key", DataType::String),
    ])
}

/// Build an aggregator from its textual definition
///
/// `aggr_func` is matched case-insensitively. `count` over the column
/// `*` counts every row; `count_where` requires `filter_col`, which
/// partitions buckets by that column's value.
#[allow(clippy::too_many_arguments)]
pub fn create_aggregator(
    base_schema: Arc<Schema>,
    aggr_schema: Arc<Schema>,
    aggr_table: Arc<dyn Table>,
    aggr_replicator: Arc<dyn Replicator>,
    index_pos: u32,
    aggr_col: &str,
    aggr_func: &str,
    ts_col: &str,
    bucket_size: &str,
    filter_col: Option<&str>,
    config: &EngineConfig,
) -> Result<Arc<Aggregator>, AggrError> {
    let window = parse_bucket_size(bucket_size)?;

    let func = aggr_func.to_lowercase();
    let Some(aggr_type) = AggrType::parse(&func) else {
        warn!(aggr_func, "unsupported aggregate function");
        return Err(AggrError::UnsupportedFunction(aggr_func.to_string()));
    };
    if aggr_type == AggrType::CountWhere && filter_col.is_none() {
        return Err(AggrError::UnsupportedFunction(
            "count_where requires a filter column".to_string(),
        ));
    }
    if aggr_type != AggrType::CountWhere && filter_col.is_some() {
        return Err(AggrError::UnsupportedFunction(format!(
            "{} does not take a filter column",
            aggr_type.as_str()
        )));
    }

    let aggregator = Aggregator::new(
        base_schema,
        aggr_schema,
        aggr_table,
        aggr_replicator,
        index_pos,
        aggr_col.to_string(),
        aggr_type,
        ts_col.to_string(),
        window,
        filter_col.map(|c| c.to_string()),
        config.notify_on_put,
    )?;
    Ok(Arc::new(aggregator))
}
