//! Aggregate function variants
//!
//! Each variant supplies three operations over the opaque accumulator:
//! fold one base row in, encode the accumulator into the `agg_val` column
//! payload, and decode a payload back. The base state machine in the
//! parent module is variant-agnostic and dispatches here.
//!
//! # Payload Encoding
//!
//! | Function    | `agg_val` bytes                                   |
//! |-------------|---------------------------------------------------|
//! | sum         | 8B i64 (integer widths widened) / 4B f32 / 8B f64 |
//! | min / max   | native width of the column; strings raw; NULL when the bucket saw no non-null sample |
//! | count       | 8B i64 non-null count                             |
//! | count_where | same as count, partitioned by filter value        |
//! | avg         | 8B f64 sum followed by 8B i64 count               |
//!
//! All numeric payloads little-endian. Min/Max over string columns order
//! values by length first, then by bytes.

use std::cmp::Ordering;

use crate::codec::RowView;
use crate::error::{AggrError, StorageError};
use crate::types::{DataType, Value};

use super::buffer::{AggrBuffer, AggrValue};
use super::Aggregator;

/// Supported aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrType {
    /// Sum of non-null values
    Sum,
    /// Minimum non-null value
    Min,
    /// Maximum non-null value
    Max,
    /// Count of non-null values, or of all rows for `count(*)`
    Count,
    /// Count partitioned by the value of a filter column
    CountWhere,
    /// Mean of non-null values
    Avg,
}

impl AggrType {
    /// Parse a lowercased function name
    pub fn parse(name: &str) -> Option<AggrType> {
        match name {
            "sum" => Some(AggrType::Sum),
            "min" => Some(AggrType::Min),
            "max" => Some(AggrType::Max),
            "count" => Some(AggrType::Count),
            "count_where" => Some(AggrType::CountWhere),
            "avg" => Some(AggrType::Avg),
            _ => None,
        }
    }

    /// Function name, for logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            AggrType::Sum => "sum",
            AggrType::Min => "min",
            AggrType::Max => "max",
            AggrType::Count => "count",
            AggrType::CountWhere => "count_where",
            AggrType::Avg => "avg",
        }
    }

    /// Column-type matrix of this function
    pub fn supports_column(&self, data_type: DataType) -> bool {
        match self {
            AggrType::Sum | AggrType::Avg => matches!(
                data_type,
                DataType::SmallInt
                    | DataType::Int
                    | DataType::BigInt
                    | DataType::Float
                    | DataType::Double
            ),
            AggrType::Min | AggrType::Max => matches!(
                data_type,
                DataType::SmallInt
                    | DataType::Int
                    | DataType::BigInt
                    | DataType::Float
                    | DataType::Double
                    | DataType::Timestamp
                    | DataType::Date
                    | DataType::String
            ),
            AggrType::Count | AggrType::CountWhere => true,
        }
    }
}

fn better<T: PartialOrd>(new: T, cur: T, take_min: bool) -> bool {
    if take_min {
        new < cur
    } else {
        new > cur
    }
}

// String accumulators order by length first, then bytes.
fn compare_str(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn better_str(new: &[u8], cur: &[u8], take_min: bool) -> bool {
    match compare_str(new, cur) {
        Ordering::Less => take_min,
        Ordering::Greater => !take_min,
        Ordering::Equal => false,
    }
}

fn payload_error(what: &str) -> AggrError {
    AggrError::Storage(StorageError::CorruptedRow(format!(
        "agg_val payload: {}",
        what
    )))
}

fn read_i64(raw: &[u8]) -> Result<i64, AggrError> {
    raw.try_into()
        .map(i64::from_le_bytes)
        .map_err(|_| payload_error("expected 8 bytes"))
}

impl Aggregator {
    fn require_aggr_col(&self) -> Result<usize, AggrError> {
        self.aggr_col_idx
            .ok_or_else(|| AggrError::SchemaMismatch(self.aggr_col.clone()))
    }

    /// Fold one base row into `buffer`'s accumulator
    pub(crate) fn update_aggr_val(
        &self,
        row: &RowView<'_>,
        buffer: &mut AggrBuffer,
    ) -> Result<(), AggrError> {
        match self.aggr_type {
            AggrType::Count | AggrType::CountWhere => {
                if self.count_all {
                    buffer.non_null_cnt += 1;
                    return Ok(());
                }
                let idx = self.require_aggr_col()?;
                if !row.is_null(idx)? {
                    buffer.non_null_cnt += 1;
                }
                Ok(())
            }
            AggrType::Sum => self.fold_sum(row, buffer),
            AggrType::Avg => self.fold_avg(row, buffer),
            AggrType::Min => self.fold_extreme(row, buffer, true),
            AggrType::Max => self.fold_extreme(row, buffer, false),
        }
    }

    fn fold_sum(&self, row: &RowView<'_>, buffer: &mut AggrBuffer) -> Result<(), AggrError> {
        let idx = self.require_aggr_col()?;
        let value = row.get_value(idx)?;
        if value.is_null() {
            return Ok(());
        }
        match (self.aggr_col_type, value) {
            (DataType::SmallInt, Value::SmallInt(x)) => {
                buffer.aggr_val = AggrValue::Long(buffer.aggr_val.long_or_zero() + x as i64);
            }
            (DataType::Int, Value::Int(x)) => {
                buffer.aggr_val = AggrValue::Long(buffer.aggr_val.long_or_zero() + x as i64);
            }
            (DataType::BigInt, Value::BigInt(x)) => {
                buffer.aggr_val = AggrValue::Long(buffer.aggr_val.long_or_zero() + x);
            }
            (DataType::Float, Value::Float(x)) => {
                buffer.aggr_val = AggrValue::Float(buffer.aggr_val.float_or_zero() + x);
            }
            (DataType::Double, Value::Double(x)) => {
                buffer.aggr_val = AggrValue::Double(buffer.aggr_val.double_or_zero() + x);
            }
            (data_type, _) => {
                return Err(AggrError::UnsupportedType {
                    data_type,
                    context: "sum column".to_string(),
                })
            }
        }
        buffer.non_null_cnt += 1;
        Ok(())
    }

    fn fold_avg(&self, row: &RowView<'_>, buffer: &mut AggrBuffer) -> Result<(), AggrError> {
        let idx = self.require_aggr_col()?;
        let value = row.get_value(idx)?;
        if value.is_null() {
            return Ok(());
        }
        let sample = match (self.aggr_col_type, value) {
            (DataType::SmallInt, Value::SmallInt(x)) => x as f64,
            (DataType::Int, Value::Int(x)) => x as f64,
            (DataType::BigInt, Value::BigInt(x)) => x as f64,
            (DataType::Float, Value::Float(x)) => x as f64,
            (DataType::Double, Value::Double(x)) => x,
            (data_type, _) => {
                return Err(AggrError::UnsupportedType {
                    data_type,
                    context: "avg column".to_string(),
                })
            }
        };
        buffer.aggr_val = AggrValue::Double(buffer.aggr_val.double_or_zero() + sample);
        buffer.non_null_cnt += 1;
        Ok(())
    }

    fn fold_extreme(
        &self,
        row: &RowView<'_>,
        buffer: &mut AggrBuffer,
        take_min: bool,
    ) -> Result<(), AggrError> {
        let idx = self.require_aggr_col()?;
        let value = row.get_value(idx)?;
        if value.is_null() {
            return Ok(());
        }
        match (self.aggr_col_type, value) {
            (DataType::SmallInt, Value::SmallInt(x)) => {
                let replace = match buffer.aggr_val {
                    AggrValue::SmallInt(cur) => better(x, cur, take_min),
                    _ => true,
                };
                if replace {
                    buffer.aggr_val = AggrValue::SmallInt(x);
                }
            }
            (DataType::Int, Value::Int(x)) | (DataType::Date, Value::Date(x)) => {
                let replace = match buffer.aggr_val {
                    AggrValue::Int(cur) => better(x, cur, take_min),
                    _ => true,
                };
                if replace {
                    buffer.aggr_val = AggrValue::Int(x);
                }
            }
            (DataType::BigInt, Value::BigInt(x)) | (DataType::Timestamp, Value::Timestamp(x)) => {
                let replace = match buffer.aggr_val {
                    AggrValue::Long(cur) => better(x, cur, take_min),
                    _ => true,
                };
                if replace {
                    buffer.aggr_val = AggrValue::Long(x);
                }
            }
            (DataType::Float, Value::Float(x)) => {
                let replace = match buffer.aggr_val {
                    AggrValue::Float(cur) => better(x, cur, take_min),
                    _ => true,
                };
                if replace {
                    buffer.aggr_val = AggrValue::Float(x);
                }
            }
            (DataType::Double, Value::Double(x)) => {
                let replace = match buffer.aggr_val {
                    AggrValue::Double(cur) => better(x, cur, take_min),
                    _ => true,
                };
                if replace {
                    buffer.aggr_val = AggrValue::Double(x);
                }
            }
            (DataType::String, Value::Str(x)) => match &mut buffer.aggr_val {
                AggrValue::Str(cur) => {
                    if better_str(&x, cur, take_min) {
                        cur.clear();
                        cur.extend_from_slice(&x);
                    }
                }
                _ => buffer.aggr_val = AggrValue::Str(x),
            },
            (data_type, _) => {
                return Err(AggrError::UnsupportedType {
                    data_type,
                    context: if take_min { "min column" } else { "max column" }.to_string(),
                })
            }
        }
        buffer.non_null_cnt += 1;
        Ok(())
    }

    /// Encode `buffer`'s accumulator into the `agg_val` payload
    ///
    /// `None` means the column is written as NULL, which happens only for
    /// Min/Max buckets that saw no non-null sample.
    pub(crate) fn encode_aggr_val(&self, buffer: &AggrBuffer) -> Result<Option<Vec<u8>>, AggrError> {
        let payload = match self.aggr_type {
            AggrType::Count | AggrType::CountWhere => {
                Some(buffer.non_null_cnt.to_le_bytes().to_vec())
            }
            AggrType::Avg => {
                let mut raw = Vec::with_capacity(16);
                raw.extend_from_slice(&buffer.aggr_val.double_or_zero().to_le_bytes());
                raw.extend_from_slice(&buffer.non_null_cnt.to_le_bytes());
                Some(raw)
            }
            AggrType::Sum => Some(match self.aggr_col_type {
                DataType::SmallInt | DataType::Int | DataType::BigInt => {
                    buffer.aggr_val.long_or_zero().to_le_bytes().to_vec()
                }
                DataType::Float => buffer.aggr_val.float_or_zero().to_le_bytes().to_vec(),
                DataType::Double => buffer.aggr_val.double_or_zero().to_le_bytes().to_vec(),
                data_type => {
                    return Err(AggrError::UnsupportedType {
                        data_type,
                        context: "sum column".to_string(),
                    })
                }
            }),
            AggrType::Min | AggrType::Max => {
                if buffer.non_null_cnt == 0 {
                    None
                } else {
                    match &buffer.aggr_val {
                        AggrValue::Empty => None,
                        AggrValue::SmallInt(v) => Some(v.to_le_bytes().to_vec()),
                        AggrValue::Int(v) => Some(v.to_le_bytes().to_vec()),
                        AggrValue::Long(v) => Some(v.to_le_bytes().to_vec()),
                        AggrValue::Float(v) => Some(v.to_le_bytes().to_vec()),
                        AggrValue::Double(v) => Some(v.to_le_bytes().to_vec()),
                        AggrValue::Str(v) => Some(v.clone()),
                    }
                }
            }
        };
        Ok(payload)
    }

    /// Decode an `agg_val` payload back into `buffer`'s accumulator
    pub(crate) fn decode_aggr_val(
        &self,
        raw: Option<&[u8]>,
        buffer: &mut AggrBuffer,
    ) -> Result<(), AggrError> {
        match self.aggr_type {
            AggrType::Count | AggrType::CountWhere => {
                buffer.aggr_val = AggrValue::Empty;
                buffer.non_null_cnt = match raw {
                    Some(b) => read_i64(b)?,
                    None => 0,
                };
            }
            AggrType::Avg => match raw {
                Some(b) if b.len() == 16 => {
                    let sum = f64::from_le_bytes(b[0..8].try_into().unwrap());
                    buffer.aggr_val = AggrValue::Double(sum);
                    buffer.non_null_cnt = i64::from_le_bytes(b[8..16].try_into().unwrap());
                }
                Some(_) => return Err(payload_error("avg payload must be 16 bytes")),
                None => {
                    buffer.aggr_val = AggrValue::Empty;
                    buffer.non_null_cnt = 0;
                }
            },
            AggrType::Sum => match raw {
                Some(b) => {
                    buffer.aggr_val = match self.aggr_col_type {
                        DataType::SmallInt | DataType::Int | DataType::BigInt => {
                            AggrValue::Long(read_i64(b)?)
                        }
                        DataType::Float => AggrValue::Float(
                            b.try_into()
                                .map(f32::from_le_bytes)
                                .map_err(|_| payload_error("expected 4 bytes"))?,
                        ),
                        DataType::Double => AggrValue::Double(
                            b.try_into()
                                .map(f64::from_le_bytes)
                                .map_err(|_| payload_error("expected 8 bytes"))?,
                        ),
                        data_type => {
                            return Err(AggrError::UnsupportedType {
                                data_type,
                                context: "sum column".to_string(),
                            })
                        }
                    };
                    buffer.non_null_cnt = 1;
                }
                None => {
                    buffer.aggr_val = AggrValue::Empty;
                    buffer.non_null_cnt = 0;
                }
            },
            AggrType::Min | AggrType::Max => match raw {
                Some(b) => {
                    buffer.aggr_val = match self.aggr_col_type {
                        DataType::SmallInt => AggrValue::SmallInt(
                            b.try_into()
                                .map(i16::from_le_bytes)
                                .map_err(|_| payload_error("expected 2 bytes"))?,
                        ),
                        DataType::Int | DataType::Date => AggrValue::Int(
                            b.try_into()
                                .map(i32::from_le_bytes)
                                .map_err(|_| payload_error("expected 4 bytes"))?,
                        ),
                        DataType::BigInt | DataType::Timestamp => AggrValue::Long(read_i64(b)?),
                        DataType::Float => AggrValue::Float(
                            b.try_into()
                                .map(f32::from_le_bytes)
                                .map_err(|_| payload_error("expected 4 bytes"))?,
                        ),
                        DataType::Double => AggrValue::Double(
                            b.try_into()
                                .map(f64::from_le_bytes)
                                .map_err(|_| payload_error("expected 8 bytes"))?,
                        ),
                        DataType::String => AggrValue::Str(b.to_vec()),
                    };
                    buffer.non_null_cnt = 1;
                }
                None => {
                    buffer.aggr_val = AggrValue::Empty;
                    buffer.non_null_cnt = 0;
                }
            },
        }
        Ok(())
    }
}
