//! Core data types shared across the engine
//!
//! This module defines the fundamental data structures used across the system:
//!
//! # Key Types
//!
//! - **`DataType`**: Declared type of a table column
//! - **`Value`**: A decoded column value, including the NULL state
//! - **`ColumnDesc`** / **`Schema`**: Ordered column descriptors for a table
//! - **`Dimension`**: An (index, key) pair routing a row into a table index
//!
//! # Example
//!
//! ```rust
//! use rollup_tsdb::types::{ColumnDesc, DataType, Schema};
//!
//! let schema = Schema::new(vec![
//!     ColumnDesc::new("id", DataType::String),
//!     ColumnDesc::new("ts", DataType::Timestamp),
//!     ColumnDesc::new("value", DataType::Int),
//! ]);
//!
//! assert_eq!(schema.index_of("ts"), Some(1));
//! assert_eq!(schema.col(2).data_type, DataType::Int);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared type of a table column
///
/// Fixed-width types occupy their natural width in the row encoding;
/// `String` columns are length-prefixed and may carry arbitrary bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 16-bit signed integer
    SmallInt,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    BigInt,
    /// 32-bit IEEE 754 float
    Float,
    /// 64-bit IEEE 754 float
    Double,
    /// Milliseconds since the Unix epoch, stored as i64
    Timestamp,
    /// Days since the Unix epoch, stored as i32
    Date,
    /// Length-prefixed byte string
    String,
}

impl DataType {
    /// Width in bytes of the encoded payload, or `None` for variable-length types
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            DataType::SmallInt => Some(2),
            DataType::Int | DataType::Date | DataType::Float => Some(4),
            DataType::BigInt | DataType::Timestamp | DataType::Double => Some(8),
            DataType::String => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::SmallInt => "smallint",
            DataType::Int => "int",
            DataType::BigInt => "bigint",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::Timestamp => "timestamp",
            DataType::Date => "date",
            DataType::String => "string",
        };
        write!(f, "{}", name)
    }
}

/// A decoded column value
///
/// `Null` is a first-class state so callers can distinguish "no value"
/// from any real payload without a side channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// 16-bit signed integer
    SmallInt(i16),
    /// 32-bit signed integer
    Int(i32),
    /// 64-bit signed integer
    BigInt(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// Milliseconds since epoch
    Timestamp(i64),
    /// Days since epoch
    Date(i32),
    /// Raw bytes of a string column
    Str(Vec<u8>),
}

impl Value {
    /// True if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical text form, used to build composite aggregation keys
    ///
    /// NULL renders as the empty string so that a null filter column still
    /// maps to a stable partition.
    pub fn string_form(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::SmallInt(v) => v.to_string(),
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Timestamp(v) => v.to_string(),
            Value::Date(v) => v.to_string(),
            Value::Str(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// Descriptor of a single column: name plus declared type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    /// Column name, unique within a schema
    pub name: String,
    /// Declared type
    pub data_type: DataType,
}

impl ColumnDesc {
    /// Create a column descriptor
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered list of column descriptors for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    cols: Vec<ColumnDesc>,
}

impl Schema {
    /// Build a schema from ordered column descriptors
    pub fn new(cols: Vec<ColumnDesc>) -> Self {
        Self { cols }
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.cols.len()
    }

    /// True if the schema has no columns
    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// Column descriptor at `idx`; panics if out of range
    pub fn col(&self, idx: usize) -> &ColumnDesc {
        &self.cols[idx]
    }

    /// Column descriptor at `idx`, or `None` if out of range
    pub fn get(&self, idx: usize) -> Option<&ColumnDesc> {
        self.cols.get(idx)
    }

    /// Position of the column named `name`
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.cols.iter().position(|c| c.name == name)
    }

    /// Iterate over column descriptors in schema order
    pub fn iter(&self) -> impl Iterator<Item = &ColumnDesc> {
        self.cols.iter()
    }
}

/// Routing of a row into one table index
///
/// `idx` names the index; `key` is the value of the index key for this row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    /// Index position in the table's index list
    pub idx: u32,
    /// Index key value
    pub key: String,
}

impl Dimension {
    /// Create a dimension for index `idx` with key `key`
    pub fn new(idx: u32, key: impl Into<String>) -> Self {
        Self {
            idx,
            key: key.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_widths() {
        assert_eq!(DataType::SmallInt.fixed_width(), Some(2));
        assert_eq!(DataType::Int.fixed_width(), Some(4));
        assert_eq!(DataType::BigInt.fixed_width(), Some(8));
        assert_eq!(DataType::Float.fixed_width(), Some(4));
        assert_eq!(DataType::Double.fixed_width(), Some(8));
        assert_eq!(DataType::Timestamp.fixed_width(), Some(8));
        assert_eq!(DataType::Date.fixed_width(), Some(4));
        assert_eq!(DataType::String.fixed_width(), None);
    }

    #[test]
    fn test_schema_lookup() {
        let schema = Schema::new(vec![
            ColumnDesc::new("id", DataType::String),
            ColumnDesc::new("ts", DataType::Timestamp),
        ]);
        assert_eq!(schema.len(), 2);
        assert_eq!(schema.index_of("ts"), Some(1));
        assert_eq!(schema.index_of("missing"), None);
        assert_eq!(schema.col(0).name, "id");
    }

    #[test]
    fn test_value_string_form() {
        assert_eq!(Value::Null.string_form(), "");
        assert_eq!(Value::Int(42).string_form(), "42");
        assert_eq!(Value::Str(b"abc".to_vec()).string_form(), "abc");
    }
}
