//! Row builder and row view
//!
//! `RowBuilder` appends typed values in schema order and produces the
//! encoded row; `RowView` parses an encoded row once and serves typed,
//! null-aware reads by column index.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::CodecError;
use crate::types::{DataType, Schema, Value};

/// Incremental, reusable encoder for one row schema
///
/// Values must be appended in schema order; `finish` validates that every
/// column was supplied, emits the row, and resets the builder for reuse.
/// A shared builder instance is how callers amortize the scratch buffer;
/// access from multiple threads must be externally serialized.
pub struct RowBuilder {
    schema: Arc<Schema>,
    nulls: Vec<u8>,
    payload: Vec<u8>,
    col: usize,
}

impl RowBuilder {
    /// Create a builder for `schema`
    pub fn new(schema: Arc<Schema>) -> Self {
        let bitmap_len = schema.len().div_ceil(8);
        Self {
            schema,
            nulls: vec![0u8; bitmap_len],
            payload: Vec::new(),
            col: 0,
        }
    }

    fn expect(&mut self, requested: &'static str, want: &[DataType]) -> Result<(), CodecError> {
        let idx = self.col;
        let desc = self
            .schema
            .get(idx)
            .ok_or(CodecError::ColumnOutOfRange {
                idx,
                len: self.schema.len(),
            })?;
        if !want.contains(&desc.data_type) {
            return Err(CodecError::TypeMismatch {
                idx,
                declared: desc.data_type,
                requested,
            });
        }
        Ok(())
    }

    /// Append a NULL for the current column
    pub fn append_null(&mut self) -> Result<(), CodecError> {
        let idx = self.col;
        if idx >= self.schema.len() {
            return Err(CodecError::ColumnOutOfRange {
                idx,
                len: self.schema.len(),
            });
        }
        self.nulls[idx / 8] |= 1 << (idx % 8);
        self.col += 1;
        Ok(())
    }

    /// Append an i16 to a `SmallInt` column
    pub fn append_i16(&mut self, v: i16) -> Result<(), CodecError> {
        self.expect("i16", &[DataType::SmallInt])?;
        self.payload.extend_from_slice(&v.to_le_bytes());
        self.col += 1;
        Ok(())
    }

    /// Append an i32 to an `Int` column
    pub fn append_i32(&mut self, v: i32) -> Result<(), CodecError> {
        self.expect("i32", &[DataType::Int])?;
        self.payload.extend_from_slice(&v.to_le_bytes());
        self.col += 1;
        Ok(())
    }

    /// Append an i64 to a `BigInt` column
    pub fn append_i64(&mut self, v: i64) -> Result<(), CodecError> {
        self.expect("i64", &[DataType::BigInt])?;
        self.payload.extend_from_slice(&v.to_le_bytes());
        self.col += 1;
        Ok(())
    }

    /// Append an f32 to a `Float` column
    pub fn append_f32(&mut self, v: f32) -> Result<(), CodecError> {
        self.expect("f32", &[DataType::Float])?;
        self.payload.extend_from_slice(&v.to_le_bytes());
        self.col += 1;
        Ok(())
    }

    /// Append an f64 to a `Double` column
    pub fn append_f64(&mut self, v: f64) -> Result<(), CodecError> {
        self.expect("f64", &[DataType::Double])?;
        self.payload.extend_from_slice(&v.to_le_bytes());
        self.col += 1;
        Ok(())
    }

    /// Append milliseconds-since-epoch to a `Timestamp` column
    pub fn append_timestamp(&mut self, v: i64) -> Result<(), CodecError> {
        self.expect("timestamp", &[DataType::Timestamp])?;
        self.payload.extend_from_slice(&v.to_le_bytes());
        self.col += 1;
        Ok(())
    }

    /// Append days-since-epoch to a `Date` column
    pub fn append_date(&mut self, v: i32) -> Result<(), CodecError> {
        self.expect("date", &[DataType::Date])?;
        self.payload.extend_from_slice(&v.to_le_bytes());
        self.col += 1;
        Ok(())
    }

    /// Append raw bytes to a `String` column
    pub fn append_bytes(&mut self, v: &[u8]) -> Result<(), CodecError> {
        self.expect("bytes", &[DataType::String])?;
        self.payload
            .extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.payload.extend_from_slice(v);
        self.col += 1;
        Ok(())
    }

    /// Append UTF-8 text to a `String` column
    pub fn append_str(&mut self, v: &str) -> Result<(), CodecError> {
        self.append_bytes(v.as_bytes())
    }

    /// Discard any partially appended row
    pub fn reset(&mut self) {
        self.nulls.iter_mut().for_each(|b| *b = 0);
        self.payload.clear();
        self.col = 0;
    }

    /// Emit the encoded row and reset the builder for the next one
    pub fn finish(&mut self) -> Result<Bytes, CodecError> {
        if self.col != self.schema.len() {
            return Err(CodecError::BuilderMisuse(format!(
                "row incomplete: {} of {} columns appended",
                self.col,
                self.schema.len()
            )));
        }
        let mut row = Vec::with_capacity(self.nulls.len() + self.payload.len());
        row.extend_from_slice(&self.nulls);
        row.extend_from_slice(&self.payload);
        self.reset();
        Ok(Bytes::from(row))
    }
}

/// Parsed, read-only view over one encoded row
///
/// Field offsets are indexed in a single pass at construction; typed
/// getters return `None` for NULL columns and fail on type mismatch.
pub struct RowView<'a> {
    schema: &'a Schema,
    data: &'a [u8],
    // (offset, len) per column; None marks NULL
    fields: Vec<Option<(usize, usize)>>,
}

impl<'a> RowView<'a> {
    /// Parse `data` against `schema`
    pub fn new(schema: &'a Schema, data: &'a [u8]) -> Result<Self, CodecError> {
        let bitmap_len = schema.len().div_ceil(8);
        if data.len() < bitmap_len {
            return Err(CodecError::TruncatedRow {
                need: bitmap_len,
                offset: 0,
                have: data.len(),
            });
        }

        let mut fields = Vec::with_capacity(schema.len());
        let mut offset = bitmap_len;
        for (idx, desc) in schema.iter().enumerate() {
            let is_null = data[idx / 8] & (1 << (idx % 8)) != 0;
            if is_null {
                fields.push(None);
                continue;
            }
            let len = match desc.data_type.fixed_width() {
                Some(w) => w,
                None => {
                    let need = 4;
                    if data.len() < offset + need {
                        return Err(CodecError::TruncatedRow {
                            need,
                            offset,
                            have: data.len().saturating_sub(offset),
                        });
                    }
                    let raw: [u8; 4] = data[offset..offset + 4].try_into().unwrap();
                    offset += 4;
                    u32::from_le_bytes(raw) as usize
                }
            };
            if data.len() < offset + len {
                return Err(CodecError::TruncatedRow {
                    need: len,
                    offset,
                    have: data.len().saturating_sub(offset),
                });
            }
            fields.push(Some((offset, len)));
            offset += len;
        }

        Ok(Self {
            schema,
            data,
            fields,
        })
    }

    fn field(&self, idx: usize) -> Result<Option<&'a [u8]>, CodecError> {
        let slot = self.fields.get(idx).ok_or(CodecError::ColumnOutOfRange {
            idx,
            len: self.schema.len(),
        })?;
        Ok(slot.map(|(off, len)| &self.data[off..off + len]))
    }

    fn typed_field(
        &self,
        idx: usize,
        requested: &'static str,
        want: &[DataType],
    ) -> Result<Option<&'a [u8]>, CodecError> {
        let declared = self
            .schema
            .get(idx)
            .ok_or(CodecError::ColumnOutOfRange {
                idx,
                len: self.schema.len(),
            })?
            .data_type;
        if !want.contains(&declared) {
            return Err(CodecError::TypeMismatch {
                idx,
                declared,
                requested,
            });
        }
        self.field(idx)
    }

    /// True if the column at `idx` is NULL
    pub fn is_null(&self, idx: usize) -> Result<bool, CodecError> {
        Ok(self.field(idx)?.is_none())
    }

    /// Read a `SmallInt` column
    pub fn get_i16(&self, idx: usize) -> Result<Option<i16>, CodecError> {
        Ok(self
            .typed_field(idx, "i16", &[DataType::SmallInt])?
            .map(|b| i16::from_le_bytes(b.try_into().unwrap())))
    }

    /// Read an `Int` column
    pub fn get_i32(&self, idx: usize) -> Result<Option<i32>, CodecError> {
        Ok(self
            .typed_field(idx, "i32", &[DataType::Int])?
            .map(|b| i32::from_le_bytes(b.try_into().unwrap())))
    }

    /// Read a `BigInt` column
    pub fn get_i64(&self, idx: usize) -> Result<Option<i64>, CodecError> {
        Ok(self
            .typed_field(idx, "i64", &[DataType::BigInt])?
            .map(|b| i64::from_le_bytes(b.try_into().unwrap())))
    }

    /// Read a `Float` column
    pub fn get_f32(&self, idx: usize) -> Result<Option<f32>, CodecError> {
        Ok(self
            .typed_field(idx, "f32", &[DataType::Float])?
            .map(|b| f32::from_le_bytes(b.try_into().unwrap())))
    }

    /// Read a `Double` column
    pub fn get_f64(&self, idx: usize) -> Result<Option<f64>, CodecError> {
        Ok(self
            .typed_field(idx, "f64", &[DataType::Double])?
            .map(|b| f64::from_le_bytes(b.try_into().unwrap())))
    }

    /// Read a `Timestamp` column as milliseconds since epoch
    pub fn get_timestamp(&self, idx: usize) -> Result<Option<i64>, CodecError> {
        Ok(self
            .typed_field(idx, "timestamp", &[DataType::Timestamp])?
            .map(|b| i64::from_le_bytes(b.try_into().unwrap())))
    }

    /// Read a `Date` column as days since epoch
    pub fn get_date(&self, idx: usize) -> Result<Option<i32>, CodecError> {
        Ok(self
            .typed_field(idx, "date", &[DataType::Date])?
            .map(|b| i32::from_le_bytes(b.try_into().unwrap())))
    }

    /// Read the raw bytes of a `String` column
    pub fn get_bytes(&self, idx: usize) -> Result<Option<&'a [u8]>, CodecError> {
        self.typed_field(idx, "bytes", &[DataType::String])
    }

    /// Read any column as a tagged [`Value`]
    pub fn get_value(&self, idx: usize) -> Result<Value, CodecError> {
        let declared = self
            .schema
            .get(idx)
            .ok_or(CodecError::ColumnOutOfRange {
                idx,
                len: self.schema.len(),
            })?
            .data_type;
        let Some(raw) = self.field(idx)? else {
            return Ok(Value::Null);
        };
        let value = match declared {
            DataType::SmallInt => Value::SmallInt(i16::from_le_bytes(raw.try_into().unwrap())),
            DataType::Int => Value::Int(i32::from_le_bytes(raw.try_into().unwrap())),
            DataType::BigInt => Value::BigInt(i64::from_le_bytes(raw.try_into().unwrap())),
            DataType::Float => Value::Float(f32::from_le_bytes(raw.try_into().unwrap())),
            DataType::Double => Value::Double(f64::from_le_bytes(raw.try_into().unwrap())),
            DataType::Timestamp => Value::Timestamp(i64::from_le_bytes(raw.try_into().unwrap())),
            DataType::Date => Value::Date(i32::from_le_bytes(raw.try_into().unwrap())),
            DataType::String => Value::Str(raw.to_vec()),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnDesc;

    fn sample_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            ColumnDesc::new("id", DataType::String),
            ColumnDesc::new("ts", DataType::Timestamp),
            ColumnDesc::new("small", DataType::SmallInt),
            ColumnDesc::new("int", DataType::Int),
            ColumnDesc::new("big", DataType::BigInt),
            ColumnDesc::new("f", DataType::Float),
            ColumnDesc::new("d", DataType::Double),
            ColumnDesc::new("day", DataType::Date),
            ColumnDesc::new("note", DataType::String),
        ]))
    }

    fn sample_row(schema: &Arc<Schema>) -> Bytes {
        let mut rb = RowBuilder::new(schema.clone());
        rb.append_str("key-1").unwrap();
        rb.append_timestamp(1_700_000_000_000).unwrap();
        rb.append_i16(-3).unwrap();
        rb.append_i32(42).unwrap();
        rb.append_i64(1 << 40).unwrap();
        rb.append_f32(1.5).unwrap();
        rb.append_f64(-2.25).unwrap();
        rb.append_date(19_000).unwrap();
        rb.append_null().unwrap();
        rb.finish().unwrap()
    }

    #[test]
    fn test_build_and_read_back() {
        let schema = sample_schema();
        let row = sample_row(&schema);
        let view = RowView::new(&schema, &row).unwrap();

        assert_eq!(view.get_bytes(0).unwrap(), Some(&b"key-1"[..]));
        assert_eq!(view.get_timestamp(1).unwrap(), Some(1_700_000_000_000));
        assert_eq!(view.get_i16(2).unwrap(), Some(-3));
        assert_eq!(view.get_i32(3).unwrap(), Some(42));
        assert_eq!(view.get_i64(4).unwrap(), Some(1 << 40));
        assert_eq!(view.get_f32(5).unwrap(), Some(1.5));
        assert_eq!(view.get_f64(6).unwrap(), Some(-2.25));
        assert_eq!(view.get_date(7).unwrap(), Some(19_000));
        assert!(view.is_null(8).unwrap());
        assert_eq!(view.get_value(8).unwrap(), Value::Null);
    }

    #[test]
    fn test_builder_reuse() {
        let schema = sample_schema();
        let mut rb = RowBuilder::new(schema.clone());

        rb.append_str("a").unwrap();
        rb.append_timestamp(1).unwrap();
        rb.append_i16(1).unwrap();
        rb.append_i32(1).unwrap();
        rb.append_i64(1).unwrap();
        rb.append_f32(1.0).unwrap();
        rb.append_f64(1.0).unwrap();
        rb.append_date(1).unwrap();
        rb.append_str("x").unwrap();
        let first = rb.finish().unwrap();

        rb.append_str("b").unwrap();
        rb.append_timestamp(2).unwrap();
        rb.append_null().unwrap();
        rb.append_null().unwrap();
        rb.append_null().unwrap();
        rb.append_null().unwrap();
        rb.append_null().unwrap();
        rb.append_null().unwrap();
        rb.append_null().unwrap();
        let second = rb.finish().unwrap();

        let view = RowView::new(&schema, &first).unwrap();
        assert_eq!(view.get_bytes(0).unwrap(), Some(&b"a"[..]));
        assert!(!view.is_null(3).unwrap());

        let view = RowView::new(&schema, &second).unwrap();
        assert_eq!(view.get_bytes(0).unwrap(), Some(&b"b"[..]));
        assert!(view.is_null(3).unwrap());
        assert!(view.is_null(8).unwrap());
    }

    #[test]
    fn test_type_mismatch() {
        let schema = sample_schema();
        let row = sample_row(&schema);
        let view = RowView::new(&schema, &row).unwrap();

        assert!(matches!(
            view.get_i32(1),
            Err(CodecError::TypeMismatch { idx: 1, .. })
        ));
        let mut rb = RowBuilder::new(schema.clone());
        assert!(matches!(
            rb.append_i32(1),
            Err(CodecError::TypeMismatch { idx: 0, .. })
        ));
    }

    #[test]
    fn test_incomplete_row_rejected() {
        let schema = sample_schema();
        let mut rb = RowBuilder::new(schema.clone());
        rb.append_str("only-key").unwrap();
        assert!(matches!(
            rb.finish(),
            Err(CodecError::BuilderMisuse(_))
        ));
    }

    #[test]
    fn test_truncated_row_rejected() {
        let schema = sample_schema();
        let row = sample_row(&schema);
        let cut = &row[..row.len() - 3];
        assert!(matches!(
            RowView::new(&schema, cut),
            Err(CodecError::TruncatedRow { .. })
        ));
    }

    #[test]
    fn test_empty_string_column() {
        let schema = Arc::new(Schema::new(vec![ColumnDesc::new("s", DataType::String)]));
        let mut rb = RowBuilder::new(schema.clone());
        rb.append_str("").unwrap();
        let row = rb.finish().unwrap();
        let view = RowView::new(&schema, &row).unwrap();
        assert_eq!(view.get_bytes(0).unwrap(), Some(&b""[..]));
        assert!(!view.is_null(0).unwrap());
    }
}
