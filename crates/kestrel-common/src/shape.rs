//! Row shape descriptors and the row image format.

use crate::datum::Datum;
use crate::error::{KestrelError, Result};
use crate::types::TypeId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Description of a single table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    /// Column name.
    pub name: String,
    /// Column type.
    pub type_id: TypeId,
    /// True if the column carries a NOT NULL constraint.
    pub not_null: bool,
    /// True if the column was dropped; its value is always null.
    pub dropped: bool,
}

impl ColumnDesc {
    /// Creates a nullable column.
    pub fn new(name: impl Into<String>, type_id: TypeId) -> Self {
        Self {
            name: name.into(),
            type_id,
            not_null: false,
            dropped: false,
        }
    }

    /// Marks the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Returns the fixed width, or None for variable-length columns.
    pub fn attlen(&self) -> Option<usize> {
        self.type_id.fixed_size()
    }
}

/// Shape of a table row: column count, types, lengths, nullability.
///
/// Row image layout:
/// +------------------------+ 0
/// | natts: u16             | 2
/// | null bitmap            | ceil(natts / 8) bytes, bit set = null
/// | attribute 1 .. natts   | each aligned to its type alignment
/// +------------------------+
///
/// Fixed-length attributes are stored little-endian in their fixed width.
/// Variable-length attributes are a u32 payload length followed by the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowShape {
    columns: Vec<ColumnDesc>,
}

impl RowShape {
    /// Creates a shape from its columns, in attribute order.
    pub fn new(columns: Vec<ColumnDesc>) -> Self {
        Self { columns }
    }

    /// Returns the number of attributes.
    pub fn natts(&self) -> usize {
        self.columns.len()
    }

    /// Returns all columns in attribute order.
    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    /// Returns the column for a 1-based attribute number.
    pub fn column(&self, attnum: u16) -> Option<&ColumnDesc> {
        if attnum == 0 {
            return None;
        }
        self.columns.get(attnum as usize - 1)
    }

    fn bitmap_len(&self) -> usize {
        self.columns.len().div_ceil(8)
    }

    /// Builds a row image from one optional value per attribute.
    pub fn form_row(&self, values: &[Option<Datum>]) -> Result<Bytes> {
        if values.len() != self.columns.len() {
            return Err(KestrelError::ShapeMismatch {
                expected: self.columns.len(),
                actual: values.len(),
            });
        }

        let header_len = 2 + self.bitmap_len();
        let mut buf = vec![0u8; header_len];
        buf[0..2].copy_from_slice(&(self.columns.len() as u16).to_le_bytes());

        for (i, (col, value)) in self.columns.iter().zip(values).enumerate() {
            let value = if col.dropped { None } else { value.as_ref() };
            match value {
                None => {
                    if col.not_null && !col.dropped {
                        return Err(KestrelError::NullNotAllowed(col.name.clone()));
                    }
                    buf[2 + i / 8] |= 1 << (i % 8);
                }
                Some(datum) => {
                    buf.resize(align_up(buf.len(), col.type_id.alignment()), 0);
                    if col.type_id.is_fixed_size() {
                        datum.write_payload(col.type_id, &mut buf)?;
                    } else {
                        let len_pos = buf.len();
                        buf.extend_from_slice(&[0u8; 4]);
                        datum.write_payload(col.type_id, &mut buf)?;
                        let len = (buf.len() - len_pos - 4) as u32;
                        buf[len_pos..len_pos + 4].copy_from_slice(&len.to_le_bytes());
                    }
                }
            }
        }
        Ok(Bytes::from(buf))
    }

    /// Splits a row image into raw attribute payloads without copying.
    ///
    /// Returns one entry per attribute; None for nulls.
    pub fn deform_row<'a>(&self, data: &'a [u8]) -> Result<Vec<Option<&'a [u8]>>> {
        if data.len() < 2 {
            return Err(KestrelError::MalformedRow("row image too short".to_string()));
        }
        let natts = u16::from_le_bytes([data[0], data[1]]) as usize;
        if natts != self.columns.len() {
            return Err(KestrelError::ShapeMismatch {
                expected: self.columns.len(),
                actual: natts,
            });
        }
        let mut pos = 2 + self.bitmap_len();
        if data.len() < pos {
            return Err(KestrelError::MalformedRow("truncated null bitmap".to_string()));
        }

        let mut attrs = Vec::with_capacity(natts);
        for (i, col) in self.columns.iter().enumerate() {
            if data[2 + i / 8] & (1 << (i % 8)) != 0 {
                attrs.push(None);
                continue;
            }
            pos = align_up(pos, col.type_id.alignment());
            let len = match col.attlen() {
                Some(len) => len,
                None => {
                    let raw = data.get(pos..pos + 4).ok_or_else(|| truncated(&col.name))?;
                    pos += 4;
                    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
                }
            };
            let payload = data.get(pos..pos + len).ok_or_else(|| truncated(&col.name))?;
            pos += len;
            attrs.push(Some(payload));
        }
        Ok(attrs)
    }

    /// Decodes every attribute of a row image.
    pub fn decode_row(&self, data: &[u8]) -> Result<Vec<Option<Datum>>> {
        self.deform_row(data)?
            .into_iter()
            .zip(&self.columns)
            .map(|(raw, col)| raw.map(|p| Datum::decode(col.type_id, p)).transpose())
            .collect()
    }
}

fn truncated(column: &str) -> KestrelError {
    KestrelError::MalformedRow(format!("attribute {} runs past end of row", column))
}

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline(always)]
pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shape() -> RowShape {
        RowShape::new(vec![
            ColumnDesc::new("id", TypeId::Int64).not_null(),
            ColumnDesc::new("flag", TypeId::Boolean),
            ColumnDesc::new("name", TypeId::Text),
            ColumnDesc::new("score", TypeId::Float64),
        ])
    }

    #[test]
    fn test_form_and_decode_row() {
        let shape = sample_shape();
        let values = vec![
            Some(Datum::Int64(42)),
            None,
            Some(Datum::Text("kestrel".into())),
            Some(Datum::Float64(0.5)),
        ];
        let row = shape.form_row(&values).unwrap();
        assert_eq!(shape.decode_row(&row).unwrap(), values);
    }

    #[test]
    fn test_deform_alignment() {
        let shape = sample_shape();
        let row = shape
            .form_row(&[
                Some(Datum::Int64(1)),
                Some(Datum::Bool(true)),
                Some(Datum::Text("ab".into())),
                Some(Datum::Float64(2.0)),
            ])
            .unwrap();
        let attrs = shape.deform_row(&row).unwrap();
        assert_eq!(attrs[0].unwrap().len(), 8);
        assert_eq!(attrs[1].unwrap(), &[1u8]);
        assert_eq!(attrs[2].unwrap(), b"ab");
        let base = row.as_ptr() as usize;
        assert_eq!((attrs[3].unwrap().as_ptr() as usize - base) % 8, 0);
    }

    #[test]
    fn test_not_null_enforced() {
        let shape = sample_shape();
        let err = shape.form_row(&[None, None, None, None]).unwrap_err();
        assert!(matches!(err, KestrelError::NullNotAllowed(ref c) if c == "id"));
    }

    #[test]
    fn test_dropped_column_reads_null() {
        let mut cols = sample_shape().columns().to_vec();
        cols[3].dropped = true;
        let shape = RowShape::new(cols);
        let row = shape
            .form_row(&[Some(Datum::Int64(1)), None, None, Some(Datum::Float64(9.0))])
            .unwrap();
        assert_eq!(shape.decode_row(&row).unwrap()[3], None);
    }

    #[test]
    fn test_shape_mismatch() {
        let shape = sample_shape();
        assert!(matches!(
            shape.form_row(&[None]),
            Err(KestrelError::ShapeMismatch {
                expected: 4,
                actual: 1
            })
        ));
        let other = RowShape::new(vec![ColumnDesc::new("x", TypeId::Int32)]);
        let row = other.form_row(&[Some(Datum::Int32(3))]).unwrap();
        assert!(shape.deform_row(&row).is_err());
    }

    #[test]
    fn test_truncated_row() {
        let shape = sample_shape();
        let row = shape
            .form_row(&[Some(Datum::Int64(1)), None, Some(Datum::Text("abc".into())), None])
            .unwrap();
        assert!(shape.deform_row(&row[..row.len() - 1]).is_err());
        assert_eq!(shape.column(1).unwrap().name, "id");
        assert!(shape.column(0).is_none());
    }
}
