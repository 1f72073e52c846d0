//! Column values and their byte encoding.

use crate::error::{KestrelError, Result};
use crate::types::TypeId;
use bytes::Bytes;

/// A single non-null column value.
///
/// Nulls are represented as `Option::None` by callers; a datum is always
/// a concrete value of one of the cacheable types.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    /// Days since epoch.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    /// Microseconds since epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
    Text(String),
    Bytes(Bytes),
}

impl Datum {
    /// Returns true if this value can be stored in a column of `ty`.
    pub fn matches(&self, ty: TypeId) -> bool {
        matches!(
            (self, ty),
            (Datum::Bool(_), TypeId::Boolean)
                | (Datum::Int16(_), TypeId::Int16)
                | (Datum::Int32(_), TypeId::Int32)
                | (Datum::Int64(_), TypeId::Int64)
                | (Datum::Float32(_), TypeId::Float32)
                | (Datum::Float64(_), TypeId::Float64)
                | (Datum::Date(_), TypeId::Date)
                | (Datum::Time(_), TypeId::Time)
                | (Datum::Timestamp(_), TypeId::Timestamp)
                | (Datum::Uuid(_), TypeId::Uuid)
                | (Datum::Text(_), TypeId::Text | TypeId::Varchar)
                | (Datum::Bytes(_), TypeId::Bytea)
        )
    }

    /// Appends the payload bytes of this value (no length prefix).
    ///
    /// Fixed-length values are written little-endian in exactly
    /// `ty.fixed_size()` bytes.
    pub fn write_payload(&self, ty: TypeId, out: &mut Vec<u8>) -> Result<()> {
        if !self.matches(ty) {
            return Err(KestrelError::TypeMismatch {
                expected: ty.to_string(),
                actual: self.type_name().to_string(),
            });
        }
        match self {
            Datum::Bool(v) => out.push(*v as u8),
            Datum::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Datum::Int32(v) | Datum::Date(v) => out.extend_from_slice(&v.to_le_bytes()),
            Datum::Int64(v) | Datum::Time(v) | Datum::Timestamp(v) => {
                out.extend_from_slice(&v.to_le_bytes())
            }
            Datum::Float32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Datum::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Datum::Uuid(v) => out.extend_from_slice(v),
            Datum::Text(v) => out.extend_from_slice(v.as_bytes()),
            Datum::Bytes(v) => out.extend_from_slice(v),
        }
        Ok(())
    }

    /// Decodes a payload written by [`Datum::write_payload`].
    pub fn decode(ty: TypeId, payload: &[u8]) -> Result<Datum> {
        if let Some(size) = ty.fixed_size() {
            if payload.len() != size {
                return Err(KestrelError::MalformedRow(format!(
                    "{} value has {} bytes, expected {}",
                    ty,
                    payload.len(),
                    size
                )));
            }
        }
        let datum = match ty {
            TypeId::Boolean => Datum::Bool(payload[0] != 0),
            TypeId::Int16 => Datum::Int16(i16::from_le_bytes([payload[0], payload[1]])),
            TypeId::Int32 => Datum::Int32(i32::from_le_bytes(le4(payload))),
            TypeId::Date => Datum::Date(i32::from_le_bytes(le4(payload))),
            TypeId::Float32 => Datum::Float32(f32::from_le_bytes(le4(payload))),
            TypeId::Int64 => Datum::Int64(i64::from_le_bytes(le8(payload))),
            TypeId::Time => Datum::Time(i64::from_le_bytes(le8(payload))),
            TypeId::Timestamp => Datum::Timestamp(i64::from_le_bytes(le8(payload))),
            TypeId::Float64 => Datum::Float64(f64::from_le_bytes(le8(payload))),
            TypeId::Uuid => {
                let mut v = [0u8; 16];
                v.copy_from_slice(payload);
                Datum::Uuid(v)
            }
            TypeId::Varchar | TypeId::Text => {
                let s = std::str::from_utf8(payload)
                    .map_err(|e| KestrelError::MalformedRow(format!("invalid UTF-8 text: {}", e)))?;
                Datum::Text(s.to_string())
            }
            TypeId::Bytea => Datum::Bytes(Bytes::copy_from_slice(payload)),
        };
        Ok(datum)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Datum::Bool(_) => "bool",
            Datum::Int16(_) => "int2",
            Datum::Int32(_) => "int4",
            Datum::Int64(_) => "int8",
            Datum::Float32(_) => "float4",
            Datum::Float64(_) => "float8",
            Datum::Date(_) => "date",
            Datum::Time(_) => "time",
            Datum::Timestamp(_) => "timestamp",
            Datum::Uuid(_) => "uuid",
            Datum::Text(_) => "text",
            Datum::Bytes(_) => "bytea",
        }
    }
}

#[inline(always)]
fn le4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

#[inline(always)]
fn le8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_payload_width() {
        let mut out = Vec::new();
        Datum::Int64(-7).write_payload(TypeId::Int64, &mut out).unwrap();
        assert_eq!(out.len(), 8);
        assert_eq!(Datum::decode(TypeId::Int64, &out).unwrap(), Datum::Int64(-7));
    }

    #[test]
    fn test_text_and_bytes() {
        let mut out = Vec::new();
        Datum::Text("hello".into())
            .write_payload(TypeId::Varchar, &mut out)
            .unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(
            Datum::decode(TypeId::Bytea, b"\x00\x01").unwrap(),
            Datum::Bytes(Bytes::from_static(b"\x00\x01"))
        );
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut out = Vec::new();
        let err = Datum::Int32(1)
            .write_payload(TypeId::Text, &mut out)
            .unwrap_err();
        assert!(matches!(err, KestrelError::TypeMismatch { .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_wrong_width() {
        assert!(matches!(
            Datum::decode(TypeId::Int32, &[1, 2]),
            Err(KestrelError::MalformedRow(_))
        ));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(Datum::decode(TypeId::Text, &[0xff, 0xfe]).is_err());
    }
}
