//! Type identifiers for cached column data.

use serde::{Deserialize, Serialize};

/// Identifier for every column type the cache can hold.
///
/// Fixed-length types are stored inline in column arrays. Variable-length
/// types are stored in a toast buffer and referenced by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeId {
    // Boolean
    Boolean = 1,

    // Integer types
    Int16 = 11,
    Int32 = 12,
    Int64 = 13,

    // Floating point types
    Float32 = 30,
    Float64 = 31,

    // String types
    Varchar = 51,
    Text = 52,

    // Binary types
    Bytea = 61,

    // Date/Time types
    Date = 70,
    Time = 71,
    Timestamp = 72,

    // UUID
    Uuid = 80,
}

impl TypeId {
    /// Width of one slot in a column array. None means the value lives in
    /// a toast buffer.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            TypeId::Boolean => Some(1),
            TypeId::Int16 => Some(2),
            TypeId::Int32 | TypeId::Float32 | TypeId::Date => Some(4),
            TypeId::Int64 | TypeId::Float64 | TypeId::Time | TypeId::Timestamp => Some(8),
            TypeId::Uuid => Some(16),
            TypeId::Varchar | TypeId::Text | TypeId::Bytea => None,
        }
    }

    #[inline]
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size().is_some()
    }

    /// Returns the alignment this type requires inside a row image.
    ///
    /// Variable-length values carry a 4-byte length prefix and align to it.
    pub fn alignment(&self) -> usize {
        match self {
            TypeId::Boolean | TypeId::Uuid => 1,
            TypeId::Int16 => 2,
            TypeId::Int32 | TypeId::Float32 | TypeId::Date => 4,
            TypeId::Int64 | TypeId::Float64 | TypeId::Time | TypeId::Timestamp => 8,
            TypeId::Varchar | TypeId::Text | TypeId::Bytea => 4,
        }
    }
}

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TypeId::Boolean => "bool",
            TypeId::Int16 => "int2",
            TypeId::Int32 => "int4",
            TypeId::Int64 => "int8",
            TypeId::Float32 => "float4",
            TypeId::Float64 => "float8",
            TypeId::Varchar => "varchar",
            TypeId::Text => "text",
            TypeId::Bytea => "bytea",
            TypeId::Date => "date",
            TypeId::Time => "time",
            TypeId::Timestamp => "timestamp",
            TypeId::Uuid => "uuid",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toasted_types_have_no_slot_width() {
        for ty in [TypeId::Varchar, TypeId::Text, TypeId::Bytea] {
            assert!(!ty.is_fixed_size());
            assert_eq!(ty.alignment(), 4);
        }
        assert_eq!(TypeId::Uuid.fixed_size(), Some(16));
        assert_eq!(TypeId::Date.fixed_size(), Some(4));
    }

    #[test]
    fn test_alignment_divides_size() {
        for ty in [
            TypeId::Boolean,
            TypeId::Int16,
            TypeId::Int32,
            TypeId::Int64,
            TypeId::Float32,
            TypeId::Float64,
            TypeId::Date,
            TypeId::Time,
            TypeId::Timestamp,
            TypeId::Uuid,
        ] {
            let size = ty.fixed_size().unwrap();
            assert_eq!(size % ty.alignment(), 0, "{}", ty);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeId::Timestamp.to_string(), "timestamp");
        assert_eq!(TypeId::Int64.to_string(), "int8");
    }
}
