//! Tuple headers and heap tuples as delivered by the storage layer.

use crate::datum::Datum;
use crate::error::Result;
use crate::location::ItemPointer;
use crate::shape::RowShape;
use bytes::Bytes;

/// Transaction identifier.
pub type TransactionId = u32;

/// Transaction id meaning "none" (an xmax of 0 marks a live row).
pub const INVALID_TRANSACTION_ID: TransactionId = 0;
/// Transaction id of bootstrap-time rows.
pub const BOOTSTRAP_TRANSACTION_ID: TransactionId = 1;
/// Frozen transaction id. As an xmax it marks a cached row as vacuumed.
pub const FROZEN_TRANSACTION_ID: TransactionId = 2;
/// First transaction id assigned to ordinary transactions.
pub const FIRST_NORMAL_TRANSACTION_ID: TransactionId = 3;

/// Visibility header carried by every cached row.
///
/// Layout (12 bytes):
/// - flags: 2 bytes
/// - natts: 2 bytes
/// - xmin: 4 bytes (transaction that created this row)
/// - xmax: 4 bytes (transaction that deleted/updated this row, 0 if live)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TupleHeader {
    /// Tuple flags.
    pub flags: TupleFlags,
    /// Number of attributes in the row image.
    pub natts: u16,
    /// Transaction ID that created this row.
    pub xmin: TransactionId,
    /// Transaction ID that deleted or updated this row (0 if still live).
    pub xmax: TransactionId,
}

impl TupleHeader {
    /// Size of the tuple header in bytes.
    pub const SIZE: usize = 12;

    /// Creates a header for a live row.
    pub fn new(natts: u16, xmin: TransactionId) -> Self {
        Self {
            flags: TupleFlags::empty(),
            natts,
            xmin,
            xmax: INVALID_TRANSACTION_ID,
        }
    }

    /// Creates a header with both xmin and xmax.
    pub fn with_xmax(natts: u16, xmin: TransactionId, xmax: TransactionId) -> Self {
        Self {
            flags: TupleFlags::empty(),
            natts,
            xmin,
            xmax,
        }
    }

    /// Returns true if this row is visible to the given snapshot.
    /// A row is visible if:
    /// - xmin is less than or equal to the snapshot
    /// - xmax is either 0 (not deleted) or greater than the snapshot
    pub fn is_visible(&self, snapshot_xid: TransactionId) -> bool {
        !self.is_tombstone()
            && self.xmin <= snapshot_xid
            && (self.xmax == INVALID_TRANSACTION_ID || self.xmax > snapshot_xid)
    }

    /// Returns true if the row was vacuumed away and only awaits compaction.
    #[inline(always)]
    pub fn is_tombstone(&self) -> bool {
        self.xmax == FROZEN_TRANSACTION_ID
    }

    /// Marks the row as vacuumed.
    pub fn mark_tombstone(&mut self) {
        self.xmax = FROZEN_TRANSACTION_ID;
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.flags.0.to_le_bytes());
        buf[2..4].copy_from_slice(&self.natts.to_le_bytes());
        buf[4..8].copy_from_slice(&self.xmin.to_le_bytes());
        buf[8..12].copy_from_slice(&self.xmax.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            flags: TupleFlags(u16::from_le_bytes([buf[0], buf[1]])),
            natts: u16::from_le_bytes([buf[2], buf[3]]),
            xmin: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            xmax: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// Flags for tuple state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TupleFlags(pub u16);

impl TupleFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Row has null values.
    pub const HAS_NULLS: u16 = 0x0001;
    /// Row has variable-length fields.
    pub const HAS_VARLEN: u16 = 0x0002;
    /// Row is the new version produced by an update.
    pub const UPDATED: u16 = 0x0004;

    /// Returns true if the given flag bit is set.
    pub fn contains(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Sets or clears a flag bit.
    pub fn set(&mut self, flag: u16, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// A row as produced by the storage scan or the change hooks: its stable
/// location, visibility header and row image.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapTuple {
    /// Storage location of this row.
    pub ctid: ItemPointer,
    /// Visibility header.
    pub header: TupleHeader,
    /// Row image in the format described by [`RowShape`].
    pub data: Bytes,
}

impl HeapTuple {
    /// Creates a tuple from an already formed row image.
    pub fn new(ctid: ItemPointer, header: TupleHeader, data: Bytes) -> Self {
        Self { ctid, header, data }
    }

    /// Forms a live tuple from values.
    pub fn form(
        shape: &RowShape,
        ctid: ItemPointer,
        xmin: TransactionId,
        values: &[Option<Datum>],
    ) -> Result<Self> {
        let data = shape.form_row(values)?;
        let mut header = TupleHeader::new(shape.natts() as u16, xmin);
        header.flags.set(TupleFlags::HAS_NULLS, values.iter().any(Option::is_none));
        header.flags.set(
            TupleFlags::HAS_VARLEN,
            shape.columns().iter().any(|c| !c.type_id.is_fixed_size()),
        );
        Ok(Self { ctid, header, data })
    }

    /// Decodes all attribute values.
    pub fn values(&self, shape: &RowShape) -> Result<Vec<Option<Datum>>> {
        shape.decode_row(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ColumnDesc;
    use crate::types::TypeId;

    #[test]
    fn test_header_serialization() {
        let header = TupleHeader::with_xmax(3, 100, 200);
        let parsed = TupleHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_visibility() {
        let header = TupleHeader::with_xmax(1, 10, 20);
        assert!(!header.is_visible(5));
        assert!(header.is_visible(15));
        assert!(!header.is_visible(25));
        assert!(TupleHeader::new(1, 10).is_visible(1000));
    }

    #[test]
    fn test_tombstone_is_exact_sentinel() {
        let mut live = TupleHeader::new(1, FIRST_NORMAL_TRANSACTION_ID);
        assert!(!live.is_tombstone());
        let superseded = TupleHeader::with_xmax(1, 5, 9);
        assert!(!superseded.is_tombstone());
        live.mark_tombstone();
        assert!(live.is_tombstone());
        assert!(!live.is_visible(u32::MAX));
    }

    #[test]
    fn test_form_heap_tuple() {
        let shape = RowShape::new(vec![
            ColumnDesc::new("a", TypeId::Int32),
            ColumnDesc::new("b", TypeId::Text),
        ]);
        let values = vec![Some(Datum::Int32(7)), None];
        let tuple = HeapTuple::form(&shape, ItemPointer::new(4, 2), 10, &values).unwrap();
        assert!(tuple.header.flags.contains(TupleFlags::HAS_NULLS));
        assert!(tuple.header.flags.contains(TupleFlags::HAS_VARLEN));
        assert_eq!(tuple.header.natts, 2);
        assert_eq!(tuple.values(&shape).unwrap(), values);
    }
}
