//! Cache-wide constants.

use kestrel_common::TupleHeader;

/// Alignment of every value stored in a chunk or buffer.
pub(crate) const MAXALIGN: usize = 8;

/// Bytes reserved at the front of a toast buffer. Value offsets start past
/// this header, so offset 0 always means "no value".
pub(crate) const TOAST_HEADER_SIZE: usize = 8;

/// Length prefix of a toast value.
pub(crate) const TOAST_LENGTH_SIZE: usize = 4;

/// Size of one entry in a toast offset array.
pub(crate) const TOAST_OFFSET_SIZE: usize = 4;

/// Size of a packed storage location.
pub(crate) const CTID_SIZE: usize = 8;

/// Fixed prefix of a row-store entry: location, header, row length.
pub(crate) const ROW_ENTRY_HEADER_SIZE: usize = CTID_SIZE + TupleHeader::SIZE + 4;

/// Size of one slot in a row-store offset index.
pub(crate) const ROW_INDEX_SLOT_SIZE: usize = 4;

/// Tree nodes carved from one arena slab.
pub(crate) const NODES_PER_SLAB: usize = 64;

/// Arena bytes charged per tree node record.
pub(crate) const NODE_RECORD_SIZE: usize = 64;

/// Fixed part of a cache-head descriptor block.
pub(crate) const HEAD_DESCRIPTOR_BASE: usize = 128;

/// Per-attribute part of a cache-head descriptor block.
pub(crate) const HEAD_DESCRIPTOR_PER_ATT: usize = 16;

/// Rounds `value` up to [`MAXALIGN`].
#[inline(always)]
pub(crate) fn max_align(value: usize) -> usize {
    (value + MAXALIGN - 1) & !(MAXALIGN - 1)
}
