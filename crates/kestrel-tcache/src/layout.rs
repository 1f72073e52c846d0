//! Byte layout of a column-store chunk.

use crate::constants::{CTID_SIZE, TOAST_OFFSET_SIZE, max_align};
use kestrel_common::{KestrelError, Result, RowShape, TupleHeader, TypeId};
use std::sync::Arc;

/// One cached attribute and where its arrays live inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedColumn {
    /// 1-based attribute number in the row shape.
    pub attnum: u16,
    /// Attribute type.
    pub type_id: TypeId,
    /// Fixed width, or None when values live in a toast buffer.
    pub attlen: Option<usize>,
    /// Offset of the null bitmap, present only for nullable columns.
    pub nullmap_offset: Option<usize>,
    /// Offset of the value array.
    pub values_offset: usize,
}

impl CachedColumn {
    /// Returns true if the column may hold nulls.
    #[inline(always)]
    pub fn is_nullable(&self) -> bool {
        self.nullmap_offset.is_some()
    }

    /// Returns the width of one slot in the value array.
    #[inline(always)]
    pub fn slot_width(&self) -> usize {
        self.attlen.unwrap_or(TOAST_OFFSET_SIZE)
    }
}

/// Layout shared by every chunk of one cache head.
///
/// Chunk block layout for `nrooms` rows:
/// +--------------------------------+ 0
/// | ctids: u64 x nrooms            |
/// | headers: 12 bytes x nrooms     |
/// +--------------------------------+ aligned to 8
/// | column 1 nullmap (if nullable) | ceil(nrooms / 8), aligned to 8
/// | column 1 values                | attlen x nrooms, or u32 toast offsets
/// +--------------------------------+
/// | column 2 ...                   |
/// +--------------------------------+ total_size
#[derive(Debug, Clone)]
pub struct ChunkLayout {
    shape: Arc<RowShape>,
    nrooms: usize,
    headers_offset: usize,
    columns: Vec<CachedColumn>,
    /// Maps attnum - 1 to an index in `columns`.
    attr_index: Vec<Option<usize>>,
    total_size: usize,
}

impl ChunkLayout {
    /// Computes the layout caching `attnums` of `shape` in chunks of
    /// `nrooms` rows. Attribute numbers are deduplicated and sorted.
    pub fn new(shape: Arc<RowShape>, attnums: &[u16], nrooms: usize) -> Result<Self> {
        if nrooms == 0 {
            return Err(KestrelError::InvalidParameter {
                name: "rows_per_chunk".to_string(),
                value: "0".to_string(),
            });
        }
        let mut attnums = attnums.to_vec();
        attnums.sort_unstable();
        attnums.dedup();

        let headers_offset = CTID_SIZE * nrooms;
        let mut pos = max_align(headers_offset + TupleHeader::SIZE * nrooms);
        let mut columns = Vec::with_capacity(attnums.len());
        let mut attr_index = vec![None; shape.natts()];

        for attnum in attnums {
            let desc = shape.column(attnum).ok_or_else(|| KestrelError::InvalidParameter {
                name: "attnum".to_string(),
                value: attnum.to_string(),
            })?;
            let nullmap_offset = if desc.not_null && !desc.dropped {
                None
            } else {
                let offset = pos;
                pos = max_align(pos + nrooms.div_ceil(8));
                Some(offset)
            };
            let attlen = desc.attlen();
            let values_offset = pos;
            pos = max_align(pos + attlen.unwrap_or(TOAST_OFFSET_SIZE) * nrooms);

            attr_index[attnum as usize - 1] = Some(columns.len());
            columns.push(CachedColumn {
                attnum,
                type_id: desc.type_id,
                attlen,
                nullmap_offset,
                values_offset,
            });
        }

        Ok(Self {
            shape,
            nrooms,
            headers_offset,
            columns,
            attr_index,
            total_size: pos,
        })
    }

    /// Returns the row shape of the cached relation.
    pub fn shape(&self) -> &Arc<RowShape> {
        &self.shape
    }

    /// Returns the fixed row capacity of a chunk.
    #[inline(always)]
    pub fn nrooms(&self) -> usize {
        self.nrooms
    }

    /// Returns the byte size of a chunk block.
    #[inline(always)]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    #[inline(always)]
    pub(crate) fn ctid_offset(&self, index: usize) -> usize {
        CTID_SIZE * index
    }

    #[inline(always)]
    pub(crate) fn header_offset(&self, index: usize) -> usize {
        self.headers_offset + TupleHeader::SIZE * index
    }

    /// Returns the cached columns in attribute order.
    pub fn columns(&self) -> &[CachedColumn] {
        &self.columns
    }

    /// Returns the position of `attnum` among the cached columns.
    pub fn column_index(&self, attnum: u16) -> Option<usize> {
        if attnum == 0 {
            return None;
        }
        self.attr_index.get(attnum as usize - 1).copied().flatten()
    }

    /// Returns the cached attribute numbers in ascending order.
    pub fn attnums(&self) -> Vec<u16> {
        self.columns.iter().map(|c| c.attnum).collect()
    }

    /// Returns true if every attribute in `attnums` is cached.
    pub fn covers(&self, attnums: &[u16]) -> bool {
        attnums.iter().all(|&a| self.column_index(a).is_some())
    }
}
