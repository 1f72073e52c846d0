//! Row-oriented staging buffer for changes not yet columnized.

use crate::constants::{CTID_SIZE, ROW_ENTRY_HEADER_SIZE, ROW_INDEX_SLOT_SIZE, max_align};
use crate::cow::Duplicate;
use bytes::Bytes;
use kestrel_common::location::INVALID_BLOCK_NUMBER;
use kestrel_common::{BlockNumber, HeapTuple, ItemPointer, OffsetNumber, Result, TupleHeader};
use kestrel_shmem::{BlockTag, ShmemBlock, ShmemSegment};
use std::sync::Arc;

/// A borrowed row: location, visibility header, and row image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef<'a> {
    pub ctid: ItemPointer,
    pub header: TupleHeader,
    pub data: &'a [u8],
}

impl<'a> RowRef<'a> {
    /// Copies the row into an owned tuple.
    pub fn to_heap_tuple(&self) -> HeapTuple {
        HeapTuple::new(self.ctid, self.header, Bytes::copy_from_slice(self.data))
    }
}

impl<'a> From<&'a HeapTuple> for RowRef<'a> {
    fn from(tuple: &'a HeapTuple) -> Self {
        Self {
            ctid: tuple.ctid,
            header: tuple.header,
            data: &tuple.data,
        }
    }
}

/// Fixed-size buffer of whole rows.
///
/// Layout:
/// +-----------------------------+ 0
/// | offset index: u32 x nrows   | grows up
/// | ...                         |
/// | free                        |
/// | ...                         | usage
/// | entry: ctid u64             | grows down, each entry aligned to 8
/// |        header (12 bytes)    |
/// |        len u32 | row image  |
/// +-----------------------------+ capacity
///
/// An index slot of 0 marks a removed entry; entries live at the tail, so
/// a live entry never sits at offset 0.
pub struct RowStore {
    block: ShmemBlock,
    nrows: usize,
    usage: usize,
    blkno_min: BlockNumber,
    blkno_max: BlockNumber,
}

impl RowStore {
    /// Creates an empty row store of at least `size` bytes.
    pub fn create(segment: &Arc<ShmemSegment>, size: usize) -> Result<Self> {
        let block = segment.alloc_alap(BlockTag::RowStore, size)?;
        let usage = block.capacity() & !(CTID_SIZE - 1);
        Ok(Self {
            block,
            nrows: 0,
            usage,
            blkno_min: INVALID_BLOCK_NUMBER,
            blkno_max: 0,
        })
    }

    /// Returns the buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }

    /// Returns the number of index slots, removed entries included.
    #[inline(always)]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Returns true if no row was ever inserted.
    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }

    /// Returns the number of entries not removed.
    pub fn live_rows(&self) -> usize {
        (0..self.nrows).filter(|&i| self.entry_offset(i) != 0).count()
    }

    /// Returns the lowest block held, or None while empty.
    pub fn blkno_min(&self) -> Option<BlockNumber> {
        (self.nrows > 0).then_some(self.blkno_min)
    }

    /// Returns the highest block held, or None while empty.
    pub fn blkno_max(&self) -> Option<BlockNumber> {
        (self.nrows > 0).then_some(self.blkno_max)
    }

    /// Returns true if `block` lies within the tracked block range.
    #[inline(always)]
    pub fn covers_block(&self, block: BlockNumber) -> bool {
        self.nrows > 0 && self.blkno_min <= block && block <= self.blkno_max
    }

    #[inline(always)]
    fn entry_offset(&self, index: usize) -> usize {
        let pos = index * ROW_INDEX_SLOT_SIZE;
        let buf = self.block.as_slice();
        u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize
    }

    #[inline(always)]
    fn set_entry_offset(&mut self, index: usize, offset: usize) {
        let pos = index * ROW_INDEX_SLOT_SIZE;
        self.block.as_mut_slice()[pos..pos + ROW_INDEX_SLOT_SIZE]
            .copy_from_slice(&(offset as u32).to_le_bytes());
    }

    /// Appends a row. Returns false if the row does not fit; the store is
    /// then left unchanged.
    pub fn insert(&mut self, row: RowRef<'_>) -> bool {
        let required = max_align(ROW_ENTRY_HEADER_SIZE + row.data.len());
        let head = (self.nrows + 1) * ROW_INDEX_SLOT_SIZE;
        if self.usage < required || self.usage - required <= head {
            return false;
        }
        let offset = self.usage - required;
        {
            let buf = self.block.as_mut_slice();
            buf[offset..offset + CTID_SIZE].copy_from_slice(&row.ctid.as_u64().to_le_bytes());
            let pos = offset + CTID_SIZE;
            buf[pos..pos + TupleHeader::SIZE].copy_from_slice(&row.header.to_bytes());
            let pos = pos + TupleHeader::SIZE;
            buf[pos..pos + 4].copy_from_slice(&(row.data.len() as u32).to_le_bytes());
            let pos = pos + 4;
            buf[pos..pos + row.data.len()].copy_from_slice(row.data);
        }
        self.set_entry_offset(self.nrows, offset);
        self.nrows += 1;
        self.usage = offset;

        let block = row.ctid.block;
        if self.blkno_min == INVALID_BLOCK_NUMBER || block < self.blkno_min {
            self.blkno_min = block;
        }
        if block > self.blkno_max {
            self.blkno_max = block;
        }
        true
    }

    /// Returns the row in slot `index`, or None if it was removed.
    pub fn get(&self, index: usize) -> Option<RowRef<'_>> {
        if index >= self.nrows {
            return None;
        }
        let offset = self.entry_offset(index);
        if offset == 0 {
            return None;
        }
        let buf = self.block.as_slice();
        let mut raw = [0u8; CTID_SIZE];
        raw.copy_from_slice(&buf[offset..offset + CTID_SIZE]);
        let ctid = ItemPointer::from_u64(u64::from_le_bytes(raw));
        let pos = offset + CTID_SIZE;
        let header = TupleHeader::from_bytes(&buf[pos..pos + TupleHeader::SIZE]);
        let pos = pos + TupleHeader::SIZE;
        let len = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        let pos = pos + 4;
        Some(RowRef {
            ctid,
            header,
            data: &buf[pos..pos + len],
        })
    }

    /// Iterates live rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> + '_ {
        (0..self.nrows).filter_map(move |i| self.get(i))
    }

    /// Returns the slot holding `ctid`.
    pub fn find(&self, ctid: ItemPointer) -> Option<usize> {
        if !self.covers_block(ctid.block) {
            return None;
        }
        (0..self.nrows).find(|&i| self.get(i).is_some_and(|row| row.ctid == ctid))
    }

    /// Overwrites the header of the row at `ctid`. Returns false if the row
    /// is not held here.
    pub fn find_and_patch(&mut self, ctid: ItemPointer, header: TupleHeader) -> bool {
        let Some(index) = self.find(ctid) else {
            return false;
        };
        let pos = self.entry_offset(index) + CTID_SIZE;
        self.block.as_mut_slice()[pos..pos + TupleHeader::SIZE].copy_from_slice(&header.to_bytes());
        true
    }

    /// Marks slot `index` removed.
    pub fn remove(&mut self, index: usize) {
        if index < self.nrows {
            self.set_entry_offset(index, 0);
        }
    }

    /// Moves the row in slot `index` to a new slot within the same block.
    pub fn relocate(&mut self, index: usize, offset: OffsetNumber) {
        if index >= self.nrows || offset == 0 {
            return;
        }
        let entry = self.entry_offset(index);
        if entry == 0 {
            return;
        }
        let buf = self.block.as_mut_slice();
        let mut raw = [0u8; CTID_SIZE];
        raw.copy_from_slice(&buf[entry..entry + CTID_SIZE]);
        let old = ItemPointer::from_u64(u64::from_le_bytes(raw));
        let new = ItemPointer::new(old.block, offset);
        buf[entry..entry + CTID_SIZE].copy_from_slice(&new.as_u64().to_le_bytes());
    }
}

impl Duplicate for RowStore {
    /// Copies the index and the entry area into a fresh block.
    fn duplicate(&self) -> Result<Self> {
        let segment = Arc::clone(self.block.segment());
        let mut block = segment.alloc_alap(BlockTag::RowStore, self.capacity())?;
        let head = self.nrows * ROW_INDEX_SLOT_SIZE;
        let tail_end = self.capacity() & !(CTID_SIZE - 1);
        {
            let src = self.block.as_slice();
            let dst = block.as_mut_slice();
            dst[..head].copy_from_slice(&src[..head]);
            dst[self.usage..tail_end].copy_from_slice(&src[self.usage..tail_end]);
        }
        Ok(Self {
            block,
            nrows: self.nrows,
            usage: self.usage,
            blkno_min: self.blkno_min,
            blkno_max: self.blkno_max,
        })
    }
}

impl std::fmt::Debug for RowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStore")
            .field("capacity", &self.capacity())
            .field("nrows", &self.nrows)
            .field("usage", &self.usage)
            .field("blkno_min", &self.blkno_min())
            .field("blkno_max", &self.blkno_max())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Arc<ShmemSegment> {
        ShmemSegment::new(4 * 1024 * 1024).unwrap()
    }

    fn row(block: BlockNumber, offset: OffsetNumber, data: &[u8]) -> HeapTuple {
        HeapTuple::new(
            ItemPointer::new(block, offset),
            TupleHeader::new(1, 10),
            Bytes::copy_from_slice(data),
        )
    }

    #[test]
    fn test_insert_and_iterate() {
        let segment = segment();
        let mut store = RowStore::create(&segment, 64 * 1024).unwrap();
        assert_eq!(store.blkno_min(), None);

        store.insert(RowRef::from(&row(7, 1, b"seven")));
        store.insert(RowRef::from(&row(3, 2, b"three")));
        store.insert(RowRef::from(&row(9, 4, b"")));

        assert_eq!(store.nrows(), 3);
        assert_eq!(store.blkno_min(), Some(3));
        assert_eq!(store.blkno_max(), Some(9));
        let rows: Vec<_> = store.iter().map(|r| (r.ctid.block, r.data.to_vec())).collect();
        assert_eq!(
            rows,
            vec![(7, b"seven".to_vec()), (3, b"three".to_vec()), (9, Vec::new())]
        );
    }

    #[test]
    fn test_insert_refuses_when_index_meets_tuples() {
        let segment = segment();
        let mut store = RowStore::create(&segment, 4096).unwrap();
        let payload = vec![1u8; 100];
        let mut inserted = 0;
        while store.insert(RowRef::from(&row(1, inserted as u16 + 1, &payload))) {
            inserted += 1;
        }
        assert!(inserted > 0);
        let per_row = max_align(ROW_ENTRY_HEADER_SIZE + 100) + ROW_INDEX_SLOT_SIZE;
        assert!(inserted <= store.capacity() / per_row);
        // A failed insert leaves the store untouched.
        assert_eq!(store.nrows(), inserted);
        assert_eq!(store.iter().count(), inserted);
    }

    #[test]
    fn test_find_and_patch() {
        let segment = segment();
        let mut store = RowStore::create(&segment, 64 * 1024).unwrap();
        store.insert(RowRef::from(&row(5, 1, b"a")));
        store.insert(RowRef::from(&row(5, 2, b"b")));

        let patched = TupleHeader::with_xmax(1, 10, 42);
        assert!(store.find_and_patch(ItemPointer::new(5, 2), patched));
        assert_eq!(store.get(1).unwrap().header.xmax, 42);
        assert_eq!(store.get(0).unwrap().header.xmax, 0);

        // Outside the tracked block range the search bails out early.
        assert!(!store.find_and_patch(ItemPointer::new(6, 1), patched));
        assert!(!store.find_and_patch(ItemPointer::new(4, 1), patched));
        assert!(!store.find_and_patch(ItemPointer::new(5, 3), patched));
    }

    #[test]
    fn test_remove_and_relocate() {
        let segment = segment();
        let mut store = RowStore::create(&segment, 64 * 1024).unwrap();
        store.insert(RowRef::from(&row(2, 1, b"x")));
        store.insert(RowRef::from(&row(2, 2, b"y")));

        store.remove(0);
        store.relocate(1, 7);
        assert!(store.get(0).is_none());
        assert_eq!(store.live_rows(), 1);
        assert_eq!(store.get(1).unwrap().ctid, ItemPointer::new(2, 7));
        assert_eq!(store.find(ItemPointer::new(2, 7)), Some(1));
    }

    #[test]
    fn test_duplicate_is_independent() {
        let segment = segment();
        let mut store = RowStore::create(&segment, 64 * 1024).unwrap();
        store.insert(RowRef::from(&row(1, 1, b"one")));

        let mut copy = store.duplicate().unwrap();
        copy.insert(RowRef::from(&row(2, 1, b"two")));
        copy.find_and_patch(ItemPointer::new(1, 1), TupleHeader::with_xmax(1, 10, 11));

        assert_eq!(store.nrows(), 1);
        assert_eq!(store.get(0).unwrap().header.xmax, 0);
        assert_eq!(copy.nrows(), 2);
        assert_eq!(copy.get(0).unwrap().data, b"one");
        assert_eq!(copy.get(0).unwrap().header.xmax, 11);
    }
}
