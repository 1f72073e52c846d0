//! Column-store chunks: fixed-capacity columnar row groups.

use crate::constants::{CTID_SIZE, TOAST_HEADER_SIZE};
use crate::cow::Duplicate;
use crate::layout::{CachedColumn, ChunkLayout};
use crate::row_store::RowRef;
use crate::toast::ToastBuffer;
use kestrel_common::{
    BlockNumber, Datum, ItemPointer, KestrelError, OffsetNumber, Result, TupleHeader,
};
use kestrel_shmem::{BlockTag, ShmemBlock, ShmemSegment};
use std::ops::Range;
use std::sync::Arc;

/// A chunk of up to `nrooms` rows stored column by column.
///
/// Rows keep their storage location and visibility header. Every cached
/// attribute has a value array and, when nullable, a null bitmap; values of
/// variable-length attributes live in a per-column [`ToastBuffer`].
///
/// Chunks are shared through `Arc` and copied on write: scans hold the
/// version they started with while writers patch a private duplicate.
/// A duplicate shares its toast buffers unless a deep copy is requested;
/// a shared toast buffer is duplicated before the first append.
pub struct ColumnStore {
    layout: Arc<ChunkLayout>,
    block: ShmemBlock,
    toasts: Vec<Option<Arc<ToastBuffer>>>,
    toast_init_size: usize,
    nrows: usize,
    njunks: usize,
    blkno_min: BlockNumber,
    blkno_max: BlockNumber,
    is_sorted: bool,
}

impl ColumnStore {
    /// Creates an empty chunk.
    pub fn create(
        segment: &Arc<ShmemSegment>,
        layout: Arc<ChunkLayout>,
        toast_init_size: usize,
    ) -> Result<Self> {
        let block = segment.alloc(BlockTag::ColumnStore, layout.total_size())?;
        let ncols = layout.columns().len();
        Ok(Self {
            layout,
            block,
            toasts: vec![None; ncols],
            toast_init_size,
            nrows: 0,
            njunks: 0,
            blkno_min: 0,
            blkno_max: 0,
            is_sorted: true,
        })
    }

    // Accessors

    /// Returns the layout shared with sibling chunks.
    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    /// Returns the number of rows, tombstones included.
    #[inline(always)]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Returns the row capacity.
    #[inline(always)]
    pub fn nrooms(&self) -> usize {
        self.layout.nrooms()
    }

    /// Returns the number of tombstoned rows.
    #[inline(always)]
    pub fn njunks(&self) -> usize {
        self.njunks
    }

    /// Returns the number of rows not tombstoned.
    #[inline(always)]
    pub fn live_rows(&self) -> usize {
        self.nrows - self.njunks
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.nrows >= self.nrooms()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }

    /// Returns the lowest block covered by this chunk.
    #[inline(always)]
    pub fn blkno_min(&self) -> BlockNumber {
        self.blkno_min
    }

    /// Returns the highest block covered by this chunk.
    #[inline(always)]
    pub fn blkno_max(&self) -> BlockNumber {
        self.blkno_max
    }

    /// Returns true if `block` lies within the covered block range.
    #[inline(always)]
    pub fn covers_block(&self, block: BlockNumber) -> bool {
        self.blkno_min <= block && block <= self.blkno_max
    }

    /// Returns true if rows are known to be in location order.
    #[inline(always)]
    pub fn is_sorted(&self) -> bool {
        self.is_sorted
    }

    /// Returns the toast buffer of the cached column at `column`, if any
    /// value was stored yet.
    pub fn toast(&self, column: usize) -> Option<&Arc<ToastBuffer>> {
        self.toasts.get(column).and_then(Option::as_ref)
    }

    // Row access

    #[inline(always)]
    fn ctid_raw(&self, index: usize) -> u64 {
        let pos = self.layout.ctid_offset(index);
        let mut raw = [0u8; CTID_SIZE];
        raw.copy_from_slice(&self.block.as_slice()[pos..pos + CTID_SIZE]);
        u64::from_le_bytes(raw)
    }

    #[inline(always)]
    fn set_ctid(&mut self, index: usize, ctid: ItemPointer) {
        let pos = self.layout.ctid_offset(index);
        self.block.as_mut_slice()[pos..pos + CTID_SIZE].copy_from_slice(&ctid.as_u64().to_le_bytes());
    }

    /// Returns the storage location of row `index`.
    #[inline(always)]
    pub fn ctid(&self, index: usize) -> ItemPointer {
        ItemPointer::from_u64(self.ctid_raw(index))
    }

    /// Returns the visibility header of row `index`.
    pub fn header(&self, index: usize) -> TupleHeader {
        let pos = self.layout.header_offset(index);
        TupleHeader::from_bytes(&self.block.as_slice()[pos..pos + TupleHeader::SIZE])
    }

    fn set_header(&mut self, index: usize, header: TupleHeader) {
        let pos = self.layout.header_offset(index);
        self.block.as_mut_slice()[pos..pos + TupleHeader::SIZE].copy_from_slice(&header.to_bytes());
    }

    fn is_null_at(&self, col: &CachedColumn, index: usize) -> bool {
        match col.nullmap_offset {
            Some(offset) => self.block.as_slice()[offset + index / 8] & (1 << (index % 8)) != 0,
            None => false,
        }
    }

    fn set_null_at(&mut self, col: &CachedColumn, index: usize, null: bool) {
        if let Some(offset) = col.nullmap_offset {
            let byte = &mut self.block.as_mut_slice()[offset + index / 8];
            if null {
                *byte |= 1 << (index % 8);
            } else {
                *byte &= !(1 << (index % 8));
            }
        }
    }

    fn slot(&self, col: &CachedColumn, index: usize) -> &[u8] {
        let width = col.slot_width();
        let pos = col.values_offset + width * index;
        &self.block.as_slice()[pos..pos + width]
    }

    /// Returns the raw payload of cached column `column` in row `index`,
    /// or None for a null.
    pub fn raw_value(&self, column: usize, index: usize) -> Result<Option<&[u8]>> {
        let col = self.layout.columns().get(column).ok_or_else(|| {
            KestrelError::InvariantViolation(format!("cached column {} out of range", column))
        })?;
        if index >= self.nrows {
            return Err(KestrelError::InvariantViolation(format!(
                "row {} out of range {}",
                index, self.nrows
            )));
        }
        if self.is_null_at(col, index) {
            return Ok(None);
        }
        let slot = self.slot(col, index);
        if col.attlen.is_some() {
            return Ok(Some(slot));
        }
        let offset = u32::from_le_bytes([slot[0], slot[1], slot[2], slot[3]]);
        if offset == 0 {
            return Ok(None);
        }
        match self.toast(column) {
            Some(toast) => toast.get(offset).map(Some),
            None => Err(KestrelError::InvariantViolation(format!(
                "column {} references toast offset {} without a buffer",
                col.attnum, offset
            ))),
        }
    }

    /// Decodes attribute `attnum` of row `index`.
    pub fn datum(&self, index: usize, attnum: u16) -> Result<Option<Datum>> {
        let column = self
            .layout
            .column_index(attnum)
            .ok_or(KestrelError::ColumnNotCached { attnum })?;
        let type_id = self.layout.columns()[column].type_id;
        self.raw_value(column, index)?
            .map(|raw| Datum::decode(type_id, raw))
            .transpose()
    }

    /// Decodes every cached attribute of row `index`, in attribute order.
    pub fn row_values(&self, index: usize) -> Result<Vec<Option<Datum>>> {
        self.layout
            .columns()
            .iter()
            .enumerate()
            .map(|(column, col)| {
                self.raw_value(column, index)?
                    .map(|raw| Datum::decode(col.type_id, raw))
                    .transpose()
            })
            .collect()
    }

    // Insertion

    /// Appends a row image, splitting it into the cached columns.
    pub fn insert_row(&mut self, row: RowRef<'_>) -> Result<()> {
        if self.is_full() {
            return Err(KestrelError::ChunkFull);
        }
        let layout = Arc::clone(&self.layout);
        let attrs = layout.shape().deform_row(row.data)?;
        let values: Vec<Option<&[u8]>> = layout
            .columns()
            .iter()
            .map(|col| attrs[col.attnum as usize - 1])
            .collect();
        self.append_raw(row.ctid, row.header, &values)
    }

    /// Appends row `index` of `src`, which must share this chunk's layout.
    pub fn copy_row_from(&mut self, src: &ColumnStore, index: usize) -> Result<()> {
        if !Arc::ptr_eq(&self.layout, &src.layout) && self.layout.attnums() != src.layout.attnums() {
            return Err(KestrelError::InvariantViolation(
                "copying a row between chunks of different layouts".to_string(),
            ));
        }
        let values = (0..src.layout.columns().len())
            .map(|column| src.raw_value(column, index))
            .collect::<Result<Vec<_>>>()?;
        self.append_raw(src.ctid(index), src.header(index), &values)
    }

    /// Appends one row given the raw payload of every cached column.
    ///
    /// All checks run before the chunk is touched; a toast append that
    /// fails part way leaves unreferenced bytes but no partial row.
    fn append_raw(
        &mut self,
        ctid: ItemPointer,
        header: TupleHeader,
        values: &[Option<&[u8]>],
    ) -> Result<()> {
        if self.is_full() {
            return Err(KestrelError::ChunkFull);
        }
        let layout = Arc::clone(&self.layout);
        let columns = layout.columns();
        if values.len() != columns.len() {
            return Err(KestrelError::ShapeMismatch {
                expected: columns.len(),
                actual: values.len(),
            });
        }
        for (col, value) in columns.iter().zip(values) {
            match (value, col.attlen) {
                (None, _) if !col.is_nullable() => {
                    let name = layout
                        .shape()
                        .column(col.attnum)
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                    return Err(KestrelError::NullNotAllowed(name));
                }
                (Some(raw), Some(attlen)) if raw.len() != attlen => {
                    return Err(KestrelError::MalformedRow(format!(
                        "attribute {} has {} bytes, expected {}",
                        col.attnum,
                        raw.len(),
                        attlen
                    )));
                }
                _ => {}
            }
        }

        let mut toast_offsets = vec![0u32; columns.len()];
        for (column, (col, value)) in columns.iter().zip(values).enumerate() {
            if let (Some(raw), None) = (value, col.attlen) {
                let toast = self.writable_toast(column, raw.len())?;
                toast_offsets[column] = toast.append(raw).ok_or_else(|| {
                    KestrelError::InvariantViolation("toast append after growth failed".to_string())
                })?;
            }
        }

        let index = self.nrows;
        self.set_ctid(index, ctid);
        self.set_header(index, header);
        for (column, (col, value)) in columns.iter().zip(values).enumerate() {
            self.set_null_at(col, index, value.is_none());
            let width = col.slot_width();
            let pos = col.values_offset + width * index;
            let slot = &mut self.block.as_mut_slice()[pos..pos + width];
            match (value, col.attlen) {
                (Some(raw), Some(_)) => slot.copy_from_slice(raw),
                (Some(_), None) => slot.copy_from_slice(&toast_offsets[column].to_le_bytes()),
                (None, _) => slot.fill(0),
            }
        }

        let block = ctid.block;
        if self.nrows == 0 {
            self.blkno_min = block;
            self.blkno_max = block;
        } else {
            if self.is_sorted && ctid.as_u64() < self.ctid_raw(index - 1) {
                self.is_sorted = false;
            }
            self.blkno_min = self.blkno_min.min(block);
            self.blkno_max = self.blkno_max.max(block);
        }
        if header.is_tombstone() {
            self.njunks += 1;
        }
        self.nrows += 1;
        Ok(())
    }

    /// Returns the toast buffer of `column`, ready to take `len` more bytes.
    ///
    /// A missing buffer is created. A shared buffer is duplicated so that
    /// other chunk versions never see the append; a full one is duplicated
    /// at twice its required length.
    fn writable_toast(&mut self, column: usize, len: usize) -> Result<&mut ToastBuffer> {
        let needed = ToastBuffer::required_space(len);
        let segment = Arc::clone(self.block.segment());
        let slot = &mut self.toasts[column];
        let replacement = match slot.as_ref() {
            None => Some(ToastBuffer::create(
                &segment,
                self.toast_init_size.max(TOAST_HEADER_SIZE + needed),
            )?),
            Some(toast) if toast.free_space() < needed => {
                Some(toast.duplicate(2 * (toast.usage() + needed))?)
            }
            Some(toast) if Arc::strong_count(toast) > 1 => Some(toast.duplicate(toast.capacity())?),
            Some(_) => None,
        };
        if let Some(toast) = replacement {
            *slot = Some(Arc::new(toast));
        }
        slot.as_mut().and_then(Arc::get_mut).ok_or_else(|| {
            KestrelError::InvariantViolation("toast buffer still shared after copy".to_string())
        })
    }

    // Search

    /// Returns the index of the row with the smallest location >= `target`.
    pub fn find_next_record(&self, target: ItemPointer) -> Option<usize> {
        if self.nrows == 0 || target.block > self.blkno_max {
            return None;
        }
        let key = target.as_u64();
        if self.is_sorted {
            let index = self.partition_point(|ctid| ctid < key);
            return (index < self.nrows).then_some(index);
        }
        let mut best: Option<(usize, u64)> = None;
        for index in 0..self.nrows {
            let ctid = self.ctid_raw(index);
            if ctid >= key && best.is_none_or(|(_, b)| ctid < b) {
                best = Some((index, ctid));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Returns the index of the row with the largest location <= `target`.
    pub fn find_prev_record(&self, target: ItemPointer) -> Option<usize> {
        if self.nrows == 0 || target.block < self.blkno_min {
            return None;
        }
        let key = target.as_u64();
        if self.is_sorted {
            let index = self.partition_point(|ctid| ctid <= key);
            return index.checked_sub(1);
        }
        let mut best: Option<(usize, u64)> = None;
        for index in 0..self.nrows {
            let ctid = self.ctid_raw(index);
            if ctid <= key && best.is_none_or(|(_, b)| ctid > b) {
                best = Some((index, ctid));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Binary search over a sorted chunk: first index where `pred` fails.
    fn partition_point(&self, pred: impl Fn(u64) -> bool) -> usize {
        let (mut lo, mut hi) = (0, self.nrows);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.ctid_raw(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    // Reorganization

    /// Sorts rows by storage location in place.
    pub fn sort(&mut self) {
        if self.is_sorted {
            return;
        }
        let mut order: Vec<usize> = (0..self.nrows).collect();
        order.sort_by_key(|&index| self.ctid_raw(index));

        let layout = Arc::clone(&self.layout);
        self.permute(layout.ctid_offset(0), CTID_SIZE, &order);
        self.permute(layout.header_offset(0), TupleHeader::SIZE, &order);
        for col in layout.columns() {
            self.permute(col.values_offset, col.slot_width(), &order);
            if col.is_nullable() {
                let nulls: Vec<bool> = order.iter().map(|&src| self.is_null_at(col, src)).collect();
                for (dst, null) in nulls.into_iter().enumerate() {
                    self.set_null_at(col, dst, null);
                }
            }
        }
        self.is_sorted = true;
    }

    /// Reorders `nrows` fixed-width slots starting at `offset`.
    fn permute(&mut self, offset: usize, width: usize, order: &[usize]) {
        let len = width * self.nrows;
        let buf = self.block.as_mut_slice();
        let old = buf[offset..offset + len].to_vec();
        for (dst, &src) in order.iter().enumerate() {
            let to = offset + dst * width;
            buf[to..to + width].copy_from_slice(&old[src * width..(src + 1) * width]);
        }
    }

    /// Returns a new chunk holding only the live rows.
    ///
    /// A chunk compacted down to nothing keeps `[blkno_min, blkno_min]` as
    /// its range so that tree ordering stays intact.
    pub fn compact(&self) -> Result<Self> {
        self.compact_range(0..self.nrows)
    }

    fn compact_range(&self, range: Range<usize>) -> Result<Self> {
        let segment = Arc::clone(self.block.segment());
        let mut dst = Self::create(&segment, Arc::clone(&self.layout), self.toast_init_size)?;
        for (column, toast) in self.toasts.iter().enumerate() {
            if let Some(toast) = toast {
                let size = toast.usage().saturating_sub(toast.junk()).max(self.toast_init_size);
                dst.toasts[column] = Some(Arc::new(ToastBuffer::create(&segment, size)?));
            }
        }
        for index in range {
            if !self.header(index).is_tombstone() {
                dst.copy_row_from(self, index)?;
            }
        }
        if dst.nrows == 0 {
            dst.blkno_min = self.blkno_min;
            dst.blkno_max = self.blkno_min;
        }
        Ok(dst)
    }

    /// Moves every row of the highest block into a new chunk and compacts
    /// the rest in place. Returns the new chunk.
    ///
    /// Fails without changing the rows if the chunk covers a single block.
    pub fn split(&mut self) -> Result<Self> {
        if self.nrows == 0 || self.blkno_min == self.blkno_max {
            return Err(KestrelError::ChunkFull);
        }
        self.sort();
        let boundary_block = self.blkno_max;
        let boundary = self.partition_point(|ctid| ItemPointer::from_u64(ctid).block < boundary_block);

        let segment = Arc::clone(self.block.segment());
        let mut upper = Self::create(&segment, Arc::clone(&self.layout), self.toast_init_size)?;
        for index in boundary..self.nrows {
            upper.copy_row_from(self, index)?;
        }
        let lower = self.compact_range(0..boundary)?;
        *self = lower;
        Ok(upper)
    }

    /// Builds one chunk from two adjacent chunks, dropping tombstones.
    ///
    /// Every row of `lower` must precede every row of `upper`. The result
    /// covers the union of both ranges; the inputs are left untouched.
    pub fn merge(lower: &ColumnStore, upper: &ColumnStore) -> Result<Self> {
        if lower.live_rows() + upper.live_rows() > lower.nrooms() {
            return Err(KestrelError::ChunkFull);
        }
        let segment = Arc::clone(lower.block.segment());
        let mut dst = Self::create(&segment, Arc::clone(&lower.layout), lower.toast_init_size)?;
        for src in [lower, upper] {
            for index in 0..src.nrows {
                if !src.header(index).is_tombstone() {
                    dst.copy_row_from(src, index)?;
                }
            }
        }
        dst.blkno_min = lower.blkno_min.min(upper.blkno_min);
        dst.blkno_max = lower.blkno_max.max(upper.blkno_max);
        Ok(dst)
    }

    // Visibility maintenance

    /// Returns the header of the row stored at `ctid`.
    pub fn header_of(&self, ctid: ItemPointer) -> Option<TupleHeader> {
        let index = self.find_next_record(ctid)?;
        (self.ctid(index) == ctid).then(|| self.header(index))
    }

    /// Overwrites the header of the row at `ctid`. Returns false if the
    /// row is not held here.
    pub fn patch_header(&mut self, ctid: ItemPointer, header: TupleHeader) -> bool {
        match self.find_next_record(ctid) {
            Some(index) if self.ctid(index) == ctid => {
                let was_tombstone = self.header(index).is_tombstone();
                self.set_header(index, header);
                if header.is_tombstone() && !was_tombstone {
                    self.njunks += 1;
                } else if was_tombstone && !header.is_tombstone() {
                    self.njunks -= 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Marks row `index` vacuumed. Its toast values become junk.
    pub fn mark_tombstone(&mut self, index: usize) -> Result<()> {
        let mut header = self.header(index);
        if header.is_tombstone() {
            return Ok(());
        }
        header.mark_tombstone();
        self.set_header(index, header);
        self.njunks += 1;
        let layout = Arc::clone(&self.layout);
        for (column, col) in layout.columns().iter().enumerate() {
            if col.attlen.is_none() {
                let len = match self.raw_value(column, index)? {
                    Some(raw) if self.toast(column).is_some() => raw.len(),
                    _ => continue,
                };
                // Other chunk versions keep their own junk count.
                self.writable_toast(column, 0)?.add_junk(len);
            }
        }
        Ok(())
    }

    /// Points row `index` at a new slot within its block.
    pub fn relocate(&mut self, index: usize, offset: OffsetNumber) {
        let ctid = ItemPointer::new(self.ctid(index).block, offset);
        self.set_ctid(index, ctid);
        if self.is_sorted {
            let key = ctid.as_u64();
            let before = index > 0 && self.ctid_raw(index - 1) > key;
            let after = index + 1 < self.nrows && self.ctid_raw(index + 1) < key;
            if before || after {
                self.is_sorted = false;
            }
        }
    }

    /// Returns a copy in a fresh block. Toast buffers are shared unless
    /// `deep_toast` is set.
    pub fn duplicate_with(&self, deep_toast: bool) -> Result<Self> {
        let segment = Arc::clone(self.block.segment());
        let size = self.layout.total_size();
        let mut block = segment.alloc(BlockTag::ColumnStore, size)?;
        block.as_mut_slice()[..size].copy_from_slice(&self.block.as_slice()[..size]);
        let toasts = self
            .toasts
            .iter()
            .map(|toast| match toast {
                Some(toast) if deep_toast => Ok(Some(Arc::new(toast.duplicate(toast.capacity())?))),
                other => Ok(other.clone()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layout: Arc::clone(&self.layout),
            block,
            toasts,
            toast_init_size: self.toast_init_size,
            nrows: self.nrows,
            njunks: self.njunks,
            blkno_min: self.blkno_min,
            blkno_max: self.blkno_max,
            is_sorted: self.is_sorted,
        })
    }
}

impl Duplicate for ColumnStore {
    fn duplicate(&self) -> Result<Self> {
        self.duplicate_with(false)
    }
}

impl std::fmt::Debug for ColumnStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnStore")
            .field("nrows", &self.nrows)
            .field("nrooms", &self.nrooms())
            .field("njunks", &self.njunks)
            .field("blkno_min", &self.blkno_min)
            .field("blkno_max", &self.blkno_max)
            .field("is_sorted", &self.is_sorted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cow::make_mut;
    use kestrel_common::{ColumnDesc, HeapTuple, RowShape, TypeId};
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn shape() -> Arc<RowShape> {
        Arc::new(RowShape::new(vec![
            ColumnDesc::new("id", TypeId::Int64).not_null(),
            ColumnDesc::new("name", TypeId::Text),
            ColumnDesc::new("score", TypeId::Int32),
        ]))
    }

    fn layout(nrooms: usize) -> Arc<ChunkLayout> {
        Arc::new(ChunkLayout::new(shape(), &[1, 2, 3], nrooms).unwrap())
    }

    fn segment() -> Arc<ShmemSegment> {
        ShmemSegment::new(16 * 1024 * 1024).unwrap()
    }

    fn tuple(block: BlockNumber, offset: OffsetNumber, name: Option<&str>) -> HeapTuple {
        HeapTuple::form(
            &shape(),
            ItemPointer::new(block, offset),
            10,
            &[
                Some(Datum::Int64(block as i64 * 1000 + offset as i64)),
                name.map(|n| Datum::Text(n.to_string())),
                None,
            ],
        )
        .unwrap()
    }

    fn chunk(segment: &Arc<ShmemSegment>, nrooms: usize) -> ColumnStore {
        ColumnStore::create(segment, layout(nrooms), 4096).unwrap()
    }

    #[test]
    fn test_insert_and_read_back() {
        let segment = segment();
        let mut chunk = chunk(&segment, 8);
        chunk.insert_row(RowRef::from(&tuple(4, 1, Some("alpha")))).unwrap();
        chunk.insert_row(RowRef::from(&tuple(2, 3, None))).unwrap();

        assert_eq!(chunk.nrows(), 2);
        assert_eq!((chunk.blkno_min(), chunk.blkno_max()), (2, 4));
        assert!(!chunk.is_sorted());
        assert_eq!(chunk.ctid(1), ItemPointer::new(2, 3));
        assert_eq!(chunk.datum(0, 1).unwrap(), Some(Datum::Int64(4001)));
        assert_eq!(chunk.datum(0, 2).unwrap(), Some(Datum::Text("alpha".into())));
        assert_eq!(chunk.datum(1, 2).unwrap(), None);
        assert_eq!(chunk.datum(0, 3).unwrap(), None);
        assert_eq!(chunk.header(0).xmin, 10);
    }

    #[test]
    fn test_insert_into_full_chunk_fails() {
        let segment = segment();
        let mut chunk = chunk(&segment, 2);
        chunk.insert_row(RowRef::from(&tuple(1, 1, None))).unwrap();
        chunk.insert_row(RowRef::from(&tuple(1, 2, None))).unwrap();
        assert!(matches!(
            chunk.insert_row(RowRef::from(&tuple(1, 3, None))),
            Err(KestrelError::ChunkFull)
        ));
    }

    #[test]
    fn test_uncached_column_is_reported() {
        let segment = segment();
        let layout = Arc::new(ChunkLayout::new(shape(), &[1], 4).unwrap());
        let mut chunk = ColumnStore::create(&segment, layout, 4096).unwrap();
        chunk.insert_row(RowRef::from(&tuple(1, 1, Some("x")))).unwrap();
        assert_eq!(chunk.datum(0, 1).unwrap(), Some(Datum::Int64(1001)));
        assert!(matches!(chunk.datum(0, 2), Err(KestrelError::ColumnNotCached { attnum: 2 })));
    }

    fn naive_next(chunk: &ColumnStore, target: ItemPointer) -> Option<ItemPointer> {
        (0..chunk.nrows()).map(|i| chunk.ctid(i)).filter(|c| *c >= target).min()
    }

    fn naive_prev(chunk: &ColumnStore, target: ItemPointer) -> Option<ItemPointer> {
        (0..chunk.nrows()).map(|i| chunk.ctid(i)).filter(|c| *c <= target).max()
    }

    #[test]
    fn test_find_records_match_naive_scan() {
        let segment = segment();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut ctids: Vec<(u32, u16)> = (0..40).map(|i| (i / 4 * 2, (i % 4) as u16 + 1)).collect();
        ctids.shuffle(&mut rng);

        let mut chunk = chunk(&segment, 64);
        for (target_block, target_offset) in [(0, 1), (5, 2), (100, 1)] {
            let target = ItemPointer::new(target_block, target_offset);
            assert_eq!(chunk.find_next_record(target), None);
            assert_eq!(chunk.find_prev_record(target), None);
        }

        for &(block, offset) in &ctids {
            chunk.insert_row(RowRef::from(&tuple(block, offset, None))).unwrap();
        }
        for sorted in [false, true] {
            if sorted {
                chunk.sort();
            }
            assert_eq!(chunk.is_sorted(), sorted);
            for _ in 0..200 {
                let target = ItemPointer::new(rng.gen_range(0..24), rng.gen_range(1..6));
                let next = chunk.find_next_record(target).map(|i| chunk.ctid(i));
                let prev = chunk.find_prev_record(target).map(|i| chunk.ctid(i));
                assert_eq!(next, naive_next(&chunk, target), "next of {}", target);
                assert_eq!(prev, naive_prev(&chunk, target), "prev of {}", target);
            }
        }
    }

    #[test]
    fn test_sort_keeps_rows_intact() {
        let segment = segment();
        let mut chunk = chunk(&segment, 16);
        for block in [9u32, 3, 7, 1, 5] {
            let name = (block % 2 == 1 && block != 5).then(|| format!("row-{}", block));
            chunk.insert_row(RowRef::from(&tuple(block, 1, name.as_deref()))).unwrap();
        }
        chunk.sort();
        let blocks: Vec<_> = (0..chunk.nrows()).map(|i| chunk.ctid(i).block).collect();
        assert_eq!(blocks, vec![1, 3, 5, 7, 9]);
        for i in 0..chunk.nrows() {
            let block = chunk.ctid(i).block;
            assert_eq!(chunk.datum(i, 1).unwrap(), Some(Datum::Int64(block as i64 * 1000 + 1)));
            let expected = (block != 5).then(|| Datum::Text(format!("row-{}", block)));
            assert_eq!(chunk.datum(i, 2).unwrap(), expected);
        }
    }

    #[test]
    fn test_split_partitions_by_highest_block() {
        let segment = segment();
        let mut chunk = chunk(&segment, 8);
        for (block, offset) in [(5, 1), (2, 1), (5, 2), (3, 1), (2, 2), (5, 3)] {
            chunk.insert_row(RowRef::from(&tuple(block, offset, Some("v")))).unwrap();
        }
        let upper = chunk.split().unwrap();

        assert_eq!(chunk.nrows() + upper.nrows(), 6);
        assert_eq!((chunk.blkno_min(), chunk.blkno_max()), (2, 3));
        assert_eq!((upper.blkno_min(), upper.blkno_max()), (5, 5));
        assert!(chunk.blkno_max() < upper.blkno_min());
        assert_eq!(upper.nrows(), 3);
        for i in 0..upper.nrows() {
            assert_eq!(upper.datum(i, 2).unwrap(), Some(Datum::Text("v".into())));
        }
    }

    #[test]
    fn test_split_single_block_is_refused() {
        let segment = segment();
        let mut chunk = chunk(&segment, 4);
        for offset in 1..=4 {
            chunk.insert_row(RowRef::from(&tuple(8, offset, None))).unwrap();
        }
        assert!(matches!(chunk.split(), Err(KestrelError::ChunkFull)));
        assert_eq!(chunk.nrows(), 4);
    }

    #[test]
    fn test_compact_drops_tombstones() {
        let segment = segment();
        let mut chunk = chunk(&segment, 8);
        for block in 1..=4 {
            chunk.insert_row(RowRef::from(&tuple(block, 1, Some("payload")))).unwrap();
        }
        chunk.mark_tombstone(0).unwrap();
        chunk.mark_tombstone(2).unwrap();
        chunk.mark_tombstone(2).unwrap();
        assert_eq!(chunk.njunks(), 2);
        assert!(chunk.toast(1).unwrap().junk() > 0);

        let compacted = chunk.compact().unwrap();
        assert_eq!(compacted.nrows(), 2);
        assert_eq!(compacted.njunks(), 0);
        assert_eq!((compacted.blkno_min(), compacted.blkno_max()), (2, 4));
        assert_eq!(compacted.toast(1).unwrap().junk(), 0);
        assert_eq!(compacted.datum(1, 2).unwrap(), Some(Datum::Text("payload".into())));
    }

    #[test]
    fn test_compact_to_empty_keeps_lower_bound() {
        let segment = segment();
        let mut chunk = chunk(&segment, 4);
        chunk.insert_row(RowRef::from(&tuple(6, 1, None))).unwrap();
        chunk.insert_row(RowRef::from(&tuple(9, 1, None))).unwrap();
        chunk.mark_tombstone(0).unwrap();
        chunk.mark_tombstone(1).unwrap();

        let compacted = chunk.compact().unwrap();
        assert!(compacted.is_empty());
        assert_eq!((compacted.blkno_min(), compacted.blkno_max()), (6, 6));
    }

    #[test]
    fn test_merge_unions_ranges() {
        let segment = segment();
        let mut lower = chunk(&segment, 8);
        let mut upper = chunk(&segment, 8);
        lower.insert_row(RowRef::from(&tuple(1, 1, Some("a")))).unwrap();
        lower.insert_row(RowRef::from(&tuple(3, 1, None))).unwrap();
        upper.insert_row(RowRef::from(&tuple(7, 1, Some("b")))).unwrap();
        upper.insert_row(RowRef::from(&tuple(9, 1, None))).unwrap();
        upper.mark_tombstone(1).unwrap();

        let merged = ColumnStore::merge(&lower, &upper).unwrap();
        assert_eq!(merged.nrows(), 3);
        assert_eq!((merged.blkno_min(), merged.blkno_max()), (1, 9));
        assert!(merged.is_sorted());
        assert_eq!(merged.datum(2, 2).unwrap(), Some(Datum::Text("b".into())));
        // The inputs are untouched.
        assert_eq!(lower.nrows(), 2);
        assert_eq!(upper.nrows(), 2);
    }

    #[test]
    fn test_patch_header_and_relocate() {
        let segment = segment();
        let mut chunk = chunk(&segment, 8);
        for offset in [1u16, 2, 3] {
            chunk.insert_row(RowRef::from(&tuple(4, offset, None))).unwrap();
        }
        let ctid = ItemPointer::new(4, 2);
        let mut header = chunk.header_of(ctid).unwrap();
        header.xmax = 99;
        assert!(chunk.patch_header(ctid, header));
        assert_eq!(chunk.header(1).xmax, 99);
        assert!(!chunk.patch_header(ItemPointer::new(4, 9), header));

        chunk.relocate(0, 2);
        assert!(chunk.is_sorted());
        chunk.relocate(0, 8);
        assert!(!chunk.is_sorted());
        assert_eq!(chunk.ctid(0), ItemPointer::new(4, 8));
    }

    #[test]
    fn test_copy_on_write_isolates_readers() {
        let segment = segment();
        let mut writer = Arc::new(chunk(&segment, 8));
        make_mut(&mut writer)
            .unwrap()
            .insert_row(RowRef::from(&tuple(1, 1, Some("first"))))
            .unwrap();

        let reader = Arc::clone(&writer);
        let chunk = make_mut(&mut writer).unwrap();
        chunk.insert_row(RowRef::from(&tuple(2, 1, Some("second")))).unwrap();
        let mut header = chunk.header(0);
        header.xmax = 50;
        chunk.patch_header(ItemPointer::new(1, 1), header);

        assert_eq!(reader.nrows(), 1);
        assert_eq!(reader.header(0).xmax, 0);
        assert_eq!(reader.datum(0, 2).unwrap(), Some(Datum::Text("first".into())));
        assert_eq!(writer.nrows(), 2);
        assert_eq!(writer.header(0).xmax, 50);
        assert_eq!(writer.datum(1, 2).unwrap(), Some(Datum::Text("second".into())));
        // The writer's append forced a private toast buffer.
        assert!(!Arc::ptr_eq(reader.toast(1).unwrap(), writer.toast(1).unwrap()));

        // A tombstone on a fresh copy charges junk to a private toast only.
        let snapshot = Arc::clone(&writer);
        make_mut(&mut writer).unwrap().mark_tombstone(1).unwrap();
        assert_eq!(snapshot.toast(1).unwrap().junk(), 0);
        assert_eq!(snapshot.njunks(), 0);
        assert!(!snapshot.header(1).is_tombstone());
        assert!(writer.toast(1).unwrap().junk() > 0);
        assert_eq!(writer.njunks(), 1);
    }

    #[test]
    fn test_toast_grows_by_copying() {
        let segment = segment();
        let mut chunk = chunk(&segment, 64);
        let long = "x".repeat(1500);
        for offset in 1..=10u16 {
            chunk.insert_row(RowRef::from(&tuple(1, offset, Some(&long)))).unwrap();
        }
        assert!(chunk.toast(1).unwrap().capacity() > 4096);
        for i in 0..10 {
            assert_eq!(chunk.datum(i, 2).unwrap(), Some(Datum::Text(long.clone())));
        }
    }

    #[test]
    fn test_deep_duplicate_owns_toast() {
        let segment = segment();
        let mut chunk = chunk(&segment, 8);
        chunk.insert_row(RowRef::from(&tuple(1, 1, Some("t")))).unwrap();
        let shallow = chunk.duplicate_with(false).unwrap();
        let deep = chunk.duplicate_with(true).unwrap();
        assert!(Arc::ptr_eq(chunk.toast(1).unwrap(), shallow.toast(1).unwrap()));
        assert!(!Arc::ptr_eq(chunk.toast(1).unwrap(), deep.toast(1).unwrap()));
        assert_eq!(Arc::strong_count(chunk.toast(1).unwrap()), 2);
        assert_eq!(deep.datum(0, 2).unwrap(), Some(Datum::Text("t".into())));
    }
}
