//! Shared memory segment and its block allocator.

use crate::block::{
    BlockHeader, BlockTag, ShmemBlock, FLAG_DETACHED, HEADER_SIZE, MAGIC_FREE, MAGIC_USED,
    MARKER_SPACE, NIL, OVERRUN_MARKER,
};
use kestrel_common::{CacheConfig, KestrelError, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// If splitting a free block would leave less than this, the whole block is
/// handed out instead.
pub const SPLIT_SLACK: usize = 4096;

/// Smallest segment that can be created.
pub const MIN_SEGMENT_SIZE: usize = 64 * 1024;

/// Scope id meaning "not owned by any resource scope".
pub const NO_SCOPE: u64 = 0;

#[inline(always)]
const fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Free list bookkeeping, guarded by the segment mutex.
struct FreeList {
    head: u64,
    free_blocks: usize,
    used_blocks: usize,
    used_bytes: usize,
}

/// A single anonymous shared mapping divided into tagged, variable-size
/// blocks.
///
/// Every block starts with an in-band header linking it to its address
/// neighbours and, when free, to the free list. Links are offsets from the
/// segment base. All header mutations happen under one segment-wide mutex;
/// payloads belong to their [`ShmemBlock`] handle.
pub struct ShmemSegment {
    /// Keeps the mapping alive; never accessed after construction.
    _mmap: MmapMut,
    base: *mut u8,
    total: usize,
    free_list: Mutex<FreeList>,
    next_scope: AtomicU64,
}

// SAFETY: headers are only touched under `free_list`, and payloads are only
// reachable through uniquely owned block handles.
unsafe impl Send for ShmemSegment {}
unsafe impl Sync for ShmemSegment {}

impl ShmemSegment {
    /// Maps a segment of `size` bytes (rounded down to 8) as one free block.
    pub fn new(size: usize) -> Result<Arc<Self>> {
        if size < MIN_SEGMENT_SIZE {
            return Err(KestrelError::InvalidParameter {
                name: "segment size".to_string(),
                value: size.to_string(),
            });
        }
        let total = size & !7;
        let mut mmap = MmapMut::map_anon(total)?;
        let base = mmap.as_mut_ptr();

        let segment = Self {
            _mmap: mmap,
            base,
            total,
            free_list: Mutex::new(FreeList {
                head: NIL,
                free_blocks: 0,
                used_blocks: 0,
                used_bytes: 0,
            }),
            next_scope: AtomicU64::new(NO_SCOPE + 1),
        };
        {
            let mut fl = segment.free_list.lock();
            let header = segment.header_mut(0);
            *header = BlockHeader {
                magic: MAGIC_FREE,
                pid: 0,
                size: total as u64,
                addr_prev: NIL,
                addr_next: NIL,
                free_prev: NIL,
                free_next: NIL,
                scope: NO_SCOPE,
                capacity: 0,
                flags: 0,
                reserved: 0,
            };
            segment.push_free(&mut fl, 0);
        }
        info!("Created shared memory segment of {} bytes", total);
        Ok(Arc::new(segment))
    }

    /// Creates the segment sized by the configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Arc<Self>> {
        Self::new(config.segment_size_bytes())
    }

    /// Returns the segment size in bytes.
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Allocates a block with at least `size` payload bytes.
    pub fn alloc(self: &Arc<Self>, tag: BlockTag, size: usize) -> Result<ShmemBlock> {
        self.alloc_internal(tag, size, false, NO_SCOPE)
    }

    /// Allocates a block with at least `size` payload bytes and hands out
    /// the whole block it came from, so the capacity may be larger.
    pub fn alloc_alap(self: &Arc<Self>, tag: BlockTag, size: usize) -> Result<ShmemBlock> {
        self.alloc_internal(tag, size, true, NO_SCOPE)
    }

    pub(crate) fn alloc_internal(
        self: &Arc<Self>,
        tag: BlockTag,
        size: usize,
        alap: bool,
        scope: u64,
    ) -> Result<ShmemBlock> {
        let required = HEADER_SIZE + align8(size) + MARKER_SPACE;
        let mut fl = self.free_list.lock();

        let mut cur = fl.head;
        while cur != NIL {
            let (block_size, next) = {
                let h = self.header(cur);
                (h.size as usize, h.free_next)
            };
            if block_size >= required {
                break;
            }
            cur = next;
        }
        if cur == NIL {
            drop(fl);
            warn!(
                "Shared memory allocation of {} bytes ({}) failed",
                size, tag
            );
            return Err(KestrelError::out_of_memory(size));
        }

        self.unlink_free(&mut fl, cur);
        let block_size = self.header(cur).size as usize;
        if block_size - required >= SPLIT_SLACK {
            let rest = cur + required as u64;
            let addr_next = self.header(cur).addr_next;
            *self.header_mut(rest) = BlockHeader {
                magic: MAGIC_FREE,
                pid: 0,
                size: (block_size - required) as u64,
                addr_prev: cur,
                addr_next,
                free_prev: NIL,
                free_next: NIL,
                scope: NO_SCOPE,
                capacity: 0,
                flags: 0,
                reserved: 0,
            };
            if addr_next != NIL {
                self.header_mut(addr_next).addr_prev = rest;
            }
            let h = self.header_mut(cur);
            h.size = required as u64;
            h.addr_next = rest;
            self.push_free(&mut fl, rest);
        }

        let h = self.header_mut(cur);
        let capacity = if alap {
            h.size as usize - HEADER_SIZE - MARKER_SPACE
        } else {
            align8(size)
        };
        h.magic = MAGIC_USED | tag as u32;
        h.pid = std::process::id();
        h.free_prev = NIL;
        h.free_next = NIL;
        h.scope = scope;
        h.capacity = capacity as u64;
        h.flags = 0;
        let consumed = h.size as usize;
        fl.used_blocks += 1;
        fl.used_bytes += consumed;

        // SAFETY: payload and marker lie inside this block, which nobody
        // else can reach until the handle is returned.
        unsafe {
            let payload = self.payload_ptr(cur);
            std::ptr::write_bytes(payload, 0, capacity);
            std::ptr::write_unaligned(payload.add(capacity) as *mut u32, OVERRUN_MARKER);
        }
        drop(fl);

        Ok(ShmemBlock::new(Arc::clone(self), cur, capacity, tag))
    }

    /// Returns a block to the free list, merging it with free neighbours.
    pub(crate) fn free(&self, offset: u64) -> Result<()> {
        let mut fl = self.free_list.lock();
        self.free_locked(&mut fl, offset)
    }

    fn free_locked(&self, fl: &mut FreeList, offset: u64) -> Result<()> {
        self.check_offset(offset)?;
        if !self.header(offset).is_used() {
            return Err(KestrelError::BlockCorrupted {
                offset,
                reason: "freeing a block that is not allocated".to_string(),
            });
        }
        if cfg!(debug_assertions) && !self.marker_intact_locked(offset) {
            tracing::error!("Overrun detected on shared memory block at offset {}", offset);
        }

        let size = self.header(offset).size as usize;
        fl.used_blocks -= 1;
        fl.used_bytes -= size;

        let h = self.header_mut(offset);
        h.magic = MAGIC_FREE;
        h.scope = NO_SCOPE;
        h.flags = 0;
        h.capacity = 0;

        let mut cur = offset;
        let prev = self.header(cur).addr_prev;
        if prev != NIL && self.header(prev).is_free() {
            self.unlink_free(fl, prev);
            self.absorb_next(prev);
            cur = prev;
        }
        let next = self.header(cur).addr_next;
        if next != NIL && self.header(next).is_free() {
            self.unlink_free(fl, next);
            self.absorb_next(cur);
        }
        self.push_free(fl, cur);
        Ok(())
    }

    /// Merges the address-next block of `offset` into it.
    fn absorb_next(&self, offset: u64) {
        let next = self.header(offset).addr_next;
        let (next_size, next_next) = {
            let n = self.header(next);
            (n.size, n.addr_next)
        };
        let h = self.header_mut(offset);
        h.size += next_size;
        h.addr_next = next_next;
        if next_next != NIL {
            self.header_mut(next_next).addr_prev = offset;
        }
    }

    fn push_free(&self, fl: &mut FreeList, offset: u64) {
        let old_head = fl.head;
        {
            let h = self.header_mut(offset);
            h.free_prev = NIL;
            h.free_next = old_head;
        }
        if old_head != NIL {
            self.header_mut(old_head).free_prev = offset;
        }
        fl.head = offset;
        fl.free_blocks += 1;
    }

    fn unlink_free(&self, fl: &mut FreeList, offset: u64) {
        let (prev, next) = {
            let h = self.header(offset);
            (h.free_prev, h.free_next)
        };
        if prev != NIL {
            self.header_mut(prev).free_next = next;
        } else {
            fl.head = next;
        }
        if next != NIL {
            self.header_mut(next).free_prev = prev;
        }
        let h = self.header_mut(offset);
        h.free_prev = NIL;
        h.free_next = NIL;
        fl.free_blocks -= 1;
    }

    pub(crate) fn set_detached(&self, offset: u64, detached: bool) {
        let _fl = self.free_list.lock();
        let h = self.header_mut(offset);
        if detached {
            h.flags |= FLAG_DETACHED;
        } else {
            h.flags &= !FLAG_DETACHED;
        }
    }

    /// Validates a detached block and clears its detached flag.
    pub(crate) fn attach(&self, offset: u64) -> Result<(usize, BlockTag)> {
        let _fl = self.free_list.lock();
        self.check_offset(offset)?;
        let h = self.header_mut(offset);
        let tag = h.tag().ok_or_else(|| KestrelError::BlockCorrupted {
            offset,
            reason: format!("bad magic {:#x}", h.magic),
        })?;
        if h.flags & FLAG_DETACHED == 0 {
            return Err(KestrelError::BlockCorrupted {
                offset,
                reason: "block is not detached".to_string(),
            });
        }
        h.flags &= !FLAG_DETACHED;
        Ok((h.capacity as usize, tag))
    }

    /// Frees every detached block owned by `scope`, in cleanup order.
    /// Returns the number of blocks reclaimed.
    pub(crate) fn release_scope(&self, scope: u64) -> usize {
        let mut fl = self.free_list.lock();
        let mut leaked = Vec::new();
        let mut cur = 0u64;
        while cur != NIL {
            let h = self.header(cur);
            if h.is_used() && h.scope == scope && h.flags & FLAG_DETACHED != 0 {
                let order = h.tag().map(|t| t.release_order()).unwrap_or(0);
                leaked.push((order, cur));
            }
            cur = h.addr_next;
        }
        leaked.sort_by_key(|&(order, _)| order);

        let mut released = 0;
        for (_, offset) in leaked {
            match self.free_locked(&mut fl, offset) {
                Ok(()) => released += 1,
                Err(e) => warn!("Resource scope {} cleanup skipped a block: {}", scope, e),
            }
        }
        if released > 0 {
            debug!("Resource scope {} released {} leaked blocks", scope, released);
        }
        released
    }

    pub(crate) fn next_scope_id(&self) -> u64 {
        self.next_scope.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns allocation statistics.
    pub fn stats(&self) -> SegmentStats {
        let fl = self.free_list.lock();
        let mut stats = SegmentStats {
            total_bytes: self.total,
            used_bytes: fl.used_bytes,
            free_bytes: self.total - fl.used_bytes,
            used_blocks: fl.used_blocks,
            free_blocks: fl.free_blocks,
            largest_free: 0,
            by_tag: BTreeMap::new(),
        };
        let mut cur = 0u64;
        while cur != NIL {
            let h = self.header(cur);
            match h.tag() {
                Some(tag) => {
                    let usage = stats.by_tag.entry(tag).or_default();
                    usage.blocks += 1;
                    usage.bytes += h.size as usize;
                }
                None => stats.largest_free = stats.largest_free.max(h.size as usize),
            }
            cur = h.addr_next;
        }
        stats
    }

    /// Lists every block in address order.
    pub fn dump(&self) -> Vec<BlockInfo> {
        let _fl = self.free_list.lock();
        let mut blocks = Vec::new();
        let mut cur = 0u64;
        while cur != NIL {
            let h = self.header(cur);
            blocks.push(BlockInfo {
                offset: cur,
                size: h.size as usize,
                tag: h.tag(),
                pid: h.pid,
                scope: h.scope,
                capacity: h.capacity as usize,
                detached: h.flags & FLAG_DETACHED != 0,
            });
            cur = h.addr_next;
        }
        blocks
    }

    /// Walks the whole segment and validates the allocator invariants:
    /// - the address list covers the segment exactly
    /// - no two address-adjacent blocks are both free
    /// - the free list holds exactly the free blocks
    /// - every used block's overrun marker is intact
    pub fn check_consistency(&self) -> Result<()> {
        let fl = self.free_list.lock();
        let corrupted = |offset: u64, reason: String| KestrelError::BlockCorrupted { offset, reason };

        let mut cur = 0u64;
        let mut prev = NIL;
        let mut covered = 0usize;
        let mut prev_free = false;
        let mut free_seen = 0usize;
        let mut used_seen = 0usize;
        while cur != NIL {
            self.check_offset(cur)?;
            let h = self.header(cur);
            if h.addr_prev != prev {
                return Err(corrupted(cur, format!("addr_prev {} != {}", h.addr_prev, prev)));
            }
            if cur as usize != covered {
                return Err(corrupted(cur, format!("gap before block (expected {})", covered)));
            }
            if h.is_free() {
                if prev_free {
                    return Err(corrupted(cur, "adjacent free blocks".to_string()));
                }
                free_seen += 1;
            } else if h.is_used() {
                if !self.marker_intact_locked(cur) {
                    return Err(KestrelError::BlockOverrun { offset: cur });
                }
                used_seen += 1;
            } else {
                return Err(corrupted(cur, format!("bad magic {:#x}", h.magic)));
            }
            prev_free = h.is_free();
            covered += h.size as usize;
            prev = cur;
            cur = h.addr_next;
        }
        if covered != self.total {
            return Err(corrupted(prev, format!("blocks cover {} of {} bytes", covered, self.total)));
        }

        let mut on_list = 0usize;
        let mut cur = fl.head;
        while cur != NIL {
            if !self.header(cur).is_free() {
                return Err(corrupted(cur, "used block on free list".to_string()));
            }
            on_list += 1;
            cur = self.header(cur).free_next;
        }
        if on_list != free_seen || on_list != fl.free_blocks || used_seen != fl.used_blocks {
            return Err(corrupted(
                fl.head,
                format!(
                    "free list holds {} blocks, segment has {} free and {} used",
                    on_list, free_seen, used_seen
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn marker_intact(&self, offset: u64) -> bool {
        let _fl = self.free_list.lock();
        self.marker_intact_locked(offset)
    }

    fn marker_intact_locked(&self, offset: u64) -> bool {
        let capacity = self.header(offset).capacity as usize;
        // SAFETY: the marker slot is inside the block by construction.
        let marker = unsafe {
            std::ptr::read_unaligned(self.payload_ptr(offset).add(capacity) as *const u32)
        };
        marker == OVERRUN_MARKER
    }

    fn check_offset(&self, offset: u64) -> Result<()> {
        if offset % 8 != 0 || offset as usize + HEADER_SIZE > self.total {
            return Err(KestrelError::BlockCorrupted {
                offset,
                reason: "offset outside segment".to_string(),
            });
        }
        Ok(())
    }

    #[inline(always)]
    pub(crate) fn payload_ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) + HEADER_SIZE <= self.total);
        // SAFETY: offsets handed out by the allocator are inside the mapping.
        unsafe { self.base.add(offset as usize + HEADER_SIZE) }
    }

    #[inline(always)]
    fn header(&self, offset: u64) -> &BlockHeader {
        debug_assert!((offset as usize) + HEADER_SIZE <= self.total);
        // SAFETY: block offsets are 8-aligned inside a page-aligned mapping,
        // and headers are only accessed with the free list lock held.
        unsafe { &*(self.base.add(offset as usize) as *const BlockHeader) }
    }

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self, offset: u64) -> &mut BlockHeader {
        debug_assert!((offset as usize) + HEADER_SIZE <= self.total);
        // SAFETY: as for `header`; callers hold the lock and keep no other
        // reference to the same header alive.
        unsafe { &mut *(self.base.add(offset as usize) as *mut BlockHeader) }
    }
}

impl std::fmt::Debug for ShmemSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemSegment")
            .field("total", &self.total)
            .finish()
    }
}

/// Usage of one block tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagUsage {
    pub blocks: usize,
    pub bytes: usize,
}

/// Snapshot of segment usage.
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
    pub by_tag: BTreeMap<BlockTag, TagUsage>,
}

/// One entry of [`ShmemSegment::dump`].
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub offset: u64,
    pub size: usize,
    /// None for free blocks.
    pub tag: Option<BlockTag>,
    pub pid: u32,
    pub scope: u64,
    pub capacity: usize,
    pub detached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const SEG: usize = 1024 * 1024;

    fn assert_accounting(segment: &ShmemSegment) {
        segment.check_consistency().unwrap();
        let blocks = segment.dump();
        let free: usize = blocks.iter().filter(|b| b.tag.is_none()).map(|b| b.size).sum();
        let used: usize = blocks.iter().filter(|b| b.tag.is_some()).map(|b| b.size).sum();
        assert_eq!(free + used, segment.total_size());
        for pair in blocks.windows(2) {
            assert!(!(pair[0].tag.is_none() && pair[1].tag.is_none()));
        }
    }

    #[test]
    fn test_new_segment_is_one_free_block() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let stats = segment.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.largest_free, SEG);
        assert_accounting(&segment);
    }

    #[test]
    fn test_too_small_segment() {
        assert!(ShmemSegment::new(1024).is_err());
    }

    #[test]
    fn test_alloc_and_free() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let mut block = segment.alloc(BlockTag::Generic, 100).unwrap();
        assert_eq!(block.capacity(), 104);
        assert!(block.as_slice().iter().all(|&b| b == 0));
        block.as_mut_slice()[..4].copy_from_slice(b"abcd");
        assert_eq!(&block.as_slice()[..4], b"abcd");
        block.check_overrun().unwrap();

        let stats = segment.stats();
        assert_eq!(stats.used_blocks, 1);
        assert_eq!(stats.by_tag[&BlockTag::Generic].blocks, 1);
        assert_accounting(&segment);

        drop(block);
        let stats = segment.stats();
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
        assert_accounting(&segment);
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let a = segment.alloc(BlockTag::Generic, 1000).unwrap();
        let rest = segment.stats().largest_free;
        // Leave less than the slack behind, so the whole block is consumed.
        let b = segment
            .alloc(BlockTag::Generic, rest - HEADER_SIZE - MARKER_SPACE - 1000)
            .unwrap();
        let stats = segment.stats();
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.used_bytes, SEG);
        drop(a);
        drop(b);
        assert_accounting(&segment);
    }

    #[test]
    fn test_alloc_alap_hands_out_whole_block() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let block = segment.alloc_alap(BlockTag::ToastBuffer, SEG - 4096).unwrap();
        assert!(block.capacity() >= SEG - 4096);
        assert_eq!(block.capacity(), SEG - HEADER_SIZE - MARKER_SPACE);
        block.check_overrun().unwrap();
    }

    #[test]
    fn test_out_of_memory() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let err = segment.alloc(BlockTag::Generic, SEG).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_accounting(&segment);
    }

    #[test]
    fn test_coalesce_with_both_neighbours() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let a = segment.alloc(BlockTag::Generic, 8192).unwrap();
        let b = segment.alloc(BlockTag::Generic, 8192).unwrap();
        let c = segment.alloc(BlockTag::Generic, 8192).unwrap();
        let _d = segment.alloc(BlockTag::Generic, 8192).unwrap();
        drop(a);
        drop(c);
        assert_eq!(segment.stats().free_blocks, 3);
        drop(b);
        assert_eq!(segment.stats().free_blocks, 2);
        assert_accounting(&segment);
    }

    #[test]
    fn test_overrun_detected() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let block = segment.alloc(BlockTag::Generic, 16).unwrap();
        // SAFETY: deliberately scribbles over the marker for the test.
        unsafe {
            let p = segment.payload_ptr(block.offset()).add(block.capacity());
            *p = 0;
        }
        assert!(matches!(block.check_overrun(), Err(KestrelError::BlockOverrun { .. })));
        assert!(segment.check_consistency().is_err());
        // SAFETY: restore so the drop path sees a sane marker.
        unsafe {
            let p = segment.payload_ptr(block.offset()).add(block.capacity());
            std::ptr::write_unaligned(p as *mut u32, OVERRUN_MARKER);
        }
    }

    #[test]
    fn test_detach_and_reattach() {
        let segment = ShmemSegment::new(SEG).unwrap();
        let mut block = segment.alloc(BlockTag::RowStore, 64).unwrap();
        block.as_mut_slice()[0] = 7;
        let raw = block.into_raw();
        assert!(segment.dump().iter().any(|b| b.detached));
        let block = ShmemBlock::from_raw(&segment, raw).unwrap();
        assert_eq!(block.as_slice()[0], 7);
        assert_eq!(block.tag(), BlockTag::RowStore);
        drop(block);
        assert_eq!(segment.stats().used_blocks, 0);
    }

    #[test]
    fn test_random_alloc_free_sequences() {
        let segment = ShmemSegment::new(4 * SEG).unwrap();
        let mut rng = rand::thread_rng();
        let mut live: Vec<ShmemBlock> = Vec::new();
        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(1..32 * 1024);
                match segment.alloc(BlockTag::Generic, size) {
                    Ok(block) => live.push(block),
                    Err(e) => assert!(e.is_out_of_memory()),
                }
            } else {
                let idx = rng.gen_range(0..live.len());
                live.swap_remove(idx);
                assert_accounting(&segment);
            }
            let stats = segment.stats();
            assert_eq!(stats.used_bytes + stats.free_bytes, stats.total_bytes);
        }
        live.clear();
        let stats = segment.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_accounting(&segment);
    }
}
