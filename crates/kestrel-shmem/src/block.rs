//! Arena block headers, tags, and owned block handles.

use crate::segment::ShmemSegment;
use kestrel_common::{KestrelError, Result};
use std::sync::Arc;

/// Magic value of a block on the free list.
pub(crate) const MAGIC_FREE: u32 = 0xF9EE_A9EA;
/// Magic value of an allocated block; the low nibble carries the tag.
pub(crate) const MAGIC_USED: u32 = 0xA110_CED0;
/// Mask separating the used magic from its tag.
pub(crate) const MAGIC_MASK: u32 = 0xFFFF_FFF0;
/// Marker written right after every allocated payload.
pub(crate) const OVERRUN_MARKER: u32 = 0xDEAD_BEAF;
/// Null link.
pub(crate) const NIL: u64 = u64::MAX;
/// Header flag: the owning handle was detached into a [`BlockRef`].
pub(crate) const FLAG_DETACHED: u32 = 0x0001;

/// Size of the in-band block header.
pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();
/// Bytes reserved after the payload for the overrun marker.
pub(crate) const MARKER_SPACE: usize = 8;

/// In-band header at the start of every block.
///
/// Layout (72 bytes, every link is an offset from the segment base):
/// +--------------------+ 0
/// | magic: u32         | 4   FREE, or USED | tag
/// | pid: u32           | 8   owning process id
/// | size: u64          | 16  whole block, header included
/// | addr_prev: u64     | 24  address-ordered neighbours
/// | addr_next: u64     | 32
/// | free_prev: u64     | 40  free list links (free blocks only)
/// | free_next: u64     | 48
/// | scope: u64         | 56  owning resource scope, 0 = none
/// | capacity: u64      | 64  usable payload bytes
/// | flags: u32         | 68
/// | reserved: u32      | 72 (HEADER_SIZE)
/// +--------------------+
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHeader {
    pub(crate) magic: u32,
    pub(crate) pid: u32,
    pub(crate) size: u64,
    pub(crate) addr_prev: u64,
    pub(crate) addr_next: u64,
    pub(crate) free_prev: u64,
    pub(crate) free_next: u64,
    pub(crate) scope: u64,
    pub(crate) capacity: u64,
    pub(crate) flags: u32,
    pub(crate) reserved: u32,
}

impl BlockHeader {
    #[inline(always)]
    pub(crate) fn is_free(&self) -> bool {
        self.magic == MAGIC_FREE
    }

    #[inline(always)]
    pub(crate) fn is_used(&self) -> bool {
        self.magic & MAGIC_MASK == MAGIC_USED
    }

    pub(crate) fn tag(&self) -> Option<BlockTag> {
        if self.is_used() {
            BlockTag::from_subtype(self.magic & !MAGIC_MASK)
        } else {
            None
        }
    }
}

/// Kind of object stored in an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum BlockTag {
    Generic = 0,
    ToastBuffer = 1,
    ColumnStore = 2,
    RowStore = 3,
    TreeNodes = 4,
    CacheHead = 5,
    Queue = 6,
    KernelParams = 7,
}

impl BlockTag {
    pub(crate) fn from_subtype(value: u32) -> Option<Self> {
        match value {
            0 => Some(BlockTag::Generic),
            1 => Some(BlockTag::ToastBuffer),
            2 => Some(BlockTag::ColumnStore),
            3 => Some(BlockTag::RowStore),
            4 => Some(BlockTag::TreeNodes),
            5 => Some(BlockTag::CacheHead),
            6 => Some(BlockTag::Queue),
            7 => Some(BlockTag::KernelParams),
            _ => None,
        }
    }

    /// Position in the scope cleanup sequence: execution buffers first,
    /// then parameter buffers, then queues.
    pub(crate) fn release_order(&self) -> u8 {
        match self {
            BlockTag::KernelParams => 1,
            BlockTag::Queue => 2,
            _ => 0,
        }
    }
}

impl std::fmt::Display for BlockTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BlockTag::Generic => "generic",
            BlockTag::ToastBuffer => "toast-buffer",
            BlockTag::ColumnStore => "column-store",
            BlockTag::RowStore => "row-store",
            BlockTag::TreeNodes => "tree-nodes",
            BlockTag::CacheHead => "cache-head",
            BlockTag::Queue => "queue",
            BlockTag::KernelParams => "kernel-params",
        };
        write!(f, "{}", name)
    }
}

/// Owned handle to an allocated block. The block returns to the free list
/// when the handle drops.
///
/// A handle has exclusive access to its payload, so reads need `&self` and
/// writes need `&mut self`.
pub struct ShmemBlock {
    segment: Arc<ShmemSegment>,
    offset: u64,
    capacity: usize,
    tag: BlockTag,
}

impl ShmemBlock {
    pub(crate) fn new(segment: Arc<ShmemSegment>, offset: u64, capacity: usize, tag: BlockTag) -> Self {
        Self {
            segment,
            offset,
            capacity,
            tag,
        }
    }

    /// Returns the block's offset from the segment base.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the usable payload size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the block tag.
    pub fn tag(&self) -> BlockTag {
        self.tag
    }

    /// Returns the segment this block lives in.
    pub fn segment(&self) -> &Arc<ShmemSegment> {
        &self.segment
    }

    /// Payload bytes.
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the segment never hands out overlapping payloads and keeps
        // the mapping alive while any handle exists.
        unsafe { std::slice::from_raw_parts(self.segment.payload_ptr(self.offset), self.capacity) }
    }

    /// Mutable payload bytes.
    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes this the only live view.
        unsafe {
            std::slice::from_raw_parts_mut(self.segment.payload_ptr(self.offset), self.capacity)
        }
    }

    /// Verifies the overrun marker behind the payload.
    pub fn check_overrun(&self) -> Result<()> {
        if self.segment.marker_intact(self.offset) {
            Ok(())
        } else {
            Err(KestrelError::BlockOverrun {
                offset: self.offset,
            })
        }
    }

    /// Detaches the handle, leaving the block allocated.
    ///
    /// The block stays owned by its resource scope, which reclaims it on
    /// release unless it is re-attached first.
    pub fn into_raw(self) -> BlockRef {
        let this = std::mem::ManuallyDrop::new(self);
        this.segment.set_detached(this.offset, true);
        // SAFETY: `this` is never used again and its Drop is suppressed, so
        // the Arc is moved out exactly once.
        let segment = unsafe { std::ptr::read(&this.segment) };
        drop(segment);
        BlockRef { offset: this.offset }
    }

    /// Re-attaches a detached block.
    pub fn from_raw(segment: &Arc<ShmemSegment>, raw: BlockRef) -> Result<Self> {
        let (capacity, tag) = segment.attach(raw.offset)?;
        Ok(Self::new(Arc::clone(segment), raw.offset, capacity, tag))
    }
}

impl Drop for ShmemBlock {
    fn drop(&mut self) {
        if let Err(e) = self.segment.free(self.offset) {
            tracing::error!("failed to free shared memory block: {}", e);
        }
    }
}

impl std::fmt::Debug for ShmemBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemBlock")
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("tag", &self.tag)
            .finish()
    }
}

/// A detached block, identified by its offset.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockRef {
    offset: u64,
}

impl BlockRef {
    /// Returns the block's offset from the segment base.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_is_aligned() {
        assert_eq!(HEADER_SIZE, 72);
        assert_eq!(HEADER_SIZE % 8, 0);
    }

    #[test]
    fn test_tag_roundtrip_through_magic() {
        for tag in [
            BlockTag::Generic,
            BlockTag::ToastBuffer,
            BlockTag::ColumnStore,
            BlockTag::RowStore,
            BlockTag::TreeNodes,
            BlockTag::CacheHead,
            BlockTag::Queue,
            BlockTag::KernelParams,
        ] {
            let header = BlockHeader {
                magic: MAGIC_USED | tag as u32,
                pid: 0,
                size: 0,
                addr_prev: NIL,
                addr_next: NIL,
                free_prev: NIL,
                free_next: NIL,
                scope: 0,
                capacity: 0,
                flags: 0,
                reserved: 0,
            };
            assert!(header.is_used());
            assert!(!header.is_free());
            assert_eq!(header.tag(), Some(tag));
        }
    }

    #[test]
    fn test_release_order() {
        assert!(BlockTag::ColumnStore.release_order() < BlockTag::KernelParams.release_order());
        assert!(BlockTag::KernelParams.release_order() < BlockTag::Queue.release_order());
    }
}
