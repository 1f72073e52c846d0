//! Append-only storage for variable-length column values.

use crate::constants::{TOAST_HEADER_SIZE, TOAST_LENGTH_SIZE, max_align};
use kestrel_common::{KestrelError, Result};
use kestrel_shmem::{BlockTag, ShmemBlock, ShmemSegment};
use std::sync::Arc;

/// Buffer holding the variable-length values of one cached column.
///
/// Layout:
/// +---------------------------+ 0
/// | reserved header           | 8
/// | value: len u32 | bytes    | padded to 8
/// | value: len u32 | bytes    |
/// | ...                       | usage
/// | free                      |
/// +---------------------------+ capacity
///
/// Values are addressed by their offset from the start of the buffer.
/// Because the header is never handed out, offset 0 marks a missing value.
/// A buffer is shared between chunk versions through `Arc`; a shared buffer
/// is never written. Growth copies the used prefix into a larger buffer.
pub struct ToastBuffer {
    block: ShmemBlock,
    /// End of the used region.
    usage: usize,
    /// Bytes held by values of vacuumed rows.
    junk: usize,
}

impl ToastBuffer {
    /// Creates an empty buffer with room for at least `min_size` bytes.
    ///
    /// The block is taken from the top of the segment since buffers are
    /// large and long-lived.
    pub fn create(segment: &Arc<ShmemSegment>, min_size: usize) -> Result<Self> {
        let size = max_align(min_size.max(TOAST_HEADER_SIZE * 2));
        let block = segment.alloc_alap(BlockTag::ToastBuffer, size)?;
        Ok(Self {
            block,
            usage: TOAST_HEADER_SIZE,
            junk: 0,
        })
    }

    /// Bytes a value of `len` bytes occupies once stored.
    #[inline(always)]
    pub fn required_space(len: usize) -> usize {
        max_align(TOAST_LENGTH_SIZE + len)
    }

    /// Returns the buffer capacity in bytes.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }

    /// Returns the end of the used region.
    #[inline(always)]
    pub fn usage(&self) -> usize {
        self.usage
    }

    /// Returns the bytes still available for appends.
    #[inline(always)]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.usage
    }

    /// Returns the bytes held by values of vacuumed rows.
    pub fn junk(&self) -> usize {
        self.junk
    }

    /// Records that a stored value of `len` bytes is no longer referenced.
    /// Only a buffer owned by a single chunk version may be charged.
    pub(crate) fn add_junk(&mut self, len: usize) {
        self.junk += Self::required_space(len);
    }

    /// Appends a value, returning its offset, or None if it does not fit.
    pub fn append(&mut self, value: &[u8]) -> Option<u32> {
        let needed = Self::required_space(value.len());
        if needed > self.free_space() || self.usage + needed > u32::MAX as usize {
            return None;
        }
        let offset = self.usage;
        let buf = self.block.as_mut_slice();
        buf[offset..offset + TOAST_LENGTH_SIZE].copy_from_slice(&(value.len() as u32).to_le_bytes());
        let start = offset + TOAST_LENGTH_SIZE;
        buf[start..start + value.len()].copy_from_slice(value);
        self.usage += needed;
        Some(offset as u32)
    }

    /// Returns the value stored at `offset`.
    pub fn get(&self, offset: u32) -> Result<&[u8]> {
        let offset = offset as usize;
        if offset < TOAST_HEADER_SIZE || offset + TOAST_LENGTH_SIZE > self.usage {
            return Err(KestrelError::InvariantViolation(format!(
                "toast offset {} outside used region {}",
                offset, self.usage
            )));
        }
        let buf = self.block.as_slice();
        let len = u32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]) as usize;
        let start = offset + TOAST_LENGTH_SIZE;
        if start + len > self.usage {
            return Err(KestrelError::InvariantViolation(format!(
                "toast value at {} overruns used region",
                offset
            )));
        }
        Ok(&buf[start..start + len])
    }

    /// Copies the used prefix into a new buffer of at least `required` bytes.
    ///
    /// Offsets handed out by this buffer stay valid in the copy.
    pub fn duplicate(&self, required: usize) -> Result<Self> {
        let mut copy = Self::create(self.block.segment(), required.max(self.usage))?;
        copy.block.as_mut_slice()[..self.usage].copy_from_slice(&self.block.as_slice()[..self.usage]);
        copy.usage = self.usage;
        copy.junk = self.junk;
        Ok(copy)
    }
}

impl std::fmt::Debug for ToastBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToastBuffer")
            .field("capacity", &self.capacity())
            .field("usage", &self.usage)
            .field("junk", &self.junk())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Arc<ShmemSegment> {
        ShmemSegment::new(1024 * 1024).unwrap()
    }

    #[test]
    fn test_append_and_get() {
        let segment = segment();
        let mut toast = ToastBuffer::create(&segment, 4096).unwrap();
        let a = toast.append(b"hello").unwrap();
        let b = toast.append(b"").unwrap();
        let c = toast.append(b"world!!!").unwrap();

        assert_eq!(a as usize, TOAST_HEADER_SIZE);
        assert_ne!(a, 0);
        assert_eq!(toast.get(a).unwrap(), b"hello");
        assert_eq!(toast.get(b).unwrap(), b"");
        assert_eq!(toast.get(c).unwrap(), b"world!!!");
        assert_eq!(toast.usage() % 8, 0);
        assert!(toast.get(0).is_err());
    }

    #[test]
    fn test_append_refuses_when_full() {
        let segment = segment();
        let mut toast = ToastBuffer::create(&segment, 64).unwrap();
        let capacity = toast.capacity();
        let big = vec![7u8; capacity];
        assert!(toast.append(&big).is_none());
        assert_eq!(toast.usage(), TOAST_HEADER_SIZE);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let segment = segment();
        let mut toast = ToastBuffer::create(&segment, 256).unwrap();
        let a = toast.append(b"shared").unwrap();
        toast.add_junk(6);

        let mut copy = toast.duplicate(toast.capacity() * 2).unwrap();
        assert!(copy.capacity() >= toast.capacity() * 2);
        assert_eq!(copy.get(a).unwrap(), b"shared");
        assert_eq!(copy.junk(), toast.junk());

        let b = copy.append(b"only in copy").unwrap();
        assert_eq!(copy.get(b).unwrap(), b"only in copy");
        assert!(toast.get(b).is_err());
        assert_eq!(toast.get(a).unwrap(), b"shared");
    }

    #[test]
    fn test_arc_refcount_tracks_sharing() {
        let segment = segment();
        let toast = Arc::new(ToastBuffer::create(&segment, 256).unwrap());
        let other = Arc::clone(&toast);
        assert_eq!(Arc::strong_count(&toast), 2);
        drop(other);
        assert_eq!(Arc::strong_count(&toast), 1);
        drop(toast);
        assert!(!segment.stats().by_tag.contains_key(&BlockTag::ToastBuffer));
    }
}
