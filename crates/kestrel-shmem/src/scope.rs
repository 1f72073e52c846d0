//! Resource scopes: owners that reclaim leaked blocks on exit.

use crate::block::{BlockTag, ShmemBlock};
use crate::segment::ShmemSegment;
use kestrel_common::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An owner of arena blocks, such as one backend's transaction.
///
/// Blocks allocated through a scope record its id. If such a block is
/// detached from its handle and never re-attached (a handle passed to
/// another worker that died, for instance), releasing the scope frees it.
/// Cleanup runs in dependency order: execution buffers, then parameter
/// buffers, then queues.
pub struct ResourceScope {
    segment: Arc<ShmemSegment>,
    id: u64,
    released: AtomicBool,
}

impl ResourceScope {
    /// Opens a new scope on the segment.
    pub fn new(segment: &Arc<ShmemSegment>) -> Self {
        Self {
            segment: Arc::clone(segment),
            id: segment.next_scope_id(),
            released: AtomicBool::new(false),
        }
    }

    /// Returns the scope id recorded in block headers.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the segment this scope allocates from.
    pub fn segment(&self) -> &Arc<ShmemSegment> {
        &self.segment
    }

    /// Allocates a block owned by this scope.
    pub fn alloc(&self, tag: BlockTag, size: usize) -> Result<ShmemBlock> {
        self.segment.alloc_internal(tag, size, false, self.id)
    }

    /// Frees every detached block still owned by this scope. Returns the
    /// number of blocks reclaimed. Later calls are no-ops.
    pub fn release(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.segment.release_scope(self.id)
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceScope")
            .field("id", &self.id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}
