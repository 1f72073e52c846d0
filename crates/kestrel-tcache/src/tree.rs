//! T-tree of column-store chunks ordered by heap block range.
//!
//! Every node owns one chunk. In-order traversal visits chunks in strictly
//! increasing, non-overlapping block ranges, so a scan walks the table in
//! storage order by repeatedly asking for the chunk after the last one.
//!
//! Nodes live in a slab indexed by `u32`; slab capacity is charged to the
//! shared segment in blocks of [`NODES_PER_SLAB`] records. Released nodes
//! go back to a free pool and are reused before the slab grows.
//!
//! Structural changes (insert, split, merge, rotation) require `&mut self`,
//! which the owner grants only under its exclusive lock. Readers share the
//! tree and take a node's mutex just long enough to clone or patch its chunk.

use crate::column_store::ColumnStore;
use crate::constants::{NODE_RECORD_SIZE, NODES_PER_SLAB};
use crate::cow::make_mut;
use crate::layout::ChunkLayout;
use crate::row_store::RowRef;
use kestrel_common::{BlockNumber, ItemPointer, KestrelError, Result};
use kestrel_shmem::{BlockTag, ShmemBlock, ShmemSegment};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Stable handle to a tree node.
///
/// The generation changes whenever the node is released, so a handle kept
/// across a merge that recycled its node no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

struct TreeNode {
    /// None while the node sits in the free pool.
    chunk: Option<Mutex<Arc<ColumnStore>>>,
    left: Option<u32>,
    right: Option<u32>,
    l_depth: u32,
    r_depth: u32,
    generation: u32,
}

impl TreeNode {
    fn vacant() -> Self {
        Self {
            chunk: None,
            left: None,
            right: None,
            l_depth: 0,
            r_depth: 0,
            generation: 0,
        }
    }
}

/// Counters describing a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Nodes in use.
    pub nodes: usize,
    /// Height of the tree; 0 when empty.
    pub depth: u32,
    /// Rows held by all chunks, tombstones included.
    pub chunk_rows: usize,
    /// Tombstoned rows awaiting compaction.
    pub junk_rows: usize,
    /// Chunk splits, counting new nodes opened for rows outside a full
    /// node's range.
    pub splits: u64,
    /// Neighbor merges.
    pub merges: u64,
}

/// Snapshot of the fields insertion decides on.
#[derive(Clone, Copy)]
struct ChunkInfo {
    nrows: usize,
    min: BlockNumber,
    max: BlockNumber,
    full: bool,
}

pub struct ChunkTree {
    segment: Arc<ShmemSegment>,
    layout: Arc<ChunkLayout>,
    toast_init_size: usize,
    nodes: Vec<TreeNode>,
    free_nodes: Vec<u32>,
    slabs: Vec<ShmemBlock>,
    root: Option<u32>,
    splits: u64,
    merges: u64,
}

impl ChunkTree {
    /// Creates an empty tree whose chunks use `layout`.
    pub fn new(segment: Arc<ShmemSegment>, layout: Arc<ChunkLayout>, toast_init_size: usize) -> Self {
        Self {
            segment,
            layout,
            toast_init_size,
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            slabs: Vec::new(),
            root: None,
            splits: 0,
            merges: 0,
        }
    }

    /// Returns the layout of every chunk in the tree.
    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    /// Returns true if the tree holds no node.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Returns the number of nodes in use.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free_nodes.len()
    }

    /// Returns the tree height.
    pub fn depth(&self) -> u32 {
        self.depth_of(self.root)
    }

    // Node slab

    #[inline(always)]
    fn node(&self, index: u32) -> &TreeNode {
        &self.nodes[index as usize]
    }

    #[inline(always)]
    fn node_mut(&mut self, index: u32) -> &mut TreeNode {
        &mut self.nodes[index as usize]
    }

    fn id(&self, index: u32) -> NodeId {
        NodeId {
            index,
            generation: self.node(index).generation,
        }
    }

    fn resolve(&self, id: NodeId) -> Option<u32> {
        self.nodes
            .get(id.index as usize)
            .filter(|n| n.generation == id.generation && n.chunk.is_some())
            .map(|_| id.index)
    }

    /// Makes sure the next `alloc_node` cannot fail.
    fn reserve_node(&mut self) -> Result<()> {
        if !self.free_nodes.is_empty() {
            return Ok(());
        }
        let slab = self
            .segment
            .alloc(BlockTag::TreeNodes, NODES_PER_SLAB * NODE_RECORD_SIZE)?;
        self.slabs.push(slab);
        let first = self.nodes.len() as u32;
        self.nodes.extend((0..NODES_PER_SLAB).map(|_| TreeNode::vacant()));
        self.free_nodes
            .extend((first..first + NODES_PER_SLAB as u32).rev());
        Ok(())
    }

    fn alloc_node(&mut self, chunk: ColumnStore) -> Result<u32> {
        self.reserve_node()?;
        let index = self
            .free_nodes
            .pop()
            .ok_or_else(|| KestrelError::InvariantViolation("node pool empty after reserve".to_string()))?;
        let node = self.node_mut(index);
        node.chunk = Some(Mutex::new(Arc::new(chunk)));
        node.left = None;
        node.right = None;
        node.l_depth = 0;
        node.r_depth = 0;
        Ok(index)
    }

    fn release_node(&mut self, index: u32) {
        let node = self.node_mut(index);
        node.chunk = None;
        node.left = None;
        node.right = None;
        node.generation = node.generation.wrapping_add(1);
        self.free_nodes.push(index);
    }

    fn vacant(index: u32) -> KestrelError {
        KestrelError::InvariantViolation(format!("tree node {} is not in use", index))
    }

    fn chunk_of(&self, index: u32) -> Result<Arc<ColumnStore>> {
        self.node(index)
            .chunk
            .as_ref()
            .map(|chunk| Arc::clone(&chunk.lock()))
            .ok_or_else(|| Self::vacant(index))
    }

    fn chunk_slot(&mut self, index: u32) -> Result<&mut Arc<ColumnStore>> {
        self.nodes[index as usize]
            .chunk
            .as_mut()
            .map(Mutex::get_mut)
            .ok_or_else(|| Self::vacant(index))
    }

    fn info(&self, index: u32) -> Result<ChunkInfo> {
        let chunk = self.node(index).chunk.as_ref().ok_or_else(|| Self::vacant(index))?;
        let chunk = chunk.lock();
        Ok(ChunkInfo {
            nrows: chunk.nrows(),
            min: chunk.blkno_min(),
            max: chunk.blkno_max(),
            full: chunk.is_full(),
        })
    }

    fn bounds(&self, index: u32) -> Option<(BlockNumber, BlockNumber)> {
        let chunk = self.node(index).chunk.as_ref()?.lock();
        Some((chunk.blkno_min(), chunk.blkno_max()))
    }

    fn new_chunk(&self) -> Result<ColumnStore> {
        ColumnStore::create(&self.segment, Arc::clone(&self.layout), self.toast_init_size)
    }

    // Depth bookkeeping

    fn depth_of(&self, index: Option<u32>) -> u32 {
        index.map_or(0, |i| {
            let node = self.node(i);
            1 + node.l_depth.max(node.r_depth)
        })
    }

    fn refresh_depths(&mut self, index: u32) {
        let (left, right) = (self.node(index).left, self.node(index).right);
        let l_depth = self.depth_of(left);
        let r_depth = self.depth_of(right);
        let node = self.node_mut(index);
        node.l_depth = l_depth;
        node.r_depth = r_depth;
    }

    /// Applies at most one single rotation at `index`. Returns the root of
    /// the rebalanced subtree.
    fn rebalance(&mut self, index: u32) -> u32 {
        let node = self.node(index);
        if node.l_depth + 1 < node.r_depth {
            self.rotate_left(index)
        } else if node.r_depth + 1 < node.l_depth {
            self.rotate_right(index)
        } else {
            index
        }
    }

    fn rotate_left(&mut self, index: u32) -> u32 {
        let Some(pivot) = self.node(index).right else {
            return index;
        };
        let inner = self.node(pivot).left;
        self.node_mut(index).right = inner;
        self.refresh_depths(index);
        self.node_mut(pivot).left = Some(index);
        self.refresh_depths(pivot);
        trace!(node = index, pivot, "Rotated left");
        pivot
    }

    fn rotate_right(&mut self, index: u32) -> u32 {
        let Some(pivot) = self.node(index).left else {
            return index;
        };
        let inner = self.node(pivot).right;
        self.node_mut(index).left = inner;
        self.refresh_depths(index);
        self.node_mut(pivot).right = Some(index);
        self.refresh_depths(pivot);
        trace!(node = index, pivot, "Rotated right");
        pivot
    }

    /// Recomputes depths bottom-up along a root-to-node path, rotating
    /// wherever a subtree leans by more than one level.
    fn rebalance_path(&mut self, path: &[u32]) {
        for k in (0..path.len()).rev() {
            let index = path[k];
            self.refresh_depths(index);
            let subtree = self.rebalance(index);
            if subtree == index {
                continue;
            }
            match k.checked_sub(1).map(|p| path[p]) {
                None => self.root = Some(subtree),
                Some(parent) => self.replace_child(parent, index, Some(subtree)),
            }
        }
    }

    fn replace_child(&mut self, parent: u32, old: u32, new: Option<u32>) {
        let node = self.node_mut(parent);
        if node.left == Some(old) {
            node.left = new;
        } else if node.right == Some(old) {
            node.right = new;
        }
    }

    // Insertion

    /// Inserts a row into the chunk owning its block range.
    ///
    /// A full node whose range covers the row is split first; a row outside
    /// a full node's range with no child on that side opens a new child.
    pub fn insert(&mut self, row: RowRef<'_>) -> Result<()> {
        let Some(root) = self.root else {
            let mut chunk = self.new_chunk()?;
            chunk.insert_row(row)?;
            self.root = Some(self.alloc_node(chunk)?);
            return Ok(());
        };
        let mut path = vec![root];
        let result = self.descend_and_insert(row, &mut path);
        self.rebalance_path(&path);
        result
    }

    fn descend_and_insert(&mut self, row: RowRef<'_>, path: &mut Vec<u32>) -> Result<()> {
        let block = row.ctid.block;
        let mut cur = path[path.len() - 1];
        loop {
            let info = self.info(cur)?;
            let (left, right) = (self.node(cur).left, self.node(cur).right);

            if info.nrows == 0 && left.is_none() && right.is_none() {
                return self.insert_into(cur, row);
            }
            if block < info.min {
                match left {
                    None if !info.full => return self.insert_into(cur, row),
                    None => {
                        let child = self.spill(row)?;
                        self.node_mut(cur).left = Some(child);
                        return Ok(());
                    }
                    Some(left) => {
                        cur = left;
                        path.push(cur);
                    }
                }
            } else if block > info.max {
                match right {
                    None if !info.full => return self.insert_into(cur, row),
                    None => {
                        let child = self.spill(row)?;
                        self.node_mut(cur).right = Some(child);
                        return Ok(());
                    }
                    Some(right) => {
                        cur = right;
                        path.push(cur);
                    }
                }
            } else if !info.full {
                return self.insert_into(cur, row);
            } else {
                self.split_node(cur)?;
            }
        }
    }

    fn insert_into(&mut self, index: u32, row: RowRef<'_>) -> Result<()> {
        make_mut(self.chunk_slot(index)?)?.insert_row(row)
    }

    /// Opens a new leaf holding just `row`.
    fn spill(&mut self, row: RowRef<'_>) -> Result<u32> {
        let mut chunk = self.new_chunk()?;
        chunk.insert_row(row)?;
        let index = self.alloc_node(chunk)?;
        self.splits += 1;
        debug!(node = index, block = row.ctid.block, "Opened node for row outside full chunk");
        Ok(index)
    }

    /// Moves the highest block of a full node into a new right child that
    /// adopts the node's old right subtree.
    fn split_node(&mut self, index: u32) -> Result<()> {
        self.reserve_node()?;
        let upper = make_mut(self.chunk_slot(index)?)?.split()?;
        let (upper_min, upper_rows) = (upper.blkno_min(), upper.nrows());
        let new = self.alloc_node(upper)?;

        let old_right = self.node(index).right;
        self.node_mut(new).right = old_right;
        self.refresh_depths(new);
        let subtree = self.rebalance(new);
        self.node_mut(index).right = Some(subtree);
        self.refresh_depths(index);
        self.splits += 1;
        debug!(
            node = index,
            new,
            block = upper_min,
            rows = upper_rows,
            "Split chunk"
        );
        Ok(())
    }

    // Lookup

    /// Returns the first node whose range contains `block` or lies above it.
    pub fn find_next(&self, block: BlockNumber) -> Option<NodeId> {
        let mut cur = self.root;
        let mut fallback = None;
        while let Some(index) = cur {
            let (min, max) = self.bounds(index)?;
            let node = self.node(index);
            if block > max {
                cur = node.right;
            } else if node.left.is_none() || block >= min {
                return Some(self.id(index));
            } else {
                fallback = Some(index);
                cur = node.left;
            }
        }
        fallback.map(|index| self.id(index))
    }

    /// Returns the last node whose range contains `block` or lies below it.
    pub fn find_prev(&self, block: BlockNumber) -> Option<NodeId> {
        let mut cur = self.root;
        let mut fallback = None;
        while let Some(index) = cur {
            let (min, max) = self.bounds(index)?;
            let node = self.node(index);
            if block < min {
                cur = node.left;
            } else if node.right.is_none() || block <= max {
                return Some(self.id(index));
            } else {
                fallback = Some(index);
                cur = node.right;
            }
        }
        fallback.map(|index| self.id(index))
    }

    /// Returns the node whose range contains `block`.
    pub fn find_covering(&self, block: BlockNumber) -> Option<NodeId> {
        let id = self.find_next(block)?;
        let (min, max) = self.bounds(id.index)?;
        (min <= block && block <= max).then_some(id)
    }

    /// Returns true if some chunk holds the row at `ctid`.
    pub fn contains(&self, ctid: ItemPointer) -> bool {
        self.find_covering(ctid.block)
            .and_then(|id| self.chunk(id))
            .is_some_and(|chunk| chunk.header_of(ctid).is_some())
    }

    /// Returns the current chunk of a node.
    pub fn chunk(&self, id: NodeId) -> Option<Arc<ColumnStore>> {
        let index = self.resolve(id)?;
        self.chunk_of(index).ok()
    }

    /// Runs `f` on a private copy of the node's chunk under the node mutex
    /// and installs the copy. Returns None if the node no longer exists.
    ///
    /// Callers that only hold shared access to the tree use this to patch
    /// headers; the chunk's block range must not change.
    pub fn modify_chunk<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut ColumnStore) -> Result<R>,
    ) -> Result<Option<R>> {
        let Some(index) = self.resolve(id) else {
            return Ok(None);
        };
        let Some(slot) = self.node(index).chunk.as_ref() else {
            return Ok(None);
        };
        let mut chunk = slot.lock();
        f(make_mut(&mut chunk)?).map(Some)
    }

    // Maintenance

    /// Replaces a node's chunk with a compacted copy. Returns the row count
    /// after compaction.
    pub fn compact_node(&mut self, id: NodeId) -> Result<Option<usize>> {
        let Some(index) = self.resolve(id) else {
            return Ok(None);
        };
        let slot = self.chunk_slot(index)?;
        let before = slot.nrows();
        let compacted = slot.compact()?;
        let after = compacted.nrows();
        *slot = Arc::new(compacted);
        debug!(node = index, before, after, "Compacted chunk");
        Ok(Some(after))
    }

    /// Merges an under-filled node with its in-order successor, or failing
    /// that its predecessor. Returns true if a merge happened.
    ///
    /// Both chunks must be below half capacity and together below two
    /// thirds of it. The ancestor of the pair survives with the merged
    /// chunk; the descendant, which has at most one child on the far side,
    /// is spliced out and its node recycled.
    pub fn try_merge(&mut self, id: NodeId) -> Result<bool> {
        let Some(target) = self.resolve(id) else {
            return Ok(false);
        };
        let chunk = self.chunk_of(target)?;
        if chunk.live_rows() >= self.layout.nrooms() / 2 {
            return Ok(false);
        }

        let mut path = Vec::new();
        let mut succ_ancestor = None;
        let mut pred_ancestor = None;
        let mut cur = self.root;
        loop {
            let Some(index) = cur else {
                return Err(KestrelError::InvariantViolation(format!(
                    "node {} unreachable from the root",
                    target
                )));
            };
            path.push(index);
            if index == target {
                break;
            }
            let (min, max) = self.bounds(index).ok_or_else(|| Self::vacant(index))?;
            if chunk.blkno_max() < min {
                succ_ancestor = Some(index);
                cur = self.node(index).left;
            } else if chunk.blkno_min() > max {
                pred_ancestor = Some(index);
                cur = self.node(index).right;
            } else {
                return Err(KestrelError::InvariantViolation(format!(
                    "chunk ranges [{}, {}] and [{}, {}] overlap",
                    chunk.blkno_min(),
                    chunk.blkno_max(),
                    min,
                    max
                )));
            }
        }

        let merged = self.merge_with_successor(&path, succ_ancestor)?
            || self.merge_with_predecessor(&path, pred_ancestor)?;
        if merged {
            self.merges += 1;
        }
        Ok(merged)
    }

    fn mergeable(&self, a: &ColumnStore, b: &ColumnStore) -> bool {
        let nrooms = self.layout.nrooms();
        a.live_rows() < nrooms / 2
            && b.live_rows() < nrooms / 2
            && a.live_rows() + b.live_rows() < 2 * nrooms / 3
    }

    /// `path` runs from the root to the target node.
    fn merge_with_successor(&mut self, path: &[u32], ancestor: Option<u32>) -> Result<bool> {
        let target = path[path.len() - 1];
        let lower = self.chunk_of(target)?;

        if let Some(right) = self.node(target).right {
            let mut chain = path.to_vec();
            let mut donor = right;
            chain.push(donor);
            while let Some(left) = self.node(donor).left {
                donor = left;
                chain.push(donor);
            }
            let upper = self.chunk_of(donor)?;
            if !self.mergeable(&lower, &upper) {
                return Ok(false);
            }
            let merged = ColumnStore::merge(&lower, &upper)?;
            *self.chunk_slot(target)? = Arc::new(merged);
            chain.pop();
            let parent = chain[chain.len() - 1];
            let orphan = self.node(donor).right;
            self.replace_child(parent, donor, orphan);
            self.release_node(donor);
            self.rebalance_path(&chain);
            debug!(survivor = target, released = donor, "Merged chunk with successor");
            return Ok(true);
        }

        let Some(survivor) = ancestor else {
            return Ok(false);
        };
        let upper = self.chunk_of(survivor)?;
        if !self.mergeable(&lower, &upper) {
            return Ok(false);
        }
        let merged = ColumnStore::merge(&lower, &upper)?;
        *self.chunk_slot(survivor)? = Arc::new(merged);
        let chain = &path[..path.len() - 1];
        let orphan = self.node(target).left;
        self.replace_child(chain[chain.len() - 1], target, orphan);
        self.release_node(target);
        self.rebalance_path(chain);
        debug!(survivor, released = target, "Merged chunk into successor");
        Ok(true)
    }

    fn merge_with_predecessor(&mut self, path: &[u32], ancestor: Option<u32>) -> Result<bool> {
        let target = path[path.len() - 1];
        let upper = self.chunk_of(target)?;

        if let Some(left) = self.node(target).left {
            let mut chain = path.to_vec();
            let mut donor = left;
            chain.push(donor);
            while let Some(right) = self.node(donor).right {
                donor = right;
                chain.push(donor);
            }
            let lower = self.chunk_of(donor)?;
            if !self.mergeable(&lower, &upper) {
                return Ok(false);
            }
            let merged = ColumnStore::merge(&lower, &upper)?;
            *self.chunk_slot(target)? = Arc::new(merged);
            chain.pop();
            let parent = chain[chain.len() - 1];
            let orphan = self.node(donor).left;
            self.replace_child(parent, donor, orphan);
            self.release_node(donor);
            self.rebalance_path(&chain);
            debug!(survivor = target, released = donor, "Merged chunk with predecessor");
            return Ok(true);
        }

        let Some(survivor) = ancestor else {
            return Ok(false);
        };
        let lower = self.chunk_of(survivor)?;
        if !self.mergeable(&lower, &upper) {
            return Ok(false);
        }
        let merged = ColumnStore::merge(&lower, &upper)?;
        *self.chunk_slot(survivor)? = Arc::new(merged);
        let chain = &path[..path.len() - 1];
        let orphan = self.node(target).right;
        self.replace_child(chain[chain.len() - 1], target, orphan);
        self.release_node(target);
        self.rebalance_path(chain);
        debug!(survivor, released = target, "Merged chunk into predecessor");
        Ok(true)
    }

    /// Drops every node and returns the slabs to the segment.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free_nodes.clear();
        self.slabs.clear();
        self.root = None;
        self.splits = 0;
        self.merges = 0;
    }

    // Inspection

    /// Returns every node in in-order sequence.
    pub fn nodes_in_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.node_count());
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur.is_some() || !stack.is_empty() {
            while let Some(index) = cur {
                stack.push(index);
                cur = self.node(index).left;
            }
            if let Some(index) = stack.pop() {
                out.push(self.id(index));
                cur = self.node(index).right;
            }
        }
        out
    }

    /// Returns every chunk in block order.
    pub fn chunks_in_order(&self) -> Vec<Arc<ColumnStore>> {
        self.nodes_in_order()
            .into_iter()
            .filter_map(|id| self.chunk(id))
            .collect()
    }

    pub fn stats(&self) -> TreeStats {
        let chunks = self.chunks_in_order();
        TreeStats {
            nodes: chunks.len(),
            depth: self.depth(),
            chunk_rows: chunks.iter().map(|c| c.nrows()).sum(),
            junk_rows: chunks.iter().map(|c| c.njunks()).sum(),
            splits: self.splits,
            merges: self.merges,
        }
    }

    /// Verifies ordering and depth bookkeeping.
    pub fn check_invariants(&self) -> Result<()> {
        let mut prev_max: Option<BlockNumber> = None;
        for id in self.nodes_in_order() {
            let (min, max) = self.bounds(id.index).ok_or_else(|| Self::vacant(id.index))?;
            if min > max {
                return Err(KestrelError::InvariantViolation(format!(
                    "node {} has inverted range [{}, {}]",
                    id.index, min, max
                )));
            }
            if prev_max.is_some_and(|prev| prev >= min) {
                return Err(KestrelError::InvariantViolation(format!(
                    "node {} range [{}, {}] overlaps its predecessor",
                    id.index, min, max
                )));
            }
            prev_max = Some(max);
        }
        self.check_depth(self.root).map(|_| ())
    }

    fn check_depth(&self, index: Option<u32>) -> Result<u32> {
        let Some(index) = index else {
            return Ok(0);
        };
        let node = self.node(index);
        let l_depth = self.check_depth(node.left)?;
        let r_depth = self.check_depth(node.right)?;
        if (l_depth, r_depth) != (node.l_depth, node.r_depth) {
            return Err(KestrelError::InvariantViolation(format!(
                "node {} records depths ({}, {}) but has ({}, {})",
                index, node.l_depth, node.r_depth, l_depth, r_depth
            )));
        }
        Ok(1 + l_depth.max(r_depth))
    }
}

impl std::fmt::Debug for ChunkTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkTree")
            .field("nodes", &self.node_count())
            .field("depth", &self.depth())
            .field("splits", &self.splits)
            .field("merges", &self.merges)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::{ColumnDesc, Datum, HeapTuple, ItemPointer, OffsetNumber, RowShape, TypeId};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn shape() -> Arc<RowShape> {
        Arc::new(RowShape::new(vec![
            ColumnDesc::new("id", TypeId::Int64).not_null(),
            ColumnDesc::new("note", TypeId::Text),
        ]))
    }

    fn tree(nrooms: usize) -> ChunkTree {
        let segment = ShmemSegment::new(32 * 1024 * 1024).unwrap();
        let layout = Arc::new(ChunkLayout::new(shape(), &[1, 2], nrooms).unwrap());
        ChunkTree::new(segment, layout, 4096)
    }

    fn tuple(block: BlockNumber, offset: OffsetNumber) -> HeapTuple {
        HeapTuple::form(
            &shape(),
            ItemPointer::new(block, offset),
            5,
            &[Some(Datum::Int64(block as i64)), Some(Datum::Text(format!("b{}", block)))],
        )
        .unwrap()
    }

    fn ranges(tree: &ChunkTree) -> Vec<(BlockNumber, BlockNumber)> {
        tree.chunks_in_order()
            .iter()
            .map(|c| (c.blkno_min(), c.blkno_max()))
            .collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = tree(4);
        assert!(tree.is_empty());
        assert_eq!(tree.find_next(0), None);
        assert_eq!(tree.find_prev(u32::MAX), None);
        assert_eq!(tree.stats(), TreeStats::default());
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_append_order_rotates_root() {
        let mut tree = tree(4);
        for block in 1..=9 {
            tree.insert(RowRef::from(&tuple(block, 1))).unwrap();
        }
        tree.check_invariants().unwrap();
        let stats = tree.stats();
        assert_eq!(stats.nodes, 3);
        assert_eq!(stats.splits, 2);
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.chunk_rows, 9);
        assert_eq!(ranges(&tree), vec![(1, 4), (5, 8), (9, 9)]);

        let root = tree.root.unwrap();
        let root_chunk = tree.chunk_of(root).unwrap();
        assert_eq!((root_chunk.blkno_min(), root_chunk.blkno_max()), (5, 8));
    }

    #[test]
    fn test_full_node_splits_on_covered_row() {
        let mut tree = tree(4);
        for block in [2, 4, 6, 8] {
            tree.insert(RowRef::from(&tuple(block, 1))).unwrap();
        }
        tree.insert(RowRef::from(&tuple(5, 1))).unwrap();
        tree.check_invariants().unwrap();
        assert_eq!(tree.stats().splits, 1);
        assert_eq!(ranges(&tree), vec![(2, 6), (8, 8)]);
    }

    #[test]
    fn test_random_inserts_keep_order() {
        let mut tree = tree(8);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut ctids: Vec<(BlockNumber, OffsetNumber)> = (0..400)
            .map(|i| ((i / 3) as BlockNumber, (i % 3) as OffsetNumber + 1))
            .collect();
        ctids.shuffle(&mut rng);
        for (block, offset) in &ctids {
            tree.insert(RowRef::from(&tuple(*block, *offset))).unwrap();
        }
        tree.check_invariants().unwrap();

        let stats = tree.stats();
        assert_eq!(stats.chunk_rows, 400);
        let mut seen: Vec<_> = tree
            .chunks_in_order()
            .iter()
            .flat_map(|c| (0..c.nrows()).map(|i| c.ctid(i)).collect::<Vec<_>>())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 400);
        // Single rotations keep the height far below the node count.
        assert!(stats.depth as usize <= stats.nodes / 2 + 2);
    }

    #[test]
    fn test_find_next_and_prev() {
        let mut tree = tree(4);
        for block in (0..40).step_by(2) {
            tree.insert(RowRef::from(&tuple(block, 1))).unwrap();
        }
        let chunks = tree.chunks_in_order();
        for block in 0..45 {
            let expect_next = chunks.iter().find(|c| c.blkno_max() >= block).map(|c| c.blkno_min());
            let got_next = tree.find_next(block).and_then(|id| tree.chunk(id)).map(|c| c.blkno_min());
            assert_eq!(got_next, expect_next, "find_next({})", block);

            let expect_prev = chunks.iter().rev().find(|c| c.blkno_min() <= block).map(|c| c.blkno_min());
            let got_prev = tree.find_prev(block).and_then(|id| tree.chunk(id)).map(|c| c.blkno_min());
            assert_eq!(got_prev, expect_prev, "find_prev({})", block);
        }
        assert!(tree.find_covering(1).is_some());
        assert!(tree.find_covering(7).is_none());
        assert!(tree.contains(ItemPointer::new(2, 1)));
        assert!(!tree.contains(ItemPointer::new(2, 9)));
        // Block 1 lies inside a chunk's range but holds no row.
        assert!(!tree.contains(ItemPointer::new(1, 1)));
        assert!(!tree.contains(ItemPointer::new(41, 1)));
    }

    #[test]
    fn test_modify_chunk_copies_on_write() {
        let mut tree = tree(4);
        tree.insert(RowRef::from(&tuple(3, 1))).unwrap();
        let id = tree.find_covering(3).unwrap();
        let before = tree.chunk(id).unwrap();

        let patched = tree
            .modify_chunk(id, |chunk| {
                let ctid = ItemPointer::new(3, 1);
                let mut header = chunk.header_of(ctid).unwrap();
                header.xmax = 77;
                Ok(chunk.patch_header(ctid, header))
            })
            .unwrap();
        assert_eq!(patched, Some(true));
        assert_eq!(before.header(0).xmax, 0);
        assert_eq!(tree.chunk(id).unwrap().header(0).xmax, 77);
    }

    #[test]
    fn test_compact_and_merge_with_successor() {
        let mut tree = tree(6);
        for block in 1..=12 {
            tree.insert(RowRef::from(&tuple(block, 1))).unwrap();
        }
        assert_eq!(ranges(&tree), vec![(1, 6), (7, 12)]);

        let first = tree.find_next(0).unwrap();
        tree.modify_chunk(first, |chunk| {
            for i in 0..chunk.nrows() - 1 {
                chunk.mark_tombstone(i)?;
            }
            Ok(())
        })
        .unwrap();
        let second = tree.find_next(7).unwrap();
        tree.modify_chunk(second, |chunk| {
            for i in 1..chunk.nrows() {
                chunk.mark_tombstone(i)?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(tree.compact_node(first).unwrap(), Some(1));
        assert_eq!(tree.compact_node(second).unwrap(), Some(1));
        assert!(tree.try_merge(first).unwrap());
        tree.check_invariants().unwrap();

        let stats = tree.stats();
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.merges, 1);
        assert_eq!(stats.chunk_rows, 2);
        // Compaction shrank both ranges to their survivors; the merge covers both.
        assert_eq!(ranges(&tree), vec![(6, 7)]);
        assert!(tree.chunk(first).is_some());
        assert!(tree.chunk(second).is_none());
    }

    #[test]
    fn test_merge_refused_when_too_full() {
        let mut tree = tree(6);
        for block in 1..=12 {
            tree.insert(RowRef::from(&tuple(block, 1))).unwrap();
        }
        let first = tree.find_next(0).unwrap();
        assert!(!tree.try_merge(first).unwrap());
        assert_eq!(tree.stats().nodes, 2);
    }

    #[test]
    fn test_clear_returns_slabs() {
        let mut tree = tree(4);
        for block in 0..20 {
            tree.insert(RowRef::from(&tuple(block, 1))).unwrap();
        }
        let segment = Arc::clone(&tree.segment);
        assert!(segment.stats().by_tag.contains_key(&BlockTag::TreeNodes));
        tree.clear();
        assert!(tree.is_empty());
        let stats = segment.stats();
        assert!(!stats.by_tag.contains_key(&BlockTag::TreeNodes));
        assert!(!stats.by_tag.contains_key(&BlockTag::ColumnStore));
    }
}
