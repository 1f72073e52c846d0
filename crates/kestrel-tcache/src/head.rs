//! Per-relation cache head.
//!
//! A head owns the chunk tree of one relation plus the row stores that
//! stage changes until a columnizer drains them into the tree.
//!
//! Lock order, outer to inner:
//! 1. `tree` (reader/writer). Shared for scans and change hooks, exclusive
//!    for builds, drains and compaction.
//! 2. A tree node's chunk mutex (see [`ChunkTree::modify_chunk`]).
//! 3. `rows`, held only to append, patch or swap a row store.
//!
//! The build state is changed only under the exclusive tree lock. It is
//! kept in an atomic so change hooks can skip heads that are not built
//! without touching the tree lock. A hook that finds a build in progress
//! waits for it on the shared lock, then stages its change.

use crate::catalog::PageItems;
use crate::constants::{HEAD_DESCRIPTOR_BASE, HEAD_DESCRIPTOR_PER_ATT};
use crate::cow::make_mut;
use crate::layout::ChunkLayout;
use crate::row_store::{RowRef, RowStore};
use crate::tree::{ChunkTree, NodeId};
use crate::vacuum::{self, PruneOutcome};
use kestrel_common::{
    BlockNumber, ItemPointer, KestrelError, RelationKey, Result, TupleHeader,
};
use kestrel_shmem::{BlockTag, ShmemBlock, ShmemSegment};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tracing::{debug, info, warn};

/// Build state of a cache head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuildState {
    /// No tree yet; the next scan builds one.
    NotBuilt = 0,
    /// A scan holds the exclusive lock and is loading the table.
    Building = 1,
    /// The tree mirrors the table; change hooks keep it current.
    Ready = 2,
}

impl BuildState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BuildState::Building,
            2 => BuildState::Ready,
            _ => BuildState::NotBuilt,
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildState::NotBuilt => write!(f, "not built"),
            BuildState::Building => write!(f, "building"),
            BuildState::Ready => write!(f, "ready"),
        }
    }
}

/// Rows staged for columnization plus chunks awaiting compaction.
#[derive(Default)]
struct StagedRows {
    active: Option<Arc<RowStore>>,
    /// Full row stores, oldest first.
    pending: VecDeque<Arc<RowStore>>,
    compaction: VecDeque<NodeId>,
}

impl StagedRows {
    fn clear(&mut self) {
        self.active = None;
        self.pending.clear();
        self.compaction.clear();
    }

    fn stores_mut(&mut self) -> impl Iterator<Item = &mut Arc<RowStore>> {
        self.pending.iter_mut().chain(self.active.iter_mut())
    }
}

/// One unit of columnizer work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnizeTask {
    /// The oldest pending row store was moved into the tree.
    DrainedRowStore { rows: usize },
    /// A chunk was compacted, and possibly merged with a neighbor.
    Compacted { rows: usize, merged: bool },
}

/// Point-in-time counters of a cache head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadStats {
    pub state: BuildState,
    pub nodes: usize,
    pub depth: u32,
    /// Rows in chunks, tombstones included.
    pub chunk_rows: usize,
    pub junk_rows: usize,
    /// Live rows in all row stores.
    pub row_store_rows: usize,
    pub pending_row_stores: usize,
    pub splits: u64,
    pub merges: u64,
}

/// The cached copy of one relation.
pub struct CacheHead {
    key: RelationKey,
    layout: Arc<ChunkLayout>,
    segment: Arc<ShmemSegment>,
    row_store_size: usize,
    _descriptor: ShmemBlock,
    state: AtomicU8,
    tree: Arc<RwLock<ChunkTree>>,
    rows: Mutex<StagedRows>,
    in_pending: AtomicBool,
    unlinked: AtomicBool,
}

impl CacheHead {
    /// Creates an unbuilt head caching the columns of `layout`.
    pub fn new(
        key: RelationKey,
        segment: &Arc<ShmemSegment>,
        layout: Arc<ChunkLayout>,
        row_store_size: usize,
        toast_init_size: usize,
    ) -> Result<Self> {
        let attnums = layout.attnums();
        let mut descriptor = segment.alloc(
            BlockTag::CacheHead,
            HEAD_DESCRIPTOR_BASE + HEAD_DESCRIPTOR_PER_ATT * attnums.len(),
        )?;
        {
            let buf = descriptor.as_mut_slice();
            buf[0..4].copy_from_slice(&key.database.0.to_le_bytes());
            buf[4..8].copy_from_slice(&key.relation.0.to_le_bytes());
            buf[8..10].copy_from_slice(&(attnums.len() as u16).to_le_bytes());
            buf[12..16].copy_from_slice(&(layout.nrooms() as u32).to_le_bytes());
            for (i, attnum) in attnums.iter().enumerate() {
                let pos = HEAD_DESCRIPTOR_BASE + i * HEAD_DESCRIPTOR_PER_ATT;
                buf[pos..pos + 2].copy_from_slice(&attnum.to_le_bytes());
            }
        }
        let tree = ChunkTree::new(Arc::clone(segment), Arc::clone(&layout), toast_init_size);
        Ok(Self {
            key,
            layout,
            segment: Arc::clone(segment),
            row_store_size,
            _descriptor: descriptor,
            state: AtomicU8::new(BuildState::NotBuilt as u8),
            tree: Arc::new(RwLock::new(tree)),
            rows: Mutex::new(StagedRows::default()),
            in_pending: AtomicBool::new(false),
            unlinked: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn key(&self) -> RelationKey {
        self.key
    }

    #[inline]
    pub fn layout(&self) -> &Arc<ChunkLayout> {
        &self.layout
    }

    /// Returns the cached attribute numbers in ascending order.
    pub fn attnums(&self) -> Vec<u16> {
        self.layout.attnums()
    }

    /// Returns true if every attribute in `attnums` is cached.
    pub fn covers(&self, attnums: &[u16]) -> bool {
        self.layout.covers(attnums)
    }

    /// Returns true once the head was removed from the registry.
    pub fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::Release);
    }

    pub fn state(&self) -> BuildState {
        BuildState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Caller must hold the exclusive tree lock.
    pub(crate) fn set_state(&self, state: BuildState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn tree_lock(&self) -> &Arc<RwLock<ChunkTree>> {
        &self.tree
    }

    /// Drops the tree and every staged row, reverting to NotBuilt.
    /// Caller must hold the exclusive tree lock.
    pub(crate) fn teardown(&self, tree: &mut ChunkTree) {
        tree.clear();
        self.rows.lock().clear();
        self.set_state(BuildState::NotBuilt);
    }

    /// Tears the head down if no scan or columnizer is using it. Used when
    /// the head is unlinked; otherwise memory returns when the last holder
    /// drops its reference.
    pub(crate) fn release(&self) {
        self.rows.lock().clear();
        if let Some(mut tree) = self.tree.try_write() {
            self.teardown(&mut tree);
        }
    }

    // Pending-queue membership

    /// Returns true if the caller won the right to queue this head.
    pub(crate) fn try_mark_pending(&self) -> bool {
        !self.in_pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_pending(&self) {
        self.in_pending.store(false, Ordering::Release);
    }

    /// Returns true if a row store or a compaction awaits a columnizer.
    pub fn has_pending_work(&self) -> bool {
        let rows = self.rows.lock();
        !rows.pending.is_empty() || !rows.compaction.is_empty()
    }

    /// Returns pending row stores oldest first, then the active one.
    pub fn staged_row_stores(&self) -> Vec<Arc<RowStore>> {
        let rows = self.rows.lock();
        rows.pending.iter().chain(rows.active.iter()).cloned().collect()
    }

    /// Moves a non-empty active row store to the pending list. Returns true
    /// if one was moved.
    pub(crate) fn rotate_active(&self) -> bool {
        let mut rows = self.rows.lock();
        match rows.active.take() {
            Some(store) if !store.is_empty() => {
                rows.pending.push_back(store);
                true
            }
            other => {
                rows.active = other;
                false
            }
        }
    }

    // Change hooks

    /// Takes the shared tree lock for a change hook, waiting out a build in
    /// progress. Returns None if the head holds no tree once the lock is
    /// taken; a failed build leaves the change to the next build.
    fn lock_for_change(&self) -> Option<RwLockReadGuard<'_, ChunkTree>> {
        if self.state() == BuildState::NotBuilt {
            return None;
        }
        let tree = self.tree.read_recursive();
        (self.state() == BuildState::Ready).then_some(tree)
    }

    /// Stages a new row. Returns None if the head is not built, otherwise
    /// whether a full row store was rotated out.
    pub fn append_row(&self, row: RowRef<'_>) -> Result<Option<bool>> {
        let Some(tree) = self.lock_for_change() else {
            return Ok(None);
        };
        if tree.contains(row.ctid) {
            // The build that just finished already read this row.
            return Ok(Some(false));
        }
        let mut rows = self.rows.lock();
        if let Some(active) = rows.active.as_mut() {
            if make_mut(active)?.insert(row) {
                return Ok(Some(false));
            }
        }

        let mut fresh = RowStore::create(&self.segment, self.row_store_size)?;
        if !fresh.insert(row) {
            return Err(KestrelError::MalformedRow(format!(
                "row of {} bytes exceeds the row store size {}",
                row.data.len(),
                self.row_store_size
            )));
        }
        let rotated = match rows.active.replace(Arc::new(fresh)) {
            Some(full) => {
                rows.pending.push_back(full);
                true
            }
            None => false,
        };
        if rotated {
            debug!(
                relation = %self.key,
                pending = rows.pending.len(),
                "Rotated full row store"
            );
        }
        Ok(Some(rotated))
    }

    /// Rewrites the header of the cached row at `ctid`, wherever it is
    /// staged. Returns false if the head does not hold the row.
    pub fn patch_row(&self, ctid: ItemPointer, f: impl Fn(&mut TupleHeader)) -> Result<bool> {
        let Some(tree) = self.lock_for_change() else {
            return Ok(false);
        };
        if let Some(id) = tree.find_covering(ctid.block) {
            let held = tree
                .chunk(id)
                .is_some_and(|chunk| chunk.header_of(ctid).is_some());
            if held {
                let patched = tree.modify_chunk(id, |chunk| {
                    let Some(mut header) = chunk.header_of(ctid) else {
                        return Ok(false);
                    };
                    f(&mut header);
                    Ok(chunk.patch_header(ctid, header))
                })?;
                return Ok(patched.unwrap_or(false));
            }
        }

        let mut rows = self.rows.lock();
        for store in rows.stores_mut() {
            let Some(header) = store.find(ctid).and_then(|i| store.get(i)).map(|r| r.header) else {
                continue;
            };
            let mut header = header;
            f(&mut header);
            return Ok(make_mut(store)?.find_and_patch(ctid, header));
        }
        Ok(false)
    }

    /// Applies a heap page prune. Chunks that gain tombstones are queued
    /// for compaction.
    pub fn prune_page(&self, block: BlockNumber, items: &dyn PageItems) -> Result<PruneOutcome> {
        let mut outcome = PruneOutcome::default();
        let Some(tree) = self.lock_for_change() else {
            return Ok(outcome);
        };

        let mut compact = None;
        if let Some(id) = tree.find_covering(block) {
            let needed = tree
                .chunk(id)
                .is_some_and(|chunk| vacuum::chunk_needs_prune(&chunk, block, items));
            if needed {
                if let Some(pruned) = tree.modify_chunk(id, |chunk| vacuum::prune_chunk(chunk, block, items))? {
                    if pruned.tombstoned > 0 {
                        compact = Some(id);
                    }
                    outcome.absorb(pruned);
                }
            }
        }

        let mut rows = self.rows.lock();
        for store in rows.stores_mut() {
            let plan = vacuum::plan_row_store(store, block, items);
            if !plan.is_empty() {
                outcome.absorb(vacuum::apply_row_store(make_mut(store)?, &plan));
            }
        }
        if let Some(id) = compact {
            if !rows.compaction.contains(&id) {
                rows.compaction.push_back(id);
            }
        }
        Ok(outcome)
    }

    // Columnizer work

    /// Runs one unit of pending work under the exclusive tree lock.
    ///
    /// On failure the tree and staged rows are dropped and the head reverts
    /// to NotBuilt, so the next scan rebuilds from the table.
    pub fn run_pending_task(&self) -> Result<Option<ColumnizeTask>> {
        let mut tree = self.tree.write();
        if self.state() != BuildState::Ready {
            return Ok(None);
        }
        let result = self.run_task_locked(&mut tree);
        if let Err(e) = &result {
            warn!(relation = %self.key, error = %e, "Columnizer task failed, dropping cache");
            self.teardown(&mut tree);
        }
        result
    }

    fn run_task_locked(&self, tree: &mut ChunkTree) -> Result<Option<ColumnizeTask>> {
        let (store, compact) = {
            let mut rows = self.rows.lock();
            match rows.pending.pop_front() {
                Some(store) => (Some(store), None),
                None => (None, rows.compaction.pop_front()),
            }
        };

        if let Some(store) = store {
            let mut drained = 0;
            for row in store.iter() {
                if tree.contains(row.ctid) {
                    debug!(relation = %self.key, ctid = ?row.ctid, "Row already columnized");
                    continue;
                }
                tree.insert(row)?;
                drained += 1;
            }
            info!(relation = %self.key, rows = drained, nodes = tree.node_count(), "Drained row store");
            return Ok(Some(ColumnizeTask::DrainedRowStore { rows: drained }));
        }

        let Some(id) = compact else {
            return Ok(None);
        };
        let Some(rows) = tree.compact_node(id)? else {
            return Ok(None);
        };
        let merged = rows < self.layout.nrooms() / 2 && tree.try_merge(id)?;
        info!(relation = %self.key, rows, merged, "Compacted chunk");
        Ok(Some(ColumnizeTask::Compacted { rows, merged }))
    }

    pub fn stats(&self) -> HeadStats {
        let tree = self.tree.read_recursive().stats();
        let rows = self.rows.lock();
        HeadStats {
            state: self.state(),
            nodes: tree.nodes,
            depth: tree.depth,
            chunk_rows: tree.chunk_rows,
            junk_rows: tree.junk_rows,
            row_store_rows: rows
                .pending
                .iter()
                .chain(rows.active.iter())
                .map(|s| s.live_rows())
                .sum(),
            pending_row_stores: rows.pending.len(),
            splits: tree.splits,
            merges: tree.merges,
        }
    }
}

impl std::fmt::Debug for CacheHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHead")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("attnums", &self.attnums())
            .field("unlinked", &self.is_unlinked())
            .finish()
    }
}
