//! Scans over a cache head.
//!
//! A scan returns column-store chunks in block order, then the staged row
//! stores (pending oldest first, then the active one). `prev` walks the
//! same sequence backwards.
//!
//! The scan holds the head's tree lock for its whole life: shared once the
//! head is built, exclusive while this scan is the one building it. The
//! tree therefore cannot change under a scan, and columnizers wait for it.
//! Shared acquisition is recursive: a thread already scanning a relation
//! can open another scan of it while a columnizer waits for the lock.

use crate::catalog::TableSource;
use crate::column_store::ColumnStore;
use crate::head::{BuildState, CacheHead};
use crate::row_store::{RowRef, RowStore};
use crate::tree::ChunkTree;
use kestrel_common::{BlockNumber, KestrelError, Result};
use parking_lot::RawRwLock;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use std::sync::Arc;
use tracing::{debug, info, warn};

type TreeReadGuard = ArcRwLockReadGuard<RawRwLock, ChunkTree>;
type TreeWriteGuard = ArcRwLockWriteGuard<RawRwLock, ChunkTree>;

/// One unit returned by a scan.
#[derive(Debug, Clone)]
pub enum ScanItem {
    /// A chunk of columnized rows.
    Columns(Arc<ColumnStore>),
    /// A row store of changes not yet columnized.
    Rows(Arc<RowStore>),
}

impl ScanItem {
    /// Returns the number of live rows in this item.
    pub fn live_rows(&self) -> usize {
        match self {
            ScanItem::Columns(chunk) => chunk.live_rows(),
            ScanItem::Rows(store) => store.live_rows(),
        }
    }
}

enum ScanLock {
    /// This scan owns the build and has not run it yet.
    Building(TreeWriteGuard),
    Reading(TreeReadGuard),
    /// The build failed; the scan returns nothing until rescanned.
    Released,
}

#[derive(Clone)]
enum Position {
    /// Fresh scan: `next` starts at the first item, `prev` at the last.
    Start,
    BeforeFirst,
    Chunk(Arc<ColumnStore>),
    Rows(usize),
    AfterLast,
}

/// A cursor over the cached copy of one relation.
pub struct CacheScan {
    source: Arc<dyn TableSource>,
    head: Arc<CacheHead>,
    lock: ScanLock,
    position: Position,
    /// Row stores, snapshotted the first time the scan reaches them.
    rows: Option<Vec<Arc<RowStore>>>,
}

impl CacheScan {
    /// Starts a scan, blocking while another scan builds the head.
    pub(crate) fn begin(source: Arc<dyn TableSource>, head: Arc<CacheHead>) -> Self {
        let lock = acquire(&head);
        Self {
            source,
            head,
            lock,
            position: Position::Start,
            rows: None,
        }
    }

    pub fn head(&self) -> &Arc<CacheHead> {
        &self.head
    }

    /// Returns the next item in block order.
    pub fn next(&mut self) -> Result<Option<ScanItem>> {
        self.ensure_built()?;
        if !matches!(self.lock, ScanLock::Reading(_)) {
            return Ok(None);
        }
        let first_store = match self.position.clone() {
            Position::AfterLast => return Ok(None),
            Position::Rows(index) => index + 1,
            Position::Start | Position::BeforeFirst => match self.chunk_from(0) {
                Some(chunk) => return Ok(Some(self.enter_chunk(chunk))),
                None => 0,
            },
            Position::Chunk(current) => {
                match current.blkno_max().checked_add(1).and_then(|b| self.chunk_from(b)) {
                    Some(chunk) => return Ok(Some(self.enter_chunk(chunk))),
                    None => 0,
                }
            }
        };
        if first_store < self.row_stores().len() {
            return Ok(Some(self.enter_rows(first_store)));
        }
        self.position = Position::AfterLast;
        Ok(None)
    }

    /// Returns the previous item, walking backwards.
    pub fn prev(&mut self) -> Result<Option<ScanItem>> {
        self.ensure_built()?;
        if !matches!(self.lock, ScanLock::Reading(_)) {
            return Ok(None);
        }
        let ceiling = match self.position.clone() {
            Position::BeforeFirst => return Ok(None),
            Position::Start | Position::AfterLast => match self.row_stores().len().checked_sub(1) {
                Some(last) => return Ok(Some(self.enter_rows(last))),
                None => Some(BlockNumber::MAX),
            },
            Position::Rows(index) => match index.checked_sub(1) {
                Some(prev) => return Ok(Some(self.enter_rows(prev))),
                None => Some(BlockNumber::MAX),
            },
            Position::Chunk(current) => current.blkno_min().checked_sub(1),
        };
        match ceiling.and_then(|b| self.chunk_before(b)) {
            Some(chunk) => Ok(Some(self.enter_chunk(chunk))),
            None => {
                self.position = Position::BeforeFirst;
                Ok(None)
            }
        }
    }

    /// Restarts the scan. An unfinished build is dropped and build intent
    /// re-acquired.
    pub fn rescan(&mut self) {
        match std::mem::replace(&mut self.lock, ScanLock::Released) {
            ScanLock::Reading(tree) => self.lock = ScanLock::Reading(tree),
            ScanLock::Building(mut tree) => {
                self.head.teardown(&mut tree);
                drop(tree);
                self.lock = acquire(&self.head);
            }
            ScanLock::Released => self.lock = acquire(&self.head),
        }
        self.position = Position::Start;
        self.rows = None;
    }

    /// Runs the build if this scan owns it. A failed build is reported as
    /// [`KestrelError::BuildAborted`] unless shared memory ran out.
    fn ensure_built(&mut self) -> Result<()> {
        let ScanLock::Building(tree) = &mut self.lock else {
            return Ok(());
        };
        let key = self.head.key();
        info!(relation = %key, "Building columnar cache");
        match build_tree(self.source.as_ref(), &self.head, tree) {
            Ok(rows) => {
                self.head.set_state(BuildState::Ready);
                info!(
                    relation = %key,
                    rows,
                    nodes = tree.node_count(),
                    depth = tree.depth(),
                    "Columnar cache ready"
                );
                // Let columnizers in between the build and the scan proper.
                self.lock = ScanLock::Released;
                self.lock = ScanLock::Reading(self.head.tree_lock().read_arc_recursive());
                Ok(())
            }
            Err(e) => {
                warn!(relation = %key, error = %e, "Columnar cache build aborted");
                self.head.teardown(tree);
                self.lock = ScanLock::Released;
                self.position = Position::AfterLast;
                // Out of memory stays recognizable so callers can read the table instead.
                if e.is_out_of_memory() {
                    Err(e)
                } else {
                    Err(KestrelError::BuildAborted(e.to_string()))
                }
            }
        }
    }

    fn row_stores(&mut self) -> &[Arc<RowStore>] {
        let head = &self.head;
        self.rows.get_or_insert_with(|| {
            head.staged_row_stores()
                .into_iter()
                .filter(|store| store.live_rows() > 0)
                .collect()
        })
    }

    fn enter_rows(&mut self, index: usize) -> ScanItem {
        let store = Arc::clone(&self.row_stores()[index]);
        self.position = Position::Rows(index);
        ScanItem::Rows(store)
    }

    fn enter_chunk(&mut self, chunk: Arc<ColumnStore>) -> ScanItem {
        self.position = Position::Chunk(Arc::clone(&chunk));
        ScanItem::Columns(chunk)
    }

    /// Returns the first non-empty chunk at or above `block`.
    fn chunk_from(&self, mut block: BlockNumber) -> Option<Arc<ColumnStore>> {
        let ScanLock::Reading(tree) = &self.lock else {
            return None;
        };
        loop {
            let chunk = tree.find_next(block).and_then(|id| tree.chunk(id))?;
            if !chunk.is_empty() {
                return Some(chunk);
            }
            block = chunk.blkno_max().checked_add(1)?;
        }
    }

    /// Returns the last non-empty chunk at or below `block`.
    fn chunk_before(&self, mut block: BlockNumber) -> Option<Arc<ColumnStore>> {
        let ScanLock::Reading(tree) = &self.lock else {
            return None;
        };
        loop {
            let chunk = tree.find_prev(block).and_then(|id| tree.chunk(id))?;
            if !chunk.is_empty() {
                return Some(chunk);
            }
            block = chunk.blkno_min().checked_sub(1)?;
        }
    }
}

impl Drop for CacheScan {
    fn drop(&mut self) {
        if let ScanLock::Building(tree) = &mut self.lock {
            debug!(relation = %self.head.key(), "Scan ended before its build, dropping tree");
            self.head.teardown(tree);
        }
    }
}

impl std::fmt::Debug for CacheScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lock = match &self.lock {
            ScanLock::Building(_) => "building",
            ScanLock::Reading(_) => "reading",
            ScanLock::Released => "released",
        };
        f.debug_struct("CacheScan")
            .field("relation", &self.head.key())
            .field("lock", &lock)
            .finish()
    }
}

/// Takes the tree lock of `head`, claiming the build if nobody has built
/// it. A scan that finds another build in progress waits for it and then
/// reads.
fn acquire(head: &Arc<CacheHead>) -> ScanLock {
    loop {
        let read = head.tree_lock().read_arc_recursive();
        if head.state() == BuildState::Ready {
            return ScanLock::Reading(read);
        }
        drop(read);

        let mut write = head.tree_lock().write_arc();
        match head.state() {
            BuildState::Ready => continue,
            BuildState::Building => {
                // A builder that vanished without cleaning up.
                head.teardown(&mut write);
            }
            BuildState::NotBuilt => {}
        }
        head.set_state(BuildState::Building);
        return ScanLock::Building(write);
    }
}

fn build_tree(source: &dyn TableSource, head: &CacheHead, tree: &mut ChunkTree) -> Result<usize> {
    let mut rows = 0;
    for tuple in source.scan(head.key())? {
        let tuple = tuple?;
        tree.insert(RowRef::from(&tuple))?;
        rows += 1;
    }
    Ok(rows)
}
