//! Process-wide table of cache heads.
//!
//! Heads are keyed by relation and kept in LRU order; every lookup touches
//! the entry. A full head table is never evicted on its own: eviction runs
//! only when creating a new head runs out of shared memory.
//!
//! The registry also owns the pending queue that change hooks feed and
//! columnizers drain, plus the latches used to wake those columnizers.
//! Closing the queue is the shutdown signal for every columnizer.

use crate::catalog::{Catalog, TableSource};
use crate::columnizer::{ColumnizerSlot, ColumnizerStatus};
use crate::head::CacheHead;
use crate::layout::ChunkLayout;
use crate::scan::CacheScan;
use kestrel_common::{CacheConfig, KestrelError, RelationKey, Result};
use kestrel_shmem::{MessageQueue, ShmemSegment};
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub heads: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub supersedes: u64,
    pub pending: usize,
}

struct RegistryCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    supersedes: AtomicU64,
}

/// The columnar cache of one process.
pub struct TCacheRegistry {
    config: CacheConfig,
    segment: Arc<ShmemSegment>,
    catalog: Arc<dyn Catalog>,
    source: Arc<dyn TableSource>,
    table: Mutex<LruCache<RelationKey, Arc<CacheHead>>>,
    pending: MessageQueue<Arc<CacheHead>>,
    columnizers: Mutex<Vec<Arc<ColumnizerSlot>>>,
    counters: RegistryCounters,
}

impl TCacheRegistry {
    /// Validates `config` and creates the shared segment.
    pub fn new(
        config: CacheConfig,
        catalog: Arc<dyn Catalog>,
        source: Arc<dyn TableSource>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let segment = ShmemSegment::from_config(&config)?;
        let pending = MessageQueue::new(&segment)?;
        info!(
            enabled = config.enabled,
            shmem_mb = config.shmem_size_mb,
            rows_per_chunk = config.rows_per_chunk,
            "Columnar cache initialized"
        );
        Ok(Arc::new(Self {
            config,
            segment,
            catalog,
            source,
            table: Mutex::new(LruCache::unbounded()),
            pending,
            columnizers: Mutex::new(Vec::new()),
            counters: RegistryCounters {
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                supersedes: AtomicU64::new(0),
            },
        }))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn segment(&self) -> &Arc<ShmemSegment> {
        &self.segment
    }

    pub(crate) fn source(&self) -> &Arc<dyn TableSource> {
        &self.source
    }

    /// Returns the head of `relation` without creating one.
    pub fn lookup(&self, relation: RelationKey) -> Option<Arc<CacheHead>> {
        if !self.config.enabled {
            return None;
        }
        self.table.lock().get(&relation).cloned()
    }

    /// Returns a head of `relation` caching at least `attnums`.
    ///
    /// A head missing some of the columns is superseded by a new head
    /// caching the union of both column sets. With `create` unset, only an
    /// existing head that covers `attnums` is returned.
    pub fn get_head(
        &self,
        relation: RelationKey,
        attnums: &[u16],
        create: bool,
    ) -> Result<Option<Arc<CacheHead>>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let mut wanted = attnums.to_vec();
        {
            let mut table = self.table.lock();
            if let Some(head) = table.get(&relation) {
                if head.covers(attnums) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(Arc::clone(head)));
                }
                wanted.extend(head.attnums());
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if !create {
            return Ok(None);
        }

        let shape = Arc::new(self.catalog.describe(relation)?);
        let layout = Arc::new(ChunkLayout::new(shape, &wanted, self.config.rows_per_chunk)?);
        let head = match self.create_head(relation, &layout) {
            Err(e) if e.is_out_of_memory() && self.evict_lru().is_some() => {
                self.create_head(relation, &layout)?
            }
            other => other?,
        };
        let head = Arc::new(head);

        let mut table = self.table.lock();
        if let Some(current) = table.get(&relation) {
            if current.covers(&wanted) {
                // Another backend installed an equivalent head first.
                return Ok(Some(Arc::clone(current)));
            }
        }
        if let Some((_, old)) = table.push(relation, Arc::clone(&head)) {
            old.mark_unlinked();
            old.release();
            self.counters.supersedes.fetch_add(1, Ordering::Relaxed);
            info!(
                relation = %relation,
                old = ?old.attnums(),
                new = ?head.attnums(),
                "Superseded cache head"
            );
        } else {
            info!(relation = %relation, attnums = ?head.attnums(), "Created cache head");
        }
        Ok(Some(head))
    }

    fn create_head(&self, relation: RelationKey, layout: &Arc<ChunkLayout>) -> Result<CacheHead> {
        CacheHead::new(
            relation,
            &self.segment,
            Arc::clone(layout),
            self.config.row_store_size,
            self.config.toast_init_size,
        )
    }

    /// Removes the head of `relation`. Returns false if none was cached.
    pub fn unlink(&self, relation: RelationKey) -> bool {
        let Some(head) = self.table.lock().pop(&relation) else {
            return false;
        };
        head.mark_unlinked();
        head.release();
        info!(relation = %relation, "Unlinked cache head");
        true
    }

    /// Unlinks the least recently used head. Returns its relation.
    pub fn evict_lru(&self) -> Option<RelationKey> {
        let (relation, head) = self.table.lock().pop_lru()?;
        head.mark_unlinked();
        head.release();
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        warn!(relation = %relation, "Evicted cache head to free shared memory");
        Some(relation)
    }

    /// Drops the cache of a dropped relation.
    pub fn on_relation_dropped(&self, relation: RelationKey) {
        self.unlink(relation);
    }

    /// Drops the cache of a relation whose definition changed. The next
    /// scan rebuilds it with the new shape.
    pub fn on_relation_altered(&self, relation: RelationKey) {
        self.unlink(relation);
    }

    /// Starts a scan of `relation` reading at least `attnums`.
    pub fn begin_scan(&self, relation: RelationKey, attnums: &[u16]) -> Result<CacheScan> {
        let head = self
            .get_head(relation, attnums, true)?
            .ok_or_else(|| KestrelError::RelationNotCached(relation.to_string()))?;
        Ok(CacheScan::begin(Arc::clone(self.source()), head))
    }

    // Pending work

    /// Queues `head` for a columnizer unless it is already queued, then
    /// wakes one.
    pub(crate) fn enqueue_pending(&self, head: &Arc<CacheHead>) {
        if head.try_mark_pending() && self.pending.enqueue(Arc::clone(head)).is_err() {
            head.clear_pending();
            debug!(relation = %head.key(), "Pending queue closed, changes stay staged");
            return;
        }
        self.wakeup_columnizer(false);
    }

    /// Pops the next head with pending work. Fails once the queue was shut
    /// down and drained.
    pub(crate) fn take_pending(&self) -> Result<Option<Arc<CacheHead>>> {
        match self.pending.try_dequeue() {
            Some(head) => {
                head.clear_pending();
                Ok(Some(head))
            }
            None if self.pending.is_closed() => Err(KestrelError::QueueClosed),
            None => Ok(None),
        }
    }

    /// Closes the pending queue and wakes every columnizer so it exits.
    /// Staged rows stay readable by scans but are no longer columnized.
    pub fn shutdown(&self) {
        if self.pending.is_closed() {
            return;
        }
        self.pending.shutdown();
        self.wakeup_columnizer(true);
        info!(pending = self.pending.len(), "Pending queue shut down");
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.pending.is_closed()
    }

    /// Returns the number of heads waiting for a columnizer.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Moves every non-empty active row store to its head's pending list
    /// and queues the head. Returns the number of heads queued.
    pub fn flush_row_stores(&self) -> usize {
        let mut queued = 0;
        for head in self.heads() {
            if head.rotate_active() {
                self.enqueue_pending(&head);
                queued += 1;
            }
        }
        if queued > 0 {
            debug!(heads = queued, "Flushed active row stores");
        }
        queued
    }

    // Columnizers

    pub(crate) fn register_columnizer(&self, slot: Arc<ColumnizerSlot>) {
        self.columnizers.lock().push(slot);
    }

    pub(crate) fn unregister_columnizers(&self, slots: &[Arc<ColumnizerSlot>]) {
        self.columnizers
            .lock()
            .retain(|s| !slots.iter().any(|other| Arc::ptr_eq(s, other)));
    }

    /// Sets the latch of an idle columnizer, or of every columnizer when
    /// `all` is set. Returns false if no columnizer is running.
    pub fn wakeup_columnizer(&self, all: bool) -> bool {
        let slots = self.columnizers.lock();
        if all {
            slots.iter().for_each(|s| s.wake());
            return !slots.is_empty();
        }
        match slots.iter().find(|s| s.is_idle()).or_else(|| slots.first()) {
            Some(slot) => {
                slot.wake();
                true
            }
            None => false,
        }
    }

    /// Returns what every running columnizer is doing.
    pub fn columnizer_status(&self) -> Vec<ColumnizerStatus> {
        self.columnizers.lock().iter().map(|s| s.status()).collect()
    }

    // Inspection

    /// Returns every head, most recently used first.
    pub fn heads(&self) -> Vec<Arc<CacheHead>> {
        self.table.lock().iter().map(|(_, head)| Arc::clone(head)).collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            heads: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            supersedes: self.counters.supersedes.load(Ordering::Relaxed),
            pending: self.pending.len(),
        }
    }
}

impl std::fmt::Debug for TCacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TCacheRegistry")
            .field("enabled", &self.config.enabled)
            .field("heads", &self.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TupleIter;
    use kestrel_common::{ColumnDesc, RowShape, TypeId};

    struct FixedCatalog;

    impl Catalog for FixedCatalog {
        fn describe(&self, relation: RelationKey) -> Result<RowShape> {
            if relation.relation.0 == 0 {
                return Err(KestrelError::RelationNotFound(relation.to_string()));
            }
            Ok(RowShape::new(vec![
                ColumnDesc::new("a", TypeId::Int32).not_null(),
                ColumnDesc::new("b", TypeId::Int64),
                ColumnDesc::new("c", TypeId::Text),
            ]))
        }
    }

    struct EmptySource;

    impl TableSource for EmptySource {
        fn scan(&self, _relation: RelationKey) -> Result<TupleIter<'_>> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn registry(config: CacheConfig) -> Arc<TCacheRegistry> {
        TCacheRegistry::new(config, Arc::new(FixedCatalog), Arc::new(EmptySource)).unwrap()
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            shmem_size_mb: 64,
            rows_per_chunk: 16,
            row_store_size: 64 * 1024,
            toast_init_size: 4096,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn test_get_head_reuses_and_supersedes() {
        let registry = registry(small_config());
        let rel = RelationKey::new(1, 10);

        assert!(registry.get_head(rel, &[1], false).unwrap().is_none());
        let first = registry.get_head(rel, &[1], true).unwrap().unwrap();
        let again = registry.get_head(rel, &[1], true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let wider = registry.get_head(rel, &[3], true).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &wider));
        assert_eq!(wider.attnums(), vec![1, 3]);
        assert!(first.is_unlinked());
        assert!(!wider.is_unlinked());
        assert_eq!(registry.len(), 1);

        let stats = registry.stats();
        assert_eq!(stats.supersedes, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_unknown_relation_and_column() {
        let registry = registry(small_config());
        let err = registry.get_head(RelationKey::new(1, 0), &[1], true).unwrap_err();
        assert!(matches!(err, KestrelError::RelationNotFound(_)));
        let err = registry.get_head(RelationKey::new(1, 5), &[9], true).unwrap_err();
        assert!(matches!(err, KestrelError::InvalidParameter { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_evict_lru_order() {
        let registry = registry(small_config());
        for rel in 1..=3 {
            registry.get_head(RelationKey::new(1, rel), &[1], true).unwrap();
        }
        // Touch relation 1 so relation 2 becomes the oldest.
        registry.lookup(RelationKey::new(1, 1));
        assert_eq!(registry.evict_lru(), Some(RelationKey::new(1, 2)));
        assert_eq!(registry.evict_lru(), Some(RelationKey::new(1, 3)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().evictions, 2);
    }

    #[test]
    fn test_disabled_cache() {
        let config = CacheConfig {
            enabled: false,
            ..small_config()
        };
        let registry = registry(config);
        let rel = RelationKey::new(1, 1);
        assert!(registry.get_head(rel, &[1], true).unwrap().is_none());
        assert!(registry.lookup(rel).is_none());
        assert!(matches!(
            registry.begin_scan(rel, &[1]),
            Err(KestrelError::RelationNotCached(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CacheConfig {
            rows_per_chunk: 1,
            ..small_config()
        };
        let result = TCacheRegistry::new(config, Arc::new(FixedCatalog), Arc::new(EmptySource));
        assert!(matches!(result, Err(KestrelError::InvalidParameter { .. })));
    }

    #[test]
    fn test_relation_dropped_unlinks() {
        let registry = registry(small_config());
        let rel = RelationKey::new(2, 7);
        let head = registry.get_head(rel, &[2], true).unwrap().unwrap();
        registry.on_relation_dropped(rel);
        assert!(head.is_unlinked());
        assert!(registry.lookup(rel).is_none());
        assert!(!registry.unlink(rel));
    }
}
