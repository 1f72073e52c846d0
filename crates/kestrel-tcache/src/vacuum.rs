//! Page-prune handling: tombstoning and relocating pruned rows.
//!
//! After the table prunes a heap page, every cached row on that page is
//! checked against the page's slot states. A slot that still holds its row
//! is left alone. A redirect chain ending at a live slot moves the row to
//! that slot. Anything else removes the row: chunks tombstone it for the
//! next compaction, row stores drop the entry.

use crate::catalog::{ItemState, PageItems};
use crate::column_store::ColumnStore;
use crate::registry::TCacheRegistry;
use crate::row_store::RowStore;
use kestrel_common::{BlockNumber, ItemPointer, OffsetNumber, RelationKey, Result};
use tracing::debug;

/// Where a pruned row ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Moved(OffsetNumber),
    Gone,
}

/// Counts of cached rows touched by one page prune.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Chunk rows marked vacuumed.
    pub tombstoned: usize,
    /// Rows whose slot moved within the page.
    pub relocated: usize,
    /// Row-store entries removed.
    pub removed: usize,
}

impl PruneOutcome {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.tombstoned == 0 && self.relocated == 0 && self.removed == 0
    }

    pub(crate) fn absorb(&mut self, other: PruneOutcome) {
        self.tombstoned += other.tombstoned;
        self.relocated += other.relocated;
        self.removed += other.removed;
    }
}

/// Follows a redirect chain from `offset`. Returns None if the row is
/// still in place.
pub(crate) fn resolve(items: &dyn PageItems, offset: OffsetNumber) -> Option<Resolution> {
    let mut cur = offset;
    for _ in 0..=OffsetNumber::MAX {
        match items.item(cur) {
            ItemState::Normal if cur == offset => return None,
            ItemState::Normal => return Some(Resolution::Moved(cur)),
            ItemState::Redirect(next) => cur = next,
            ItemState::Dead => return Some(Resolution::Gone),
        }
    }
    // A redirect cycle leaves no live slot.
    Some(Resolution::Gone)
}

/// Returns true if any row of `block` in the chunk needs pruning.
pub(crate) fn chunk_needs_prune(chunk: &ColumnStore, block: BlockNumber, items: &dyn PageItems) -> bool {
    if !chunk.covers_block(block) {
        return false;
    }
    (0..chunk.nrows()).any(|i| {
        let ctid = chunk.ctid(i);
        ctid.block == block && !chunk.header(i).is_tombstone() && resolve(items, ctid.offset).is_some()
    })
}

/// Applies a page prune to a private chunk copy.
pub(crate) fn prune_chunk(
    chunk: &mut ColumnStore,
    block: BlockNumber,
    items: &dyn PageItems,
) -> Result<PruneOutcome> {
    let mut outcome = PruneOutcome::default();
    chunk.sort();
    let Some(mut index) = chunk.find_next_record(ItemPointer::new(block, 0)) else {
        return Ok(outcome);
    };
    while index < chunk.nrows() && chunk.ctid(index).block == block {
        if !chunk.header(index).is_tombstone() {
            match resolve(items, chunk.ctid(index).offset) {
                None => {}
                Some(Resolution::Moved(offset)) => {
                    chunk.relocate(index, offset);
                    outcome.relocated += 1;
                }
                Some(Resolution::Gone) => {
                    chunk.mark_tombstone(index)?;
                    outcome.tombstoned += 1;
                }
            }
        }
        index += 1;
    }
    Ok(outcome)
}

/// Lists the row-store slots of `block` that need pruning.
pub(crate) fn plan_row_store(
    store: &RowStore,
    block: BlockNumber,
    items: &dyn PageItems,
) -> Vec<(usize, Resolution)> {
    if !store.covers_block(block) {
        return Vec::new();
    }
    (0..store.nrows())
        .filter_map(|i| {
            let row = store.get(i)?;
            if row.ctid.block != block {
                return None;
            }
            resolve(items, row.ctid.offset).map(|r| (i, r))
        })
        .collect()
}

/// Applies a plan from [`plan_row_store`] to a private row-store copy.
pub(crate) fn apply_row_store(store: &mut RowStore, plan: &[(usize, Resolution)]) -> PruneOutcome {
    let mut outcome = PruneOutcome::default();
    for &(index, resolution) in plan {
        match resolution {
            Resolution::Moved(offset) => {
                store.relocate(index, offset);
                outcome.relocated += 1;
            }
            Resolution::Gone => {
                store.remove(index);
                outcome.removed += 1;
            }
        }
    }
    outcome
}

impl TCacheRegistry {
    /// Applies a heap page prune to the cached copy of `relation`.
    ///
    /// Chunks that gain tombstones are queued for compaction and a
    /// columnizer is woken.
    pub fn on_page_prune(
        &self,
        relation: RelationKey,
        block: BlockNumber,
        items: &dyn PageItems,
    ) -> Result<PruneOutcome> {
        let Some(head) = self.lookup(relation) else {
            return Ok(PruneOutcome::default());
        };
        let outcome = head.prune_page(block, items)?;
        if outcome.tombstoned > 0 {
            debug!(
                relation = %relation,
                block,
                tombstoned = outcome.tombstoned,
                "Tombstoned pruned rows"
            );
            self.enqueue_pending(&head);
        }
        Ok(outcome)
    }
}
