//! Change hooks that keep cached relations in step with the table.
//!
//! The table calls these after its own change is durable. Heads that are
//! not built ignore changes; the next build reads them from the table.
//! A head being built makes the hook wait until the build finishes.

use crate::registry::TCacheRegistry;
use crate::row_store::RowRef;
use kestrel_common::{HeapTuple, ItemPointer, RelationKey, Result, TransactionId};
use tracing::trace;

impl TCacheRegistry {
    /// Stages a newly inserted row.
    pub fn on_insert(&self, relation: RelationKey, tuple: &HeapTuple) -> Result<()> {
        let Some(head) = self.lookup(relation) else {
            return Ok(());
        };
        if head.append_row(RowRef::from(tuple))? == Some(true) {
            self.enqueue_pending(&head);
        }
        Ok(())
    }

    /// Marks the old version superseded by `xmax` and stages the new one.
    pub fn on_update(
        &self,
        relation: RelationKey,
        old: ItemPointer,
        xmax: TransactionId,
        tuple: &HeapTuple,
    ) -> Result<()> {
        let Some(head) = self.lookup(relation) else {
            return Ok(());
        };
        if !head.patch_row(old, |header| header.xmax = xmax)? {
            trace!(relation = %relation, ctid = ?old, "Updated row not cached");
        }
        if head.append_row(RowRef::from(tuple))? == Some(true) {
            self.enqueue_pending(&head);
        }
        Ok(())
    }

    /// Marks a deleted row superseded by `xmax`.
    pub fn on_delete(&self, relation: RelationKey, ctid: ItemPointer, xmax: TransactionId) -> Result<()> {
        let Some(head) = self.lookup(relation) else {
            return Ok(());
        };
        if !head.patch_row(ctid, |header| header.xmax = xmax)? {
            trace!(relation = %relation, ctid = ?ctid, "Deleted row not cached");
        }
        Ok(())
    }

    /// Drops the whole cache of a truncated relation.
    pub fn on_truncate(&self, relation: RelationKey) {
        self.unlink(relation);
    }
}
