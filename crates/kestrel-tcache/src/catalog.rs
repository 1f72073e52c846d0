//! Interfaces to the collaborators the cache depends on.

use kestrel_common::{HeapTuple, OffsetNumber, RelationKey, Result, RowShape};

/// Resolves relations to their row shape.
pub trait Catalog: Send + Sync {
    /// Returns the row shape of `relation`.
    fn describe(&self, relation: RelationKey) -> Result<RowShape>;
}

/// Iterator over a relation's rows, in storage order.
pub type TupleIter<'a> = Box<dyn Iterator<Item = Result<HeapTuple>> + Send + 'a>;

/// Supplies the authoritative rows of a relation for a cache build.
pub trait TableSource: Send + Sync {
    /// Starts a sequential scan of `relation`.
    fn scan(&self, relation: RelationKey) -> Result<TupleIter<'_>>;
}

/// State of one slot on a pruned heap page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// The slot still holds its row.
    Normal,
    /// The slot forwards to another slot on the same page.
    Redirect(OffsetNumber),
    /// The row is gone.
    Dead,
}

/// Slot states of a heap page after pruning.
pub trait PageItems {
    fn item(&self, offset: OffsetNumber) -> ItemState;
}
