//! Storage locations and relation identity.

use serde::{Deserialize, Serialize};

/// Block number within a relation's heap.
pub type BlockNumber = u32;

/// Slot number within a heap block (1-based, 0 is invalid).
pub type OffsetNumber = u16;

/// Highest block number a heap may address.
pub const MAX_BLOCK_NUMBER: BlockNumber = 0xFFFF_FFFE;

/// Block number marking "no block".
pub const INVALID_BLOCK_NUMBER: BlockNumber = 0xFFFF_FFFF;

/// First valid slot number within a block.
pub const FIRST_OFFSET_NUMBER: OffsetNumber = 1;

/// Highest slot number a block may address.
pub const MAX_OFFSET_NUMBER: OffsetNumber = 0xFFFF;

/// Stable identifier of a row in the authoritative table.
///
/// Ordering is block-major then slot, which is the same order as the packed
/// `u64` representation. Column stores keep these packed values in their
/// storage-location array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemPointer {
    /// Heap block holding the row.
    pub block: BlockNumber,
    /// Slot within the block.
    pub offset: OffsetNumber,
}

impl ItemPointer {
    /// Invalid item pointer.
    pub const INVALID: ItemPointer = ItemPointer {
        block: INVALID_BLOCK_NUMBER,
        offset: 0,
    };

    /// Creates a new item pointer.
    pub fn new(block: BlockNumber, offset: OffsetNumber) -> Self {
        Self { block, offset }
    }

    /// Returns true if this points at a real slot.
    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK_NUMBER && self.offset != 0
    }

    /// Packs the location into a single u64 (block in the upper bits).
    #[inline(always)]
    pub fn as_u64(&self) -> u64 {
        ((self.block as u64) << 16) | (self.offset as u64)
    }

    /// Unpacks a location produced by [`ItemPointer::as_u64`].
    #[inline(always)]
    pub fn from_u64(value: u64) -> Self {
        Self {
            block: (value >> 16) as u32,
            offset: value as u16,
        }
    }
}

impl std::fmt::Display for ItemPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.block, self.offset)
    }
}

/// Database identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseId(pub u32);

/// Relation identifier, unique within a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationId(pub u32);

/// Key identifying a cached relation across the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationKey {
    pub database: DatabaseId,
    pub relation: RelationId,
}

impl RelationKey {
    /// Creates a new relation key.
    pub fn new(database: u32, relation: u32) -> Self {
        Self {
            database: DatabaseId(database),
            relation: RelationId(relation),
        }
    }
}

impl std::fmt::Display for RelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database.0, self.relation.0)
    }
}
