//! T-tree columnar cache for kestrel.
//!
//! This crate provides:
//! - Column-store chunks with toast buffers for variable-length values
//! - Row stores that stage changes in row layout
//! - A T-tree of chunks ordered by heap block range
//! - Cache heads with a NotBuilt/Building/Ready build state machine
//! - A registry of heads with LRU eviction and supersede on wider requests
//! - Scans over chunks and staged rows
//! - Change hooks for inserts, updates, deletes, truncates and page prunes
//! - Background columnizers that drain row stores into the tree

mod catalog;
mod column_store;
mod columnizer;
mod constants;
mod cow;
mod head;
mod layout;
mod registry;
mod row_store;
mod scan;
mod synchronizer;
mod toast;
mod tree;
mod vacuum;

pub use catalog::{Catalog, ItemState, PageItems, TableSource, TupleIter};
pub use column_store::ColumnStore;
pub use columnizer::{ColumnizerPool, ColumnizerStatus};
pub use cow::{Duplicate, make_mut};
pub use head::{BuildState, CacheHead, ColumnizeTask, HeadStats};
pub use layout::{CachedColumn, ChunkLayout};
pub use registry::{RegistryStats, TCacheRegistry};
pub use row_store::{RowRef, RowStore};
pub use scan::{CacheScan, ScanItem};
pub use toast::ToastBuffer;
pub use tree::{ChunkTree, NodeId, TreeStats};
pub use vacuum::PruneOutcome;
