//! kestrel common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all kestrel components:
//! - Error type and result alias
//! - Cache configuration
//! - Storage locations and relation identity
//! - Column types, values, and row shapes
//! - Tuple headers and heap tuples

pub mod config;
pub mod datum;
pub mod error;
pub mod location;
pub mod shape;
pub mod tuple;
pub mod types;

pub use config::CacheConfig;
pub use datum::Datum;
pub use error::{KestrelError, Result};
pub use location::{BlockNumber, ItemPointer, OffsetNumber, RelationKey};
pub use shape::{ColumnDesc, RowShape};
pub use tuple::{HeapTuple, TransactionId, TupleHeader};
pub use types::TypeId;
