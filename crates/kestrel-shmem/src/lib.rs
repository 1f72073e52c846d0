//! Shared memory substrate for kestrel.
//!
//! This crate provides the allocation and handoff layer the cache runs on:
//! - One mapped segment carved into tagged, coalescing blocks
//! - RAII block handles with overrun detection
//! - Resource scopes that reclaim leaked blocks in dependency order
//! - Latches and timed condition waits
//! - A blocking message queue with one-way shutdown

mod block;
mod queue;
mod scope;
mod segment;
mod sync;

pub use block::{BlockRef, BlockTag, ShmemBlock};
pub use queue::MessageQueue;
pub use scope::ResourceScope;
pub use segment::{BlockInfo, SegmentStats, ShmemSegment, TagUsage, MIN_SEGMENT_SIZE, SPLIT_SLACK};
pub use sync::{wait_until, Latch, WaitResult};
