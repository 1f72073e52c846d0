//! Blocking multi-producer, multi-consumer message queue.

use crate::block::{BlockTag, ShmemBlock};
use crate::scope::ResourceScope;
use crate::segment::ShmemSegment;
use crate::sync::wait_until;
use kestrel_common::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Arena footprint charged for a queue's control block.
const QUEUE_CONTROL_SIZE: usize = 64;

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO handoff queue between producers and consumers.
///
/// `dequeue` blocks with an optional timeout. `shutdown` is one-way: once
/// closed, `enqueue` fails and every blocked consumer is released.
pub struct MessageQueue<T> {
    _block: ShmemBlock,
    inner: Mutex<QueueInner<T>>,
    cond: Condvar,
}

impl<T> MessageQueue<T> {
    /// Creates a queue whose control block is charged to the segment.
    pub fn new(segment: &Arc<ShmemSegment>) -> Result<Self> {
        let block = segment.alloc(BlockTag::Queue, QUEUE_CONTROL_SIZE)?;
        Ok(Self::with_block(block))
    }

    /// Creates a queue owned by a resource scope.
    pub fn new_in(scope: &ResourceScope) -> Result<Self> {
        let block = scope.alloc(BlockTag::Queue, QUEUE_CONTROL_SIZE)?;
        Ok(Self::with_block(block))
    }

    fn with_block(block: ShmemBlock) -> Self {
        Self {
            _block: block,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Appends a message. Hands the message back if the queue is closed.
    pub fn enqueue(&self, msg: T) -> std::result::Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(msg);
        }
        inner.items.push_back(msg);
        self.cond.notify_one();
        Ok(())
    }

    /// Removes the oldest message, waiting up to `timeout` (forever if None).
    ///
    /// Returns None on timeout, or once the queue is closed and drained.
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        wait_until(&self.cond, &mut inner, deadline, |q| {
            !q.items.is_empty() || q.closed
        });
        inner.items.pop_front()
    }

    /// Removes the oldest message without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Returns the number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Returns true if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Returns true once the queue has been shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes the queue and wakes every blocked consumer.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.cond.notify_all();
    }
}

impl<T> std::fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MessageQueue")
            .field("len", &inner.items.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
