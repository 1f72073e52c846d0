//! Background columnizers.
//!
//! Each worker sleeps on its latch for at most the configured naptime,
//! then drains the registry's pending queue one task at a time. A head
//! with more work left is queued again, so several workers share the
//! load of a busy head without ever running two of its tasks at once;
//! the head's exclusive tree lock serializes them.
//!
//! A naptime expiry also flushes every active row store, so staged rows
//! reach the tree even when no row store ever fills up.
//!
//! Workers run until the registry's pending queue is shut down.

use crate::head::ColumnizeTask;
use crate::registry::TCacheRegistry;
use kestrel_common::{KestrelError, RelationKey, Result};
use kestrel_shmem::{Latch, WaitResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// What one columnizer is doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnizerStatus {
    pub index: usize,
    /// Relation being processed, if any.
    pub relation: Option<RelationKey>,
    pub tasks_done: u64,
}

/// Shared state of one worker, visible to the registry.
pub(crate) struct ColumnizerSlot {
    index: usize,
    latch: Latch,
    current: Mutex<Option<RelationKey>>,
    tasks_done: AtomicU64,
}

impl ColumnizerSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            latch: Latch::new(),
            current: Mutex::new(None),
            tasks_done: AtomicU64::new(0),
        }
    }

    pub(crate) fn wake(&self) {
        self.latch.set();
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.current.lock().is_none()
    }

    pub(crate) fn status(&self) -> ColumnizerStatus {
        ColumnizerStatus {
            index: self.index,
            relation: *self.current.lock(),
            tasks_done: self.tasks_done.load(Ordering::Relaxed),
        }
    }
}

/// A running set of columnizer threads. Dropping the pool stops them
/// and shuts the registry's pending queue down.
pub struct ColumnizerPool {
    registry: Arc<TCacheRegistry>,
    slots: Vec<Arc<ColumnizerSlot>>,
    workers: Vec<JoinHandle<()>>,
}

impl ColumnizerPool {
    /// Starts `num_columnizers` workers for `registry`. Fails with
    /// [`KestrelError::QueueClosed`] once the registry was shut down.
    pub fn start(registry: &Arc<TCacheRegistry>) -> Result<Self> {
        if registry.is_shut_down() {
            return Err(KestrelError::QueueClosed);
        }
        let count = registry.config().num_columnizers;
        let naptime = Duration::from_millis(registry.config().columnizer_naptime_ms);
        let mut pool = Self {
            registry: Arc::clone(registry),
            slots: Vec::with_capacity(count),
            workers: Vec::with_capacity(count),
        };
        for index in 0..count {
            let slot = Arc::new(ColumnizerSlot::new(index));
            let worker = Worker {
                registry: Arc::clone(registry),
                slot: Arc::clone(&slot),
                naptime,
            };
            // On spawn failure, dropping `pool` stops the workers already running.
            let handle = thread::Builder::new()
                .name(format!("kestrel-columnizer-{}", index))
                .spawn(move || worker.run())?;
            registry.register_columnizer(Arc::clone(&slot));
            pool.slots.push(slot);
            pool.workers.push(handle);
        }
        info!(workers = count, naptime_ms = naptime.as_millis() as u64, "Started columnizers");
        Ok(pool)
    }

    /// Returns the number of running workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns the number of workers that have not exited yet.
    pub fn running(&self) -> usize {
        self.workers.iter().filter(|handle| !handle.is_finished()).count()
    }

    /// Stops every worker and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.registry.shutdown();
        for slot in &self.slots {
            slot.wake();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Columnizer thread panicked");
            }
        }
        self.registry.unregister_columnizers(&self.slots);
        info!("Stopped columnizers");
    }
}

impl Drop for ColumnizerPool {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

impl std::fmt::Debug for ColumnizerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnizerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

struct Worker {
    registry: Arc<TCacheRegistry>,
    slot: Arc<ColumnizerSlot>,
    naptime: Duration,
}

impl Worker {
    fn run(self) {
        debug!(worker = self.slot.index, "Columnizer started");
        loop {
            let woken = self.slot.latch.wait(self.naptime);
            self.slot.latch.reset();
            if woken == WaitResult::TimedOut && !self.registry.is_shut_down() {
                self.registry.flush_row_stores();
            }
            if let Err(e) = self.drain_pending() {
                debug!(worker = self.slot.index, reason = %e, "Columnizer stopping");
                break;
            }
        }
        debug!(worker = self.slot.index, "Columnizer exiting");
    }

    /// Runs queued tasks until the queue is empty. Fails once the queue
    /// is shut down.
    fn drain_pending(&self) -> Result<()> {
        if self.registry.is_shut_down() {
            return Err(KestrelError::QueueClosed);
        }
        while let Some(head) = self.registry.take_pending()? {
            if self.registry.is_shut_down() {
                return Err(KestrelError::QueueClosed);
            }
            if head.is_unlinked() {
                continue;
            }
            *self.slot.current.lock() = Some(head.key());
            match head.run_pending_task() {
                Ok(Some(task)) => {
                    self.slot.tasks_done.fetch_add(1, Ordering::Relaxed);
                    match task {
                        ColumnizeTask::DrainedRowStore { rows } => {
                            debug!(worker = self.slot.index, relation = %head.key(), rows, "Columnized rows");
                        }
                        ColumnizeTask::Compacted { rows, merged } => {
                            debug!(worker = self.slot.index, relation = %head.key(), rows, merged, "Compacted");
                        }
                    }
                    if head.has_pending_work() {
                        self.registry.enqueue_pending(&head);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = self.slot.index, relation = %head.key(), error = %e, "Columnizer task failed");
                }
            }
            *self.slot.current.lock() = None;
        }
        Ok(())
    }
}
