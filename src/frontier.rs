//! Frontier / Scheduler (C5): a bounded, order-preserving queue of pending
//! work items.
//!
//! Dequeue is strictly ascending by `OrderKey`; enqueue blocks once the
//! bounded depth is reached, up to `BackpressureTimeout`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;

use crate::error::{EngineError, EngineResult};
use crate::work_item::{OrderKey, WorkItem};

struct HeapEntry<S> {
    item: WorkItem<S>,
}

impl<S> PartialEq for HeapEntry<S> {
    fn eq(&self, other: &Self) -> bool {
        self.item.order_key == other.item.order_key
    }
}
impl<S> Eq for HeapEntry<S> {}

impl<S> PartialOrd for HeapEntry<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for HeapEntry<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest OrderKey sorts
        // to the top, giving ascending dequeue order.
        other.item.order_key.cmp(&self.item.order_key)
    }
}

/// Bounded, ascending-`OrderKey` work queue.
pub struct Frontier<S> {
    heap: parking_lot::Mutex<BinaryHeap<HeapEntry<S>>>,
    depth_permits: Semaphore,
    not_empty: Notify,
}

impl<S: Send + 'static> Frontier<S> {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            heap: parking_lot::Mutex::new(BinaryHeap::new()),
            depth_permits: Semaphore::new(queue_depth),
            not_empty: Notify::new(),
        }
    }

    /// Blocks while the frontier is at its bound, up to `backpressure_timeout`.
    pub async fn enqueue(
        &self,
        item: WorkItem<S>,
        backpressure_timeout: Duration,
    ) -> EngineResult<()> {
        let permit = timeout(backpressure_timeout, self.depth_permits.acquire())
            .await
            .map_err(|_| EngineError::Backpressure)?
            .map_err(|_| EngineError::Backpressure)?;
        permit.forget();
        self.heap.lock().push(HeapEntry { item });
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pops the item with the smallest `OrderKey`, waiting if the
    /// frontier is currently empty. Returns `None` if `shutdown` is
    /// signalled first (via the notify being woken with nothing to pop
    /// twice in a row is not sufficient on its own — callers pass their
    /// own cancellation check alongside this future).
    pub async fn dequeue(&self) -> WorkItem<S> {
        loop {
            if let Some(entry) = self.heap.lock().pop() {
                self.depth_permits.add_permits(1);
                return entry.item;
            }
            self.not_empty.notified().await;
        }
    }

    pub fn try_dequeue(&self) -> Option<WorkItem<S>> {
        let entry = self.heap.lock().pop();
        if entry.is_some() {
            self.depth_permits.add_permits(1);
        }
        entry.map(|e| e.item)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn peek_order_key(&self) -> Option<OrderKey> {
        self.heap.lock().peek().map(|e| e.item.order_key)
    }
}
