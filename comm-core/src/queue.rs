//! An unbounded FIFO shared between tasks.
//!
//! [`BlockingQueue`] is the only state the sender, receiver and dispatcher
//! tasks share. Producers never wait; consumers suspend in
//! [`dequeue`](BlockingQueue::dequeue) until an item is available.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        // Every critical section is a single push or pop, so a panic elsewhere
        // cannot leave the deque half-modified
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item and wakes one waiting consumer, if there is one.
    pub fn enqueue(&self, item: T) {
        self.items().push_back(item);
        self.notify.notify_one();
    }

    /// Removes the oldest item, waiting until one exists.
    pub async fn dequeue(&self) -> T {
        loop {
            // Register interest before looking so an enqueue that lands
            // between the check and the await still wakes this consumer
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                return item;
            }
            notified.await;
        }
    }

    /// Removes the oldest item if there is one.
    pub fn try_dequeue(&self) -> Option<T> {
        self.items().pop_front()
    }

    /// A snapshot of the number of queued items. It may be stale by the time
    /// the caller looks at it.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued item.
    pub fn clear(&self) {
        self.items().clear();
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
