//! Queue types consumed by [`JobDispatcher::drain`](crate::JobDispatcher::drain).

use std::collections::VecDeque;
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Unbounded multi-producer multi-consumer blocking queue of work items.
///
/// Clones share the same underlying channel. A drain call holds a sender
/// for tombstone re-enqueueing, so consumers rely on the tombstone
/// contract for termination rather than channel disconnect.
pub struct ItemQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

// Manual impl: channel handles clone regardless of whether T does.
impl<T> Clone for ItemQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send> ItemQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) {
        // Cannot fail: this handle owns a receiver.
        let _ = self.tx.send(item);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocks until an item arrives. `None` only if every other handle to
    /// the queue is gone, which a drain call treats as a clean end of input.
    pub(crate) fn pop_blocking(&self) -> Option<T> {
        self.rx.recv().ok()
    }
}

impl<T: Send> Default for ItemQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Items whose processing failed, kept for a later pass.
///
/// Drained ahead of fresh queue items so retries take precedence over
/// head-of-queue fairness.
#[derive(Debug)]
pub struct RetryQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> RetryQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.lock_items().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.lock_items().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    /// Removes and returns everything, e.g. to re-seed a queue for a second
    /// drain pass.
    pub fn take_all(&self) -> Vec<T> {
        self.lock_items().drain(..).collect()
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_queue_is_fifo_for_a_single_consumer() {
        let queue = ItemQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.pop_blocking(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn clones_share_the_same_channel() {
        let queue = ItemQueue::new();
        let other = queue.clone();
        queue.push("a");
        assert_eq!(other.try_pop(), Some("a"));
    }

    #[test]
    fn item_queue_handles_clone_for_non_clone_items() {
        struct Opaque(u32);

        let queue = ItemQueue::new();
        let other = queue.clone();
        queue.push(Opaque(7));
        let popped = other.try_pop().map(|item| item.0);
        assert_eq!(popped, Some(7));
    }

    #[test]
    fn retry_queue_preserves_insertion_order() {
        let retry = RetryQueue::new();
        retry.push("first");
        retry.push("second");

        assert_eq!(retry.len(), 2);
        assert_eq!(retry.pop(), Some("first"));
        assert_eq!(retry.take_all(), vec!["second"]);
        assert!(retry.is_empty());
    }
}
