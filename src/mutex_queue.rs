use core::fmt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::err::PushError;

/// A coarse-grained locked queue with the same surface as
/// [`MpmcQueue`](crate::MpmcQueue).
///
/// Exists as the contended baseline for benchmarks and as the oracle for
/// differential tests: under a single lock the behavior is trivially
/// sequential, so any disagreement with the lock-free queue in a
/// single-threaded interleaving is a lock-free bug.
pub struct MutexQueue<T> {
    items: Mutex<VecDeque<T>>,
    closed: AtomicBool,
}

impl<T> MutexQueue<T> {
    /// Creates a new, empty queue.
    pub fn new() -> Self {
        MutexQueue {
            items: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Pushes an element, failing with the element if the queue is closed.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let mut items = self.items.lock().unwrap();
        if self.is_closed() {
            return Err(PushError(value));
        }
        items.push_back(value);
        Ok(())
    }

    /// Pops the front element, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Closes the queue, permanently. Idempotent.
    pub fn close(&self) {
        // Taking the lock orders the close against in-flight pushes, so a
        // push can never succeed after `close` returns.
        let _items = self.items.lock().unwrap();
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` if the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` if the queue was observed empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

impl<T> Default for MutexQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MutexQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("MutexQueue { .. }")
    }
}
