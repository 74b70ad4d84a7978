//! The Michael–Scott queue core.

use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::err::PushError;
use crate::pool;
use crate::reclaim::{Epoch, Reclaim, Retired};

/// A queue node. Lives in a pool slot; `value` is initialized exactly while
/// the node carries a payload (linked behind the sentinel, not yet popped).
struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: MaybeUninit<T>,
}

/// Places a node into a fresh pool slot. `None` builds a sentinel whose
/// value stays uninitialized.
fn alloc_node<T>(value: Option<T>) -> *mut Node<T> {
    let node = pool::alloc::<Node<T>>();
    // SAFETY: the pool hands out an uninitialized slot sized for `Node<T>`.
    unsafe {
        ptr::write(
            node,
            Node {
                next: AtomicPtr::new(ptr::null_mut()),
                value: match value {
                    Some(value) => MaybeUninit::new(value),
                    None => MaybeUninit::uninit(),
                },
            },
        );
    }
    node
}

/// Returns a retired node's slot to the pool.
///
/// By the time a node is retired its value has been moved out (or was never
/// initialized), so only the slot itself goes back.
unsafe fn release_node<T>(ptr: *mut u8) {
    pool::dealloc(ptr.cast::<Node<T>>());
}

/// An unbounded MPMC FIFO queue with pluggable memory reclamation.
///
/// This is a Michael–Scott linked-list queue: producers link nodes behind
/// `tail` with a compare-and-swap, consumers advance `head` with another,
/// and a sentinel node keeps the list non-empty so neither end ever needs a
/// special empty case. The reclamation strategy `R` decides when a node
/// removed by a consumer is actually freed; see the [`reclaim`](crate::reclaim)
/// module for the available strategies.
///
/// The queue can be [closed](MpmcQueue::close). Closing is permanent and
/// only stops *new* elements from entering; consumers drain whatever is
/// already linked.
///
/// Elements pushed by one thread are popped in push order. No order is
/// guaranteed between elements of different producers.
///
/// # Examples
///
/// ```
/// use reclaim_queue::MpmcQueue;
///
/// let q = MpmcQueue::<i32>::new();
///
/// q.push(10).unwrap();
/// q.push(20).unwrap();
///
/// assert_eq!(q.pop(), Some(10));
/// assert_eq!(q.pop(), Some(20));
/// assert_eq!(q.pop(), None);
///
/// q.close();
/// assert!(q.push(30).is_err());
/// ```
pub struct MpmcQueue<T, R: Reclaim = Epoch> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    closed: AtomicBool,
    _marker: PhantomData<(T, fn() -> R)>,
}

unsafe impl<T: Send, R: Reclaim> Send for MpmcQueue<T, R> {}
unsafe impl<T: Send, R: Reclaim> Sync for MpmcQueue<T, R> {}

impl<T, R: Reclaim> MpmcQueue<T, R> {
    /// Creates a new, empty queue.
    ///
    /// # Examples
    ///
    /// ```
    /// use reclaim_queue::{MpmcQueue, reclaim::Hazard};
    ///
    /// let q = MpmcQueue::<String, Hazard>::new();
    /// assert!(q.is_empty());
    /// ```
    pub fn new() -> Self {
        let sentinel = alloc_node::<T>(None);
        MpmcQueue {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            closed: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    /// Pushes an element onto the back of the queue.
    ///
    /// Fails only when the queue is [closed](MpmcQueue::close); the rejected
    /// element comes back in the error. Lock-free: a stalled thread cannot
    /// prevent others from completing pushes.
    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        let _guard = R::pin();

        if self.is_closed() {
            return Err(PushError(value));
        }
        let node = alloc_node(Some(value));
        let backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // Publish before dereferencing, then make sure the publication
            // happened while `tail` was still current; a reclaimer scans
            // published slots before freeing, so a protected-and-revalidated
            // pointer cannot be freed under us.
            R::protect(0, tail.cast());
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            // SAFETY: protected above, or covered by the critical region.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if self.is_closed() {
                // Lost the race with `close`: unpublish the node we never
                // linked and hand the value back.
                // SAFETY: `node` is still exclusively ours.
                let value = unsafe { (*node).value.assume_init_read() };
                unsafe { pool::dealloc(node) };
                return Err(PushError(value));
            }
            if self.tail.load(Ordering::Acquire) != tail {
                continue;
            }

            if next.is_null() {
                // SAFETY: as above.
                let linked = unsafe {
                    (*tail)
                        .next
                        .compare_exchange(
                            ptr::null_mut(),
                            node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                };
                if linked {
                    // Swing `tail`; failure means someone helped us.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return Ok(());
                }
                backoff.snooze();
            } else {
                // `tail` lags; help it forward.
                let _ =
                    self.tail
                        .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                backoff.snooze();
            }
        }
    }

    /// Pops the element at the front of the queue, or returns `None` if the
    /// queue is observed empty. Never blocks.
    pub fn pop(&self) -> Option<T> {
        let _guard = R::pin();
        let backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire);
            R::protect(0, head.cast());
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `head` is protected and was revalidated.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if next.is_null() {
                return None;
            }

            // The successor needs its own protection: between the loads
            // above and the dereference below, another consumer may pop it
            // and retire it.
            R::protect(1, next.cast());
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }

            if head == tail {
                // Non-empty but `tail` still points at the sentinel; help.
                let _ =
                    self.tail
                        .compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
                backoff.snooze();
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: winning the CAS makes us the unique consumer of
                // `next`'s value. Slot-1 protection (or the critical
                // region) keeps `next` alive while we read it, even if
                // another consumer retires it right away.
                let value = unsafe { (*next).value.assume_init_read() };
                // The old sentinel is unreachable from the queue now.
                unsafe { R::retire(Retired::new(head.cast(), release_node::<T>)) };
                return Some(value);
            }
            backoff.snooze();
        }
    }

    /// Closes the queue, permanently.
    ///
    /// Subsequent pushes fail. Pushes that already linked their node
    /// complete normally, and consumers drain every linked element.
    /// Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` if the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` if the queue was observed empty.
    ///
    /// Like any size question about a concurrent queue, the answer may be
    /// stale by the time the caller inspects it.
    pub fn is_empty(&self) -> bool {
        let _guard = R::pin();
        loop {
            let head = self.head.load(Ordering::Acquire);
            R::protect(0, head.cast());
            if self.head.load(Ordering::Acquire) != head {
                continue;
            }
            // SAFETY: protected and revalidated.
            return unsafe { (*head).next.load(Ordering::Acquire) }.is_null();
        }
    }

    /// Hints that this thread holds no references into the queue.
    ///
    /// Forwarded to the reclamation strategy, which may use the opportunity
    /// to scan or advance. Call it from worker threads that are about to
    /// idle or exit.
    pub fn quiescent(&self) {
        R::quiescent();
    }
}

impl<T, R: Reclaim> Drop for MpmcQueue<T, R> {
    fn drop(&mut self) {
        // Exclusive access: no protection or atomicity needed. The sentinel
        // carries no value; every node behind it does.
        unsafe {
            let sentinel = self.head.load(Ordering::Relaxed);
            let mut node = (*sentinel).next.load(Ordering::Relaxed);
            pool::dealloc(sentinel);
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                (*node).value.assume_init_drop();
                pool::dealloc(node);
                node = next;
            }
        }
    }
}

impl<T, R: Reclaim> Default for MpmcQueue<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R: Reclaim> fmt::Debug for MpmcQueue<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("MpmcQueue { .. }")
    }
}
