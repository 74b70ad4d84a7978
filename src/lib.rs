//! An unbounded MPMC FIFO queue with pluggable safe memory reclamation.
//!
//! The centerpiece is [`MpmcQueue`], a Michael–Scott linked-list queue:
//! producers link nodes at the tail, consumers unlink at the head, and all
//! progress is made with compare-and-swap rather than locks. What makes
//! such a queue hard is not the linking but the *unlinking*: a node removed
//! from the list may still be dereferenced by a thread that read its
//! address a moment earlier, so freeing it immediately risks use-after-free
//! and the ABA problem. The queue therefore hands removed nodes to a
//! reclamation strategy chosen at compile time:
//!
//! * [`reclaim::Hazard`] — hazard pointers: readers publish the addresses
//!   they are about to dereference; a retired node is freed once no
//!   published slot names it.
//! * [`reclaim::Epoch`] — epoch-based reclamation: readers announce the
//!   global generation they entered under; a retired node is freed two
//!   generations later.
//! * [`reclaim::Leak`] — never frees; the correctness baseline.
//!
//! Freed nodes do not return to the system allocator but to a two-level
//! slot pool (per-thread cache over a process-wide free list), so steady
//! state push/pop traffic allocates nothing.
//!
//! A [`MutexQueue`] with the same surface serves as the locked baseline,
//! and the `bench-queue` binary drives both under configurable
//! producer/consumer loads.
//!
//! # Examples
//!
//! ```
//! use reclaim_queue::{MpmcQueue, reclaim::Hazard};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let q = Arc::new(MpmcQueue::<u64, Hazard>::new());
//!
//! let producer = {
//!     let q = Arc::clone(&q);
//!     thread::spawn(move || {
//!         for i in 0..1000 {
//!             q.push(i).unwrap();
//!         }
//!         q.close();
//!     })
//! };
//!
//! let mut received = 0;
//! loop {
//!     match q.pop() {
//!         Some(_) => received += 1,
//!         None if q.is_closed() => break,
//!         None => thread::yield_now(),
//!     }
//! }
//! producer.join().unwrap();
//! assert_eq!(received, 1000);
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

mod backoff;
mod err;
mod mutex_queue;
mod pool;
mod queue;
pub mod reclaim;

pub use crate::backoff::Backoff;
pub use crate::err::PushError;
pub use crate::mutex_queue::MutexQueue;
pub use crate::queue::MpmcQueue;
pub use crate::reclaim::Reclaim;
