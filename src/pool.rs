//! Node slot pool.
//!
//! Queue nodes are recycled through a two-level free list instead of going
//! back to the system allocator on every dequeue. Each thread keeps a small
//! cache of raw slots; overflow and thread-exit residue migrate in batches
//! to a process-wide shelf shared by all threads using the same node layout.
//!
//! Slots are *uninitialized* memory. The queue placement-writes a node into
//! a slot on allocation and must have moved or dropped the node's contents
//! before the slot comes back here. Recycling a slot while some thread still
//! holds a pointer into its former life is exactly the ABA hazard the
//! reclaimers exist to rule out; the pool itself makes no such promise.

use core::cell::RefCell;
use std::alloc::{self, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Capacity of a thread's cache for one slot layout.
const LOCAL_CAP: usize = 256;
/// Slots moved per refill or flush between a thread cache and its shelf.
const XFER_BATCH: usize = 64;

/// Raw slots parked on a shelf. The wrapper exists so the containing mutex
/// can live in a static.
struct SlotList(Vec<*mut u8>);

unsafe impl Send for SlotList {}

/// Process-wide free list for one node layout. Shelves are created on first
/// use and never torn down; threads may still be returning slots to them
/// during teardown.
struct Shelf {
    layout: Layout,
    slots: Mutex<SlotList>,
    /// Relaxed mirror of `slots.0.len()`, so allocation can skip the mutex
    /// when the shelf has nothing worth a batched refill.
    len: AtomicUsize,
}

static SHELVES: Mutex<Vec<&'static Shelf>> = Mutex::new(Vec::new());

fn shelf(layout: Layout) -> &'static Shelf {
    let mut registry = SHELVES.lock().unwrap();
    if let Some(shelf) = registry.iter().find(|s| s.layout == layout) {
        return shelf;
    }
    let shelf: &'static Shelf = Box::leak(Box::new(Shelf {
        layout,
        slots: Mutex::new(SlotList(Vec::new())),
        len: AtomicUsize::new(0),
    }));
    registry.push(shelf);
    shelf
}

/// One thread's cache for one layout.
struct Lane {
    shelf: &'static Shelf,
    slots: Vec<*mut u8>,
}

struct LocalCache {
    lanes: Vec<Lane>,
}

impl LocalCache {
    fn lane(&mut self, layout: Layout) -> &mut Lane {
        // A process uses a handful of node layouts, so a linear scan beats
        // any keyed structure here.
        if let Some(i) = self.lanes.iter().position(|l| l.shelf.layout == layout) {
            return &mut self.lanes[i];
        }
        self.lanes.push(Lane {
            shelf: shelf(layout),
            slots: Vec::with_capacity(LOCAL_CAP),
        });
        self.lanes.last_mut().unwrap()
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        // Residual slots survive the thread by migrating to their shelves.
        for lane in self.lanes.drain(..) {
            if lane.slots.is_empty() {
                continue;
            }
            let mut parked = lane.shelf.slots.lock().unwrap();
            parked.0.extend(lane.slots);
            lane.shelf.len.store(parked.0.len(), Ordering::Relaxed);
        }
    }
}

thread_local! {
    static CACHE: RefCell<LocalCache> = RefCell::new(LocalCache { lanes: Vec::new() });
}

fn raw_alloc(layout: Layout) -> *mut u8 {
    // SAFETY: queue node layouts are never zero-sized.
    let ptr = unsafe { alloc::alloc(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    ptr
}

cfg_if::cfg_if! {
    if #[cfg(reclaim_queue_sanitize)] {
        // Under a sanitizer every slot goes straight to the allocator so
        // stale dereferences trip instrumentation instead of landing in a
        // recycled slot.
        pub(crate) fn alloc<T>() -> *mut T {
            raw_alloc(Layout::new::<T>()).cast()
        }

        pub(crate) unsafe fn dealloc<T>(ptr: *mut T) {
            alloc::dealloc(ptr.cast(), Layout::new::<T>());
        }
    } else {
        /// Hands out an *uninitialized* slot sized and aligned for `T`.
        pub(crate) fn alloc<T>() -> *mut T {
            let layout = Layout::new::<T>();
            CACHE
                .try_with(|cache| {
                    let mut cache = cache.borrow_mut();
                    let lane = cache.lane(layout);
                    if let Some(ptr) = lane.slots.pop() {
                        return ptr;
                    }
                    // Refill only when the shelf holds a full batch;
                    // otherwise the mutex costs more than a fresh slot.
                    if lane.shelf.len.load(Ordering::Relaxed) >= XFER_BATCH {
                        let mut parked = lane.shelf.slots.lock().unwrap();
                        let take = parked.0.len().min(XFER_BATCH);
                        let at = parked.0.len() - take;
                        lane.slots.extend(parked.0.drain(at..));
                        lane.shelf.len.store(parked.0.len(), Ordering::Relaxed);
                        drop(parked);
                        if let Some(ptr) = lane.slots.pop() {
                            return ptr;
                        }
                    }
                    raw_alloc(layout)
                })
                // The cache is gone during thread teardown; fall through to
                // the allocator.
                .unwrap_or_else(|_| raw_alloc(layout))
                .cast()
        }

        /// Returns a slot to the pool.
        ///
        /// # Safety
        ///
        /// `ptr` must have come from [`alloc::<T>`](alloc) and the `T` it
        /// held must already be moved out or dropped. No other thread may
        /// legitimately dereference it anymore.
        pub(crate) unsafe fn dealloc<T>(ptr: *mut T) {
            let layout = Layout::new::<T>();
            let ptr = ptr.cast::<u8>();
            let parked_locally = CACHE.try_with(|cache| {
                let mut cache = cache.borrow_mut();
                let lane = cache.lane(layout);
                if lane.slots.len() >= LOCAL_CAP {
                    let mut parked = lane.shelf.slots.lock().unwrap();
                    let at = lane.slots.len() - XFER_BATCH;
                    parked.0.extend(lane.slots.drain(at..));
                    lane.shelf.len.store(parked.0.len(), Ordering::Relaxed);
                }
                lane.slots.push(ptr);
            });
            if parked_locally.is_err() {
                // TLS destructors may still be retiring nodes; park the slot
                // on the shelf directly.
                let shelf = shelf(layout);
                let mut parked = shelf.slots.lock().unwrap();
                parked.0.push(ptr);
                shelf.len.store(parked.0.len(), Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn shelved<T>() -> usize {
    shelf(Layout::new::<T>()).len.load(Ordering::Relaxed)
}
