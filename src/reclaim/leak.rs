use super::{Reclaim, Retired};

/// The no-op strategy: retired nodes are abandoned.
///
/// Nothing is ever freed, so nothing can ever be freed too early — with
/// infinite memory this is trivially correct, which makes it the baseline
/// that separates queue bugs from reclamation bugs. Any ordering or
/// counting violation observed under `Leak` is a queue bug.
#[derive(Debug)]
pub struct Leak;

impl Reclaim for Leak {
    type Guard = ();

    #[inline]
    fn pin() -> Self::Guard {}

    #[inline]
    unsafe fn retire(entry: Retired) {
        // Abandon the allocation.
        drop(entry);
    }

    #[inline]
    fn quiescent() {}
}

/// The deliberately broken strategy: retired nodes go straight back to the
/// slot pool.
///
/// A reader that was preempted holding a pointer to the node will resume
/// over a slot that may since have been handed to a producer — the textbook
/// ABA setup. This exists so the stress harness can prove it detects that
/// failure class; it is not a reclaimer.
///
/// # Safety
///
/// Unsound by construction for any queue shared between threads. Do not use
/// outside single-threaded code or tests that intend to observe the
/// breakage.
#[derive(Debug)]
pub struct Recycle;

impl Reclaim for Recycle {
    type Guard = ();

    #[inline]
    fn pin() -> Self::Guard {}

    #[inline]
    unsafe fn retire(entry: Retired) {
        entry.release();
    }

    #[inline]
    fn quiescent() {}
}
