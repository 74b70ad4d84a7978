use core::cell::Cell;
use core::fmt;
use core::hint;
use std::thread;

/// Steps below this spin with exponentially more pause instructions.
const SPIN_LIMIT: u32 = 6;
/// Steps between `SPIN_LIMIT` and this yield the thread; past it the state
/// resets so a long-contended loop cycles back to cheap spinning.
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff for contended retry loops.
///
/// Each miss doubles the number of pause instructions executed, up to
/// `2^6`. `snooze` escalates further: past the spin range it yields the
/// thread, and past the yield range it resets so the cycle starts over.
/// Backoff is a throughput aid only; no correctness property depends on it.
///
/// # Examples
///
/// ```
/// use reclaim_queue::Backoff;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// fn wait_for(flag: &AtomicBool) {
///     let backoff = Backoff::new();
///     while !flag.load(Ordering::Acquire) {
///         backoff.snooze();
///     }
/// }
/// # wait_for(&AtomicBool::new(true));
/// ```
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    /// Creates a backoff in its initial (shortest-pause) state.
    #[inline]
    pub fn new() -> Self {
        Backoff { step: Cell::new(0) }
    }

    /// Resets to the initial state.
    #[inline]
    pub fn reset(&self) {
        self.step.set(0);
    }

    /// Backs off without ever yielding the thread.
    ///
    /// Suited to revalidation loops where the awaited change is another
    /// core's store that lands within a few cache misses.
    #[inline]
    pub fn spin(&self) {
        let step = self.step.get().min(SPIN_LIMIT);
        for _ in 0..pauses(step) {
            hint::spin_loop();
        }
        if self.step.get() <= SPIN_LIMIT {
            self.step.set(self.step.get() + 1);
        }
    }

    /// Backs off, yielding the thread once spinning stops paying off.
    ///
    /// Past the yield range the state resets, so a thread stuck behind a
    /// descheduled peer alternates between yielding and brief spins instead
    /// of burning a full quantum.
    #[inline]
    pub fn snooze(&self) {
        let step = self.step.get();
        if step <= SPIN_LIMIT {
            for _ in 0..pauses(step) {
                hint::spin_loop();
            }
            self.step.set(step + 1);
        } else if step <= YIELD_LIMIT {
            thread::yield_now();
            self.step.set(step + 1);
        } else {
            thread::yield_now();
            self.step.set(0);
        }
    }

    /// Returns `true` once spinning alone has been exhausted.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.step.get() > SPIN_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("step", &self.step.get())
            .finish()
    }
}

/// Number of pause instructions for a given step.
#[cfg(not(feature = "jitter"))]
#[inline]
fn pauses(step: u32) -> u32 {
    1 << step
}

/// Number of pause instructions for a given step, randomized into the upper
/// half of the nominal window so contending threads fall out of lockstep.
#[cfg(feature = "jitter")]
#[inline]
fn pauses(step: u32) -> u32 {
    let base = 1u32 << step;
    if base <= 2 {
        return base;
    }
    let half = base / 2;
    half + xorshift() % (half + 1)
}

/// 32-bit xorshift with thread-local state.
#[cfg(feature = "jitter")]
fn xorshift() -> u32 {
    use core::num::Wrapping;

    thread_local! {
        static RNG: Cell<Wrapping<u32>> = const { Cell::new(Wrapping(0x9E37_79B9)) };
    }

    RNG.try_with(|rng| {
        let mut x = rng.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        rng.set(x);
        x.0
    })
    .unwrap_or(1)
}
