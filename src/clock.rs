//! The global version clock.
//!
//! A single monotonic counter, bumped by one on every writer commit.
//! Every core samples it at begin and (for lazy/value-based cores) again
//! at commit to derive a serialization point.

use core::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// A cache-line padded, monotonically increasing counter.
///
/// Padding keeps the clock's cache line free of false sharing with
/// whatever table happens to sit next to it in a `Runtime`.
pub struct VersionClock {
    value: CachePadded<AtomicU64>,
}

impl VersionClock {
    /// Create a new clock starting at zero.
    pub const fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Read the current value.
    #[inline]
    pub fn load(&self, order: Ordering) -> u64 {
        self.value.load(order)
    }

    /// Atomically add one, returning the clock's value *before* the bump.
    #[inline]
    pub fn fetch_add_one(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel)
    }

    /// Bump the clock to at least `target`, used by `OrecEager::abort` to
    /// restore the invariant that the clock never falls below the version
    /// of any unlocked orec.
    #[inline]
    pub fn bump_to_at_least(&self, target: u64) {
        let mut current = self.value.load(Ordering::Relaxed);
        while current < target {
            match self.value.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Compare-and-swap, used by NOrec-style sequence locks and RingSTM's
    /// commit-slot acquisition.
    #[inline]
    pub fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}
