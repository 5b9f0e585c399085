//! Contention manager: back-off, hourglass and irrevocability escalation.
//!
//! Wraps [`crate::backoff::Backoff`] with the policy spec §4.11 asks for
//! on top of plain exponential spinning: an abort counter that, past a
//! threshold, asks the caller to become irrevocable instead of retrying
//! forever, and an optional sticky "hourglass" token a repeatedly
//! aborting thread can claim to force its competitors to back off.

use crate::backoff::Backoff;
use core::sync::atomic::{AtomicU32, Ordering};

/// What [`ContentionManager::before_begin`] recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Proceed with the ordinary optimistic path.
    Proceed,
    /// This thread has aborted too many times in a row; take the
    /// irrevocable path if the core supports one.
    BecomeIrrevocable,
}

/// Number of consecutive aborts before `before_begin` recommends
/// escalating to irrevocable.
pub const DEFAULT_ABORT_THRESHOLD: u32 = 16;

/// Process-wide sticky token: whichever descriptor is thrashing hardest
/// claims it, and every other descriptor backs off harder while it's
/// held. `0` means unheld; otherwise `slot + 1`.
pub struct HourglassToken {
    held_by: AtomicU32,
}

impl HourglassToken {
    /// Create an unheld token.
    pub const fn new() -> Self {
        Self {
            held_by: AtomicU32::new(0),
        }
    }

    /// Attempt to claim the token for `slot`.
    #[inline]
    pub fn claim(&self, slot: u32) -> bool {
        self.held_by
            .compare_exchange(0, slot + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the token; must only be called by the current holder.
    #[inline]
    pub fn release(&self, slot: u32) {
        let _ = self
            .held_by
            .compare_exchange(slot + 1, 0, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// True if some slot other than `slot` currently holds the token.
    #[inline]
    pub fn held_by_other(&self, slot: u32) -> bool {
        let held = self.held_by.load(Ordering::Acquire);
        held != 0 && held != slot + 1
    }
}

impl Default for HourglassToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-descriptor contention policy.
pub struct ContentionManager {
    backoff: Backoff,
    abort_count: u32,
    threshold: u32,
    holds_hourglass: bool,
}

impl ContentionManager {
    /// Create a policy with the default abort-escalation threshold.
    pub const fn new() -> Self {
        Self {
            backoff: Backoff::new(),
            abort_count: 0,
            threshold: DEFAULT_ABORT_THRESHOLD,
            holds_hourglass: false,
        }
    }

    /// Create a policy with a custom escalation threshold.
    pub const fn with_threshold(threshold: u32) -> Self {
        Self {
            backoff: Backoff::new(),
            abort_count: 0,
            threshold,
            holds_hourglass: false,
        }
    }

    /// Called at the start of `begin`. If another descriptor holds the
    /// hourglass token, back off before even sampling a start time, so a
    /// thrashing workload drains instead of compounding.
    pub fn before_begin(&mut self, slot: u32, hourglass: Option<&HourglassToken>) -> Disposition {
        if let Some(token) = hourglass {
            while token.held_by_other(slot) {
                self.backoff.spin();
            }
        }
        if self.abort_count >= self.threshold {
            Disposition::BecomeIrrevocable
        } else {
            Disposition::Proceed
        }
    }

    /// Called after an abort: back off and bump the abort counter; past
    /// half the threshold, try to claim the hourglass token so
    /// competitors back off while this thread retries.
    pub fn after_abort(&mut self, slot: u32, hourglass: Option<&HourglassToken>) {
        self.abort_count += 1;
        self.backoff.spin();
        if let Some(token) = hourglass {
            if self.abort_count >= self.threshold / 2 {
                self.holds_hourglass = token.claim(slot);
            }
        }
    }

    /// Called after a successful commit: reset back-off and abort state,
    /// releasing the hourglass token if held.
    pub fn after_commit(&mut self, slot: u32, hourglass: Option<&HourglassToken>) {
        self.abort_count = 0;
        self.backoff.reset();
        if self.holds_hourglass {
            if let Some(token) = hourglass {
                token.release(slot);
            }
            self.holds_hourglass = false;
        }
    }

    /// Current consecutive-abort count.
    #[inline]
    pub fn abort_count(&self) -> u32 {
        self.abort_count
    }
}

impl Default for ContentionManager {
    fn default() -> Self {
        Self::new()
    }
}
