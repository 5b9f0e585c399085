//! Platform primitives: the small set of fences and the spin hint every
//! core algorithm and substrate component actually needs, rather than
//! reaching for `core::sync::atomic` ordering constants inline at each
//! call site.
//!
//! Four operations cover every use in this crate:
//! - [`stall`] backs every spin-wait ([`crate::backoff::Backoff`],
//!   [`crate::sequence::Sequence::read_begin`], [`crate::epoch::Epoch`]'s
//!   quiescence wait).
//! - [`fence_acquire`] is [`crate::sequence::Sequence::read_retry`]'s
//!   seqlock validation fence: it must run after the body being validated
//!   and before the re-check of the sequence counter, or a reordered read
//!   could observe a torn value and still see a matching sequence number.
//! - [`fence_store`] and [`fence_store_load`] order a persistence domain's
//!   writeback against its status-word update ([`crate::persist`]): a
//!   flush must retire before the word that marks it durable, and the
//!   post-flush fence must be strong enough to stop a subsequent read of
//!   that word from migrating ahead of the flush it's meant to follow.

use core::sync::atomic::{fence, Ordering};

/// CPU pause hint for spin loops: reduces power draw and contention on
/// the cache line being polled, with no ordering effect of its own.
#[inline(always)]
pub fn stall() {
    core::hint::spin_loop();
}

/// Acquire fence: nothing after this point may be reordered before it.
#[inline(always)]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

/// Release fence: nothing before this point may be reordered after it.
#[inline(always)]
pub fn fence_store() {
    fence(Ordering::Release);
}

/// Full store-load fence (`mfence` on x86): the strongest and most
/// expensive ordering, needed where a release fence alone would still
/// let a later load migrate ahead of an earlier store.
#[inline(always)]
pub fn fence_store_load() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_do_not_panic() {
        stall();
        fence_acquire();
        fence_store();
        fence_store_load();
    }
}
