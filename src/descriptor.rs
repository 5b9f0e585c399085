//! The per-thread transaction descriptor.
//!
//! Per the design notes, there is no global descriptor registry: a
//! descriptor is an owned value a thread creates once and keeps for its
//! lifetime (typically in a `thread_local!`, wired up by [`crate::api`]),
//! borrowing the shared [`crate::epoch::Epoch`] for as long as it lives.
//! `DescriptorBase` holds the fields every core needs regardless of its
//! locking discipline (identity, nesting, frame filter, deferred queue,
//! contention policy, epoch announcement); each core in [`crate::core`]
//! wraps a `DescriptorBase` with its own logs and sets (redo/undo/value
//! log, read-set/lock-set of orec pointers, read/write bit filters).
//!
//! There is deliberately no `Checkpoint` type holding register state:
//! Rust has no `longjmp`, so the checkpoint/re-entry pattern is instead
//! the retry loop in [`crate::api::execute`], whose closure body is
//! simply re-invoked from the top on `Err(Restart)`.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::contention::ContentionManager;
use crate::deferred::DeferredQueue;
use crate::epoch;
use crate::frame::FrameFilter;

/// Process-wide counter handing out stable small-integer descriptor
/// slots on first use.
pub struct SlotAllocator {
    next: AtomicU32,
}

impl SlotAllocator {
    /// Create an allocator starting at slot zero.
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    /// Acquire the next slot, or `None` if `max_slots` has been reached.
    pub fn acquire(&self, max_slots: u32) -> Option<u32> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        if slot < max_slots {
            Some(slot)
        } else {
            None
        }
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The fields common to every core's descriptor.
pub struct DescriptorBase<'e> {
    slot: u32,
    nesting_depth: u32,
    start_time: u64,
    frame: FrameFilter,
    deferred: DeferredQueue,
    contention: ContentionManager,
    epoch: epoch::Guard<'e>,
}

impl<'e> DescriptorBase<'e> {
    /// Create a fresh, non-nested descriptor bound to `epoch_guard`.
    pub const fn new(slot: u32, epoch_guard: epoch::Guard<'e>) -> Self {
        Self {
            slot,
            nesting_depth: 0,
            start_time: 0,
            frame: FrameFilter::new(),
            deferred: DeferredQueue::new(),
            contention: ContentionManager::new(),
            epoch: epoch_guard,
        }
    }

    /// This descriptor's stable slot index.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Increment nesting depth; returns `true` if this is the outer
    /// begin (flat nesting: only the outermost begin runs the protocol).
    #[inline]
    pub fn enter(&mut self) -> bool {
        self.nesting_depth += 1;
        self.nesting_depth == 1
    }

    /// Decrement nesting depth; returns `true` if this is the outer
    /// commit/abort.
    #[inline]
    pub fn leave(&mut self) -> bool {
        debug_assert!(self.nesting_depth > 0, "leave without a matching enter");
        self.nesting_depth -= 1;
        self.nesting_depth == 0
    }

    /// Current nesting depth (0 = not inside a transaction).
    #[inline]
    pub fn nesting_depth(&self) -> u32 {
        self.nesting_depth
    }

    #[inline]
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    #[inline]
    pub fn set_start_time(&mut self, t: u64) {
        self.start_time = t;
    }

    #[inline]
    pub fn frame(&self) -> &FrameFilter {
        &self.frame
    }

    #[inline]
    pub fn deferred(&mut self) -> &mut DeferredQueue {
        &mut self.deferred
    }

    #[inline]
    pub fn contention(&mut self) -> &mut ContentionManager {
        &mut self.contention
    }

    #[inline]
    pub fn epoch(&self) -> &epoch::Guard<'e> {
        &self.epoch
    }
}
