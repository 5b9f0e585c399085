//! The allocation manager.
//!
//! Wraps [`Allocator`] with the transactional bookkeeping spec §4.12
//! asks for: mallocs inside an active transaction are logged so an
//! abort can reclaim them, frees are deferred to a free list so a
//! restart never actually loses the memory, and (for the two
//! captured-memory variants) the most recent allocation is tracked so
//! accesses inside it can skip instrumentation entirely.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::minivec::MiniVec;

/// A memory allocator usable by a core's [`AllocationManager`].
///
/// Every core in this crate only ever allocates and frees whole,
/// precisely-sized blocks — nothing here resizes an existing allocation —
/// so the interface is just the two operations that are actually called.
///
/// # Safety
///
/// Implementations must ensure `malloc` returns memory aligned for any
/// type, and that `free` only deallocates memory this allocator itself
/// handed out.
pub trait Allocator {
    /// Allocate a new block of at least `size` bytes. `None` on failure.
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Deallocate a block previously returned by `malloc`.
    ///
    /// # Safety
    /// `ptr`/`size` must describe a live allocation from this allocator.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// An [`Allocator`] backed by Rust's global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAllocator;

impl Allocator for GlobalAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return NonNull::new(core::mem::align_of::<usize>() as *mut u8);
        }
        let layout = Layout::from_size_align(size, core::mem::align_of::<usize>()).ok()?;
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }
        let Ok(layout) = Layout::from_size_align(size, core::mem::align_of::<usize>()) else {
            return;
        };
        // SAFETY: caller guarantees ptr was allocated with size.
        dealloc(ptr.as_ptr(), layout);
    }
}

/// Which captured-memory and flush policy this build selects (spec
/// §4.12's variant table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// No captured-memory fast path.
    Basic,
    /// Captured-memory fast path; writes to it are flushed in a batch
    /// during `precommit`.
    Enhanced,
    /// Captured-memory fast path; every captured write is flushed
    /// immediately rather than batched.
    NaiveCapturing,
}

/// What a captured write's caller should do about persistence, per the
/// selected [`Variant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturedFlushPolicy {
    /// This build has no captured-memory concept; flush normally.
    NotCaptured,
    /// Defer the flush; `precommit` will flush every malloc'd range.
    DeferToPrecommit,
    /// Flush this write immediately.
    Immediate,
}

struct Allocation {
    ptr: NonNull<u8>,
    size: usize,
}

/// Per-descriptor allocation bookkeeping over a shared [`Allocator`].
pub struct AllocationManager<A: Allocator> {
    allocator: A,
    variant: Variant,
    malloc_list: MiniVec<Allocation>,
    free_list: MiniVec<Allocation>,
    last_allocation: Option<(usize, usize)>,
    active: bool,
}

impl<A: Allocator> AllocationManager<A> {
    /// Create a manager over `allocator` using `variant`'s policy.
    pub const fn new(allocator: A, variant: Variant) -> Self {
        Self {
            allocator,
            variant,
            malloc_list: MiniVec::new(),
            free_list: MiniVec::new(),
            last_allocation: None,
            active: false,
        }
    }

    /// Activate transactional logging at outer begin.
    pub fn on_begin(&mut self) {
        self.active = true;
        self.malloc_list.clear();
        self.free_list.clear();
        self.last_allocation = None;
    }

    /// Allocate `size` bytes, logging the result in the malloc list and,
    /// for capturing variants, remembering it as the "last allocation".
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocator.malloc(size)?;
        self.malloc_list.push(Allocation { ptr, size });
        if self.variant != Variant::Basic {
            self.last_allocation = Some((ptr.as_ptr() as usize, size));
        }
        Some(ptr)
    }

    /// Free `ptr`/`size`: deferred to the free list while a transaction
    /// is active, immediate otherwise.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by this manager's allocator with
    /// exactly `size` bytes and must not be used again after this call
    /// if the transaction goes on to commit.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        if self.active {
            self.free_list.push(Allocation { ptr, size });
        } else {
            self.allocator.free(ptr, size);
        }
    }

    /// True if `addr` falls inside the most recent allocation and this
    /// variant supports captured memory.
    #[inline]
    pub fn is_captured(&self, addr: usize) -> bool {
        match (self.variant, self.last_allocation) {
            (Variant::Basic, _) | (_, None) => false,
            (_, Some((base, size))) => addr >= base && addr < base + size,
        }
    }

    /// The persistence policy a captured write at `addr` should follow.
    pub fn captured_flush_policy(&self, addr: usize) -> CapturedFlushPolicy {
        if !self.is_captured(addr) {
            return CapturedFlushPolicy::NotCaptured;
        }
        match self.variant {
            Variant::Basic => CapturedFlushPolicy::NotCaptured,
            Variant::Enhanced => CapturedFlushPolicy::DeferToPrecommit,
            Variant::NaiveCapturing => CapturedFlushPolicy::Immediate,
        }
    }

    /// Reclaim every logged malloc and drop the free list, run on abort.
    pub fn on_abort(&mut self) {
        for allocation in self.malloc_list.drain() {
            unsafe { self.allocator.free(allocation.ptr, allocation.size) };
        }
        self.free_list.clear();
        self.last_allocation = None;
        self.active = false;
    }

    /// PTM hook: flush every malloc'd range, for `Variant::Enhanced`.
    /// Returns whether a fence is needed after the flushes (true unless
    /// nothing was flushed).
    pub fn precommit(&self, mut flush_range: impl FnMut(usize, usize)) -> bool {
        if self.variant != Variant::Enhanced {
            return false;
        }
        let mut flushed_any = false;
        for allocation in self.malloc_list.iter() {
            flush_range(allocation.ptr.as_ptr() as usize, allocation.size);
            flushed_any = true;
        }
        flushed_any
    }

    /// Finalize the malloc list: it's only ever used for abort-time
    /// reclaim, so a committing transaction simply drops it.
    pub fn commit_mallocs(&mut self) {
        self.malloc_list.clear();
        self.active = false;
    }

    /// Finalize the free list: actually free everything that was
    /// deferred, run after quiescence so no concurrent reader can still
    /// be touching the freed memory (spec §8 epoch invariant).
    pub fn commit_frees(&mut self) {
        let frees: Vec<Allocation> = self.free_list.drain().collect();
        for allocation in frees {
            unsafe { self.allocator.free(allocation.ptr, allocation.size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_variant_never_captures() {
        let mut mgr = AllocationManager::new(GlobalAllocator, Variant::Basic);
        mgr.on_begin();
        let ptr = mgr.alloc(64).unwrap();
        assert!(!mgr.is_captured(ptr.as_ptr() as usize));
        mgr.on_abort();
    }

    #[test]
    fn enhanced_variant_captures_and_defers_flush() {
        let mut mgr = AllocationManager::new(GlobalAllocator, Variant::Enhanced);
        mgr.on_begin();
        let ptr = mgr.alloc(64).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert!(mgr.is_captured(addr));
        assert_eq!(
            mgr.captured_flush_policy(addr),
            CapturedFlushPolicy::DeferToPrecommit
        );
        let mut flushed = 0;
        assert!(mgr.precommit(|_, _| flushed += 1));
        assert_eq!(flushed, 1);
        mgr.commit_mallocs();
    }

    #[test]
    fn naive_capturing_flushes_immediately() {
        let mut mgr = AllocationManager::new(GlobalAllocator, Variant::NaiveCapturing);
        mgr.on_begin();
        let ptr = mgr.alloc(32).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert_eq!(
            mgr.captured_flush_policy(addr),
            CapturedFlushPolicy::Immediate
        );
        mgr.on_abort();
    }

    #[test]
    fn abort_reclaims_mallocs_and_drops_frees() {
        let mut mgr = AllocationManager::new(GlobalAllocator, Variant::Basic);
        mgr.on_begin();
        let ptr = mgr.alloc(128).unwrap();
        unsafe { mgr.free(ptr, 128) };
        mgr.on_abort();
    }

    #[test]
    fn commit_frees_actually_frees_deferred_memory() {
        let mut mgr = AllocationManager::new(GlobalAllocator, Variant::Basic);
        mgr.on_begin();
        let ptr = mgr.alloc(16).unwrap();
        mgr.commit_mallocs();
        unsafe { mgr.free(ptr, 16) };
        mgr.commit_frees();
    }

    #[test]
    fn global_allocator_roundtrips_and_preserves_bytes() {
        let alloc = GlobalAllocator;
        let ptr = alloc.malloc(64).expect("allocation failed");
        unsafe {
            for i in 0..64 {
                *ptr.as_ptr().add(i) = i as u8;
            }
            for i in 0..64 {
                assert_eq!(*ptr.as_ptr().add(i), i as u8);
            }
            alloc.free(ptr, 64);
        }
    }

    #[test]
    fn global_allocator_zero_size_is_safe() {
        let alloc = GlobalAllocator;
        let ptr = alloc.malloc(0).expect("zero-size allocation should succeed");
        unsafe { alloc.free(ptr, 0) };
    }
}
