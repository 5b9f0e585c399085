//! Coarse-grained lock core (CGL).
//!
//! One mutex: begin acquires, commit releases, reads and writes are
//! direct (spec §4.7). Serves as a baseline and as the fallback an
//! irrevocable transaction on another core drops into, since only one
//! thread is ever inside the critical section at a time.
//!
//! The acquire loop is a fetch-and-store spinlock, specialized here to a
//! zero-sized critical section (the data protected is whatever memory the
//! transaction touches, not a Rust value the lock owns) and composed with
//! `crate::backoff::Backoff` rather than a bare spin.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::alloc_mgr::{AllocationManager, Allocator, GlobalAllocator, Variant};
use crate::backoff::Backoff;
use crate::contention::Disposition;
use crate::deferred::DeferredQueue;
use crate::error::{AbortReason, CoreResult, Restart};

/// The process-wide critical section every descriptor contends for.
pub struct Runtime<A: Allocator = GlobalAllocator> {
    locked: AtomicBool,
    allocator: A,
}

impl Runtime<GlobalAllocator> {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            allocator: GlobalAllocator,
        }
    }
}

impl<A: Allocator> Runtime<A> {
    #[inline]
    fn acquire(&self) {
        let mut backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    #[inline]
    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Per-thread descriptor. Holds no read/write sets: the lock itself is
/// the only synchronization CGL needs.
pub struct Descriptor<'r, A: Allocator> {
    runtime: &'r Runtime<A>,
    nesting_depth: u32,
    deferred: DeferredQueue,
    alloc_mgr: AllocationManager<GlobalAllocator>,
    held: bool,
}

impl<'r, A: Allocator> Descriptor<'r, A> {
    pub const fn new(runtime: &'r Runtime<A>) -> Self {
        Self {
            runtime,
            nesting_depth: 0,
            deferred: DeferredQueue::new(),
            alloc_mgr: AllocationManager::new(GlobalAllocator, Variant::Basic),
            held: false,
        }
    }

    /// CGL has no contention manager of its own: its mutual exclusion is
    /// already absolute, so there is nothing for escalation to improve on.
    /// Always reports `Proceed` so callers that branch on every core's
    /// `begin` uniformly never need a CGL-specific case.
    pub fn begin(&mut self) -> Disposition {
        self.nesting_depth += 1;
        if self.nesting_depth == 1 {
            self.runtime.acquire();
            self.held = true;
            self.alloc_mgr.on_begin();
        }
        Disposition::Proceed
    }

    pub fn commit(&mut self) -> CoreResult<()> {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
        if self.nesting_depth == 0 {
            self.deferred.on_commit();
            self.alloc_mgr.commit_mallocs();
            self.alloc_mgr.commit_frees();
            self.held = false;
            self.runtime.release();
        }
        Ok(())
    }

    pub fn abort(&mut self) -> Restart {
        self.deferred.on_abort();
        self.alloc_mgr.on_abort();
        self.nesting_depth = 0;
        if self.held {
            self.held = false;
            self.runtime.release();
        }
        Restart(AbortReason::LockContention)
    }

    /// Direct read: the lock already gives exclusive access.
    #[inline]
    pub unsafe fn read_unchecked<T: Copy>(&self, addr: *const T) -> T {
        core::ptr::read(addr)
    }

    /// Direct write.
    #[inline]
    pub unsafe fn write_unchecked<T: Copy>(&mut self, addr: *mut T, val: T) {
        core::ptr::write(addr, val);
    }

    /// Fallible read, matching every other core's entry point: CGL never
    /// actually fails once the lock is held, so this always returns `Ok`.
    #[inline]
    pub fn read<T: crate::logs::Scalar>(&self, addr: *const T) -> CoreResult<T> {
        Ok(unsafe { core::ptr::read(addr) })
    }

    /// Fallible write, matching every other core's entry point.
    #[inline]
    pub fn write<T: crate::logs::Scalar>(&mut self, addr: *mut T, val: T) -> CoreResult<()> {
        unsafe { core::ptr::write(addr, val) };
        Ok(())
    }

    pub fn alloc(&mut self, size: usize) -> Option<core::ptr::NonNull<u8>> {
        self.alloc_mgr.alloc(size)
    }

    /// # Safety
    /// `ptr`/`size` must describe a live allocation from this descriptor.
    pub unsafe fn free(&mut self, ptr: core::ptr::NonNull<u8>, size: usize) {
        self.alloc_mgr.free(ptr, size);
    }

    /// # Safety
    /// See [`crate::deferred::DeferredQueue::register`].
    pub unsafe fn register_commit_handler(&mut self, callback: unsafe fn(*mut ()), arg: *mut ()) {
        self.deferred.register(callback, arg);
    }

    /// CGL has no frame filter: direct reads/writes already bypass any
    /// instrumentation once the lock is held, so there is nothing to
    /// override here.
    pub fn set_stackframe(&self, _addr: usize) {}

    /// CGL already runs with exclusive access once its lock is held, so
    /// becoming irrevocable costs nothing further.
    pub fn try_become_irrevocable(&self) -> bool {
        self.held
    }

    pub fn release_irrevocable(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_releases_lock() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime);
        desc.begin();
        assert!(runtime.locked.load(Ordering::Relaxed));
        desc.commit().unwrap();
        assert!(!runtime.locked.load(Ordering::Relaxed));
    }

    #[test]
    fn nested_begin_only_acquires_once() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime);
        desc.begin();
        desc.begin();
        desc.commit().unwrap();
        assert!(runtime.locked.load(Ordering::Relaxed));
        desc.commit().unwrap();
        assert!(!runtime.locked.load(Ordering::Relaxed));
    }

    #[test]
    fn read_write_roundtrip_under_lock() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime);
        let mut cell: u64 = 0;
        desc.begin();
        desc.write(&mut cell as *mut u64, 7).unwrap();
        let seen = desc.read(&cell as *const u64).unwrap();
        desc.commit().unwrap();
        assert_eq!(seen, 7);
        assert_eq!(cell, 7);
    }

    #[test]
    fn abort_releases_lock() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime);
        desc.begin();
        desc.abort();
        assert!(!runtime.locked.load(Ordering::Relaxed));
    }
}
