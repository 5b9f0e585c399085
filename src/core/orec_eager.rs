//! Eager-locking orec core (OrecEager): write-in-place with undo logging,
//! encounter-time locking, global clock (spec §4.2).
//!
//! Properties: opacity — readers never observe a state inconsistent with
//! a single serialization point; writers commit in clock-increment order.

use core::sync::atomic::Ordering;

use crate::alloc_mgr::{AllocationManager, GlobalAllocator, Variant};
use crate::clock::VersionClock;
use crate::contention::{ContentionManager, Disposition, HourglassToken};
use crate::deferred::DeferredQueue;
use crate::epoch::{Epoch, Guard};
use crate::error::{AbortReason, CoreResult, Restart};
use crate::frame::FrameFilter;
use crate::logs::undo::UndoLog;
use crate::logs::Scalar;
use crate::minivec::MiniVec;
use crate::orec::{self, lock_token, Orec, OrecTable};

/// Shared state: the orec table, the version clock, the epoch table and
/// the hourglass token every descriptor contends through.
pub struct Runtime<const N: usize> {
    orecs: OrecTable<N>,
    clock: VersionClock,
    epoch: Epoch,
    hourglass: HourglassToken,
}

impl<const N: usize> Runtime<N> {
    pub const fn new() -> Self {
        Self {
            orecs: OrecTable::new(),
            clock: VersionClock::new(),
            epoch: Epoch::new(),
            hourglass: HourglassToken::new(),
        }
    }
}

impl<const N: usize> Default for Runtime<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread descriptor: undo log, read-set and lock-set of orec
/// references, plus the shared substrate pieces every core carries.
pub struct Descriptor<'r, const N: usize> {
    runtime: &'r Runtime<N>,
    slot: u32,
    nesting_depth: u32,
    start_time: u64,
    undo: UndoLog,
    read_set: MiniVec<&'r Orec>,
    lock_set: MiniVec<&'r Orec>,
    frame: FrameFilter,
    deferred: DeferredQueue,
    alloc_mgr: AllocationManager<GlobalAllocator>,
    contention: ContentionManager,
    epoch: Guard<'r>,
}

impl<'r, const N: usize> Descriptor<'r, N> {
    pub fn new(runtime: &'r Runtime<N>, slot: u32) -> Self {
        Self {
            runtime,
            slot,
            nesting_depth: 0,
            start_time: 0,
            undo: UndoLog::new(),
            read_set: MiniVec::new(),
            lock_set: MiniVec::new(),
            frame: FrameFilter::new(),
            deferred: DeferredQueue::new(),
            alloc_mgr: AllocationManager::new(GlobalAllocator, Variant::Basic),
            contention: ContentionManager::new(),
            epoch: runtime.epoch.register(),
        }
    }

    #[inline]
    fn token(&self) -> u64 {
        lock_token(self.slot)
    }

    pub fn begin(&mut self) -> Disposition {
        self.nesting_depth += 1;
        if self.nesting_depth != 1 {
            return Disposition::Proceed;
        }
        self.frame.set_bottom(self as *const Self as usize);
        self.alloc_mgr.on_begin();
        self.start_time = self.runtime.clock.load(Ordering::Acquire);
        self.epoch.on_begin(self.start_time);
        self.contention
            .before_begin(self.slot, Some(&self.runtime.hourglass))
    }

    /// Every orec in the read-set must still be `<= bound` or owned by us.
    fn validate(&self, bound: u64) -> bool {
        let my_token = self.token();
        self.read_set.iter().all(|o| {
            let w = o.load(Ordering::Acquire);
            if orec::is_locked(w) {
                w == my_token
            } else {
                orec::version(w) <= bound
            }
        })
    }

    pub fn read<T: Scalar>(&mut self, addr: *const T) -> CoreResult<T> {
        if self.frame.is_private(addr as usize) {
            return Ok(unsafe { core::ptr::read(addr) });
        }
        let o = self.runtime.orecs.get(addr as usize);
        let my_token = self.token();
        loop {
            let pre = o.load(Ordering::Acquire);
            if orec::is_locked(pre) && pre != my_token {
                return Err(Restart(AbortReason::LockContention));
            }
            let val = unsafe { core::ptr::read(addr) };
            let post = o.load(Ordering::Acquire);
            if pre == post {
                if pre == my_token {
                    return Ok(val);
                }
                if orec::version(pre) <= self.start_time {
                    self.read_set.push(o);
                    return Ok(val);
                }
            }
            // Either torn (pre != post) or unlocked-but-newer: extend.
            let fresh = self.runtime.clock.load(Ordering::Acquire);
            if !self.validate(self.start_time) {
                return Err(Restart(AbortReason::ReadInconsistency));
            }
            self.start_time = fresh;
            self.epoch.set_epoch(fresh);
        }
    }

    pub fn write<T: Scalar>(&mut self, addr: *mut T, val: T) -> CoreResult<()> {
        if self.frame.is_private(addr as usize) {
            unsafe { core::ptr::write(addr, val) };
            return Ok(());
        }
        let o = self.runtime.orecs.get(addr as usize);
        let my_token = self.token();
        loop {
            let pre = o.load(Ordering::Acquire);
            if pre == my_token {
                break;
            }
            if orec::is_locked(pre) {
                return Err(Restart(AbortReason::LockContention));
            }
            if orec::version(pre) <= self.start_time {
                match o.try_lock(pre, my_token) {
                    Ok(()) => {
                        self.lock_set.push(o);
                        break;
                    }
                    Err(_) => return Err(Restart(AbortReason::LockContention)),
                }
            }
            let fresh = self.runtime.clock.load(Ordering::Acquire);
            if !self.validate(self.start_time) {
                return Err(Restart(AbortReason::ReadInconsistency));
            }
            self.start_time = fresh;
            self.epoch.set_epoch(fresh);
        }
        let prior = unsafe { core::ptr::read(addr) };
        self.undo.push(addr as usize, T::WIDTH, prior.to_bits());
        unsafe { core::ptr::write(addr, val) };
        Ok(())
    }

    /// Read-only fast path or writer commit, per spec §4.2/§4.1.
    pub fn commit(&mut self) -> CoreResult<()> {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
        if self.nesting_depth != 0 {
            return Ok(());
        }
        if self.lock_set.is_empty() {
            self.epoch.quiesce(self.start_time);
            self.finish_commit();
            return Ok(());
        }
        let end_time = self.runtime.clock.fetch_add_one() + 1;
        if end_time != self.start_time + 1 && !self.validate(self.start_time) {
            self.abort();
            return Err(Restart(AbortReason::ReadInconsistency));
        }
        for o in self.lock_set.iter() {
            o.release(end_time);
        }
        self.lock_set.clear();
        self.epoch.quiesce(end_time);
        self.finish_commit();
        Ok(())
    }

    fn finish_commit(&mut self) {
        self.read_set.clear();
        self.undo.clear();
        self.epoch.clear_epoch();
        self.deferred.on_commit();
        self.alloc_mgr.commit_mallocs();
        self.alloc_mgr.commit_frees();
        self.contention
            .after_commit(self.slot, Some(&self.runtime.hourglass));
    }

    /// Release our still-held locks without publishing a new commit
    /// version, restoring each to `prev + 1` (spec §4.2's abort step).
    fn rollback_locks(&mut self) {
        let mut max_released = 0u64;
        for o in self.lock_set.iter() {
            let restored = orec::version(o.prev_version()) + 1;
            o.release(restored);
            max_released = max_released.max(restored);
        }
        self.lock_set.clear();
        self.runtime.clock.bump_to_at_least(max_released);
    }

    pub fn abort(&mut self) -> Restart {
        let runtime = self.runtime;
        self.undo.replay_reverse(|addr, width, prior| unsafe {
            crate::logs::store_bits_by_width(addr, width, prior);
        });
        if !self.lock_set.is_empty() {
            self.rollback_locks();
        }
        self.read_set.clear();
        self.epoch.clear_epoch();
        self.deferred.on_abort();
        self.alloc_mgr.on_abort();
        self.nesting_depth = 0;
        self.contention.after_abort(self.slot, Some(&runtime.hourglass));
        Restart(AbortReason::ReadInconsistency)
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

    /// Override the frame filter's conservative bottom.
    pub fn set_stackframe(&self, addr: usize) {
        self.frame.set_bottom(addr);
    }

    /// Claim the process-wide irrevocability token and wait for every
    /// other descriptor to go quiescent.
    pub fn try_become_irrevocable(&self) -> bool {
        self.epoch.try_irrevoc()
    }

    pub fn release_irrevocable(&self) {
        self.epoch.release_irrevoc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip_commits() {
        let runtime: Runtime<64> = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 10;

        desc.begin();
        let seen = desc.read(&cell as *const u32).unwrap();
        assert_eq!(seen, 10);
        desc.write(&mut cell as *mut u32, 20).unwrap();
        desc.commit().unwrap();

        assert_eq!(cell, 20);
    }

    #[test]
    fn abort_restores_prior_value_via_undo() {
        let runtime: Runtime<64> = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 5;

        desc.begin();
        desc.write(&mut cell as *mut u32, 999).unwrap();
        assert_eq!(cell, 999); // write-in-place, visible immediately
        desc.abort();

        assert_eq!(cell, 5);
    }

    #[test]
    fn concurrent_writer_causes_lock_contention_abort() {
        let runtime: Runtime<64> = Runtime::new();
        let mut a = Descriptor::new(&runtime, 0);
        let mut b = Descriptor::new(&runtime, 1);
        let mut cell: u64 = 0;

        a.begin();
        a.write(&mut cell as *mut u64, 1).unwrap();

        b.begin();
        let result = b.write(&mut cell as *mut u64, 2);
        assert!(result.is_err());
        b.abort(); // a real caller always aborts on Err before retrying

        a.commit().unwrap();
        assert_eq!(cell, 1);
    }

    #[test]
    fn read_only_commit_takes_fast_path() {
        let runtime: Runtime<64> = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let cell: u32 = 42;

        desc.begin();
        assert_eq!(desc.read(&cell as *const u32).unwrap(), 42);
        desc.commit().unwrap();
    }

    #[test]
    fn nested_transactions_only_run_protocol_at_outer_level() {
        let runtime: Runtime<64> = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 1;

        desc.begin();
        desc.begin();
        desc.write(&mut cell as *mut u32, 2).unwrap();
        desc.commit().unwrap(); // inner: no-op
        assert_eq!(cell, 2);
        desc.commit().unwrap(); // outer: publishes
        assert_eq!(cell, 2);
    }
}
