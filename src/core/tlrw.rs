//! Reader-writer bytelock core (TLRW): pessimistic two-phase locking with
//! bounded retries in place of deadlock detection (spec §4.6).
//!
//! A read announces itself in the bytelock's reader array after checking
//! no writer owns it; a write takes exclusive ownership of the bytelock,
//! then waits for announced readers to drain, writing in place under an
//! undo log once it holds the lock. Both acquisitions give up after
//! [`MAX_RETRIES`] failed attempts rather than detecting a cycle, trading
//! a spurious abort for never having to track a wait-for graph.

use core::sync::atomic::Ordering;

use crate::alloc_mgr::{AllocationManager, GlobalAllocator, Variant};
use crate::backoff::Backoff;
use crate::bytelock::{ByteLockRecord, ByteLockTable};
use crate::contention::{ContentionManager, Disposition, HourglassToken};
use crate::deferred::DeferredQueue;
use crate::epoch::{Epoch, Guard};
use crate::error::{AbortReason, CoreResult, Restart};
use crate::frame::FrameFilter;
use crate::logs::undo::UndoLog;
use crate::logs::Scalar;
use crate::minivec::MiniVec;

/// Acquisition attempts before giving up and aborting instead of spinning
/// forever against a possible cycle.
pub const MAX_RETRIES: u32 = 16;

pub struct Runtime<const N: usize> {
    locks: ByteLockTable<N>,
    epoch: Epoch,
    hourglass: HourglassToken,
}

impl<const N: usize> Runtime<N> {
    pub const fn new() -> Self {
        Self {
            locks: ByteLockTable::new(),
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

pub struct Descriptor<'r, const N: usize> {
    runtime: &'r Runtime<N>,
    slot: u32,
    nesting_depth: u32,
    undo: UndoLog,
    read_locks: MiniVec<&'r ByteLockRecord>,
    write_locks: MiniVec<&'r ByteLockRecord>,
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
            undo: UndoLog::new(),
            read_locks: MiniVec::new(),
            write_locks: MiniVec::new(),
            frame: FrameFilter::new(),
            deferred: DeferredQueue::new(),
            alloc_mgr: AllocationManager::new(GlobalAllocator, Variant::Basic),
            contention: ContentionManager::new(),
            epoch: runtime.epoch.register(),
        }
    }

    pub fn begin(&mut self) -> Disposition {
        self.nesting_depth += 1;
        if self.nesting_depth != 1 {
            return Disposition::Proceed;
        }
        self.frame.set_bottom(self as *const Self as usize);
        self.alloc_mgr.on_begin();
        self.epoch.on_begin(0);
        self.contention
            .before_begin(self.slot, Some(&self.runtime.hourglass))
    }

    fn already_reading(&self, rec: &ByteLockRecord) -> bool {
        self.read_locks
            .iter()
            .any(|held| core::ptr::eq(*held, rec))
    }

    fn acquire_read(&mut self, rec: &'r ByteLockRecord) -> CoreResult<()> {
        let slot = self.slot as usize;
        if rec.is_owner(slot) || self.already_reading(rec) {
            return Ok(());
        }
        let mut backoff = Backoff::new();
        for _ in 0..MAX_RETRIES {
            let owner = rec.owner_word();
            if owner != 0 && owner != slot as u32 + 1 {
                backoff.spin();
                continue;
            }
            rec.announce_reader(slot);
            // Double-check: a writer may have slipped in between the
            // owner check above and announcing.
            let owner = rec.owner_word();
            if owner != 0 && owner != slot as u32 + 1 {
                rec.retract_reader(slot);
                backoff.spin();
                continue;
            }
            self.read_locks.push(rec);
            return Ok(());
        }
        Err(Restart(AbortReason::DeadlockSuspicion))
    }

    fn acquire_write(&mut self, rec: &'r ByteLockRecord) -> CoreResult<()> {
        let slot = self.slot as usize;
        if rec.is_owner(slot) {
            return Ok(());
        }
        let mut backoff = Backoff::new();
        let mut acquired = false;
        for _ in 0..MAX_RETRIES {
            if rec.try_acquire_write(slot) {
                acquired = true;
                break;
            }
            backoff.spin();
        }
        if !acquired {
            return Err(Restart(AbortReason::LockContention));
        }
        let mut drain_backoff = Backoff::new();
        for _ in 0..MAX_RETRIES {
            if !rec.has_other_reader(slot) {
                self.write_locks.push(rec);
                return Ok(());
            }
            drain_backoff.spin();
        }
        rec.release_write();
        Err(Restart(AbortReason::DeadlockSuspicion))
    }

    pub fn read<T: Scalar>(&mut self, addr: *const T) -> CoreResult<T> {
        if self.frame.is_private(addr as usize) {
            return Ok(unsafe { core::ptr::read(addr) });
        }
        let rec = self.runtime.locks.get(addr as usize);
        self.acquire_read(rec)?;
        Ok(unsafe { core::ptr::read(addr) })
    }

    pub fn write<T: Scalar>(&mut self, addr: *mut T, val: T) -> CoreResult<()> {
        if self.frame.is_private(addr as usize) {
            unsafe { core::ptr::write(addr, val) };
            return Ok(());
        }
        let rec = self.runtime.locks.get(addr as usize);
        self.acquire_write(rec)?;
        let prior = unsafe { core::ptr::read(addr) };
        self.undo.push(addr as usize, T::WIDTH, prior.to_bits());
        unsafe { core::ptr::write(addr, val) };
        Ok(())
    }

    fn release_all(&mut self) {
        let slot = self.slot as usize;
        for rec in self.read_locks.iter() {
            rec.retract_reader(slot);
        }
        self.read_locks.clear();
        for rec in self.write_locks.iter() {
            rec.release_write();
        }
        self.write_locks.clear();
    }

    pub fn commit(&mut self) -> CoreResult<()> {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
        if self.nesting_depth != 0 {
            return Ok(());
        }
        self.undo.clear();
        self.release_all();
        self.epoch.clear_epoch();
        self.deferred.on_commit();
        self.alloc_mgr.commit_mallocs();
        self.alloc_mgr.commit_frees();
        self.contention
            .after_commit(self.slot, Some(&self.runtime.hourglass));
        Ok(())
    }

    pub fn abort(&mut self) -> Restart {
        self.undo.replay_reverse(|addr, width, prior| unsafe {
            crate::logs::store_bits_by_width(addr, width, prior);
        });
        self.release_all();
        self.epoch.clear_epoch();
        self.deferred.on_abort();
        self.alloc_mgr.on_abort();
        self.nesting_depth = 0;
        self.contention
            .after_abort(self.slot, Some(&self.runtime.hourglass));
        Restart(AbortReason::DeadlockSuspicion)
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
        assert_eq!(desc.read(&cell as *const u32).unwrap(), 10);
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
        assert_eq!(cell, 999);
        desc.abort();

        assert_eq!(cell, 5);
    }

    #[test]
    fn second_writer_fails_to_acquire_held_lock() {
        let runtime: Runtime<64> = Runtime::new();
        let mut a = Descriptor::new(&runtime, 0);
        let mut b = Descriptor::new(&runtime, 1);
        let mut cell: u64 = 0;

        a.begin();
        a.write(&mut cell as *mut u64, 1).unwrap();

        b.begin();
        let result = b.write(&mut cell as *mut u64, 2);
        assert!(result.is_err());
        b.abort();

        a.commit().unwrap();
        assert_eq!(cell, 1);
    }

    #[test]
    fn writer_blocks_on_existing_reader() {
        let runtime: Runtime<64> = Runtime::new();
        let mut reader = Descriptor::new(&runtime, 0);
        let mut writer = Descriptor::new(&runtime, 1);
        let mut cell: u64 = 7;

        reader.begin();
        assert_eq!(reader.read(&cell as *const u64).unwrap(), 7);

        writer.begin();
        let result = writer.write(&mut cell as *mut u64, 8);
        assert!(result.is_err());
        writer.abort();

        reader.commit().unwrap();
    }

    #[test]
    fn concurrent_readers_do_not_conflict() {
        let runtime: Runtime<64> = Runtime::new();
        let mut a = Descriptor::new(&runtime, 0);
        let mut b = Descriptor::new(&runtime, 1);
        let cell: u64 = 3;

        a.begin();
        b.begin();
        assert_eq!(a.read(&cell as *const u64).unwrap(), 3);
        assert_eq!(b.read(&cell as *const u64).unwrap(), 3);
        a.commit().unwrap();
        b.commit().unwrap();
    }

    #[test]
    fn nested_transactions_only_run_protocol_at_outer_level() {
        let runtime: Runtime<64> = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 1;

        desc.begin();
        desc.begin();
        desc.write(&mut cell as *mut u32, 2).unwrap();
        desc.commit().unwrap();
        assert_eq!(cell, 2);
        desc.commit().unwrap();
        assert_eq!(cell, 2);
    }
}
