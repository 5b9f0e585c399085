//! Phased batch-commit core (Cohorts, spec §4.8).
//!
//! Transactions that begin together run fully concurrently with no
//! locking at all — reads are recorded in a value log, writes are
//! redo-buffered, and validation only happens once, at commit, against
//! whichever cohort member wrote back first. There are three
//! process-wide counters: `started` (transactions currently active),
//! `sealed` (committers that have claimed a writeback order) and
//! `finished` (committers that have written back). A cohort is "in
//! progress" whenever `sealed != finished`; `begin` blocks new entrants
//! until the previous cohort fully drains, which is what lets every
//! member of the next cohort assume no conflicting writer is still
//! running.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::alloc_mgr::{AllocationManager, GlobalAllocator, Variant};
use crate::backoff::Backoff;
use crate::contention::{ContentionManager, Disposition, HourglassToken};
use crate::deferred::DeferredQueue;
use crate::epoch::{Epoch, Guard};
use crate::error::{AbortReason, CoreResult, Restart};
use crate::frame::FrameFilter;
use crate::logs::redo::RedoLog;
use crate::logs::value::ValueLog;
use crate::logs::{load_bits_by_width, Scalar};

pub struct Runtime {
    started: AtomicU64,
    sealed: AtomicU64,
    finished: AtomicU64,
    epoch: Epoch,
    hourglass: HourglassToken,
}

impl Runtime {
    pub const fn new() -> Self {
        Self {
            started: AtomicU64::new(0),
            sealed: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            epoch: Epoch::new(),
            hourglass: HourglassToken::new(),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread descriptor: a redo log for buffered writes and a value log
/// for validating every read against whichever cohort member writes
/// back before this one's turn.
pub struct Descriptor<'r> {
    runtime: &'r Runtime,
    slot: u32,
    nesting_depth: u32,
    /// `finished`'s value at `begin`: this cohort's writeback baseline.
    start: u64,
    redo: RedoLog,
    values: ValueLog,
    frame: FrameFilter,
    deferred: DeferredQueue,
    alloc_mgr: AllocationManager<GlobalAllocator>,
    contention: ContentionManager,
    epoch: Guard<'r>,
}

impl<'r> Descriptor<'r> {
    pub fn new(runtime: &'r Runtime, slot: u32) -> Self {
        Self {
            runtime,
            slot,
            nesting_depth: 0,
            start: 0,
            redo: RedoLog::new(),
            values: ValueLog::new(),
            frame: FrameFilter::new(),
            deferred: DeferredQueue::new(),
            alloc_mgr: AllocationManager::new(GlobalAllocator, Variant::Basic),
            contention: ContentionManager::new(),
            epoch: runtime.epoch.register(),
        }
    }

    /// Join the current cohort, or wait for one in progress to drain and
    /// try again.
    pub fn begin(&mut self) -> Disposition {
        self.nesting_depth += 1;
        if self.nesting_depth != 1 {
            return Disposition::Proceed;
        }
        self.frame.set_bottom(self as *const Self as usize);
        self.alloc_mgr.on_begin();
        let mut backoff = Backoff::new();
        loop {
            self.runtime.started.fetch_add(1, Ordering::AcqRel);
            let sealed = self.runtime.sealed.load(Ordering::Acquire);
            let finished = self.runtime.finished.load(Ordering::Acquire);
            if sealed == finished {
                self.start = finished;
                break;
            }
            // A cohort is already sealing; back out and wait for it to
            // fully drain before trying to join the next one.
            self.runtime.started.fetch_sub(1, Ordering::AcqRel);
            while self.runtime.sealed.load(Ordering::Acquire)
                != self.runtime.finished.load(Ordering::Acquire)
            {
                backoff.spin();
            }
        }
        self.epoch.on_begin(self.start);
        self.contention
            .before_begin(self.slot, Some(&self.runtime.hourglass))
    }

    pub fn read<T: Scalar>(&mut self, addr: *const T) -> CoreResult<T> {
        if self.frame.is_private(addr as usize) {
            return Ok(unsafe { core::ptr::read(addr) });
        }
        let width = T::WIDTH;
        if let Some(hit) = self.redo.lookup(addr as usize, width.bytes()) {
            if hit.is_full_hit(width.bytes()) {
                let bytes = hit.reconstruct(width.bytes(), &[0u8; 8]);
                return Ok(T::from_bits(u64::from_le_bytes(bytes)));
            }
        }
        let raw = unsafe { load_bits_by_width(addr as usize, width) };
        let merged = match self.redo.lookup(addr as usize, width.bytes()) {
            Some(hit) => u64::from_le_bytes(hit.reconstruct(width.bytes(), &raw.to_le_bytes())),
            None => raw,
        };
        self.values.record(addr as usize, width, raw);
        Ok(T::from_bits(merged))
    }

    /// Cohorts never writes in place: every write is redo-buffered until
    /// this descriptor's writeback turn.
    pub fn write<T: Scalar>(&mut self, addr: *mut T, val: T) -> CoreResult<()> {
        if self.frame.is_private(addr as usize) {
            unsafe { core::ptr::write(addr, val) };
            return Ok(());
        }
        self.redo.insert(addr as usize, T::WIDTH.bytes(), val.to_bits());
        Ok(())
    }

    /// Re-read every logged value; true if nothing has changed since
    /// this descriptor's reads were taken.
    fn validate(&self) -> bool {
        self.values
            .find_mismatch(|addr, width| unsafe { load_bits_by_width(addr, width) })
            .is_none()
    }

    pub fn commit(&mut self) -> CoreResult<()> {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
        if self.nesting_depth != 0 {
            return Ok(());
        }

        if self.redo.is_empty() {
            // Read-only: leave the cohort without taking a writeback
            // ticket, and without waiting for anyone (spec §4.8).
            self.runtime.started.fetch_sub(1, Ordering::AcqRel);
            self.values.clear();
            self.epoch.clear_epoch();
            self.deferred.on_commit();
            self.alloc_mgr.commit_mallocs();
            self.alloc_mgr.commit_frees();
            self.contention
                .after_commit(self.slot, Some(&self.runtime.hourglass));
            return Ok(());
        }

        let my_order = self.runtime.sealed.fetch_add(1, Ordering::AcqRel);
        self.runtime.started.fetch_sub(1, Ordering::AcqRel);

        // Seal the cohort: wait until every transaction that started
        // alongside this one has also reached commit, so no new writer
        // can still invalidate what we're about to write back.
        let mut backoff = Backoff::new();
        while self.runtime.started.load(Ordering::Acquire) != 0 {
            backoff.spin();
        }
        let sealed_snapshot = self.runtime.sealed.load(Ordering::Acquire);

        // Wait for our turn in writeback order.
        let mut backoff = Backoff::new();
        while self.runtime.finished.load(Ordering::Acquire) != my_order {
            backoff.spin();
        }

        // The first writer in the cohort has nothing committed ahead of
        // it to conflict with; everyone after that must validate.
        let outcome = if my_order == self.start || self.validate() {
            self.redo.writeback(|addr, bytes| unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
            });
            Ok(())
        } else {
            Err(Restart(AbortReason::ReadInconsistency))
        };

        self.runtime.finished.fetch_add(1, Ordering::AcqRel);

        // Wait for the rest of the cohort to finish before freeing, so
        // the next cohort's `begin` observes `sealed == finished`.
        let mut backoff = Backoff::new();
        while self.runtime.finished.load(Ordering::Acquire) != sealed_snapshot {
            backoff.spin();
        }

        if outcome.is_ok() {
            self.epoch.quiesce(sealed_snapshot);
        }
        self.values.clear();
        self.redo.clear();
        self.epoch.clear_epoch();
        if outcome.is_ok() {
            self.deferred.on_commit();
            self.alloc_mgr.commit_mallocs();
            self.alloc_mgr.commit_frees();
            self.contention
                .after_commit(self.slot, Some(&self.runtime.hourglass));
        } else {
            self.deferred.on_abort();
            self.alloc_mgr.on_abort();
            self.contention
                .after_abort(self.slot, Some(&self.runtime.hourglass));
        }
        outcome
    }

    /// Leave the cohort before ever taking a writeback ticket — used
    /// when the transaction body itself reports failure, not when
    /// validation fails during writeback (that path is handled inside
    /// `commit`, since by then a ticket is already held).
    pub fn abort(&mut self) -> Restart {
        self.redo.clear();
        self.values.clear();
        self.runtime.started.fetch_sub(1, Ordering::AcqRel);
        self.epoch.clear_epoch();
        self.deferred.on_abort();
        self.alloc_mgr.on_abort();
        self.nesting_depth = 0;
        self.contention
            .after_abort(self.slot, Some(&self.runtime.hourglass));
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

    /// Cohorts has no irrevocable path (spec §4.8): there is no lock to
    /// hand a single thread exclusive access to, only a writeback
    /// ticket every thread must still wait its turn for.
    pub fn try_become_irrevocable(&self) -> bool {
        false
    }

    pub fn release_irrevocable(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip_commits() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 10;

        desc.begin();
        assert_eq!(desc.read(&cell as *const u32).unwrap(), 10);
        desc.write(&mut cell as *mut u32, 20).unwrap();
        desc.commit().unwrap();

        assert_eq!(cell, 20);
    }

    #[test]
    fn abort_before_commit_never_touches_memory() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 5;

        desc.begin();
        desc.write(&mut cell as *mut u32, 999).unwrap();
        desc.abort();

        assert_eq!(cell, 5);
        assert_eq!(runtime.started.load(Ordering::Acquire), 0);
    }

    #[test]
    fn read_only_commit_skips_the_writeback_ticket() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let cell: u32 = 7;

        desc.begin();
        assert_eq!(desc.read(&cell as *const u32).unwrap(), 7);
        desc.commit().unwrap();

        assert_eq!(runtime.sealed.load(Ordering::Acquire), 0);
        assert_eq!(runtime.finished.load(Ordering::Acquire), 0);
    }

    #[test]
    fn two_writers_in_one_cohort_both_commit_in_ticket_order() {
        let runtime = Runtime::new();
        let mut cell: u64 = 0;

        let mut a = Descriptor::new(&runtime, 0);
        let mut b = Descriptor::new(&runtime, 1);
        a.begin();
        b.begin();

        a.write(&mut cell as *mut u64, 1).unwrap();
        b.write(&mut cell as *mut u64, 2).unwrap();

        a.commit().unwrap();
        b.commit().unwrap();

        assert_eq!(cell, 2);
        assert_eq!(runtime.sealed.load(Ordering::Acquire), 2);
        assert_eq!(runtime.finished.load(Ordering::Acquire), 2);
    }

    #[test]
    fn a_second_cohort_only_starts_once_the_first_drains() {
        let runtime = Runtime::new();
        let mut cell: u64 = 0;

        let mut a = Descriptor::new(&runtime, 0);
        a.begin();
        a.write(&mut cell as *mut u64, 1).unwrap();
        a.commit().unwrap();

        let mut b = Descriptor::new(&runtime, 1);
        b.begin();
        assert_eq!(b.start, 1);
        b.write(&mut cell as *mut u64, 2).unwrap();
        b.commit().unwrap();

        assert_eq!(cell, 2);
    }

    #[test]
    fn nested_transactions_only_run_protocol_at_outer_level() {
        let runtime = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 1;

        desc.begin();
        desc.begin();
        desc.write(&mut cell as *mut u32, 2).unwrap();
        desc.commit().unwrap();
        assert_eq!(cell, 1);
        desc.commit().unwrap();
        assert_eq!(cell, 2);
    }

    #[test]
    fn irrevocability_is_never_supported() {
        let runtime = Runtime::new();
        let desc = Descriptor::new(&runtime, 0);
        assert!(!desc.try_become_irrevocable());
    }
}
