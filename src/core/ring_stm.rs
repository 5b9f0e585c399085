//! Bit-filter ring core (RingSTM: RingSW/RingMW, spec §4.5).
//!
//! A read adds a bit to a private Bloom filter, then incrementally
//! checks that filter against every entry the ring has published since
//! the last time this descriptor checked — not just once at commit.
//! That keeps a long-running reader from discovering a conflict only
//! after it has already read arbitrarily many values past the point a
//! concurrent writer invalidated them; the commit-time check is the
//! same incremental check run one last time against whatever was
//! published after the final read.
//!
//! `RingSW` (one committer at a time) and `RingMW` (many, ordered by a
//! ticket) are the same protocol here: a committer claims a ticket with
//! `clock.fetch_add_one`, waits for the ring's `last_init` cursor to
//! reach `ticket - 1`, then publishes its filter and writes its redo log
//! back. Under a build that only ever has one live writer this degenerates
//! to RingSW; allowing several to validate and writeback concurrently
//! (serialized only at the narrow publish step) is RingMW.

use crate::alloc_mgr::{AllocationManager, GlobalAllocator, Variant};
use crate::backoff::Backoff;
use crate::clock::VersionClock;
use crate::contention::{ContentionManager, Disposition, HourglassToken};
use crate::deferred::DeferredQueue;
use crate::epoch::{Epoch, Guard};
use crate::error::{AbortReason, CoreResult, Restart};
use crate::filter::{hash_addr, BitFilter, FilterRing};
use crate::frame::FrameFilter;
use crate::logs::redo::RedoLog;
use crate::logs::{load_bits_by_width, Scalar};

pub struct Runtime<const WORDS: usize, const CAP: usize> {
    clock: VersionClock,
    ring: FilterRing<WORDS, CAP>,
    epoch: Epoch,
    hourglass: HourglassToken,
}

impl<const WORDS: usize, const CAP: usize> Runtime<WORDS, CAP> {
    pub const fn new() -> Self {
        Self {
            clock: VersionClock::new(),
            ring: FilterRing::new(),
            epoch: Epoch::new(),
            hourglass: HourglassToken::new(),
        }
    }
}

impl<const WORDS: usize, const CAP: usize> Default for Runtime<WORDS, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Descriptor<'r, const WORDS: usize, const CAP: usize> {
    runtime: &'r Runtime<WORDS, CAP>,
    slot: u32,
    nesting_depth: u32,
    start_time: u64,
    last_checked: u64,
    read_filter: BitFilter<WORDS>,
    write_filter: BitFilter<WORDS>,
    redo: RedoLog,
    frame: FrameFilter,
    deferred: DeferredQueue,
    alloc_mgr: AllocationManager<GlobalAllocator>,
    contention: ContentionManager,
    epoch: Guard<'r>,
}

impl<'r, const WORDS: usize, const CAP: usize> Descriptor<'r, WORDS, CAP> {
    pub fn new(runtime: &'r Runtime<WORDS, CAP>, slot: u32) -> Self {
        Self {
            runtime,
            slot,
            nesting_depth: 0,
            start_time: 0,
            last_checked: 0,
            read_filter: BitFilter::new(),
            write_filter: BitFilter::new(),
            redo: RedoLog::new(),
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
        self.start_time = self.runtime.ring.last_init();
        self.last_checked = self.start_time;
        self.epoch.on_begin(self.start_time);
        self.contention
            .before_begin(self.slot, Some(&self.runtime.hourglass))
    }

    #[inline]
    fn bit_for(addr: usize) -> usize {
        hash_addr(addr, BitFilter::<WORDS>::BITS)
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
        self.read_filter.add(Self::bit_for(addr as usize));
        let upto = self.runtime.ring.last_init();
        if let Err(reason) = self.check_for_conflicts(upto) {
            return Err(reason);
        }
        let raw = unsafe { load_bits_by_width(addr as usize, width) };
        let merged = match self.redo.lookup(addr as usize, width.bytes()) {
            Some(hit) => u64::from_le_bytes(hit.reconstruct(width.bytes(), &raw.to_le_bytes())),
            None => raw,
        };
        Ok(T::from_bits(merged))
    }

    pub fn write<T: Scalar>(&mut self, addr: *mut T, val: T) -> CoreResult<()> {
        if self.frame.is_private(addr as usize) {
            unsafe { core::ptr::write(addr, val) };
            return Ok(());
        }
        self.write_filter.add(Self::bit_for(addr as usize));
        self.redo.insert(addr as usize, T::WIDTH.bytes(), val.to_bits());
        Ok(())
    }

    /// Check the ring for overflow or an intersecting commit in
    /// `(self.last_checked, upto]`, advancing `last_checked` to `upto` on
    /// success so the next call only re-scans what's new. Called from
    /// every `read()` as well as from `commit()`, so a long-running
    /// reader discovers a conflict as soon as it happens rather than
    /// only once, at the end.
    fn check_for_conflicts(&mut self, upto: u64) -> CoreResult<()> {
        if self.runtime.ring.overflowed(self.last_checked, upto) {
            return Err(Restart(AbortReason::RingOverflow));
        }
        if upto > self.last_checked {
            let conflict = self
                .runtime
                .ring
                .intersects_range(&self.read_filter, self.last_checked, upto)
                || self
                    .runtime
                    .ring
                    .intersects_range(&self.write_filter, self.last_checked, upto);
            self.last_checked = upto;
            if conflict {
                return Err(Restart(AbortReason::ReadInconsistency));
            }
        }
        Ok(())
    }

    pub fn commit(&mut self) -> CoreResult<()> {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
        if self.nesting_depth != 0 {
            return Ok(());
        }
        if self.redo.is_empty() {
            let upto = self.runtime.ring.last_init();
            if let Err(reason) = self.check_for_conflicts(upto) {
                self.abort();
                return Err(reason);
            }
            self.epoch.quiesce(self.start_time);
            self.finish_commit();
            return Ok(());
        }

        let ticket = self.runtime.clock.fetch_add_one() + 1;
        if let Err(reason) = self.check_for_conflicts(ticket - 1) {
            self.abort();
            return Err(reason);
        }

        let mut backoff = Backoff::new();
        while self.runtime.ring.last_init() != ticket - 1 {
            backoff.spin();
        }
        self.runtime.ring.publish(ticket, &self.write_filter);

        self.redo.writeback(|addr, bytes| unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        });
        self.runtime.ring.complete_up_to(ticket);

        self.epoch.quiesce(ticket);
        self.finish_commit();
        Ok(())
    }

    fn finish_commit(&mut self) {
        self.read_filter.clear();
        self.write_filter.clear();
        self.redo.clear();
        self.epoch.clear_epoch();
        self.deferred.on_commit();
        self.alloc_mgr.commit_mallocs();
        self.alloc_mgr.commit_frees();
        self.contention
            .after_commit(self.slot, Some(&self.runtime.hourglass));
    }

    pub fn abort(&mut self) -> Restart {
        self.read_filter.clear();
        self.write_filter.clear();
        self.redo.clear();
        self.epoch.clear_epoch();
        self.deferred.on_abort();
        self.alloc_mgr.on_abort();
        self.nesting_depth = 0;
        self.contention
            .after_abort(self.slot, Some(&self.runtime.hourglass));
        Restart(AbortReason::RingOverflow)
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

/// Default ring sizing: 256-bit filters (`WORDS = 4`), 64-deep ring.
pub type DefaultRuntime = Runtime<4, 64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_buffered_until_commit() {
        let runtime: Runtime<4, 64> = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 10;

        desc.begin();
        desc.write(&mut cell as *mut u32, 20).unwrap();
        assert_eq!(cell, 10);
        assert_eq!(desc.read(&cell as *const u32).unwrap(), 20);
        desc.commit().unwrap();

        assert_eq!(cell, 20);
    }

    #[test]
    fn abort_never_touches_memory() {
        let runtime: Runtime<4, 64> = Runtime::new();
        let mut desc = Descriptor::new(&runtime, 0);
        let mut cell: u32 = 5;

        desc.begin();
        desc.write(&mut cell as *mut u32, 999).unwrap();
        desc.abort();

        assert_eq!(cell, 5);
    }

    #[test]
    fn sequential_writers_both_land() {
        let runtime: Runtime<4, 64> = Runtime::new();
        let mut cell: u64 = 0;

        let mut a = Descriptor::new(&runtime, 0);
        a.begin();
        a.write(&mut cell as *mut u64, 1).unwrap();
        a.commit().unwrap();
        assert_eq!(cell, 1);

        let mut b = Descriptor::new(&runtime, 1);
        b.begin();
        b.write(&mut cell as *mut u64, 2).unwrap();
        b.commit().unwrap();
        assert_eq!(cell, 2);
    }

    #[test]
    fn reader_detects_conflicting_writer_via_filter_intersection() {
        let runtime: Runtime<4, 64> = Runtime::new();
        let mut cell: u32 = 1;

        let mut reader = Descriptor::new(&runtime, 0);
        reader.begin();
        assert_eq!(reader.read(&cell as *const u32).unwrap(), 1);

        let mut writer = Descriptor::new(&runtime, 1);
        writer.begin();
        writer.write(&mut cell as *mut u32, 2).unwrap();
        writer.commit().unwrap();
        assert_eq!(cell, 2);

        let result = reader.commit();
        assert!(result.is_err());
        reader.abort();
    }

    #[test]
    fn ring_overflow_forces_abort() {
        let runtime: Runtime<1, 4> = Runtime::new();
        let mut target: u32 = 0;

        let mut desc = Descriptor::new(&runtime, 0);
        desc.begin();
        assert_eq!(desc.read(&target as *const u32).unwrap(), 0);

        // Commit enough unrelated writers to push the ring past CAP.
        for i in 0..5u32 {
            let mut other: u32 = 0;
            let mut w = Descriptor::new(&runtime, 1);
            w.begin();
            w.write(&mut other as *mut u32, i).unwrap();
            w.commit().unwrap();
        }

        let result = desc.commit();
        assert!(result.is_err());
        desc.abort();
    }

    #[test]
    fn nested_transactions_only_run_protocol_at_outer_level() {
        let runtime: Runtime<4, 64> = Runtime::new();
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
}
