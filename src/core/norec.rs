//! Value-based core (NOrec): a single global sequence lock plus a value
//! log, no per-address metadata at all (spec §4.4).
//!
//! No orec table: every address is validated by re-reading it and
//! comparing against what was observed, not by checking a per-address
//! version word. This buys zero instrumentation overhead on any address
//! never touched by a concurrent writer, at the cost of a single global
//! point of writer serialization (`crate::sequence::Sequence`).

use core::sync::atomic::Ordering;

use crate::alloc_mgr::{AllocationManager, GlobalAllocator, Variant};
use crate::contention::{ContentionManager, Disposition, HourglassToken};
use crate::deferred::DeferredQueue;
use crate::epoch::{Epoch, Guard};
use crate::error::{AbortReason, CoreResult, Restart};
use crate::frame::FrameFilter;
use crate::logs::redo::RedoLog;
use crate::logs::value::ValueLog;
use crate::logs::{load_bits_by_width, Scalar};
use crate::sequence::Sequence;

/// Shared state: just the sequence lock, the epoch table and the
/// hourglass token. There is no orec table for this core.
pub struct Runtime {
    seq: Sequence,
    epoch: Epoch,
    hourglass: HourglassToken,
}

impl Runtime {
    pub const fn new() -> Self {
        Self {
            seq: Sequence::new(),
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

/// Per-thread descriptor: redo log for buffered writes, value log for
/// validating every read against a concurrent committer.
pub struct Descriptor<'r> {
    runtime: &'r Runtime,
    slot: u32,
    nesting_depth: u32,
    start_seq: usize,
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
            start_seq: 0,
            redo: RedoLog::new(),
            values: ValueLog::new(),
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
        self.start_seq = self.runtime.seq.read_begin();
        self.epoch.on_begin(self.start_seq as u64);
        self.contention
            .before_begin(self.slot, Some(&self.runtime.hourglass))
    }

    /// Re-read every logged value; true if nothing has changed.
    fn validate(&self) -> bool {
        self.values
            .find_mismatch(|addr, width| unsafe { load_bits_by_width(addr, width) })
            .is_none()
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
        loop {
            let raw = unsafe { load_bits_by_width(addr as usize, width) };
            if !self.runtime.seq.read_retry(self.start_seq) {
                let merged = match self.redo.lookup(addr as usize, width.bytes()) {
                    Some(hit) => {
                        u64::from_le_bytes(hit.reconstruct(width.bytes(), &raw.to_le_bytes()))
                    }
                    None => raw,
                };
                self.values.record(addr as usize, width, raw);
                return Ok(T::from_bits(merged));
            }
            // A writer committed mid-read: the whole value log (everything
            // read so far this transaction) must still hold before we can
            // adopt the new sequence number and keep going.
            if !self.validate() {
                return Err(Restart(AbortReason::ReadInconsistency));
            }
            self.start_seq = self.runtime.seq.read_begin();
            self.epoch.set_epoch(self.start_seq as u64);
        }
    }

    /// NOrec never locks at write time: every write is redo-buffered only.
    pub fn write<T: Scalar>(&mut self, addr: *mut T, val: T) -> CoreResult<()> {
        if self.frame.is_private(addr as usize) {
            unsafe { core::ptr::write(addr, val) };
            return Ok(());
        }
        self.redo.insert(addr as usize, T::WIDTH.bytes(), val.to_bits());
        Ok(())
    }

    /// Read-only fast path, or acquire the single sequence lock, validate,
    /// write back and release (spec §4.4).
    pub fn commit(&mut self) -> CoreResult<()> {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
        if self.nesting_depth != 0 {
            return Ok(());
        }
        if self.redo.is_empty() {
            if !self.validate() {
                self.abort();
                return Err(Restart(AbortReason::ReadInconsistency));
            }
            self.epoch.quiesce(self.start_seq as u64);
            self.finish_commit();
            return Ok(());
        }

        loop {
            if self.runtime.seq.try_write_begin().is_some() {
                break;
            }
            // Lost the CAS to another committing writer: its writeback may
            // have touched something in our read set, so re-validate
            // before trying to acquire again.
            if !self.validate() {
                self.abort();
                return Err(Restart(AbortReason::ReadInconsistency));
            }
        }
        if !self.validate() {
            self.runtime.seq.write_end();
            self.abort();
            return Err(Restart(AbortReason::ReadInconsistency));
        }
        self.redo.writeback(|addr, bytes| unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        });
        self.runtime.seq.write_end();
        let end_seq = self.runtime.seq.read();
        self.epoch.quiesce(end_seq as u64);
        self.finish_commit();
        Ok(())
    }

    fn finish_commit(&mut self) {
        self.values.clear();
        self.redo.clear();
        self.epoch.clear_epoch();
        self.deferred.on_commit();
        self.alloc_mgr.commit_mallocs();
        self.alloc_mgr.commit_frees();
        self.contention
            .after_commit(self.slot, Some(&self.runtime.hourglass));
    }

    pub fn abort(&mut self) -> Restart {
        self.redo.clear();
        self.values.clear();
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

    /// Claim the process-wide irrevocability token and wait for every
    /// other descriptor to go quiescent.
    pub fn try_become_irrevocable(&self) -> bool {
        self.epoch.try_irrevoc()
    }

    pub fn release_irrevocable(&self) {
        self.epoch.release_irrevoc()
    }
}
