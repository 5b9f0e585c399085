//! Lazy-locking orec core (OrecLazy / TL2 / OrecMixed): redo-log buffered
//! writes validated against the same orec table and version clock as
//! [`crate::core::orec_eager`], but with lock acquisition deferred past
//! the write itself (spec §4.3).
//!
//! One descriptor, two flags pick between the three named variants:
//! - `LockMode::CommitTime` (OrecLazy/TL2, the default): every lock is
//!   acquired in a single pass over the redo log's chunk bases at commit.
//! - `LockMode::EncounterTime` (OrecMixed): a write locks its orec
//!   immediately, same as the eager core, but still only buffers the
//!   value — the in-place store happens at commit's writeback pass.
//! - `single_fence` (the TL2 optimization): skip read-set revalidation
//!   against a freshly sampled clock mid-transaction and trust the single
//!   post-lock-acquisition fence at commit instead. A descriptor built
//!   with this set never records a read-set.

use core::sync::atomic::Ordering;

use alloc::vec::Vec;

use crate::alloc_mgr::{AllocationManager, GlobalAllocator, Variant};
use crate::clock::VersionClock;
use crate::contention::{ContentionManager, Disposition, HourglassToken};
use crate::deferred::DeferredQueue;
use crate::epoch::{Epoch, Guard};
use crate::error::{AbortReason, CoreResult, Restart};
use crate::frame::FrameFilter;
use crate::logs::redo::RedoLog;
use crate::logs::Scalar;
use crate::minivec::MiniVec;
use crate::orec::{self, lock_token, Orec, OrecTable};

/// When a write's orec lock is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    CommitTime,
    EncounterTime,
}

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

/// Per-thread descriptor: redo log, read-set and (possibly empty until
/// commit) lock-set of orec references.
pub struct Descriptor<'r, const N: usize> {
    runtime: &'r Runtime<N>,
    slot: u32,
    nesting_depth: u32,
    start_time: u64,
    mode: LockMode,
    single_fence: bool,
    redo: RedoLog,
    read_set: MiniVec<&'r Orec>,
    lock_set: MiniVec<&'r Orec>,
    frame: FrameFilter,
    deferred: DeferredQueue,
    alloc_mgr: AllocationManager<GlobalAllocator>,
    contention: ContentionManager,
    epoch: Guard<'r>,
}

impl<'r, const N: usize> Descriptor<'r, N> {
    pub fn new(runtime: &'r Runtime<N>, slot: u32, mode: LockMode, single_fence: bool) -> Self {
        Self {
            runtime,
            slot,
            nesting_depth: 0,
            start_time: 0,
            mode,
            single_fence,
            redo: RedoLog::new(),
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
    /// Always true under `single_fence`, which keeps no read-set.
    fn validate(&self, bound: u64) -> bool {
        if self.single_fence {
            return true;
        }
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
        let width = T::WIDTH;
        let hit = self.redo.lookup(addr as usize, width.bytes());
        if let Some(h) = hit {
            if h.is_full_hit(width.bytes()) {
                let bytes = h.reconstruct(width.bytes(), &[0u8; 8]);
                return Ok(T::from_bits(u64::from_le_bytes(bytes)));
            }
        }

        let o = self.runtime.orecs.get(addr as usize);
        let my_token = self.token();
        loop {
            let pre = o.load(Ordering::Acquire);
            if orec::is_locked(pre) && pre != my_token {
                let fresh = self.runtime.clock.load(Ordering::Acquire);
                if !self.validate(self.start_time) {
                    return Err(Restart(AbortReason::ReadInconsistency));
                }
                self.start_time = fresh;
                self.epoch.set_epoch(fresh);
                continue;
            }
            let raw = unsafe { core::ptr::read(addr) }.to_bits();
            let post = o.load(Ordering::Acquire);
            if pre == post && (pre == my_token || orec::version(pre) <= self.start_time) {
                if pre != my_token && !self.single_fence {
                    self.read_set.push(o);
                }
                let merged = match hit {
                    Some(h) => u64::from_le_bytes(h.reconstruct(width.bytes(), &raw.to_le_bytes())),
                    None => raw,
                };
                return Ok(T::from_bits(merged));
            }
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
        if self.mode == LockMode::EncounterTime {
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
        }
        self.redo.insert(addr as usize, T::WIDTH.bytes(), val.to_bits());
        Ok(())
    }

    /// Read-only fast path, or writer commit per spec §4.3: acquire any
    /// outstanding commit-time locks in one pass, fence the clock once,
    /// write back the redo log, then release.
    pub fn commit(&mut self) -> CoreResult<()> {
        debug_assert!(self.nesting_depth > 0);
        self.nesting_depth -= 1;
        if self.nesting_depth != 0 {
            return Ok(());
        }
        if self.redo.is_empty() {
            self.epoch.quiesce(self.start_time);
            self.finish_commit();
            return Ok(());
        }

        if self.mode == LockMode::CommitTime {
            let bases: Vec<usize> = self.redo.chunk_bases().collect();
            let my_token = self.token();
            for base in bases {
                let o = self.runtime.orecs.get(base);
                let pre = o.load(Ordering::Acquire);
                if orec::is_locked(pre) {
                    self.abort();
                    return Err(Restart(AbortReason::LockContention));
                }
                if orec::version(pre) > self.start_time {
                    self.abort();
                    return Err(Restart(AbortReason::ReadInconsistency));
                }
                match o.try_lock(pre, my_token) {
                    Ok(()) => self.lock_set.push(o),
                    Err(_) => {
                        self.abort();
                        return Err(Restart(AbortReason::LockContention));
                    }
                }
            }
        }

        let end_time = self.runtime.clock.fetch_add_one() + 1;
        if !self.single_fence && end_time != self.start_time + 1 && !self.validate(self.start_time)
        {
            self.abort();
            return Err(Restart(AbortReason::ReadInconsistency));
        }

        self.redo.writeback(|addr, bytes| unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        });
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
        self.redo.clear();
        self.epoch.clear_epoch();
        self.deferred.on_commit();
        self.alloc_mgr.commit_mallocs();
        self.alloc_mgr.commit_frees();
        self.contention
            .after_commit(self.slot, Some(&self.runtime.hourglass));
    }

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
        if !self.lock_set.is_empty() {
            self.rollback_locks();
        }
        self.redo.clear();
        self.read_set.clear();
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
