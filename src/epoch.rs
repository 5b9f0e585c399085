//! Per-thread announced-epoch table, quiescence and the irrevocability
//! token.
//!
//! Each registered thread owns one [`EpochRecord`] announcing either a
//! timestamp it is active at or [`QUIESCENT`]. `quiesce(t)` waits until
//! every other thread's announcement is either quiescent or greater than
//! `t`, which is what lets a committing writer know no reader that began
//! at or before `t` can still be running with a stale view. This is the
//! linked-list-of-records, RAII-`Guard` registration idiom, repointed at
//! announced timestamps instead of reclamation generations: there is no
//! garbage list here because freeing is the allocation manager's job,
//! not the epoch manager's.

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

/// The announcement value meaning "not currently inside a transaction".
pub const QUIESCENT: u64 = u64::MAX;

struct EpochRecord {
    announced: AtomicU64,
    next: AtomicPtr<EpochRecord>,
}

impl EpochRecord {
    fn new() -> Self {
        Self {
            announced: AtomicU64::new(QUIESCENT),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Process-wide epoch state: the head of the registered-thread list and
/// the single irrevocability token.
pub struct Epoch {
    head: AtomicPtr<EpochRecord>,
    irrevocable_held: AtomicBool,
}

impl Epoch {
    /// Create an empty epoch table with the irrevocability token free.
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            irrevocable_held: AtomicBool::new(false),
        }
    }

    /// Register the calling thread, returning a guard that owns its
    /// announcement slot for the thread's lifetime.
    pub fn register(&self) -> Guard<'_> {
        let record = Box::into_raw(Box::new(EpochRecord::new()));
        loop {
            let head = self.head.load(Ordering::Relaxed);
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        Guard {
            epoch: self,
            record,
            _not_send_sync: core::marker::PhantomData,
        }
    }

    /// True if some thread currently holds the irrevocability token.
    #[inline]
    pub fn exists_irrevoc(&self) -> bool {
        self.irrevocable_held.load(Ordering::Acquire)
    }

    fn iter_others<'a>(&'a self, mine: *const EpochRecord) -> OthersIter<'a> {
        OthersIter {
            current: self.head.load(Ordering::Acquire),
            mine,
            _marker: core::marker::PhantomData,
        }
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

struct OthersIter<'a> {
    current: *mut EpochRecord,
    mine: *const EpochRecord,
    _marker: core::marker::PhantomData<&'a EpochRecord>,
}

impl<'a> Iterator for OthersIter<'a> {
    type Item = &'a EpochRecord;

    fn next(&mut self) -> Option<&'a EpochRecord> {
        while !self.current.is_null() {
            let record = unsafe { &*self.current };
            self.current = record.next.load(Ordering::Acquire);
            if (record as *const EpochRecord) != self.mine {
                return Some(record);
            }
        }
        None
    }
}

/// A registered thread's handle into the epoch table.
///
/// Deliberately `!Send + !Sync`: a descriptor's epoch slot is only ever
/// touched by the thread that registered it.
pub struct Guard<'a> {
    epoch: &'a Epoch,
    record: *mut EpochRecord,
    _not_send_sync: core::marker::PhantomData<*mut ()>,
}

impl<'a> Guard<'a> {
    /// Announce that this thread is now active at timestamp `t`.
    #[inline]
    pub fn on_begin(&self, t: u64) {
        unsafe { &*self.record }
            .announced
            .store(t, Ordering::Release);
    }

    /// Update the active announcement to `t` without changing
    /// quiescent/active state. Used when a core extends its start time
    /// mid-transaction (e.g. OrecEager's fresh-time-and-validate retry).
    #[inline]
    pub fn set_epoch(&self, t: u64) {
        self.on_begin(t);
    }

    /// Announce that this thread is no longer active.
    #[inline]
    pub fn clear_epoch(&self) {
        unsafe { &*self.record }
            .announced
            .store(QUIESCENT, Ordering::Release);
    }

    /// Wait until every other registered thread's announcement is either
    /// quiescent or strictly greater than `t`.
    pub fn quiesce(&self, t: u64) {
        for other in self.epoch.iter_others(self.record) {
            loop {
                let announced = other.announced.load(Ordering::Acquire);
                if announced == QUIESCENT || announced > t {
                    break;
                }
                crate::platform::stall();
            }
        }
    }

    /// Wait until every other registered thread is quiescent, regardless
    /// of timestamp. Used after acquiring the irrevocability token: an
    /// irrevocable transaction must run with no concurrent transaction
    /// at all.
    fn quiesce_all(&self) {
        for other in self.epoch.iter_others(self.record) {
            while other.announced.load(Ordering::Acquire) != QUIESCENT {
                crate::platform::stall();
            }
        }
    }

    /// Attempt to acquire the single process-wide irrevocability token
    /// and wait for every other thread to go quiescent. Returns `false`
    /// if another thread already holds the token.
    pub fn try_irrevoc(&self) -> bool {
        if self
            .epoch
            .irrevocable_held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.quiesce_all();
        true
    }

    /// Release a held irrevocability token.
    pub fn release_irrevoc(&self) {
        self.epoch.irrevocable_held.store(false, Ordering::Release);
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        unsafe { &*self.record }
            .announced
            .store(QUIESCENT, Ordering::Release);
    }
}
