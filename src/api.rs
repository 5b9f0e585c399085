//! The process-wide, C-calling-convention-shaped external interface
//! (spec §6): what a code-transformation front-end or a hand-instrumented
//! application actually links against.
//!
//! Exactly one core is linked into a given build, selected by Cargo
//! feature (`core-cgl`, `core-orec-eager` [default], `core-orec-lazy`,
//! `core-norec`, `core-ring-stm`, `core-tlrw`, `core-cohorts`) — the
//! cores in [`crate::core`] deliberately share no Rust trait, so this
//! module is the `cfg`-dispatch point the module-level doc comment
//! promises, picking one concrete `Runtime`/`Descriptor` pair and naming
//! it `SelectedRuntime`/`SelectedDescriptor` for everything below.
//!
//! There is no `longjmp` in Rust, so the checkpoint/retry pattern
//! [`crate::descriptor`] describes is instead ordinary `Result`
//! propagation: a transaction body is `Fn(*mut ()) -> CoreResult<R>` and
//! uses `?` on the `load_*`/`store_*` calls below; [`execute`] re-invokes
//! it from the top whenever it, or the commit that follows it, reports a
//! [`crate::error::Restart`].

use core::cell::RefCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::contention::Disposition;
use crate::error::{CoreResult, FatalError};

cfg_if::cfg_if! {
    if #[cfg(feature = "core-cgl")] {
        use crate::alloc_mgr::GlobalAllocator;
        /// Table/ring sizing is irrelevant for CGL; kept only so every
        /// branch of this `cfg_if` defines the same constant names.
        const TABLE_SLOTS: usize = 4096;
        pub type SelectedRuntime = crate::core::cgl::Runtime<GlobalAllocator>;
        pub type SelectedDescriptor<'r> = crate::core::cgl::Descriptor<'r, GlobalAllocator>;

        fn new_descriptor(runtime: &'static SelectedRuntime, _slot: u32) -> SelectedDescriptor<'static> {
            crate::core::cgl::Descriptor::new(runtime)
        }
    } else if #[cfg(feature = "core-orec-lazy")] {
        const TABLE_SLOTS: usize = 4096;
        pub type SelectedRuntime = crate::core::orec_lazy::Runtime<TABLE_SLOTS>;
        pub type SelectedDescriptor<'r> = crate::core::orec_lazy::Descriptor<'r, TABLE_SLOTS>;

        /// Selects commit-time locking (OrecLazy/TL2). Switch the mode
        /// argument to `EncounterTime` for OrecMixed, or flip the
        /// trailing `bool` to `true` for TL2's single-fence variant.
        fn new_descriptor(runtime: &'static SelectedRuntime, slot: u32) -> SelectedDescriptor<'static> {
            crate::core::orec_lazy::Descriptor::new(
                runtime,
                slot,
                crate::core::orec_lazy::LockMode::CommitTime,
                false,
            )
        }
    } else if #[cfg(feature = "core-norec")] {
        const TABLE_SLOTS: usize = 4096;
        pub type SelectedRuntime = crate::core::norec::Runtime;
        pub type SelectedDescriptor<'r> = crate::core::norec::Descriptor<'r>;

        fn new_descriptor(runtime: &'static SelectedRuntime, slot: u32) -> SelectedDescriptor<'static> {
            crate::core::norec::Descriptor::new(runtime, slot)
        }
    } else if #[cfg(feature = "core-ring-stm")] {
        const TABLE_SLOTS: usize = 4096;
        const RING_WORDS: usize = 4;
        const RING_CAP: usize = 64;
        pub type SelectedRuntime = crate::core::ring_stm::Runtime<RING_WORDS, RING_CAP>;
        pub type SelectedDescriptor<'r> = crate::core::ring_stm::Descriptor<'r, RING_WORDS, RING_CAP>;

        fn new_descriptor(runtime: &'static SelectedRuntime, slot: u32) -> SelectedDescriptor<'static> {
            crate::core::ring_stm::Descriptor::new(runtime, slot)
        }
    } else if #[cfg(feature = "core-tlrw")] {
        const TABLE_SLOTS: usize = 4096;
        pub type SelectedRuntime = crate::core::tlrw::Runtime<TABLE_SLOTS>;
        pub type SelectedDescriptor<'r> = crate::core::tlrw::Descriptor<'r, TABLE_SLOTS>;

        fn new_descriptor(runtime: &'static SelectedRuntime, slot: u32) -> SelectedDescriptor<'static> {
            crate::core::tlrw::Descriptor::new(runtime, slot)
        }
    } else if #[cfg(feature = "core-cohorts")] {
        const TABLE_SLOTS: usize = 4096;
        pub type SelectedRuntime = crate::core::cohorts::Runtime;
        pub type SelectedDescriptor<'r> = crate::core::cohorts::Descriptor<'r>;

        fn new_descriptor(runtime: &'static SelectedRuntime, slot: u32) -> SelectedDescriptor<'static> {
            crate::core::cohorts::Descriptor::new(runtime, slot)
        }
    } else {
        const TABLE_SLOTS: usize = 4096;
        pub type SelectedRuntime = crate::core::orec_eager::Runtime<TABLE_SLOTS>;
        pub type SelectedDescriptor<'r> = crate::core::orec_eager::Descriptor<'r, TABLE_SLOTS>;

        fn new_descriptor(runtime: &'static SelectedRuntime, slot: u32) -> SelectedDescriptor<'static> {
            crate::core::orec_eager::Descriptor::new(runtime, slot)
        }
    }
}

/// Bound on live descriptors: [`crate::bytelock::MAX_SLOTS`]'s reader
/// array is the tightest limit any core places on a slot index, so every
/// build shares it regardless of which core is selected.
const MAX_DESCRIPTOR_SLOTS: u32 = crate::bytelock::MAX_SLOTS as u32;

static RUNTIME: SelectedRuntime = SelectedRuntime::new();
static SLOTS: crate::descriptor::SlotAllocator = crate::descriptor::SlotAllocator::new();

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
std::thread_local! {
    static DESCRIPTOR: RefCell<Option<SelectedDescriptor<'static>>> = const { RefCell::new(None) };
    static IRREVOCABLE: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Bare-metal/uniprocessor fallback for builds without the `std`
/// feature: exactly one descriptor, guarded by a spinlock rather than
/// per-thread storage. Suitable only for single-core targets.
#[cfg(not(feature = "std"))]
static DESCRIPTOR: spin::Mutex<Option<SelectedDescriptor<'static>>> = spin::Mutex::new(None);
#[cfg(not(feature = "std"))]
static IRREVOCABLE: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

fn fresh_descriptor() -> SelectedDescriptor<'static> {
    let slot = SLOTS
        .acquire(MAX_DESCRIPTOR_SLOTS)
        .expect("descriptor slots exhausted");
    new_descriptor(&RUNTIME, slot)
}

/// Run `f` against the calling thread's descriptor, creating it on first
/// use. Never held across a call back into application code — every
/// caller in this module acquires it once per core operation, so a
/// `body` closure that itself calls `load_*`/`store_*` never re-enters
/// the same borrow.
#[cfg(feature = "std")]
fn with_descriptor<R>(f: impl FnOnce(&mut SelectedDescriptor<'static>) -> R) -> R {
    DESCRIPTOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        let desc = slot.get_or_insert_with(fresh_descriptor);
        f(desc)
    })
}

#[cfg(not(feature = "std"))]
fn with_descriptor<R>(f: impl FnOnce(&mut SelectedDescriptor<'static>) -> R) -> R {
    let mut guard = DESCRIPTOR.lock();
    let desc = guard.get_or_insert_with(fresh_descriptor);
    f(desc)
}

fn is_irrevocable() -> bool {
    #[cfg(feature = "std")]
    {
        IRREVOCABLE.with(|c| c.get())
    }
    #[cfg(not(feature = "std"))]
    {
        IRREVOCABLE.load(Ordering::Acquire)
    }
}

fn set_irrevocable(value: bool) {
    #[cfg(feature = "std")]
    {
        IRREVOCABLE.with(|c| c.set(value));
    }
    #[cfg(not(feature = "std"))]
    {
        IRREVOCABLE.store(value, Ordering::Release);
    }
}

fn release_irrevocable_if_held() {
    if is_irrevocable() {
        with_descriptor(|d| d.release_irrevocable());
        set_irrevocable(false);
    }
}

/// Process-wide diagnostic counters, atomically accumulated across every
/// descriptor and surfaced by [`report_stats`].
struct AtomicStats {
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl AtomicStats {
    const fn new() -> Self {
        Self {
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }

    fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> crate::core::CoreStats {
        let mut stats = crate::core::CoreStats::new();
        stats.commits = self.commits.load(Ordering::Relaxed);
        stats.aborts = self.aborts.load(Ordering::Relaxed);
        stats
    }
}

static STATS: AtomicStats = AtomicStats::new();

/// Call a [`crate::error::FatalError`] terminator: log it and abort the
/// process. Nothing upstream of this ever gets a `Result` to inspect —
/// per spec §7, an unsupported-operation or unrecoverable-pressure
/// condition is fatal, not retryable.
pub fn fatal(err: FatalError) -> ! {
    log::error!("fatal transactional-memory error: {err}");
    #[cfg(feature = "std")]
    {
        std::process::abort();
    }
    #[cfg(not(feature = "std"))]
    {
        loop {
            core::sync::atomic::compiler_fence(Ordering::SeqCst);
        }
    }
}

/// Start a transaction, then act on the core's own escalation request
/// (spec §4.1 step 5) instead of leaving it to be discovered only by a
/// caller that happens to ask `is_irrevocable` later.
fn begin_descriptor() {
    let disposition = with_descriptor(|d| d.begin());
    if disposition == Disposition::BecomeIrrevocable {
        become_irrevocable();
    }
}

/// Run `body(arg)` as a transaction (spec §6's `execute`). `flags` is
/// reserved. Retries from the top on every `Restart`, whether reported
/// by `body` itself or by the commit that follows a successful one.
pub fn execute<R>(_flags: u32, body: impl Fn(*mut ()) -> CoreResult<R>, arg: *mut ()) -> R {
    loop {
        begin_descriptor();
        match body(arg) {
            Ok(value) => match with_descriptor(|d| d.commit()) {
                Ok(()) => {
                    STATS.record_commit();
                    release_irrevocable_if_held();
                    return value;
                }
                Err(_) => {
                    STATS.record_abort();
                }
            },
            Err(_) => {
                with_descriptor(|d| {
                    d.abort();
                });
                STATS.record_abort();
            }
        }
    }
}

/// Scoped form of [`execute`]: `raii_begin` starts the outer checkpoint
/// and returns whether the caller actually needs to retry around it (it
/// never does inside this crate's retry-by-`Result` design, but the
/// return value mirrors the C API so a transliterated caller reads the
/// same either way). `raii_end` commits, retrying internally until it
/// succeeds — there being no surrounding closure to re-invoke, a
/// `raii`-style transaction that conflicts pays for its retry with an
/// internally re-run, side-effect-free commit attempt only.
pub fn execute_raii_begin() -> bool {
    begin_descriptor();
    false
}

pub fn raii_end() {
    loop {
        match with_descriptor(|d| d.commit()) {
            Ok(()) => {
                STATS.record_commit();
                release_irrevocable_if_held();
                return;
            }
            Err(_) => {
                STATS.record_abort();
                begin_descriptor();
            }
        }
    }
}

macro_rules! scalar_accessors {
    ($load:ident, $store:ident, $ty:ty) => {
        #[doc = concat!("Transactional read of a `", stringify!($ty), "`.")]
        pub fn $load(ptr: *const $ty) -> CoreResult<$ty> {
            with_descriptor(|d| d.read(ptr))
        }

        #[doc = concat!("Transactional write of a `", stringify!($ty), "`.")]
        pub fn $store(val: $ty, ptr: *mut $ty) -> CoreResult<()> {
            with_descriptor(|d| d.write(ptr, val))
        }
    };
}

scalar_accessors!(load_u8, store_u8, u8);
scalar_accessors!(load_u16, store_u16, u16);
scalar_accessors!(load_u32, store_u32, u32);
scalar_accessors!(load_u64, store_u64, u64);
scalar_accessors!(load_f32, store_f32, f32);
scalar_accessors!(load_f64, store_f64, f64);
scalar_accessors!(load_ptr, store_ptr, usize);

/// Transactional allocation (spec §6's `malloc`).
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
    with_descriptor(|d| d.alloc(size))
}

/// Transactional allocation with an alignment request. Only alignments
/// up to `align_of::<usize>()` can be honored, matching
/// [`crate::alloc_mgr::GlobalAllocator`]'s own guarantee; anything stricter
/// fails rather than silently under-aligning.
pub fn aligned_alloc(align: usize, size: usize) -> Option<NonNull<u8>> {
    if align <= core::mem::align_of::<usize>() {
        malloc(size)
    } else {
        None
    }
}

/// Transactional free.
///
/// # Safety
/// `ptr`/`size` must describe a live allocation made by [`malloc`] (or
/// [`aligned_alloc`]) on the calling thread, not yet freed.
pub unsafe fn free(ptr: NonNull<u8>, size: usize) {
    with_descriptor(|d| unsafe { d.free(ptr, size) });
}

/// Bulk transactional copy (spec §6's `memcpy`). Copies in 8-byte
/// instrumented chunks when `dst`/`src` share alignment, one byte at a
/// time otherwise; an irrevocable transaction forwards straight to
/// [`core::ptr::copy_nonoverlapping`] instead of instrumenting.
///
/// # Safety
/// `src`/`dst` must each be valid for `n` bytes and must not overlap.
pub unsafe fn memcpy(dst: *mut u8, src: *const u8, n: usize) -> CoreResult<()> {
    if is_irrevocable() {
        unsafe { core::ptr::copy_nonoverlapping(src, dst, n) };
        return Ok(());
    }
    bulk_copy(dst, src, n)
}

/// Bulk transactional move, safe for overlapping ranges.
///
/// # Safety
/// `src`/`dst` must each be valid for `n` bytes.
pub unsafe fn memmove(dst: *mut u8, src: *const u8, n: usize) -> CoreResult<()> {
    if is_irrevocable() {
        unsafe { core::ptr::copy(src, dst, n) };
        return Ok(());
    }
    if (dst as usize) < (src as usize) || (dst as usize) >= (src as usize) + n {
        bulk_copy(dst, src, n)
    } else {
        // Overlapping, dst ahead of src: walk backward one byte at a
        // time through the instrumented path so no byte is read after
        // a transactional write has already clobbered it.
        for i in (0..n).rev() {
            let byte = load_u8(unsafe { src.add(i) })?;
            store_u8(byte, unsafe { dst.add(i) })?;
        }
        Ok(())
    }
}

unsafe fn bulk_copy(dst: *mut u8, src: *const u8, n: usize) -> CoreResult<()> {
    let shared_align = (dst as usize | src as usize) & 7 == 0 && n >= 8;
    let mut i = 0;
    if shared_align {
        while i + 8 <= n {
            let word = load_u64(unsafe { src.add(i) as *const u64 })?;
            store_u64(word, unsafe { dst.add(i) as *mut u64 })?;
            i += 8;
        }
    }
    while i < n {
        let byte = load_u8(unsafe { src.add(i) })?;
        store_u8(byte, unsafe { dst.add(i) })?;
        i += 1;
    }
    Ok(())
}

/// Bulk transactional fill (spec §6's `memset`).
///
/// # Safety
/// `dst` must be valid for `n` bytes.
pub unsafe fn memset(dst: *mut u8, val: u8, n: usize) -> CoreResult<()> {
    if is_irrevocable() {
        unsafe { core::ptr::write_bytes(dst, val, n) };
        return Ok(());
    }
    let word = u64::from_ne_bytes([val; 8]);
    let mut i = 0;
    if (dst as usize) & 7 == 0 {
        while i + 8 <= n {
            store_u64(word, unsafe { dst.add(i) as *mut u64 })?;
            i += 8;
        }
    }
    while i < n {
        store_u8(val, unsafe { dst.add(i) })?;
        i += 1;
    }
    Ok(())
}

/// Enqueue a post-commit callback (spec §6's `register_commit_handler`).
///
/// # Safety
/// See [`crate::deferred::DeferredQueue::register`].
pub unsafe fn register_commit_handler(callback: unsafe fn(*mut ()), arg: *mut ()) {
    with_descriptor(|d| unsafe { d.register_commit_handler(callback, arg) });
}

/// Override the frame filter's conservative bottom-of-stack boundary.
pub fn set_stackframe(ptr: *const ()) {
    with_descriptor(|d| d.set_stackframe(ptr as usize));
}

/// An instrumented clone registered by [`register_clone`] for
/// [`translate_call`] to find.
struct CloneEntry {
    from: usize,
    to: usize,
}

/// Process-wide, not per-thread: a clone registered by one thread must
/// be visible to `translate_call` lookups on every other thread.
static CLONES: spin::Mutex<alloc::vec::Vec<CloneEntry>> = spin::Mutex::new(alloc::vec::Vec::new());

fn with_clones<R>(f: impl FnOnce(&mut alloc::vec::Vec<CloneEntry>) -> R) -> R {
    f(&mut CLONES.lock())
}

/// Declare `to` the instrumented clone of `from`, so [`translate_call`]
/// can find it later.
pub fn register_clone(from: *const (), to: *const ()) {
    with_clones(|clones| {
        clones.push(CloneEntry {
            from: from as usize,
            to: to as usize,
        });
    });
}

/// Look up the instrumented clone of `f`. If none was registered,
/// escalate the calling transaction to irrevocable (so it's safe to call
/// the uninstrumented original directly) and return `f` unchanged.
pub fn translate_call(f: *const ()) -> *const () {
    let addr = f as usize;
    let found = with_clones(|clones| {
        clones
            .iter()
            .find(|entry| entry.from == addr)
            .map(|entry| entry.to)
    });
    match found {
        Some(to) => to as *const (),
        None => {
            become_irrevocable();
            f
        }
    }
}

/// Request escalation to the sole, exclusively-running transaction in
/// the process (spec §6's `become_irrevocable`). Returns whether the
/// escalation succeeded; a `false` result leaves the current
/// transaction's optimistic state untouched.
pub fn become_irrevocable() -> bool {
    if is_irrevocable() {
        return true;
    }
    let acquired = with_descriptor(|d| d.try_become_irrevocable());
    if acquired {
        set_irrevocable(true);
    }
    acquired
}

/// Diagnostic output (spec §6's `report_stats`): logs the process-wide
/// commit/abort counters at `info` level.
pub fn report_stats() {
    let stats = STATS.snapshot();
    log::info!(
        "tm_substrate stats: commits={} aborts={}",
        stats.commits,
        stats.aborts
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_commits_a_simple_write() {
        static CELL: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);
        let ptr = CELL.as_ptr();
        execute(
            0,
            |_| {
                store_u32(7, ptr)?;
                Ok(())
            },
            core::ptr::null_mut(),
        );
        assert_eq!(CELL.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn execute_retries_until_a_commit_succeeds() {
        static CELL: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(1);
        let ptr = CELL.as_ptr();
        let attempts = core::cell::Cell::new(0);
        let value = execute(
            0,
            |_| {
                attempts.set(attempts.get() + 1);
                load_u32(ptr)
            },
            core::ptr::null_mut(),
        );
        assert_eq!(value, 1);
        assert!(attempts.get() >= 1);
    }

    #[test]
    fn malloc_then_free_roundtrips() {
        let ptr = malloc(64).expect("allocation failed");
        unsafe { free(ptr, 64) };
    }

    #[test]
    fn aligned_alloc_refuses_overstrict_alignment() {
        assert!(aligned_alloc(4096, 16).is_none());
        assert!(aligned_alloc(core::mem::align_of::<usize>(), 16).is_some());
    }

    #[test]
    fn memcpy_copies_unaligned_tail_correctly() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut dst = [0u8; 9];
        unsafe { memcpy(dst.as_mut_ptr(), src.as_ptr(), 9).unwrap() };
        assert_eq!(src, dst);
    }

    #[test]
    fn memset_fills_every_byte() {
        let mut buf = [0u8; 20];
        unsafe { memset(buf.as_mut_ptr(), 0xAB, 20).unwrap() };
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn memmove_handles_forward_overlap() {
        let mut buf = [1u8, 2, 3, 4, 5, 0, 0, 0];
        unsafe {
            let base = buf.as_mut_ptr();
            memmove(base.add(3), base, 5).unwrap();
        }
        assert_eq!(buf, [1, 2, 3, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn translate_call_finds_a_registered_clone() {
        let from = 0x1000usize as *const ();
        let to = 0x2000usize as *const ();
        register_clone(from, to);
        assert_eq!(translate_call(from), to);
    }

    #[test]
    fn report_stats_does_not_panic() {
        execute(0, |_| Ok(()), core::ptr::null_mut());
        report_stats();
    }
}
