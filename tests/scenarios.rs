//! Concrete multi-threaded scenarios, exercised directly against the
//! concrete cores rather than through `tm_substrate::api` (whose process
//! singleton is fixed to one core per build by a Cargo feature — these
//! tests want to pick the core the scenario needs). Always std-linked,
//! unlike the library itself.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::thread;

use tm_substrate::core::{orec_eager, orec_lazy, ring_stm};

const TABLE_SLOTS: usize = 64;

/// Mirrors `tm_substrate::api::execute`'s retry loop for a concrete core,
/// since the integration tests need several cores in the same binary and
/// `api`'s process-wide singleton only carries whichever core the active
/// Cargo feature selected.
fn eager_commit<R>(
    desc: &mut orec_eager::Descriptor<'_, TABLE_SLOTS>,
    body: impl Fn(&mut orec_eager::Descriptor<'_, TABLE_SLOTS>) -> tm_substrate::error::CoreResult<R>,
) -> R {
    loop {
        desc.begin();
        match body(desc) {
            Ok(value) => {
                if desc.commit().is_ok() {
                    return value;
                }
            }
            Err(_) => {
                desc.abort();
            }
        }
    }
}

#[test]
fn counter_reaches_two_hundred_across_two_threads() {
    static RUNTIME: orec_eager::Runtime<TABLE_SLOTS> = orec_eager::Runtime::new();
    static X: AtomicU64 = AtomicU64::new(0);

    let run = |slot: u32| {
        let mut desc = orec_eager::Descriptor::new(&RUNTIME, slot);
        for _ in 0..100 {
            eager_commit(&mut desc, |d| {
                let v = d.read(X.as_ptr())?;
                d.write(X.as_ptr(), v + 1)
            });
        }
    };

    let a = thread::spawn(move || run(0));
    let b = thread::spawn(move || run(1));
    a.join().unwrap();
    b.join().unwrap();

    assert_eq!(X.load(Ordering::SeqCst), 200);
}

#[test]
fn swap_preserves_the_value_multiset() {
    static RUNTIME: orec_eager::Runtime<TABLE_SLOTS> = orec_eager::Runtime::new();
    static X: AtomicU64 = AtomicU64::new(3);
    static Y: AtomicU64 = AtomicU64::new(5);

    let run = |slot: u32| {
        let mut desc = orec_eager::Descriptor::new(&RUNTIME, slot);
        eager_commit(&mut desc, |d| {
            let t = d.read(X.as_ptr())?;
            let y = d.read(Y.as_ptr())?;
            d.write(X.as_ptr(), y)?;
            d.write(Y.as_ptr(), t)
        });
    };

    let a = thread::spawn(move || run(0));
    let b = thread::spawn(move || run(1));
    a.join().unwrap();
    b.join().unwrap();

    let mut seen = [X.load(Ordering::SeqCst), Y.load(Ordering::SeqCst)];
    seen.sort_unstable();
    assert_eq!(seen, [3, 5]);
}

#[test]
fn concurrent_reader_never_observes_a_torn_intermediate_state() {
    static RUNTIME: orec_eager::Runtime<TABLE_SLOTS> = orec_eager::Runtime::new();
    static P: AtomicU64 = AtomicU64::new(0);
    static Q: AtomicU64 = AtomicU64::new(0);
    static BAD_STATE_SEEN: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    let writer = thread::spawn(move || {
        let mut desc = orec_eager::Descriptor::new(&RUNTIME, 0);
        eager_commit(&mut desc, |d| {
            d.write(P.as_ptr(), 1)?;
            let p = d.read(P.as_ptr())?;
            d.write(Q.as_ptr(), p + 1)
        });
    });

    let reader = thread::spawn(move || {
        let mut desc = orec_eager::Descriptor::new(&RUNTIME, 1);
        for _ in 0..2000 {
            eager_commit(&mut desc, |d| {
                let p = d.read(P.as_ptr())?;
                let q = d.read(Q.as_ptr())?;
                if (p == 1 && q == 0) || (p == 0 && q == 2) {
                    BAD_STATE_SEEN.store(true, Ordering::SeqCst);
                }
                Ok(())
            });
        }
    });

    writer.join().unwrap();
    reader.join().unwrap();

    assert!(!BAD_STATE_SEEN.load(Ordering::SeqCst));
    assert_eq!(P.load(Ordering::SeqCst), 1);
    assert_eq!(Q.load(Ordering::SeqCst), 2);
}

#[test]
fn partial_byte_write_reconstructs_into_a_wider_read() {
    let runtime: orec_lazy::Runtime<TABLE_SLOTS> = orec_lazy::Runtime::new();
    let mut desc = orec_lazy::Descriptor::new(&runtime, 0, orec_lazy::LockMode::CommitTime, false);

    // `a-3 .. a-1` holds {0xAA, 0xBB, 0xCC} already; `a` gets overwritten.
    // Backed by a `u32` (not a `[u8; 4]`) so the 4-byte read below is
    // naturally aligned.
    let mut word_storage: u32 = u32::from_le_bytes([0xAA, 0xBB, 0xCC, 0x00]);
    let base = &mut word_storage as *mut u32 as *mut u8;
    let a = unsafe { base.add(3) };

    desc.begin();
    desc.write(a, 0xDDu8).unwrap();
    let word = desc.read(base as *const u32).unwrap();
    desc.commit().unwrap();

    assert_eq!(word, 0xDDCCBBAAu32);
}

#[test]
fn ring_overflow_forces_an_abort() {
    const RING_WORDS: usize = 4;
    const RING_CAP: usize = 4;
    static RUNTIME: ring_stm::Runtime<RING_WORDS, RING_CAP> = ring_stm::Runtime::new();
    static CELL: AtomicU32 = AtomicU32::new(0);

    let mut reader = ring_stm::Descriptor::new(&RUNTIME, 0);
    reader.begin();
    // Read something so the filter isn't trivially empty, establishing
    // `start_time` before the other four writers commit.
    let _ = reader.read(CELL.as_ptr()).unwrap();

    for slot in 1..=RING_CAP as u32 {
        let mut writer = ring_stm::Descriptor::new(&RUNTIME, slot);
        loop {
            writer.begin();
            writer.write(CELL.as_ptr(), slot).unwrap();
            if writer.commit().is_ok() {
                break;
            }
        }
    }

    // A full ring wrap is detected as soon as the reader performs
    // another read, not only once it reaches commit (spec §4.5).
    let read_result = reader.read(CELL.as_ptr());
    assert!(
        read_result.is_err(),
        "a reader spanning a full ring wrap must abort on its next read"
    );
    reader.abort();
}

#[test]
fn commit_handlers_run_in_registration_order_after_the_commit_point() {
    static RUNTIME: orec_eager::Runtime<TABLE_SLOTS> = orec_eager::Runtime::new();
    static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    static CELL: AtomicU8 = AtomicU8::new(0);

    unsafe fn mark(arg: *mut ()) {
        let id = arg as usize as u32;
        ORDER.lock().unwrap().push(id);
    }

    let mut desc = orec_eager::Descriptor::new(&RUNTIME, 0);
    desc.begin();
    desc.write(CELL.as_ptr(), 1).unwrap();
    unsafe {
        desc.register_commit_handler(mark, 1usize as *mut ());
        desc.register_commit_handler(mark, 2usize as *mut ());
    }
    desc.commit().unwrap();

    assert_eq!(CELL.load(Ordering::SeqCst), 1);
    assert_eq!(*ORDER.lock().unwrap(), vec![1, 2]);
}
