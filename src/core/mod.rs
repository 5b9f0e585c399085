//! Concrete runtime cores.
//!
//! Each submodule implements one locking discipline from spec §4.2-§4.8
//! over the shared substrate (`crate::orec`, `crate::bytelock`,
//! `crate::clock`, `crate::filter`, `crate::logs`, `crate::epoch`,
//! `crate::contention`, `crate::alloc_mgr`, `crate::frame`,
//! `crate::deferred`, `crate::descriptor`). A core pairs a process-wide
//! `Runtime` (the shared tables) with a per-thread `Descriptor` (the
//! private logs/sets built on [`crate::descriptor::DescriptorBase`]).
//!
//! Every core exposes the same shape (spec §4.1): `begin`, `commit`,
//! `abort`, `read<T>`, `write<T>`, `alloc`, `free`,
//! `register_commit_handler`, `set_stackframe`, `try_become_irrevocable`,
//! `release_irrevocable`. There is no shared Rust trait for this — the
//! cores' state differs too much (orec read-sets vs bytelock
//! announcements vs a single sequence number) to benefit from forcing a
//! common vtable; [`crate::api`] dispatches to whichever core the build
//! selected via a `cfg` choice. `aligned_alloc` lives one level up, in
//! `crate::api`, since it needs no core-specific state beyond `alloc`.

pub mod cgl;
pub mod cohorts;
pub mod norec;
pub mod orec_eager;
pub mod orec_lazy;
pub mod ring_stm;
pub mod tlrw;

/// Diagnostic counters every core accumulates, surfaced by
/// `report_stats` (spec §6).
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreStats {
    pub commits: u64,
    pub aborts: u64,
}

impl CoreStats {
    pub const fn new() -> Self {
        Self {
            commits: 0,
            aborts: 0,
        }
    }

    #[inline]
    pub fn record_commit(&mut self) {
        self.commits += 1;
    }

    #[inline]
    pub fn record_abort(&mut self) {
        self.aborts += 1;
    }
}
