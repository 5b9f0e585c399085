//! Error disposition: fatal termination vs. silent restart.
//!
//! Per the core framework, only two outcomes are ever observable from a
//! transaction: commit, or a restart from the checkpoint. Every internal
//! error kind below resolves to one of those two, or — for a handful of
//! escalation-capable kinds — to becoming irrevocable instead of aborting.
//! Nothing here is allowed to unwind out of transactional code.

use core::fmt;

/// A retryable abort. Cores return this from their internal read/write/
/// commit paths; the retry loop in [`crate::api::execute`] catches it and
/// re-enters the transaction body from the checkpoint. This is control
/// flow, not an exception: it never crosses an FFI boundary and is never
/// logged above `debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restart(pub AbortReason);

impl fmt::Display for Restart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction restart: {:?}", self.0)
    }
}

/// Why a transaction is being aborted and restarted.
///
/// This mirrors the disposition table: every variant here always resolves
/// to "abort, then restart" — variants that can instead escalate to
/// irrevocability are not abort reasons, they are handled explicitly at
/// the call site (see [`crate::contention::ContentionManager::before_begin`]
/// and [`crate::api::translate_call`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// An orec/clock mismatch, a value-log mismatch, or a ring
    /// intersection showed the transaction's view is no longer consistent.
    ReadInconsistency,
    /// A CAS on an orec or bytelock lost to another owner.
    LockContention,
    /// `clock - start >= RING_ELEMENTS`: a ring slot we'd need has wrapped.
    RingOverflow,
    /// TLRW's bounded retry budget for a read or write lock was exhausted.
    DeadlockSuspicion,
    /// Another thread already holds the process-wide irrevocability token.
    IrrevocabilityConflict,
}

/// Errors that terminate the process rather than restart a transaction.
///
/// These correspond to the two "Fatal termination" / unrecoverable rows of
/// the disposition table. A core that encounters one calls
/// [`crate::api::fatal`] rather than returning a `Result` through ordinary
/// transactional control flow.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// An irrevocable request was made against a core or build
    /// configuration that does not support irrevocability (e.g. a PTM
    /// core built without an irrevocable path).
    #[error("irrevocability was requested but this core/build does not support it")]
    UnsupportedIrrevocableRequest,
    /// The allocation manager's bound was hit and no irrevocable fallback
    /// path exists for this build.
    #[error("allocation pressure exceeded the allocation manager's bound with no irrevocable fallback")]
    AllocationPressureUnrecoverable,
}

/// Result type for core internals: `Ok` carries the operation's value,
/// `Err` is always a [`Restart`].
pub type CoreResult<T> = Result<T, Restart>;
