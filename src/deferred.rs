//! The deferred-action handler.
//!
//! A small per-descriptor queue of `(callback, arg)` pairs registered by
//! `register_commit_handler`. `on_commit` runs them in insertion order
//! after the transaction has released its locks; `on_abort` discards
//! them untouched. `fn(arg)` is a raw function pointer plus an untyped
//! argument pointer, matching the C-calling-convention shape spec §6
//! describes for the rest of the external interface.

use crate::minivec::MiniVec;

/// A registered post-commit callback.
#[derive(Clone, Copy)]
struct Handler {
    callback: unsafe fn(*mut ()),
    arg: *mut (),
}

/// A FIFO queue of deferred actions, run at most once per transaction
/// attempt (spec §8: "invokes `fn(arg)` exactly once if the transaction
/// commits, zero times if it aborts").
pub struct DeferredQueue {
    handlers: MiniVec<Handler>,
}

impl DeferredQueue {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            handlers: MiniVec::new(),
        }
    }

    /// Enqueue `callback(arg)` to run after this transaction commits.
    ///
    /// # Safety
    ///
    /// `arg` must remain valid until either `on_commit` or `on_abort` is
    /// called, and `callback` must be safe to call with it.
    pub unsafe fn register(&mut self, callback: unsafe fn(*mut ()), arg: *mut ()) {
        self.handlers.push(Handler { callback, arg });
    }

    /// Run every handler in registration order, then clear the queue.
    pub fn on_commit(&mut self) {
        for handler in self.handlers.drain() {
            unsafe { (handler.callback)(handler.arg) };
        }
    }

    /// Discard every handler without running it.
    pub fn on_abort(&mut self) {
        self.handlers.clear();
    }

    /// Number of handlers currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handlers are queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}
