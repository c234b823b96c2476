//! Resource coordinators built on strong/weak references.
//!
//! Each coordinator hands out acquired resources as a [`Strong`] token.
//! A destruction callback on the token returns the resource and re-drives
//! pending requests; there is no `release` call that could be forgotten
//! or made twice. Queued requesters are held weakly, so a requester that
//! disappears while waiting is skipped at admission time.
//!
//! - [`Semaphore`]: counting semaphore with a strict FIFO queue and
//!   push-style delivery to an [`Owner`].
//! - [`FixedSemaphore`]: non-blocking check-and-deduct with an optional
//!   [`AcquirePolicy`].
//! - [`LockPool`]: keyed locks with a pluggable [`LockStrategy`] and
//!   poll-style delivery through an [`Event`].
//!
//! [`Strong`]: crate::Strong

mod event;
mod fixed;
mod lock_pool;
mod semaphore;

pub use event::{Event, LevelEvent};
pub use fixed::{AcquirePolicy, FixedPermit, FixedSemaphore};
pub use lock_pool::{
    Access, ExclusiveKeys, HeldLocks, LockHold, LockPool, LockPoolConfig, LockRequest, LockStrategy,
    ReadWriteKeys,
};
pub use semaphore::{Owner, Permit, Semaphore, Units};

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

/// Threads currently inside a coordinator's admission loop. A callback
/// that releases a grant on the thread already running the loop only
/// updates the counters; the running loop picks the change up. Other
/// threads run the loop themselves.
#[derive(Debug, Default)]
pub(crate) struct Runners(Vec<ThreadId>);

impl Runners {
    /// Register the current thread; false if it is already running.
    pub(crate) fn enter(&mut self) -> bool {
        let me = thread::current().id();
        if self.0.contains(&me) {
            return false;
        }
        self.0.push(me);
        true
    }

    pub(crate) fn leave(&mut self) {
        let me = thread::current().id();
        self.0.retain(|t| *t != me);
    }
}

/// Run a user callback during steady-state operation. A panic is logged
/// and reported as `None`; it never unwinds into the coordinator.
pub(crate) fn invoke_isolated<R>(what: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(callback = what, panic = %msg, "user callback panicked");
            None
        }
    }
}
