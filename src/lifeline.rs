//! Destruction notification: per-object callback registry.
//!
//! Every object managed by [`Strong`](crate::Strong) owns one `Lifeline`,
//! shared with all of its weak references. Callbacks registered on it fire
//! exactly once, on the thread that drops the last strong reference, before
//! the object's storage is released.
//!
//! Two locks are involved:
//! - `phase` guards the Alive / Destroying / Destroyed state and is paired
//!   with a condvar so `cancel` can wait out an in-flight teardown.
//! - `callbacks` guards the ordered set of pending callbacks.
//!
//! Teardown never holds either lock while running a callback.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Alive,
    Destroying(ThreadId),
    Destroyed,
}

/// Result of [`Subscription::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The callback was removed before it ran; it will never run.
    Cancelled,
    /// The object had already been destroyed; the callback ran.
    AlreadyFired,
    /// Teardown was in progress when `cancel` was called. It has finished
    /// by the time `cancel` returns (unless the caller is the tearing-down
    /// thread itself), and the callback ran.
    RaceResolved,
}

struct Callbacks {
    next_id: u64,
    pending: BTreeMap<u64, Callback>,
}

/// Shared lifetime-tracking block of one managed object.
pub struct Lifeline {
    phase: Mutex<Phase>,
    settled: Condvar,
    callbacks: Mutex<Callbacks>,
}

impl Lifeline {
    pub(crate) fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Alive),
            settled: Condvar::new(),
            callbacks: Mutex::new(Callbacks {
                next_id: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// True until teardown of the object begins.
    pub fn is_alive(&self) -> bool {
        *self.phase.lock() == Phase::Alive
    }

    /// Number of callbacks still waiting to fire.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().pending.len()
    }

    /// Register `f`. If the object is already being torn down (or gone),
    /// `f` runs right here on the calling thread and the returned
    /// subscription reports `AlreadyFired`.
    pub(crate) fn register(self: &Arc<Self>, f: Callback) -> Subscription {
        {
            let phase = self.phase.lock();
            if *phase == Phase::Alive {
                // Holding `phase` orders this insert before any teardown.
                let mut cbs = self.callbacks.lock();
                let id = cbs.next_id;
                cbs.next_id += 1;
                cbs.pending.insert(id, f);
                return Subscription {
                    lifeline: Some(self.clone()),
                    id,
                    outcome: None,
                };
            }
        }
        f();
        Subscription {
            lifeline: None,
            id: 0,
            outcome: Some(CancelOutcome::AlreadyFired),
        }
    }

    fn cancel(&self, id: u64) -> CancelOutcome {
        let removed = self.callbacks.lock().pending.remove(&id);
        if removed.is_some() {
            // Captured state is dropped here, outside the callbacks lock.
            drop(removed);
            return CancelOutcome::Cancelled;
        }

        let mut phase = self.phase.lock();
        match *phase {
            Phase::Alive | Phase::Destroyed => CancelOutcome::AlreadyFired,
            Phase::Destroying(owner) if owner == thread::current().id() => {
                CancelOutcome::RaceResolved
            }
            Phase::Destroying(_) => {
                while matches!(*phase, Phase::Destroying(_)) {
                    self.settled.wait(&mut phase);
                }
                CancelOutcome::RaceResolved
            }
        }
    }

    /// Run every pending callback once, in registration order.
    ///
    /// Called exactly once, from the drop of the managed object.
    pub(crate) fn teardown(&self) {
        *self.phase.lock() = Phase::Destroying(thread::current().id());
        let callbacks = mem::take(&mut self.callbacks.lock().pending);
        for (id, cb) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(cb)).is_err() {
                tracing::error!(callback = id, "destruction callback panicked during teardown");
                std::process::abort();
            }
        }
        *self.phase.lock() = Phase::Destroyed;
        self.settled.notify_all();
    }
}

impl fmt::Debug for Lifeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifeline")
            .field("phase", &*self.phase.lock())
            .field("pending_callbacks", &self.pending_callbacks())
            .finish()
    }
}

/// Handle to a registered destruction callback.
///
/// Dropping a subscription that has not fired cancels it. Use
/// [`Subscription::detach`] to leave the callback installed.
#[must_use = "dropping a Subscription cancels its callback; call `detach` to keep it"]
pub struct Subscription {
    lifeline: Option<Arc<Lifeline>>,
    id: u64,
    outcome: Option<CancelOutcome>,
}

impl Subscription {
    /// Cancel the callback. Blocks while the object is being torn down on
    /// another thread. Calling it again returns the first outcome.
    pub fn cancel(&mut self) -> CancelOutcome {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let outcome = match self.lifeline.take() {
            Some(lifeline) => lifeline.cancel(self.id),
            None => CancelOutcome::AlreadyFired,
        };
        self.outcome = Some(outcome);
        outcome
    }

    /// Outcome of an earlier `cancel`, or of a registration that fired
    /// immediately.
    pub fn outcome(&self) -> Option<CancelOutcome> {
        self.outcome
    }

    /// Keep the callback installed for the object's whole life.
    pub fn detach(mut self) {
        self.lifeline = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.lifeline.is_some() {
            let _ = self.cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("armed", &self.lifeline.is_some())
            .field("outcome", &self.outcome)
            .finish()
    }
}
