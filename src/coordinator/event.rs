//! Poll-style readiness signalling for the lock pool.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::Duration;

/// Readiness sink supplied by the consumer of a lock pool.
///
/// `signal` is called after the request's hold has been installed; it
/// should be quick and must not block on the pool.
pub trait Event: Send + Sync {
    fn signal(&self);
}

/// Level-triggered event: stays set until `reset`.
#[derive(Default)]
pub struct LevelEvent {
    set: Mutex<bool>,
    cond: Condvar,
}

impl LevelEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Block until the event is set.
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Block until the event is set or `timeout` elapses. Returns whether
    /// the event is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock();
        if !*set {
            let _ = self.cond.wait_while_for(&mut set, |set| !*set, timeout);
        }
        *set
    }
}

impl Event for LevelEvent {
    fn signal(&self) {
        self.set();
    }
}

impl fmt::Debug for LevelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelEvent")
            .field("set", &self.is_set())
            .finish()
    }
}
