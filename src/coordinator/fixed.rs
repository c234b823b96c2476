//! Fixed-capacity semaphore: no queue, no waiting.

use super::invoke_isolated;
use super::semaphore::Units;
use crate::reference::Strong;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Hooks consulted by [`FixedSemaphore::acquire`].
pub trait AcquirePolicy: Send + Sync {
    /// Final say before the acquisition commits. Units are already
    /// reserved; returning false (or panicking) gives them back.
    fn acquired(&self, _units: usize) -> bool {
        true
    }

    /// Runs when the permit is destroyed, before the units are credited
    /// back. Runs during teardown: a panic here aborts the process.
    fn on_release(&self, _units: usize) {}
}

/// Capability token for units taken from a [`FixedSemaphore`].
pub type FixedPermit = Strong<Units>;

#[derive(Debug)]
struct State {
    capacity: usize,
    used: usize,
}

/// Non-blocking semaphore. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FixedSemaphore {
    state: Arc<Mutex<State>>,
}

impl FixedSemaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State { capacity, used: 0 })),
        }
    }

    /// Take `needed` units now or return `None`. Callers retry by their
    /// own means; nothing is queued.
    pub fn acquire(
        &self,
        needed: usize,
        policy: Option<Arc<dyn AcquirePolicy>>,
    ) -> Option<FixedPermit> {
        {
            let mut st = self.state.lock();
            if st.capacity.saturating_sub(st.used) < needed {
                return None;
            }
            st.used += needed;
        }

        if let Some(p) = &policy {
            let confirmed =
                invoke_isolated("fixed semaphore policy", || p.acquired(needed)).unwrap_or(false);
            if !confirmed {
                self.credit(needed);
                return None;
            }
        }

        let permit = Strong::new(Units::new(needed));
        let state = self.state.clone();
        Strong::on_destroy(&permit, move || {
            if let Some(p) = policy {
                p.on_release(needed);
            }
            let mut st = state.lock();
            st.used = st.used.saturating_sub(needed);
        })
        .detach();
        Some(permit)
    }

    /// Return the permit's units. Equivalent to dropping it.
    pub fn release(&self, permit: FixedPermit) {
        drop(permit);
    }

    fn credit(&self, units: usize) {
        let mut st = self.state.lock();
        st.used = st.used.saturating_sub(units);
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    pub fn available(&self) -> usize {
        let st = self.state.lock();
        st.capacity.saturating_sub(st.used)
    }

    /// Change the capacity. Outstanding permits are unaffected.
    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }
}

impl fmt::Debug for FixedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("FixedSemaphore")
            .field("capacity", &st.capacity)
            .field("used", &st.used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gate {
        allow: bool,
        released: AtomicUsize,
    }

    impl AcquirePolicy for Gate {
        fn acquired(&self, _units: usize) -> bool {
            self.allow
        }

        fn on_release(&self, units: usize) {
            self.released.fetch_add(units, Ordering::SeqCst);
        }
    }

    #[test]
    fn check_and_deduct() {
        let sem = FixedSemaphore::new(3);
        let a = sem.acquire(2, None).expect("fits");
        assert_eq!(a.units(), 2);
        assert!(sem.acquire(2, None).is_none());
        assert_eq!(sem.available(), 1);
        sem.release(a);
        assert_eq!(sem.available(), 3);
        assert!(sem.acquire(4, None).is_none(), "no head-of-line exception here");
    }

    #[test]
    fn policy_refusal_rolls_back() {
        let sem = FixedSemaphore::new(2);
        let gate = Arc::new(Gate {
            allow: false,
            released: AtomicUsize::new(0),
        });
        assert!(sem.acquire(1, Some(gate.clone())).is_none());
        assert_eq!(sem.used(), 0);
        assert_eq!(gate.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn on_release_runs_before_credit() {
        let sem = FixedSemaphore::new(2);
        let gate = Arc::new(Gate {
            allow: true,
            released: AtomicUsize::new(0),
        });
        let p = sem.acquire(2, Some(gate.clone())).expect("allowed");
        let clone = p.clone();
        drop(p);
        assert_eq!(sem.used(), 2, "a clone still holds the units");
        drop(clone);
        assert_eq!(gate.released.load(Ordering::SeqCst), 2);
        assert_eq!(sem.used(), 0);
    }

    #[test]
    fn panicking_policy_counts_as_refusal() {
        struct Bad;
        impl AcquirePolicy for Bad {
            fn acquired(&self, _units: usize) -> bool {
                panic!("policy failure")
            }
        }
        let sem = FixedSemaphore::new(1);
        assert!(sem.acquire(1, Some(Arc::new(Bad))).is_none());
        assert_eq!(sem.available(), 1);
    }
}
