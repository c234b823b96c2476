//! Counting semaphore with a strict FIFO queue.
//!
//! Admission rule: the head request is admitted when it fits in the free
//! capacity, or unconditionally when nothing is in use. The second clause
//! keeps an oversized request from blocking the queue forever, at the cost
//! of letting `used` exceed `capacity` until its permit is dropped.
//! A head that does not fit blocks everything behind it.

use super::{invoke_isolated, Runners};
use crate::error::MisuseError;
use crate::reference::{Strong, WeakRef};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Requester of semaphore units, held weakly while queued.
pub trait Owner: Send + Sync + 'static {
    /// Called once, synchronously, when the request is admitted. Dropping
    /// `permit` (here or later) returns the units.
    fn process(&self, permit: Permit);
}

/// Units granted by a coordinator.
#[derive(Debug)]
pub struct Units {
    units: usize,
}

impl Units {
    pub(crate) fn new(units: usize) -> Self {
        Self { units }
    }

    pub fn units(&self) -> usize {
        self.units
    }
}

/// Capability token for admitted semaphore units.
pub type Permit = Strong<Units>;

trait Requester: Send {
    /// Deliver the permit; false if the owner is gone.
    fn admit(&self, permit: Permit) -> bool;
}

impl<O: Owner> Requester for WeakRef<O> {
    fn admit(&self, permit: Permit) -> bool {
        match self.resolve() {
            Some(owner) => {
                owner.process(permit);
                true
            }
            None => false,
        }
    }
}

struct Waiter {
    units: usize,
    owner: Box<dyn Requester>,
}

struct State {
    capacity: usize,
    used: usize,
    queue: VecDeque<Waiter>,
    runners: Runners,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn process(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if !st.runners.enter() {
                return;
            }
        }
        loop {
            let waiter = {
                let mut st = self.state.lock();
                let free = st.capacity.saturating_sub(st.used);
                let admit = match st.queue.front() {
                    Some(head) => st.used == 0 || head.units <= free,
                    None => false,
                };
                match admit.then(|| st.queue.pop_front()).flatten() {
                    Some(w) => {
                        st.used += w.units;
                        tracing::debug!(
                            units = w.units,
                            used = st.used,
                            capacity = st.capacity,
                            "semaphore request admitted"
                        );
                        w
                    }
                    None => {
                        st.runners.leave();
                        return;
                    }
                }
            };
            let permit = self.mint(waiter.units);
            match invoke_isolated("semaphore owner", || waiter.owner.admit(permit)) {
                Some(true) => {}
                Some(false) => {
                    tracing::debug!(units = waiter.units, "semaphore owner vanished while queued");
                }
                None => {}
            }
        }
    }

    fn mint(self: &Arc<Self>, units: usize) -> Permit {
        let permit = Strong::new(Units::new(units));
        let shared = self.clone();
        Strong::on_destroy(&permit, move || shared.release(units)).detach();
        permit
    }

    fn release(self: &Arc<Self>, units: usize) {
        {
            let mut st = self.state.lock();
            st.used = st.used.saturating_sub(units);
        }
        self.process();
    }
}

/// Counting semaphore. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Semaphore {
    shared: Arc<Shared>,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    capacity,
                    used: 0,
                    queue: VecDeque::new(),
                    runners: Runners::default(),
                }),
            }),
        }
    }

    /// Queue a request for `units` on behalf of `owner`. The owner may be
    /// admitted before this returns, on this thread.
    pub fn request<O: Owner>(&self, owner: &Strong<O>, units: usize) -> Result<(), MisuseError> {
        if units == 0 {
            return Err(MisuseError::ZeroUnits);
        }
        self.shared.state.lock().queue.push_back(Waiter {
            units,
            owner: Box::new(Strong::downgrade(owner)),
        });
        self.shared.process();
        Ok(())
    }

    /// Return the permit's units. Equivalent to dropping it; units come
    /// back when the last clone of the permit is gone.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    /// Units currently held. May exceed `capacity` after an oversized
    /// request was admitted into an idle semaphore.
    pub fn used(&self) -> usize {
        self.shared.state.lock().used
    }

    /// Requests waiting for admission, including ones whose owner is gone.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Change the capacity and admit whatever now fits.
    pub fn set_capacity(&self, capacity: usize) {
        self.shared.state.lock().capacity = capacity;
        self.shared.process();
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("Semaphore")
            .field("capacity", &st.capacity)
            .field("used", &st.used)
            .field("queued", &st.queue.len())
            .finish()
    }
}
