//! Keyed lock pool with pluggable exclusion strategies.
//!
//! Requests name a lock set; a [`LockStrategy`] decides whether that set
//! can be held next to the sets already granted. Granted sets are
//! delivered poll-style: the hold is parked in the [`LockRequest`] and the
//! request's [`Event`] is signalled.
//!
//! With `starve == false` the scan stops at the first request that cannot
//! be granted. With `starve == true` the scan continues past it, so
//! independent requests further back proceed and the blocked one may wait
//! indefinitely.

use super::event::Event;
use super::{invoke_isolated, Runners};
use crate::error::MisuseError;
use crate::reference::{Strong, WeakRef};
use crate::weak_container::{WeakContainer, WeakList};
use core::hash::Hash;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Decides which lock sets may be held together.
pub trait LockStrategy: Send + 'static {
    type Set: Clone + Send + Sync + 'static;

    fn is_empty(set: &Self::Set) -> bool;

    /// Record `set` as held if it is compatible with what is held now.
    fn try_insert(&mut self, set: &Self::Set) -> bool;

    /// Forget a set previously accepted by `try_insert`.
    fn remove(&mut self, set: &Self::Set);
}

/// Every key is held by at most one set at a time.
pub struct ExclusiveKeys<K> {
    held: HashSet<K>,
}

impl<K> ExclusiveKeys<K> {
    pub fn new() -> Self {
        Self {
            held: HashSet::new(),
        }
    }
}

impl<K> Default for ExclusiveKeys<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> LockStrategy for ExclusiveKeys<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    type Set = Vec<K>;

    fn is_empty(set: &Vec<K>) -> bool {
        set.is_empty()
    }

    fn try_insert(&mut self, set: &Vec<K>) -> bool {
        if set.iter().any(|k| self.held.contains(k)) {
            return false;
        }
        self.held.extend(set.iter().cloned());
        true
    }

    fn remove(&mut self, set: &Vec<K>) {
        for k in set {
            self.held.remove(k);
        }
    }
}

/// Access mode of one key in a [`ReadWriteKeys`] set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    Shared,
    Exclusive,
}

#[derive(Default, Debug)]
struct Holders {
    readers: usize,
    writer: bool,
}

/// Many shared holders or one exclusive holder per key.
pub struct ReadWriteKeys<K> {
    held: HashMap<K, Holders>,
}

impl<K> ReadWriteKeys<K> {
    pub fn new() -> Self {
        Self {
            held: HashMap::new(),
        }
    }
}

impl<K> Default for ReadWriteKeys<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ReadWriteKeys<K>
where
    K: Eq + Hash,
{
    /// Strongest access per key; a key listed twice counts once.
    fn normalize(set: &[(K, Access)]) -> HashMap<&K, Access> {
        let mut merged: HashMap<&K, Access> = HashMap::with_capacity(set.len());
        for (k, a) in set {
            let slot = merged.entry(k).or_insert(*a);
            *slot = (*slot).max(*a);
        }
        merged
    }
}

impl<K> LockStrategy for ReadWriteKeys<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    type Set = Vec<(K, Access)>;

    fn is_empty(set: &Self::Set) -> bool {
        set.is_empty()
    }

    fn try_insert(&mut self, set: &Self::Set) -> bool {
        let wanted = Self::normalize(set);
        let compatible = wanted.iter().all(|(k, a)| match self.held.get(*k) {
            None => true,
            Some(h) => match a {
                Access::Shared => !h.writer,
                Access::Exclusive => !h.writer && h.readers == 0,
            },
        });
        if !compatible {
            return false;
        }
        for (k, a) in wanted {
            let h = self.held.entry(k.clone()).or_default();
            match a {
                Access::Shared => h.readers += 1,
                Access::Exclusive => h.writer = true,
            }
        }
        true
    }

    fn remove(&mut self, set: &Self::Set) {
        for (k, a) in Self::normalize(set) {
            let Some(h) = self.held.get_mut(k) else {
                continue;
            };
            match a {
                Access::Shared => h.readers = h.readers.saturating_sub(1),
                Access::Exclusive => h.writer = false,
            }
            if h.readers == 0 && !h.writer {
                self.held.remove(k);
            }
        }
    }
}

/// Pool configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LockPoolConfig {
    /// Let the admission scan skip past a blocked request.
    pub starve: bool,
}

/// A granted lock set. Dropping the last hold releases the locks.
pub struct HeldLocks<S: LockStrategy> {
    set: S::Set,
}

impl<S: LockStrategy> HeldLocks<S> {
    pub fn set(&self) -> &S::Set {
        &self.set
    }
}

/// Capability token for a granted lock set.
pub type LockHold<S> = Strong<HeldLocks<S>>;

/// A pending or granted request, owned by the requester. The pool only
/// holds it weakly: dropping it withdraws the request.
pub struct LockRequest<S: LockStrategy> {
    set: S::Set,
    event: Arc<dyn Event>,
    hold: Mutex<Option<LockHold<S>>>,
}

impl<S: LockStrategy> LockRequest<S> {
    pub fn set(&self) -> &S::Set {
        &self.set
    }

    /// True once the pool has installed a hold that was not taken yet.
    pub fn is_granted(&self) -> bool {
        self.hold.lock().is_some()
    }

    /// Take the granted hold, if any.
    pub fn take(&self) -> Option<LockHold<S>> {
        self.hold.lock().take()
    }

    fn install(&self, hold: LockHold<S>) -> Result<(), MisuseError> {
        let mut slot = self.hold.lock();
        if slot.is_some() {
            return Err(MisuseError::TokenAlreadyInstalled);
        }
        *slot = Some(hold);
        Ok(())
    }
}

struct State<S: LockStrategy> {
    strategy: S,
    queue: VecDeque<(S::Set, WeakRef<LockRequest<S>>)>,
    runners: Runners,
}

struct Shared<S: LockStrategy> {
    state: Mutex<State<S>>,
    config: LockPoolConfig,
    holds: WeakList<HeldLocks<S>>,
}

impl<S: LockStrategy> Shared<S> {
    /// Next grantable request, removed from the queue and recorded in the
    /// strategy. Requests whose owner is gone are dropped on the way.
    fn next_grant(&self, st: &mut State<S>) -> Option<(S::Set, WeakRef<LockRequest<S>>)> {
        let mut i = 0;
        while i < st.queue.len() {
            if !st.queue[i].1.is_alive() {
                st.queue.remove(i);
                continue;
            }
            if st.strategy.try_insert(&st.queue[i].0) {
                return st.queue.remove(i);
            }
            if !self.config.starve {
                return None;
            }
            i += 1;
        }
        None
    }

    fn process(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if !st.runners.enter() {
                return;
            }
        }
        loop {
            let (set, requester) = {
                let mut st = self.state.lock();
                match self.next_grant(&mut st) {
                    Some(next) => next,
                    None => {
                        st.runners.leave();
                        return;
                    }
                }
            };
            let hold = self.mint(set);
            // The requester can vanish between the scan and here; the
            // unclaimed hold is then dropped, releasing the set again.
            let Some(request) = requester.resolve() else {
                continue;
            };
            match request.install(hold) {
                Ok(()) => {
                    tracing::debug!("lock set granted");
                    let _ = invoke_isolated("lock pool event", || request.event.signal());
                }
                Err(e) => tracing::error!(error = %e, "lock request granted twice"),
            }
        }
    }

    fn mint(self: &Arc<Self>, set: S::Set) -> LockHold<S> {
        let hold = Strong::new(HeldLocks { set: set.clone() });
        let shared = self.clone();
        Strong::on_destroy(&hold, move || shared.release(&set)).detach();
        let _ = self.holds.push(&hold);
        hold
    }

    fn release(self: &Arc<Self>, set: &S::Set) {
        self.state.lock().strategy.remove(set);
        self.process();
    }
}

/// Keyed lock pool. Cheap to clone; clones share state.
pub struct LockPool<S: LockStrategy> {
    shared: Arc<Shared<S>>,
}

impl<S: LockStrategy> LockPool<S> {
    pub fn new(strategy: S) -> Self {
        Self::with_config(strategy, LockPoolConfig::default())
    }

    pub fn with_config(strategy: S, config: LockPoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    strategy,
                    queue: VecDeque::new(),
                    runners: Runners::default(),
                }),
                config,
                holds: WeakContainer::insertion_ordered(),
            }),
        }
    }

    pub fn config(&self) -> LockPoolConfig {
        self.shared.config
    }

    /// Queue `set`; `event` is signalled once the set is granted. The
    /// grant may happen before this returns.
    pub fn add_lock_set(
        &self,
        set: S::Set,
        event: Arc<dyn Event>,
    ) -> Result<Strong<LockRequest<S>>, MisuseError> {
        if S::is_empty(&set) {
            return Err(MisuseError::EmptyLockSet);
        }
        let request = Strong::new(LockRequest {
            set: set.clone(),
            event,
            hold: Mutex::new(None),
        });
        self.shared
            .state
            .lock()
            .queue
            .push_back((set, Strong::downgrade(&request)));
        self.shared.process();
        Ok(request)
    }

    /// Release a hold. Equivalent to dropping it.
    pub fn release(&self, hold: LockHold<S>) {
        drop(hold);
    }

    /// Requests waiting for a grant.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Lock sets currently held.
    pub fn held(&self) -> Vec<S::Set> {
        self.shared
            .holds
            .iter()
            .filter_map(|e| e.value.resolve())
            .map(|h| h.set.clone())
            .collect()
    }
}

impl<S: LockStrategy> Clone for LockPool<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: LockStrategy> fmt::Debug for LockPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockPool")
            .field("config", &self.shared.config)
            .field("queued", &self.queued())
            .field("held", &self.shared.holds.len())
            .finish()
    }
}
