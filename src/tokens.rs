//! Capability tokens: container entries whose presence is driven by a
//! separately destructible token rather than by the payload's own
//! reference count.
//!
//! A [`Capability`] is a strong reference to a small [`Grant`] that holds
//! the payload strongly and remembers the id of the entry created for it.
//! The [`TokenMap`] only observes grants weakly, so dropping the last
//! capability removes the entry even while the payload is shared elsewhere.
//! The grant stores an entry id, not a pointer back into the map.

use crate::entry_map::{EntryId, Order};
use crate::error::MisuseError;
use crate::reference::Strong;
use crate::weak_container::{Entry, Iter, WeakContainer};
use parking_lot::Mutex;
use std::fmt;
use std::sync::OnceLock;

/// Wrapper object behind a [`Capability`].
pub struct Grant<P> {
    payload: Strong<P>,
    entry: OnceLock<EntryId>,
}

/// Strong handle to a grant; dropping the last one releases the entry.
pub type Capability<P> = Strong<Grant<P>>;

impl<P> Grant<P> {
    /// A capability not yet installed in any map.
    pub fn new(payload: Strong<P>) -> Capability<P> {
        Strong::new(Grant {
            payload,
            entry: OnceLock::new(),
        })
    }

    pub fn payload(&self) -> &Strong<P> {
        &self.payload
    }

    /// Id of the entry this grant was installed under.
    pub fn entry(&self) -> Option<EntryId> {
        self.entry.get().copied()
    }

    fn install(&self, id: EntryId) -> Result<(), MisuseError> {
        self.entry
            .set(id)
            .map_err(|_| MisuseError::TokenAlreadyInstalled)
    }
}

impl<P: fmt::Debug> fmt::Debug for Grant<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grant")
            .field("payload", &*self.payload)
            .field("entry", &self.entry())
            .finish()
    }
}

/// Map from keys to capability-backed entries.
pub struct TokenMap<K, P> {
    entries: WeakContainer<K, Grant<P>>,
    // Serializes check-then-insert so `find_or_create` runs its factory
    // at most once per key. Distinct from the container's own locks.
    insertion: Mutex<()>,
}

impl<K, P> TokenMap<K, P>
where
    K: Ord + Clone + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    pub fn new(order: Order) -> Self {
        Self {
            entries: WeakContainer::new(order),
            insertion: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert `payload` under `key`. Returns the entry's capability, or
    /// `None` if a live entry for `key` exists (unique ordering).
    pub fn insert(&self, key: K, payload: Strong<P>) -> Option<Capability<P>> {
        let _g = self.insertion.lock();
        self.insert_locked(key, payload)
    }

    /// Install an existing capability under `key`. `Ok(None)` if `key` is
    /// taken; an error if the capability already has an entry.
    pub fn insert_token(
        &self,
        key: K,
        token: &Capability<P>,
    ) -> Result<Option<EntryId>, MisuseError> {
        if token.entry().is_some() {
            return Err(MisuseError::TokenAlreadyInstalled);
        }
        let _g = self.insertion.lock();
        let Ok(id) = self.entries.insert(key, token) else {
            return Ok(None);
        };
        if let Err(e) = token.install(id) {
            // Lost a race with another install of the same token.
            self.entries.erase(id);
            return Err(e);
        }
        Ok(Some(id))
    }

    fn insert_locked(&self, key: K, payload: Strong<P>) -> Option<Capability<P>> {
        let token = Grant::new(payload);
        let id = self.entries.insert(key, &token).ok()?;
        // The grant was created above and is not shared yet.
        let _ = token.install(id);
        Some(token)
    }

    /// Capability of the live entry for `key`.
    pub fn token(&self, key: &K) -> Option<Capability<P>> {
        self.entries.find(key)?.resolve()
    }

    /// Payload of the live entry for `key`.
    pub fn find(&self, key: &K) -> Option<Strong<P>> {
        self.token(key).map(|t| t.payload().clone())
    }

    /// Return the payload for `key`, creating it with `factory` if absent.
    ///
    /// Atomic per map: concurrent callers never both run `factory` for the
    /// same key. Only the caller that created the entry gets its
    /// capability; everyone else gets `None` alongside the payload.
    pub fn find_or_create<F>(&self, key: K, factory: F) -> (Strong<P>, Option<Capability<P>>)
    where
        F: FnOnce() -> P,
    {
        let _g = self.insertion.lock();
        if let Some(existing) = self.find(&key) {
            return (existing, None);
        }
        let payload = Strong::new(factory());
        let token = self.insert_locked(key, payload.clone());
        (payload, token)
    }

    /// Remove the entry of `token` now, regardless of other capability
    /// holders. False if the token is not installed in this map.
    pub fn erase(&self, token: &Capability<P>) -> bool {
        let Some(id) = token.entry() else {
            return false;
        };
        match self.entries.get(id) {
            Some(weak) if weak.refers_to(token) => self.entries.erase(id),
            _ => false,
        }
    }

    pub fn erase_key(&self, key: &K) -> usize {
        self.entries.erase_key(key)
    }

    pub fn iter(&self) -> Iter<'_, K, Grant<P>> {
        self.entries.iter()
    }
}

impl<K, P> Default for TokenMap<K, P>
where
    K: Ord + Clone + Send + Sync + 'static,
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Order::OrderedUnique)
    }
}

impl<K, P> Entry<K, Grant<P>> {
    /// Recover the entry's capability; `None` for a zombie entry.
    pub fn token(&self) -> Option<Capability<P>> {
        self.value.resolve()
    }
}
