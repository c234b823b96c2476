//! WeakContainer: keyed or sequential container of weak references with
//! deferred, non-blocking cleanup.
//!
//! Locks, always taken in this order and never held across user callbacks:
//! - `iterators` (reader/writer): readers are open [`Iter`]s, the writer is
//!   the purge step. Only ever write-locked with `try_write`.
//! - `entries`: the arena and its ordering index.
//! - `pending`: positions awaiting physical removal. Pushers release it
//!   before they attempt the iterator lock.
//!
//! An entry dies logically either through [`WeakContainer::erase`] or
//! through its object's destruction callback. Both only queue the entry;
//! the purge that physically removes it runs as soon as no iterator is
//! open: immediately when possible, otherwise when the last iterator drops.

use crate::entry_map::{EntryId, EntryMap, Order, Pos};
use crate::error::InsertError;
use crate::lifeline::Subscription;
use crate::reference::{Strong, WeakRef};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Cause {
    Destroyed,
    Erased,
}

struct Record<V> {
    weak: WeakRef<V>,
    subscription: Option<Subscription>,
    erased: bool,
}

impl<V> Record<V> {
    /// Live entries block a unique insert of the same key and are
    /// preferred by lookups. Uses `is_alive` so no teardown can start
    /// while the entry lock is held.
    fn is_live(&self) -> bool {
        !self.erased && self.weak.is_alive()
    }
}

struct Shared<K, V> {
    iterators: RwLock<()>,
    entries: Mutex<EntryMap<K, Record<V>>>,
    pending: Mutex<Vec<(EntryId, Cause)>>,
}

impl<K, V> Shared<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn entry_destroyed(this: &Weak<Self>, id: EntryId) {
        // The container may already be gone; nothing to clean then.
        let Some(shared) = this.upgrade() else {
            return;
        };
        shared.pending.lock().push((id, Cause::Destroyed));
        shared.try_purge();
    }

    /// Physically remove queued entries if no iterator is open. Never
    /// blocks on the iterator lock; returns the number of entries removed.
    fn try_purge(&self) -> usize {
        let mut purged = 0;
        loop {
            let Some(exclusive) = self.iterators.try_write() else {
                return purged;
            };
            let queued = mem::take(&mut *self.pending.lock());
            if queued.is_empty() {
                drop(exclusive);
                // A push made while we held the writer lock failed its own
                // attempt; recheck after releasing so it is not stranded.
                if self.pending.lock().is_empty() {
                    return purged;
                }
                continue;
            }
            let removed: Vec<_> = {
                let mut entries = self.entries.lock();
                queued
                    .into_iter()
                    .filter_map(|(id, cause)| entries.remove(id).map(|kv| (cause, kv)))
                    .collect()
            };
            drop(exclusive);

            purged += removed.len();
            tracing::trace!(removed = removed.len(), "purged weak container entries");
            // Keys and records drop here, outside every container lock.
            for (cause, (_key, mut record)) in removed {
                if cause == Cause::Destroyed {
                    if let Some(sub) = record.subscription.take() {
                        sub.detach();
                    }
                }
            }
            // Loop: positions queued while we held the writer lock failed
            // their own attempt and are ours to drain.
        }
    }
}

/// A container of weak references, ordered according to [`Order`].
///
/// Cheap to clone; clones share the same entries.
pub struct WeakContainer<K, V> {
    shared: Arc<Shared<K, V>>,
}

/// Weak container in insertion order with no keys.
pub type WeakList<V> = WeakContainer<(), V>;

/// Snapshot of one entry yielded by [`Iter`].
pub struct Entry<K, V> {
    pub id: EntryId,
    pub key: K,
    /// Possibly stale: `resolve()` returns `None` for a zombie entry.
    pub value: WeakRef<V>,
}

impl<K: fmt::Debug, V> fmt::Debug for Entry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

impl<K, V> WeakContainer<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(order: Order) -> Self {
        Self {
            shared: Arc::new(Shared {
                iterators: RwLock::new(()),
                entries: Mutex::new(EntryMap::new(order)),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn ordered_unique() -> Self {
        Self::new(Order::OrderedUnique)
    }

    pub fn ordered_multi() -> Self {
        Self::new(Order::OrderedMulti)
    }

    pub fn insertion_ordered() -> Self {
        Self::new(Order::InsertionOrdered)
    }

    pub fn order(&self) -> Order {
        self.shared.entries.lock().order()
    }

    /// Number of physical entries, including zombies and erased entries
    /// whose removal is deferred by an open iterator.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().is_empty()
    }

    /// Number of entries queued for physical removal.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Add an entry observing `value`. The entry dies when `value`'s object
    /// is destroyed. Unique containers reject a key that has a live entry.
    pub fn insert(&self, key: K, value: &Strong<V>) -> Result<EntryId, InsertError> {
        let weak = Strong::downgrade(value);
        let back = Arc::downgrade(&self.shared);
        let mut entries = self.shared.entries.lock();
        let id = entries.insert_with(key, Record::is_live, |_| Record {
            weak,
            subscription: None,
            erased: false,
        })?;
        // `value` is held by the caller, so the callback cannot fire
        // synchronously here and registering under the entry lock is safe.
        let subscription = Strong::on_destroy(value, move || Shared::entry_destroyed(&back, id));
        if let Some(record) = entries.get_mut(id) {
            record.subscription = Some(subscription);
        }
        Ok(id)
    }

    /// Weak reference of the first live entry for `key`.
    pub fn find(&self, key: &K) -> Option<WeakRef<V>> {
        let entries = self.shared.entries.lock();
        entries
            .find_by(key, Record::is_live)
            .map(|(_, record)| record.weak.clone())
    }

    /// Weak references of every live entry for `key`, in container order.
    pub fn find_all(&self, key: &K) -> Vec<WeakRef<V>> {
        let entries = self.shared.entries.lock();
        entries
            .filter_by(key, Record::is_live)
            .into_iter()
            .filter_map(|id| entries.get(id).map(|r| r.weak.clone()))
            .collect()
    }

    /// Id of the first live entry for `key`.
    pub fn find_id(&self, key: &K) -> Option<EntryId> {
        let entries = self.shared.entries.lock();
        entries.find_by(key, Record::is_live).map(|(id, _)| id)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find_id(key).is_some()
    }

    /// Key stored under `id`, unless the entry was erased.
    pub fn key(&self, id: EntryId) -> Option<K> {
        let entries = self.shared.entries.lock();
        match entries.get(id) {
            Some(record) if !record.erased => entries.key(id).cloned(),
            _ => None,
        }
    }

    /// Weak reference stored under `id`, unless the entry was erased.
    pub fn get(&self, id: EntryId) -> Option<WeakRef<V>> {
        let entries = self.shared.entries.lock();
        entries
            .get(id)
            .filter(|r| !r.erased)
            .map(|r| r.weak.clone())
    }

    /// Logically remove the entry. Returns false if it was already erased
    /// or purged. Physical removal waits for open iterators to close.
    pub fn erase(&self, id: EntryId) -> bool {
        let subscription = {
            let mut entries = self.shared.entries.lock();
            match entries.get_mut(id) {
                Some(record) if !record.erased => {
                    record.erased = true;
                    record.subscription.take()
                }
                _ => return false,
            }
        };
        self.shared.pending.lock().push((id, Cause::Erased));
        // Cancelling may wait for an in-flight teardown of the object, so
        // it happens with no container lock held.
        drop(subscription);
        self.shared.try_purge();
        true
    }

    /// Erase every non-erased entry for `key`; returns how many.
    pub fn erase_key(&self, key: &K) -> usize {
        let ids = {
            let entries = self.shared.entries.lock();
            entries.filter_by(key, |r| !r.erased)
        };
        ids.into_iter().filter(|&id| self.erase(id)).count()
    }

    /// Attempt the deferred purge now. Non-blocking: does nothing while an
    /// iterator is open. Returns the number of entries removed.
    pub fn purge(&self) -> usize {
        self.shared.try_purge()
    }

    /// Open an iterator. Entries are purged only after every open
    /// iterator has been dropped.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            container: self,
            guard: Some(self.shared.iterators.read()),
            cursor: None,
            state: IterState::Start,
        }
    }
}

impl<V> WeakContainer<(), V>
where
    V: Send + Sync + 'static,
{
    /// Append to the list. `None` only when the container was built with
    /// a unique ordering and already holds a live entry.
    pub fn push(&self, value: &Strong<V>) -> Option<EntryId> {
        self.insert((), value).ok()
    }
}

impl<K, V> Default for WeakContainer<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Order::default())
    }
}

impl<K, V> Clone for WeakContainer<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> fmt::Debug for WeakContainer<K, V>
where
    K: Ord + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.shared.entries.lock();
        f.debug_struct("WeakContainer")
            .field("order", &entries.order())
            .field("len", &entries.len())
            .finish()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IterState {
    Start,
    At(EntryId),
    End,
}

/// Iterator over a [`WeakContainer`]. Holds the shared iterator lock for
/// its whole life, so no entry is physically removed while it is open.
///
/// New entries inserted concurrently may or may not be observed, depending
/// on their position relative to the cursor.
pub struct Iter<'a, K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    container: &'a WeakContainer<K, V>,
    guard: Option<RwLockReadGuard<'a, ()>>,
    cursor: Option<Pos<K>>,
    state: IterState,
}

impl<K, V> Iter<'_, K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Id of the entry most recently yielded, `None` before the first
    /// call to `next` and after the end.
    pub fn position(&self) -> Option<EntryId> {
        match self.state {
            IterState::At(id) => Some(id),
            IterState::Start | IterState::End => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == IterState::End
    }
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    type Item = Entry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == IterState::End {
            return None;
        }
        let entries = self.container.shared.entries.lock();
        loop {
            let Some((pos, id, key, record)) = entries.next_after(self.cursor.as_ref()) else {
                self.state = IterState::End;
                return None;
            };
            self.cursor = Some(pos.clone());
            if record.erased {
                continue;
            }
            self.state = IterState::At(id);
            return Some(Entry {
                id,
                key: key.clone(),
                value: record.weak.clone(),
            });
        }
    }
}

impl<K, V> PartialEq for Iter<'_, K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.container.shared, &other.container.shared) && self.state == other.state
    }
}

impl<K, V> Drop for Iter<'_, K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        self.container.shared.try_purge();
    }
}
