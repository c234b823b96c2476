//! EntryMap: arena of entries with stable generational ids, an ordering
//! index selected by [`Order`].
//!
//! Entries live in a `SlotMap`; the index maps an ordering position to the
//! slot. Positions are totally ordered and never reused, so a cursor that
//! remembers the last position it visited can resume after arbitrary
//! inserts and removals.

use crate::error::InsertError;
use slotmap::{DefaultKey, SlotMap};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Ordering and lookup policy of a container.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub enum Order {
    /// Sorted by key; at most one live entry per key.
    #[default]
    OrderedUnique,
    /// Sorted by key, then by insertion; duplicate keys allowed.
    OrderedMulti,
    /// Insertion order; keys are payload only and may repeat.
    InsertionOrdered,
}

impl Order {
    pub fn is_unique(self) -> bool {
        matches!(self, Order::OrderedUnique)
    }

    fn is_keyed(self) -> bool {
        !matches!(self, Order::InsertionOrdered)
    }
}

/// Stable, generational id of a container entry. A stale id never
/// resolves to a newer entry that reused the same slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntryId(DefaultKey);

/// Ordering position. `key` is `None` for insertion-ordered maps.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Pos<K> {
    key: Option<K>,
    seq: u64,
}

#[derive(Debug)]
struct Slot<K, E> {
    key: K,
    pos: Pos<K>,
    value: E,
}

pub(crate) struct EntryMap<K, E> {
    order: Order,
    index: BTreeMap<Pos<K>, DefaultKey>,
    slots: SlotMap<DefaultKey, Slot<K, E>>,
    next_seq: u64,
}

impl<K, E> EntryMap<K, E>
where
    K: Ord + Clone,
{
    pub fn new(order: Order) -> Self {
        Self {
            order,
            index: BTreeMap::new(),
            slots: SlotMap::with_key(),
            next_seq: 0,
        }
    }

    pub fn order(&self) -> Order {
        self.order
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert `key`, building the value from its id. For unique maps, an
    /// existing entry with the same key rejects the insert only when
    /// `blocks` returns true for its value.
    pub fn insert_with<B, F>(&mut self, key: K, blocks: B, make: F) -> Result<EntryId, InsertError>
    where
        B: Fn(&E) -> bool,
        F: FnOnce(EntryId) -> E,
    {
        if self.order.is_unique()
            && self
                .candidates(&key)
                .any(|k| self.slots.get(k).map(|s| blocks(&s.value)).unwrap_or(false))
        {
            return Err(InsertError::DuplicateKey);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let pos = Pos {
            key: self.order.is_keyed().then(|| key.clone()),
            seq,
        };
        let k = self.slots.insert_with_key(|k| Slot {
            key,
            pos: pos.clone(),
            value: make(EntryId(k)),
        });
        self.index.insert(pos, k);
        Ok(EntryId(k))
    }

    pub fn remove(&mut self, id: EntryId) -> Option<(K, E)> {
        let slot = self.slots.remove(id.0)?;
        self.index.remove(&slot.pos);
        Some((slot.key, slot.value))
    }

    pub fn get(&self, id: EntryId) -> Option<&E> {
        self.slots.get(id.0).map(|s| &s.value)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut E> {
        self.slots.get_mut(id.0).map(|s| &mut s.value)
    }

    pub fn key(&self, id: EntryId) -> Option<&K> {
        self.slots.get(id.0).map(|s| &s.key)
    }

    /// First entry with `key`, in container order, accepted by `pred`.
    pub fn find_by<P>(&self, key: &K, mut pred: P) -> Option<(EntryId, &E)>
    where
        P: FnMut(&E) -> bool,
    {
        self.candidates(key).find_map(|k| {
            let slot = self.slots.get(k)?;
            pred(&slot.value).then_some((EntryId(k), &slot.value))
        })
    }

    /// All entries with `key`, in container order, accepted by `pred`.
    pub fn filter_by<P>(&self, key: &K, mut pred: P) -> Vec<EntryId>
    where
        P: FnMut(&E) -> bool,
    {
        self.candidates(key)
            .filter(|&k| self.slots.get(k).map(|s| pred(&s.value)).unwrap_or(false))
            .map(EntryId)
            .collect()
    }

    /// The entry following `after` in container order (the first entry
    /// when `after` is `None`).
    pub fn next_after(&self, after: Option<&Pos<K>>) -> Option<(&Pos<K>, EntryId, &K, &E)> {
        let (pos, &k) = match after {
            Some(p) => self
                .index
                .range((Bound::Excluded(p), Bound::Unbounded))
                .next()?,
            None => self.index.iter().next()?,
        };
        let slot = self.slots.get(k)?;
        Some((pos, EntryId(k), &slot.key, &slot.value))
    }

    /// Entries in container order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &K, &E)> {
        self.index.values().filter_map(move |&k| {
            self.slots
                .get(k)
                .map(|s| (EntryId(k), &s.key, &s.value))
        })
    }

    fn candidates<'a>(&'a self, key: &K) -> Box<dyn Iterator<Item = DefaultKey> + 'a> {
        if self.order.is_keyed() {
            let lo = Pos {
                key: Some(key.clone()),
                seq: 0,
            };
            let hi = Pos {
                key: Some(key.clone()),
                seq: u64::MAX,
            };
            Box::new(self.index.range(lo..=hi).map(|(_, &k)| k))
        } else {
            let key = key.clone();
            Box::new(self.index.values().copied().filter(move |&k| {
                self.slots.get(k).map(|s| s.key == key).unwrap_or(false)
            }))
        }
    }
}
