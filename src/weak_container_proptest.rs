#![cfg(test)]

// Property tests for WeakContainer kept inside the crate so the model can
// compare against internal ids without widening the public surface.

use crate::entry_map::{EntryId, Order};
use crate::error::InsertError;
use crate::reference::Strong;
use crate::weak_container::{Iter, WeakContainer};
use proptest::prelude::*;
use std::collections::HashSet;

// Small key space so duplicates, zombies and re-inserts are common.
const KEYS: u8 = 4;

#[derive(Clone, Debug)]
enum Op {
    Insert(u8),
    DropValue(usize),
    Erase(usize),
    EraseKey(u8),
    OpenIter,
    StepIter,
    CloseIter,
    Iterate,
    Purge,
}

fn arb_order() -> impl Strategy<Value = Order> {
    prop_oneof![
        Just(Order::OrderedUnique),
        Just(Order::OrderedMulti),
        Just(Order::InsertionOrdered),
    ]
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        3 => (0..KEYS).prop_map(Op::Insert),
        2 => any::<usize>().prop_map(Op::DropValue),
        1 => any::<usize>().prop_map(Op::Erase),
        1 => (0..KEYS).prop_map(Op::EraseKey),
        1 => Just(Op::OpenIter),
        1 => Just(Op::StepIter),
        1 => Just(Op::CloseIter),
        1 => Just(Op::Iterate),
        1 => Just(Op::Purge),
    ];
    proptest::collection::vec(op, 1..80)
}

struct Held {
    key: u8,
    id: EntryId,
    value: Strong<i32>,
}

// Property: state-machine equivalence against a list of held values.
// Invariants exercised across random operation sequences:
// - Unique containers reject a key only while a live entry holds it.
// - Lookups see exactly the entries whose value is alive and not erased.
// - Destroying a value or erasing an entry never removes anything
//   physically while an iterator is open; once the last one closes,
//   the physical size equals the live count and nothing stays queued.
// - Erased entries stay detached: dropping their value later is a no-op.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine(order in arb_order(), ops in arb_ops()) {
        let sut: WeakContainer<u8, i32> = WeakContainer::new(order);
        let mut held: Vec<Held> = Vec::new();
        let mut orphans: Vec<Strong<i32>> = Vec::new();
        let mut iters: Vec<Iter<'_, u8, i32>> = Vec::new();
        let mut next_value = 0i32;

        for op in ops {
            match op {
                Op::Insert(key) => {
                    next_value += 1;
                    let value = Strong::new(next_value);
                    let taken = held.iter().any(|h| h.key == key);
                    match sut.insert(key, &value) {
                        Ok(id) => {
                            prop_assert!(
                                !(order.is_unique() && taken),
                                "unique key inserted twice"
                            );
                            held.push(Held { key, id, value });
                        }
                        Err(InsertError::DuplicateKey) => {
                            prop_assert!(
                                order.is_unique() && taken,
                                "duplicate error only for a live key"
                            );
                        }
                    }
                }
                Op::DropValue(i) => {
                    if !held.is_empty() {
                        let h = held.remove(i % held.len());
                        drop(h.value);
                        prop_assert!(sut.get(h.id).map_or(true, |w| w.resolve().is_none()));
                    }
                }
                Op::Erase(i) => {
                    if !held.is_empty() {
                        let h = held.remove(i % held.len());
                        prop_assert!(sut.erase(h.id));
                        prop_assert!(!sut.erase(h.id), "second erase is a no-op");
                        prop_assert!(sut.get(h.id).is_none());
                        orphans.push(h.value);
                    }
                }
                Op::EraseKey(key) => {
                    let before = held.len();
                    let (gone, kept): (Vec<_>, Vec<_>) =
                        held.drain(..).partition(|h| h.key == key);
                    held = kept;
                    let erased = sut.erase_key(&key);
                    // Zombies awaiting purge are not erased yet, so they count too.
                    prop_assert!(erased >= before - held.len());
                    orphans.extend(gone.into_iter().map(|h| h.value));
                }
                Op::OpenIter => iters.push(sut.iter()),
                Op::StepIter => {
                    if let Some(it) = iters.last_mut() {
                        if let Some(entry) = it.next() {
                            prop_assert_eq!(Iter::position(it), Some(entry.id));
                            if let Some(v) = entry.value.resolve() {
                                let expected = held
                                    .iter()
                                    .any(|h| h.id == entry.id && Strong::ptr_eq(&h.value, &v));
                                prop_assert!(expected);
                            }
                        }
                    }
                }
                Op::CloseIter => {
                    iters.pop();
                }
                Op::Iterate => {
                    let seen: Vec<EntryId> = sut
                        .iter()
                        .filter(|e| e.value.resolve().is_some())
                        .map(|e| e.id)
                        .collect();
                    let expected: HashSet<EntryId> = held.iter().map(|h| h.id).collect();
                    prop_assert_eq!(seen.len(), expected.len());
                    prop_assert_eq!(seen.into_iter().collect::<HashSet<_>>(), expected);
                }
                Op::Purge => {
                    let purged = sut.purge();
                    if !iters.is_empty() {
                        prop_assert_eq!(purged, 0);
                    }
                }
            }

            // Post-conditions after each op
            for key in 0..KEYS {
                let live = held.iter().filter(|h| h.key == key).count();
                prop_assert_eq!(sut.contains_key(&key), live > 0);
                prop_assert_eq!(sut.find_all(&key).len(), live);
            }
            for h in &held {
                let weak = sut.get(h.id).expect("held entry is present");
                prop_assert!(weak.refers_to(&h.value));
                prop_assert_eq!(sut.key(h.id), Some(h.key));
            }
            if iters.is_empty() {
                prop_assert_eq!(sut.len(), held.len());
                prop_assert_eq!(sut.pending(), 0);
            } else {
                prop_assert!(sut.len() >= held.len());
            }
        }

        drop(iters);
        prop_assert_eq!(sut.len(), held.len());
        drop(orphans);
        prop_assert_eq!(sut.len(), held.len(), "erased entries stay detached");
    }
}
