use rc_lifeline::{InsertError, Order, Strong, WeakContainer, WeakList};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

#[test]
fn zombie_is_yielded_then_purged_when_iteration_ends() {
    let c = WeakContainer::ordered_unique();
    let a = Strong::new("a".to_string());
    let b = Strong::new("b".to_string());
    c.insert(1u32, &a).unwrap();
    c.insert(2u32, &b).unwrap();

    let mut it = c.iter();
    let first = it.next().expect("first entry");
    assert_eq!(first.key, 1);
    drop(b);

    // Still physically present, but lookups no longer see it.
    assert_eq!(c.len(), 2);
    assert!(c.find(&2).is_none());
    assert!(!c.contains_key(&2));

    let zombie = it.next().expect("zombie is still yielded");
    assert_eq!(zombie.key, 2);
    assert!(zombie.value.resolve().is_none());
    assert!(it.next().is_none());
    drop(it);

    assert_eq!(c.len(), 1);
    assert_eq!(c.pending(), 0);
}

#[test]
fn unique_key_is_free_again_once_its_object_dies() {
    let c = WeakContainer::ordered_unique();
    let a = Strong::new(1u8);
    c.insert("k", &a).unwrap();
    let b = Strong::new(2u8);
    assert_eq!(c.insert("k", &b), Err(InsertError::DuplicateKey));

    // Keep an iterator open so the dead entry lingers as a zombie.
    let it = c.iter();
    drop(a);
    let id = c.insert("k", &b).expect("zombie does not block the key");
    assert!(c.find(&"k").unwrap().refers_to(&b));
    assert_eq!(c.len(), 2);
    drop(it);
    assert_eq!(c.len(), 1);
    assert_eq!(c.find_id(&"k"), Some(id));
}

#[test]
fn find_after_destroy_reports_absent() {
    let c: WeakContainer<String, Vec<u8>> = WeakContainer::ordered_multi();
    let v = Strong::new(vec![1, 2, 3]);
    c.insert("x".to_string(), &v).unwrap();
    let w = c.find(&"x".to_string()).unwrap();
    drop(v);
    assert!(w.resolve().is_none());
    assert!(c.find(&"x".to_string()).is_none());
    assert!(c.find_all(&"x".to_string()).is_empty());
    assert!(c.is_empty());
}

#[test]
fn erase_key_removes_every_duplicate() {
    let c = WeakContainer::new(Order::OrderedMulti);
    let values: Vec<_> = (0..4u32).map(Strong::new).collect();
    for v in &values {
        c.insert(**v % 2, v).unwrap();
    }
    assert_eq!(c.erase_key(&0), 2);
    assert_eq!(c.len(), 2);
    assert_eq!(c.erase_key(&0), 0);
    let keys: Vec<_> = c.iter().map(|e| e.key).collect();
    assert_eq!(keys, vec![1, 1]);
}

#[test]
fn list_keeps_insertion_order() {
    let list: WeakList<u32> = WeakContainer::insertion_ordered();
    let values: Vec<_> = [3u32, 1, 2].into_iter().map(Strong::new).collect();
    for v in &values {
        list.push(v).unwrap();
    }
    let seen: Vec<u32> = list.iter().filter_map(|e| e.value.resolve()).map(|v| *v).collect();
    assert_eq!(seen, vec![3, 1, 2]);
}

#[test]
fn dropping_the_container_first_is_harmless() {
    let v = Strong::new(9u64);
    {
        let c = WeakContainer::ordered_unique();
        c.insert(1u8, &v).unwrap();
    }
    // The destruction callback finds the container gone and does nothing.
    drop(v);
}

#[test]
fn concurrent_purges_never_strand_destroyed_entries() {
    let c = WeakContainer::ordered_multi();
    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                c.purge();
            }
        });
        for i in 0..2000usize {
            let v = Strong::new(i);
            c.insert(i % 7, &v).unwrap();
            drop(v);
        }
        stop.store(true, Ordering::Release);
    });
    assert_eq!(c.pending(), 0);
    assert_eq!(c.len(), 0);
}

#[test]
fn iterators_race_erasures_and_destructions() {
    const ITERATORS: usize = 4;
    const MUTATORS: usize = 4;
    const PER_MUTATOR: usize = 64;

    let c: WeakContainer<usize, usize> = WeakContainer::ordered_multi();
    let mut batches: Vec<Vec<(usize, Strong<usize>)>> = Vec::new();
    for m in 0..MUTATORS {
        let batch = (0..PER_MUTATOR)
            .map(|i| {
                let v = Strong::new(m * PER_MUTATOR + i);
                let id_key = i % 8;
                c.insert(id_key, &v).unwrap();
                (id_key, v)
            })
            .collect();
        batches.push(batch);
    }
    assert_eq!(c.len(), MUTATORS * PER_MUTATOR);

    let barrier = Barrier::new(ITERATORS + MUTATORS);
    let stop = AtomicBool::new(false);
    let yielded = AtomicUsize::new(0);
    let survivors = thread::scope(|s| {
        for _ in 0..ITERATORS {
            s.spawn(|| {
                barrier.wait();
                loop {
                    let mut last: Option<usize> = None;
                    for entry in c.iter() {
                        // Ordered multi: keys never go backwards mid-iteration.
                        assert!(last.map_or(true, |k| k <= entry.key));
                        last = Some(entry.key);
                        if let Some(v) = entry.value.resolve() {
                            assert_eq!(*v % PER_MUTATOR % 8, entry.key);
                        }
                        yielded.fetch_add(1, Ordering::Relaxed);
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
            });
        }

        let mutators: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let c = &c;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut kept = Vec::new();
                    for (n, (key, v)) in batch.into_iter().enumerate() {
                        match n % 3 {
                            // Destroy the object.
                            0 => drop(v),
                            // Erase the entry but keep the object alive.
                            1 => {
                                assert!(erase_entry_of(c, key, &v));
                                kept.push(v);
                            }
                            _ => kept.push(v),
                        }
                    }
                    kept
                })
            })
            .collect();

        let survivors: Vec<Vec<Strong<usize>>> =
            mutators.into_iter().map(|h| h.join().unwrap()).collect();
        stop.store(true, Ordering::SeqCst);
        survivors
    });

    assert!(yielded.load(Ordering::Relaxed) > 0);
    // Every iterator is gone, so everything queued has been purged.
    assert_eq!(c.pending(), 0);
    let still_observed = survivors.iter().flatten().filter(|v| {
        let key = ***v % PER_MUTATOR % 8;
        c.find_all(&key).iter().any(|w| w.refers_to(v))
    });
    let live = (0..PER_MUTATOR).filter(|n| n % 3 == 2).count() * MUTATORS;
    assert_eq!(still_observed.count(), live);
    assert_eq!(c.len(), live);
}

fn erase_entry_of(c: &WeakContainer<usize, usize>, key: usize, v: &Strong<usize>) -> bool {
    let id = c
        .iter()
        .find(|e| e.key == key && e.value.refers_to(v))
        .map(|e| e.id);
    id.map_or(false, |id| c.erase(id))
}
