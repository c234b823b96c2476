//! rc-lifeline: strong/weak references with destruction callbacks, weak
//! containers that stay consistent under concurrent iteration, and
//! resource coordinators whose grants are capability tokens.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let unrelated parts of a program observe objects they do not
//!   own, learn exactly once when such an object goes away, and keep
//!   containers of such observers correct while they are iterated,
//!   mutated and torn down from different threads.
//! - Layers (leaf to root):
//!   - `Strong<T>` / `WeakRef<T>`: owning and observing handles. Every
//!     object carries a `Lifeline`, its shared lifetime-tracking block.
//!   - `Lifeline` / `Subscription`: destruction callbacks, fired once on
//!     the thread dropping the last `Strong`, before `T` is dropped.
//!   - `EntryMap<K, E>`: arena of entries with generational `EntryId`s and
//!     an ordering index (`Order`), reachable only under the container's
//!     entry lock.
//!   - `WeakContainer<K, V>`: entries of weak references; destruction
//!     callbacks and explicit erases queue entries, a non-blocking purge
//!     removes them once no iterator is open.
//!   - `TokenMap<K, P>`: entries whose presence follows a `Capability`
//!     token instead of the payload's own reference count.
//!   - `Semaphore`, `FixedSemaphore`, `LockPool`: coordinators that hand
//!     out grants as tokens; dropping a token releases the grant.
//!
//! Constraints
//! - Thread-safe: every public type is `Send + Sync` for `Send + Sync`
//!   payloads; callbacks may run on any thread.
//! - Cleanup never blocks on a reader: the purge step only ever
//!   `try_write`s the iterator lock. The thread destroying an object is
//!   never stalled by an iteration open elsewhere.
//! - No lock is held while user code runs (callbacks, owner `process`,
//!   event `signal`, payload drops), except `K: Ord`/`K: Clone` inside
//!   the entry map.
//! - No process-wide or thread-local state: containers and coordinators
//!   are explicit values shared through `Arc`.
//!
//! Lock order
//! - Weak container: iterator lock, then entry lock. The pending-delete
//!   lock is always released before the iterator lock is attempted.
//! - Lifeline: the phase lock is taken before the callbacks lock when
//!   registering; teardown takes them one after the other, never nested,
//!   and runs callbacks with neither held.
//! - Coordinators: one state lock, never held across user code. Any
//!   thread may run the admission loop; a release made on a thread that
//!   is already inside the loop only updates the counters.
//!
//! Failure policy
//! - Expected absence (dead weak reference, refused acquire) is an
//!   `Option`/`bool`, never an error.
//! - Misuse (zero-unit request, empty lock set, installing a token twice)
//!   is a `MisuseError` returned at the call site.
//! - A panicking coordinator callback (owner, policy, event) is caught
//!   and logged with `tracing`; the coordinator keeps going.
//! - A panicking destruction callback aborts the process: there is no
//!   safe place to unwind to in the middle of a teardown.
//!
//! Notes and non-goals
//! - No cycle detection: a cycle of `Strong`s leaks, like `Arc`.
//! - The counting semaphore always admits its head request when nothing
//!   is in use, even if the request exceeds capacity.

pub mod coordinator;
mod entry_map;
mod error;
pub mod lifeline;
mod reference;
pub mod tokens;
pub mod weak_container;

#[cfg(test)]
mod weak_container_proptest;

// Public surface
pub use coordinator::{
    Access, AcquirePolicy, Event, ExclusiveKeys, FixedPermit, FixedSemaphore, HeldLocks,
    LevelEvent, LockHold, LockPool, LockPoolConfig, LockRequest, LockStrategy, Owner, Permit,
    ReadWriteKeys, Semaphore, Units,
};
pub use entry_map::{EntryId, Order};
pub use error::{InsertError, MisuseError};
pub use lifeline::{CancelOutcome, Lifeline, Subscription};
pub use reference::{Strong, WeakRef};
pub use tokens::{Capability, Grant, TokenMap};
pub use weak_container::{Entry, Iter, WeakContainer, WeakList};
