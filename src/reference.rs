//! Strong and weak handles over reference-counted objects.
//!
//! `Strong<T>` owns a share of the object; `WeakRef<T>` only observes it.
//! Both carry the object's [`Lifeline`], so destruction callbacks can be
//! registered from either side. When the last `Strong` drops, the
//! lifeline's callbacks run on that thread and only then is `T` dropped.

use crate::lifeline::{Lifeline, Subscription};
use core::hash::{Hash, Hasher};
use core::ops::Deref;
use std::fmt;
use std::sync::{Arc, Weak};

struct Managed<T> {
    lifeline: Arc<Lifeline>,
    value: T,
}

impl<T> Drop for Managed<T> {
    fn drop(&mut self) {
        // Runs before `value` is dropped: callbacks observe teardown
        // while the payload storage still exists.
        self.lifeline.teardown();
    }
}

/// Owning handle. The referent stays valid for the handle's lifetime.
///
/// Like `Arc`, helper functions are associated functions
/// (`Strong::downgrade(&s)`) so they never shadow methods of `T`.
pub struct Strong<T> {
    inner: Arc<Managed<T>>,
}

impl<T> Strong<T> {
    /// Create a new managed object with one strong reference.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Managed {
                lifeline: Arc::new(Lifeline::new()),
                value,
            }),
        }
    }

    pub fn downgrade(this: &Self) -> WeakRef<T> {
        WeakRef {
            weak: Arc::downgrade(&this.inner),
            lifeline: this.inner.lifeline.clone(),
        }
    }

    /// Register `f` to run once when the object is destroyed.
    pub fn on_destroy<F>(this: &Self, f: F) -> Subscription
    where
        F: FnOnce() + Send + 'static,
    {
        this.inner.lifeline.register(Box::new(f))
    }

    pub fn lifeline(this: &Self) -> &Arc<Lifeline> {
        &this.inner.lifeline
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    fn addr(this: &Self) -> usize {
        Arc::as_ptr(&this.inner) as *const () as usize
    }
}

impl<T> Deref for Strong<T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T> Clone for Strong<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for Strong<T> {
    fn eq(&self, other: &Self) -> bool {
        Strong::ptr_eq(self, other)
    }
}

impl<T> Eq for Strong<T> {}

impl<T> Hash for Strong<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Strong::addr(self).hash(state);
    }
}

impl<T: fmt::Debug> fmt::Debug for Strong<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Strong").field(&self.inner.value).finish()
    }
}

/// Non-owning handle. Never extends the object's life.
pub struct WeakRef<T> {
    weak: Weak<Managed<T>>,
    lifeline: Arc<Lifeline>,
}

impl<T> WeakRef<T> {
    /// Try to recover a strong reference. `None` once the object is gone;
    /// atomic with respect to a concurrent last drop on another thread.
    pub fn resolve(&self) -> Option<Strong<T>> {
        self.weak.upgrade().map(|inner| Strong { inner })
    }

    /// Liveness check that does not mint a strong reference.
    ///
    /// Safe to call under locks: unlike `resolve`, it can never cause the
    /// object's teardown to run on this thread.
    pub fn is_alive(&self) -> bool {
        self.weak.strong_count() > 0
    }

    /// Register `f` to run once when the object is destroyed. If the
    /// object is already being destroyed, `f` runs immediately.
    pub fn on_destroy<F>(&self, f: F) -> Subscription
    where
        F: FnOnce() + Send + 'static,
    {
        self.lifeline.register(Box::new(f))
    }

    pub fn lifeline(&self) -> &Arc<Lifeline> {
        &self.lifeline
    }

    /// True if both handles observe the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.lifeline, &other.lifeline)
    }

    /// True if this handle observes the object behind `strong`.
    pub fn refers_to(&self, strong: &Strong<T>) -> bool {
        Arc::ptr_eq(&self.lifeline, &strong.inner.lifeline)
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            weak: self.weak.clone(),
            lifeline: self.lifeline.clone(),
        }
    }
}

impl<T> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("alive", &self.is_alive())
            .finish()
    }
}
