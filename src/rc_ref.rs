//! `Ref<V>`: shared handle to a cached value.
//!
//! The cache keeps one `Ref` per entry and hands out clones. Eviction may
//! only destroy an entry whose `Ref` is unique (`use_count() == 1`); any
//! clone held elsewhere pins the value alive, even after the entry has been
//! erased from the map.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::Deref;
use std::rc::Rc;

pub struct Ref<V>(Rc<V>);

impl<V> Ref<V> {
    pub fn new(value: V) -> Self {
        Ref(Rc::new(value))
    }

    /// Number of live `Ref`s to this value, the cache's own included.
    #[inline]
    pub fn use_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// `true` when no other `Ref` shares this value.
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }

    /// Identity comparison: both handles point at the same allocation.
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Take the value out if this is the last handle.
    pub fn try_unwrap(this: Self) -> Result<V, Self> {
        Rc::try_unwrap(this.0).map_err(Ref)
    }
}

impl<V> Clone for Ref<V> {
    fn clone(&self) -> Self {
        Ref(Rc::clone(&self.0))
    }
}

impl<V> Deref for Ref<V> {
    type Target = V;
    #[inline]
    fn deref(&self) -> &V {
        &self.0
    }
}

impl<V> AsRef<V> for Ref<V> {
    fn as_ref(&self) -> &V {
        &self.0
    }
}

impl<V> From<V> for Ref<V> {
    fn from(value: V) -> Self {
        Ref::new(value)
    }
}

// Equality and hashing are by identity, so a `Ref` can key a side table.
impl<V> PartialEq for Ref<V> {
    fn eq(&self, other: &Self) -> bool {
        Ref::ptr_eq(self, other)
    }
}

impl<V> Eq for Ref<V> {}

impl<V> Hash for Ref<V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl<V: fmt::Debug> fmt::Debug for Ref<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.0).finish()
    }
}
