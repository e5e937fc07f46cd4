//! Cache policies: how a value is keyed, weighed, and shrunk.

use core::hash::Hash;
use core::marker::PhantomData;

/// Describes the values stored in a `CacheMap`.
///
/// The map calls `key` once per `put` and keeps the result for the life of
/// the entry. `size` must report the value's current weight consistently
/// between calls; the map does not re-validate it.
pub trait CachePolicy<V> {
    type Key: Eq + Hash;

    fn key(&self, value: &V) -> Self::Key;

    /// Logical weight the value currently contributes (bytes, pixels, slots).
    fn size(&self, value: &V) -> usize;

    /// Shrink the value in place by up to `requested` units and report how
    /// many were freed. Values may be shared, so shrinking goes through
    /// interior mutability. Return 0 when nothing can be freed.
    fn release(&self, value: &V, requested: usize) -> usize;
}

/// Slot-counted entries: every value weighs 1 and is only ever evicted
/// whole. Fits caches bounded by entry count, such as open fonts or laid-out
/// text blocks.
pub struct SlotPolicy<V, F> {
    key_fn: F,
    _pd: PhantomData<fn(&V)>,
}

impl<V, F, K> SlotPolicy<V, F>
where
    F: Fn(&V) -> K,
    K: Eq + Hash,
{
    pub fn new(key_fn: F) -> Self {
        Self {
            key_fn,
            _pd: PhantomData,
        }
    }
}

impl<V, F, K> CachePolicy<V> for SlotPolicy<V, F>
where
    F: Fn(&V) -> K,
    K: Eq + Hash,
{
    type Key = K;

    fn key(&self, value: &V) -> K {
        (self.key_fn)(value)
    }

    fn size(&self, _value: &V) -> usize {
        1
    }

    fn release(&self, _value: &V, _requested: usize) -> usize {
        0
    }
}

/// Byte-weighted entries that cannot shrink, such as captured snapshots:
/// each value is evicted atomically.
pub struct WeightedPolicy<V, F, W> {
    key_fn: F,
    weight_fn: W,
    _pd: PhantomData<fn(&V)>,
}

impl<V, F, W, K> WeightedPolicy<V, F, W>
where
    F: Fn(&V) -> K,
    W: Fn(&V) -> usize,
    K: Eq + Hash,
{
    pub fn new(key_fn: F, weight_fn: W) -> Self {
        Self {
            key_fn,
            weight_fn,
            _pd: PhantomData,
        }
    }
}

impl<V, F, W, K> CachePolicy<V> for WeightedPolicy<V, F, W>
where
    F: Fn(&V) -> K,
    W: Fn(&V) -> usize,
    K: Eq + Hash,
{
    type Key = K;

    fn key(&self, value: &V) -> K {
        (self.key_fn)(value)
    }

    fn size(&self, value: &V) -> usize {
        (self.weight_fn)(value)
    }

    fn release(&self, _value: &V, _requested: usize) -> usize {
        0
    }
}
