//! CacheMap: size-bounded recency cache over `ChainedHashTable`.
//!
//! Every table node also carries the entry's recency links, so one node
//! sits in one bucket chain and one position of the MRU→LRU list. The map
//! owns one `Ref<V>` per entry; eviction only destroys entries nobody else
//! holds and otherwise asks the policy to shrink them in place.

use crate::chained_hash_table::{ChainedHashTable, Handle, MIN_BUCKETS};
use crate::error::{CacheError, InvariantError};
use crate::policy::CachePolicy;
use crate::rc_ref::Ref;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use hashbrown::hash_map::DefaultHashBuilder;

/// Construction parameters for a `CacheMap`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CacheConfig {
    /// Logical weight budget, in the policy's units.
    pub capacity: usize,
    /// Bucket heads to allocate up front; rounded up to a power of two.
    pub initial_buckets: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: usize::MAX,
            initial_buckets: MIN_BUCKETS,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_buckets(mut self, initial_buckets: usize) -> Self {
        self.initial_buckets = initial_buckets;
        self
    }
}

/// Point-in-time usage figures for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CacheStats {
    pub len: usize,
    pub size: usize,
    pub capacity: usize,
    pub bucket_count: usize,
    pub bucket_bytes: usize,
}

// Payload stored in each table node. `prev` points toward the MRU end,
// `next` toward the LRU end.
struct Slot<V> {
    value: Ref<V>,
    prev: Option<Handle>,
    next: Option<Handle>,
}

pub struct CacheMap<V, P, S = DefaultHashBuilder>
where
    P: CachePolicy<V>,
{
    table: ChainedHashTable<P::Key, Slot<V>, S>,
    policy: P,
    head: Option<Handle>,
    tail: Option<Handle>,
    size: usize,
    capacity: usize,
    // Shrinking never goes below the bucket array the map was built with.
    min_buckets: usize,
}

impl<V, P> CacheMap<V, P>
where
    P: CachePolicy<V>,
{
    pub fn new(capacity: usize, policy: P) -> Self {
        Self::from_table(ChainedHashTable::new(), capacity, policy)
    }

    pub fn try_with_config(config: CacheConfig, policy: P) -> Result<Self, CacheError> {
        Self::try_with_config_and_hasher(config, policy, DefaultHashBuilder::default())
    }
}

impl<V, P, S> CacheMap<V, P, S>
where
    P: CachePolicy<V>,
    S: BuildHasher,
{
    pub fn try_with_config_and_hasher(
        config: CacheConfig,
        policy: P,
        hasher: S,
    ) -> Result<Self, CacheError> {
        let table = ChainedHashTable::try_with_buckets_and_hasher(config.initial_buckets, hasher)?;
        Ok(Self::from_table(table, config.capacity, policy))
    }

    fn from_table(table: ChainedHashTable<P::Key, Slot<V>, S>, capacity: usize, policy: P) -> Self {
        Self {
            min_buckets: table.bucket_count(),
            table,
            policy,
            head: None,
            tail: None,
            size: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Total weight of all entries, as last reported by the policy.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the weight budget and evict down to it. Returns the units
    /// reclaimed.
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity;
        self.evict()
    }

    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    pub fn bucket_bytes(&self) -> usize {
        self.table.bucket_bytes()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.len(),
            size: self.size,
            capacity: self.capacity,
            bucket_count: self.bucket_count(),
            bucket_bytes: self.bucket_bytes(),
        }
    }

    /// Whether `h` was issued by this map. Handles from other maps resolve
    /// to nothing here.
    pub fn owns(&self, h: Handle) -> bool {
        self.table.owns(h)
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Most recently used entry.
    pub fn first(&self) -> Option<Handle> {
        self.head
    }

    /// Least recently used entry.
    pub fn last(&self) -> Option<Handle> {
        self.tail
    }

    pub fn key(&self, h: Handle) -> Option<&P::Key> {
        self.table.key(h)
    }

    pub fn value(&self, h: Handle) -> Option<&Ref<V>> {
        self.table.get(h).map(|s| &s.value)
    }

    // ---- recency list plumbing ----

    fn slot(&self, h: Handle) -> &Slot<V> {
        self.table
            .get(h)
            .expect("recency list must only link live nodes")
    }

    fn slot_mut(&mut self, h: Handle) -> &mut Slot<V> {
        self.table
            .get_mut(h)
            .expect("recency list must only link live nodes")
    }

    fn unlink(&mut self, h: Handle) {
        let (prev, next) = {
            let s = self.slot(h);
            (s.prev, s.next)
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, h: Handle) {
        let old = self.head;
        {
            let s = self.slot_mut(h);
            s.prev = None;
            s.next = old;
        }
        match old {
            Some(o) => self.slot_mut(o).prev = Some(h),
            None => self.tail = Some(h),
        }
        self.head = Some(h);
    }

    // Unlink from both structures and settle the size. The value is handed
    // back so it drops after the map is consistent again.
    fn detach(&mut self, h: Handle) -> Option<(Option<Handle>, Ref<V>, usize)> {
        let next = self.table.get(h)?.next;
        self.unlink(h);
        let (_key, slot) = self.table.remove(h)?;
        let weight = self.policy.size(&slot.value);
        self.size = self.size.saturating_sub(weight);
        Some((next, slot.value, weight))
    }

    // ---- lookup ----

    /// Look up without touching recency order.
    pub fn find<Q>(&self, q: &Q) -> Option<Handle>
    where
        P::Key: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.table.find(q)
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        P::Key: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.table.contains_key(q)
    }

    /// Look up and promote a hit to most recently used.
    pub fn get<Q>(&mut self, q: &Q) -> Option<Handle>
    where
        P::Key: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.table.find(q)?;
        self.use_entry(h);
        Some(h)
    }

    /// `get` followed by a clone of the entry's `Ref`.
    pub fn lookup<Q>(&mut self, q: &Q) -> Option<Ref<V>>
    where
        P::Key: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.get(q)?;
        self.value(h).cloned()
    }

    /// Move an entry to the MRU end. Returns `false` for a stale handle.
    pub fn use_entry(&mut self, h: Handle) -> bool {
        if self.table.get(h).is_none() {
            return false;
        }
        if self.head != Some(h) {
            self.unlink(h);
            self.push_front(h);
        }
        true
    }

    // ---- admission and removal ----

    /// Insert `value` under `policy.key(&value)` and evict down to capacity.
    ///
    /// When the key is already present the existing entry is returned with
    /// `false`, `value` is dropped, and recency order is left alone; call
    /// `use_entry` to promote it.
    pub fn put(&mut self, value: V) -> Result<(Handle, bool), CacheError> {
        self.put_with(value, true)
    }

    /// `put` with eviction made optional.
    pub fn put_with(&mut self, value: V, evict: bool) -> Result<(Handle, bool), CacheError> {
        let key = self.policy.key(&value);
        if let Some(h) = self.table.find(&key) {
            return Ok((h, false));
        }
        let weight = self.policy.size(&value);
        let h = self.table.insert(
            key,
            Slot {
                value: Ref::new(value),
                prev: None,
                next: None,
            },
        )?;
        self.push_front(h);
        self.size = self.size.saturating_add(weight);
        if evict {
            self.evict();
        }
        Ok((h, true))
    }

    /// Remove an entry regardless of capacity pressure and return the entry
    /// that followed it toward the LRU end. Outstanding `Ref`s keep the
    /// value itself alive.
    pub fn erase(&mut self, h: Handle) -> Option<Handle> {
        let (next, value, _weight) = self.detach(h)?;
        drop(value);
        next
    }

    pub fn erase_key<Q>(&mut self, q: &Q) -> Option<Handle>
    where
        P::Key: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.table.find(q)?;
        self.erase(h)
    }

    /// Drop every entry. Values still referenced elsewhere survive.
    pub fn clear(&mut self) {
        self.head = None;
        self.tail = None;
        self.size = 0;
        self.table.clear();
    }

    /// Record an out-of-band change in some entry's weight.
    pub fn adjust(&mut self, delta: isize) {
        self.adjust_with(delta, true);
    }

    pub fn adjust_with(&mut self, delta: isize, evict: bool) {
        self.size = self.size.saturating_add_signed(delta);
        if evict {
            self.evict();
        }
    }

    // ---- eviction ----

    /// Reclaim the excess over capacity. The entry that is most recently
    /// used when the call starts is never visited, so the entry just
    /// inserted or touched survives.
    pub fn evict(&mut self) -> usize {
        let baseline = self.size - self.size.min(self.capacity);
        self.evict_pass(baseline, true)
    }

    /// Reclaim up to `baseline` units, scanning from the LRU end over every
    /// entry. Returns the units credited toward `baseline`, never more than
    /// `baseline`; falling short means the rest is pinned by outside `Ref`s.
    pub fn evict_by(&mut self, baseline: usize) -> usize {
        self.evict_pass(baseline, false)
    }

    // Sweeps the list from the LRU end until `baseline` is met or a whole
    // sweep frees nothing. Entries that release part of their weight move
    // to the MRU end and are offered again by the next sweep.
    fn evict_pass(&mut self, baseline: usize, spare_mru: bool) -> usize {
        let spared = if spare_mru { self.head } else { None };
        let mut released = 0usize;
        let mut sweeps = 0usize;
        let (mut shrunk, mut erased, mut pinned) = (0usize, 0usize, 0usize);

        while released < baseline {
            sweeps += 1;
            let progress_mark = (released, erased);
            let stop = self.head;
            let mut cursor = self.tail;

            while released < baseline {
                let Some(h) = cursor else { break };
                let slot = self.slot(h);
                let prev = slot.prev;

                if Some(h) != spared {
                    let delta = self.policy.release(&slot.value, baseline - released);
                    let unique = slot.value.is_unique();

                    if delta > 0 {
                        // Still warm: keep it behind the rest of this sweep.
                        self.size = self.size.saturating_sub(delta);
                        released = released.saturating_add(delta);
                        self.use_entry(h);
                        shrunk += 1;
                    } else if unique {
                        if let Some((_next, value, weight)) = self.detach(h) {
                            released = released.saturating_add(weight);
                            erased += 1;
                            drop(value);
                        }
                    } else {
                        pinned += 1;
                    }
                }

                // Entries moved to the front wait for the next sweep.
                if Some(h) == stop {
                    break;
                }
                cursor = prev;
            }

            if (released, erased) == progress_mark {
                break;
            }
        }

        self.shrink_buckets();
        tracing::trace!(
            baseline,
            released,
            sweeps,
            shrunk,
            erased,
            pinned,
            size = self.size,
            capacity = self.capacity,
            "eviction pass"
        );
        released.min(baseline)
    }

    /// Remove the least recently used entry nobody else holds and give its
    /// `Ref` to the caller, for reusing one whole slot.
    pub fn evict_last(&mut self) -> Option<Ref<V>> {
        let mut cursor = self.tail;
        while let Some(h) = cursor {
            let (unique, prev) = {
                let slot = self.slot(h);
                (slot.value.is_unique(), slot.prev)
            };
            if unique {
                let (_next, value, weight) = self.detach(h)?;
                tracing::trace!(weight, size = self.size, "evicted last entry");
                return Some(value);
            }
            cursor = prev;
        }
        None
    }

    fn shrink_buckets(&mut self) {
        let count = self.table.len();
        let buckets = self.table.bucket_count();
        if count.max(MIN_BUCKETS).saturating_mul(4) <= buckets {
            // Best effort: on failure the larger array keeps working.
            if let Err(err) = self.table.rehash(count.max(self.min_buckets)) {
                tracing::warn!(%err, buckets, count, "bucket array shrink failed");
            }
        }
    }

    // ---- iteration and diagnostics ----

    /// Entries from most to least recently used.
    pub fn iter(&self) -> Iter<'_, V, P, S> {
        Iter {
            map: self,
            cursor: self.head,
            toward_lru: true,
        }
    }

    /// Entries from least to most recently used.
    pub fn iter_lru(&self) -> Iter<'_, V, P, S> {
        Iter {
            map: self,
            cursor: self.tail,
            toward_lru: false,
        }
    }

    /// Verify that the table and the recency list hold the same nodes with
    /// symmetric links, and that `size` matches the policy's weights.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        self.table.check_chains()?;

        let mut seen = 0usize;
        let mut weight = 0usize;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(h) = cursor {
            let slot = self
                .table
                .get(h)
                .ok_or_else(|| InvariantError::new("recency list links a removed node"))?;
            if slot.prev != prev {
                return Err(InvariantError::new("asymmetric recency link"));
            }
            seen += 1;
            if seen > self.table.len() {
                return Err(InvariantError::new("recency list contains a cycle"));
            }
            weight = weight.saturating_add(self.policy.size(&slot.value));
            prev = Some(h);
            cursor = slot.next;
        }
        if self.tail != prev {
            return Err(InvariantError::new("tail is not the last list node"));
        }
        if seen != self.table.len() {
            return Err(InvariantError::new(format!(
                "{} nodes in table but {} in recency list",
                self.table.len(),
                seen
            )));
        }
        if weight != self.size {
            return Err(InvariantError::new(format!(
                "size is {} but entries weigh {}",
                self.size, weight
            )));
        }
        Ok(())
    }
}

impl Handle {
    /// Borrow the entry's `Ref` from `map`, if the entry is still live.
    pub fn value<'a, V, P, S>(&self, map: &'a CacheMap<V, P, S>) -> Option<&'a Ref<V>>
    where
        P: CachePolicy<V>,
        S: BuildHasher,
    {
        map.value(*self)
    }

    pub fn key<'a, V, P, S>(&self, map: &'a CacheMap<V, P, S>) -> Option<&'a P::Key>
    where
        P: CachePolicy<V>,
        S: BuildHasher,
    {
        map.key(*self)
    }
}

/// Recency-ordered iterator over a `CacheMap`.
pub struct Iter<'a, V, P, S>
where
    P: CachePolicy<V>,
{
    map: &'a CacheMap<V, P, S>,
    cursor: Option<Handle>,
    toward_lru: bool,
}

impl<'a, V, P, S> Iterator for Iter<'a, V, P, S>
where
    P: CachePolicy<V>,
    S: BuildHasher,
{
    type Item = (Handle, &'a P::Key, &'a Ref<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let h = self.cursor?;
        let map: &'a CacheMap<V, P, S> = self.map;
        let slot = map.table.get(h)?;
        let key = map.table.key(h)?;
        self.cursor = if self.toward_lru { slot.next } else { slot.prev };
        Some((h, key, &slot.value))
    }
}
