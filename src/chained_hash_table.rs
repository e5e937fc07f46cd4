//! ChainedHashTable: open hashing with chains threaded through the nodes.
//!
//! Nodes live in a generational arena and each one carries its own
//! `chain_prev`/`chain_next` links, so a collision chain needs no storage
//! beyond the nodes themselves. The bucket array holds one chain head per
//! bucket and its length is always a power of two.

use crate::error::{CacheError, InvariantError};
use crate::reentrancy::DebugReentrancy;
use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::hash_map::DefaultHashBuilder;
use slotmap::{DefaultKey, SlotMap};

/// Smallest bucket array the table ever holds.
pub const MIN_BUCKETS: usize = 4;

// Source of table identities; 0 is never handed out.
static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_table_id() -> u64 {
    NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Stable, generational reference to a node. A handle outlives its node
/// safely: once the node is removed the handle resolves to nothing, even if
/// the arena slot is reused. Handles also remember which table issued them,
/// so one table never resolves another table's handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle {
    owner: u64,
    key: DefaultKey,
}

impl Handle {
    pub(crate) fn new(owner: u64, key: DefaultKey) -> Self {
        Handle { owner, key }
    }
}

#[derive(Debug)]
struct Node<K, T> {
    key: K,
    hash: u64,
    chain_prev: Option<DefaultKey>,
    chain_next: Option<DefaultKey>,
    item: T,
}

pub struct ChainedHashTable<K, T, S = DefaultHashBuilder> {
    hasher: S,
    buckets: Vec<Option<DefaultKey>>,
    nodes: SlotMap<DefaultKey, Node<K, T>>,
    id: u64,
    reentrancy: DebugReentrancy,
}

fn bucket_target(requested: usize) -> Result<usize, CacheError> {
    requested
        .max(MIN_BUCKETS)
        .checked_next_power_of_two()
        .ok_or(CacheError::CapacityOverflow { requested })
}

fn alloc_buckets(n: usize) -> Result<Vec<Option<DefaultKey>>, CacheError> {
    let mut buckets = Vec::new();
    buckets
        .try_reserve_exact(n)
        .map_err(|source| CacheError::BucketAlloc { buckets: n, source })?;
    buckets.resize(n, None);
    Ok(buckets)
}

// Next bucket count on growth. Overflow reports the count that could not
// be doubled.
fn doubled(current: usize) -> Result<usize, CacheError> {
    current
        .checked_mul(2)
        .ok_or(CacheError::CapacityOverflow { requested: current })
}

// Rebuild every chain into a fresh bucket array sized for `requested`.
// Works on the fields directly so callers can hold their reentrancy guard.
fn relink<K, T>(
    buckets: &mut Vec<Option<DefaultKey>>,
    nodes: &mut SlotMap<DefaultKey, Node<K, T>>,
    requested: usize,
) -> Result<(), CacheError> {
    let target = bucket_target(requested)?;
    if target == buckets.len() {
        return Ok(());
    }
    let mut fresh = alloc_buckets(target)?;
    let mask = target - 1;

    // Stored hashes only: no user code runs while chains are rebuilt.
    for (k, node) in nodes.iter_mut() {
        let b = (node.hash as usize) & mask;
        node.chain_next = fresh[b];
        fresh[b] = Some(k);
    }
    for head in fresh.iter() {
        let mut prev = None;
        let mut cursor = *head;
        while let Some(k) = cursor {
            let node = &mut nodes[k];
            node.chain_prev = prev;
            prev = Some(k);
            cursor = node.chain_next;
        }
    }

    tracing::debug!(
        from = buckets.len(),
        to = target,
        nodes = nodes.len(),
        "rehashed bucket array"
    );
    *buckets = fresh;
    Ok(())
}

impl<K, T> ChainedHashTable<K, T>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, T> Default for ChainedHashTable<K, T>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the nodes of a `ChainedHashTable` in arena order.
pub struct Iter<'a, K, T> {
    it: slotmap::basic::Iter<'a, DefaultKey, Node<K, T>>,
    owner: u64,
}

impl<'a, K, T> Iterator for Iter<'a, K, T> {
    type Item = (Handle, &'a K, &'a T);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let owner = self.owner;
        self.it
            .next()
            .map(|(k, n)| (Handle::new(owner, k), &n.key, &n.item))
    }
}

/// Mutable iterator over the nodes of a `ChainedHashTable`.
pub struct IterMut<'a, K, T> {
    it: slotmap::basic::IterMut<'a, DefaultKey, Node<K, T>>,
    owner: u64,
}

impl<'a, K, T> Iterator for IterMut<'a, K, T> {
    type Item = (Handle, &'a K, &'a mut T);
    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let owner = self.owner;
        self.it
            .next()
            .map(|(k, n)| (Handle::new(owner, k), &n.key, &mut n.item))
    }
}

impl<K, T, S> ChainedHashTable<K, T, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            buckets: vec![None; MIN_BUCKETS],
            nodes: SlotMap::with_key(),
            id: next_table_id(),
            reentrancy: DebugReentrancy::new(),
        }
    }

    /// Create a table whose bucket array holds at least `buckets` heads.
    pub fn try_with_buckets_and_hasher(buckets: usize, hasher: S) -> Result<Self, CacheError> {
        let n = bucket_target(buckets)?;
        Ok(Self {
            hasher,
            buckets: alloc_buckets(n)?,
            nodes: SlotMap::with_key(),
            id: next_table_id(),
            reentrancy: DebugReentrancy::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Heap bytes held by the bucket array.
    pub fn bucket_bytes(&self) -> usize {
        self.buckets.capacity() * core::mem::size_of::<Option<DefaultKey>>()
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Whether `h` was issued by this table. Says nothing about liveness.
    pub fn owns(&self, h: Handle) -> bool {
        h.owner == self.id
    }

    // Arena key behind `h`, or `None` for another table's handle.
    #[inline]
    fn resolve(&self, h: Handle) -> Option<DefaultKey> {
        self.owns(h).then_some(h.key)
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn find_hashed<Q>(&self, hash: u64, q: &Q) -> Option<DefaultKey>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while let Some(k) = cursor {
            let node = &self.nodes[k];
            if node.hash == hash && node.key.borrow() == q {
                return Some(k);
            }
            cursor = node.chain_next;
        }
        None
    }

    pub fn find<Q>(&self, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _g = self.reentrancy.enter("find");
        let hash = self.hasher.hash_one(q);
        let id = self.id;
        self.find_hashed(hash, q).map(|k| Handle::new(id, k))
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.find(q).is_some()
    }

    /// Link a new node at the head of its bucket chain.
    ///
    /// The key must be absent; callers look it up first. The bucket array
    /// doubles before linking once the node count would exceed it, and if
    /// that allocation fails nothing is inserted.
    pub fn insert(&mut self, key: K, item: T) -> Result<Handle, CacheError> {
        let _g = self.reentrancy.enter("insert");
        let hash = self.hasher.hash_one(&key);
        debug_assert!(
            self.find_hashed(hash, &key).is_none(),
            "insert requires an absent key"
        );

        if self.nodes.len() + 1 > self.buckets.len() {
            let grown = doubled(self.buckets.len())?;
            relink(&mut self.buckets, &mut self.nodes, grown)?;
        }

        let b = self.bucket_of(hash);
        let head = self.buckets[b];
        let k = self.nodes.insert(Node {
            key,
            hash,
            chain_prev: None,
            chain_next: head,
            item,
        });
        if let Some(h) = head {
            self.nodes[h].chain_prev = Some(k);
        }
        self.buckets[b] = Some(k);
        Ok(Handle::new(self.id, k))
    }

    /// Unlink a node and hand back its key and payload. Stale handles and
    /// handles from another table return `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<(K, T)> {
        let k = self.resolve(handle)?;
        let _g = self.reentrancy.enter("remove");
        let node = self.nodes.remove(k)?;

        match node.chain_prev {
            Some(p) => self.nodes[p].chain_next = node.chain_next,
            None => {
                let b = self.bucket_of(node.hash);
                self.buckets[b] = node.chain_next;
            }
        }
        if let Some(n) = node.chain_next {
            self.nodes[n].chain_prev = node.chain_prev;
        }

        Some((node.key, node.item))
    }

    /// Move every node into a bucket array sized for `requested` heads
    /// (never fewer than the node count), rounded up to a power of two.
    pub fn rehash(&mut self, requested: usize) -> Result<(), CacheError> {
        let _g = self.reentrancy.enter("rehash");
        let requested = requested.max(self.nodes.len());
        relink(&mut self.buckets, &mut self.nodes, requested)
    }

    pub fn key(&self, h: Handle) -> Option<&K> {
        self.nodes.get(self.resolve(h)?).map(|n| &n.key)
    }

    pub fn get(&self, h: Handle) -> Option<&T> {
        self.nodes.get(self.resolve(h)?).map(|n| &n.item)
    }

    pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        let k = self.resolve(h)?;
        self.nodes.get_mut(k).map(|n| &mut n.item)
    }

    pub fn iter(&self) -> Iter<'_, K, T> {
        Iter {
            it: self.nodes.iter(),
            owner: self.id,
        }
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, K, T> {
        IterMut {
            it: self.nodes.iter_mut(),
            owner: self.id,
        }
    }

    /// Remove every node, keeping the current bucket array.
    pub fn clear(&mut self) {
        let _g = self.reentrancy.enter("clear");
        self.buckets.iter_mut().for_each(|b| *b = None);
        // Drops run after the buckets are consistent again.
        let nodes = core::mem::replace(&mut self.nodes, SlotMap::with_key());
        drop(_g);
        drop(nodes);
    }

    /// Walk every bucket chain and confirm it agrees with the arena.
    pub fn check_chains(&self) -> Result<(), InvariantError> {
        let mut reached = 0usize;
        for (b, head) in self.buckets.iter().enumerate() {
            let mut prev = None;
            let mut cursor = *head;
            while let Some(k) = cursor {
                let node = self
                    .nodes
                    .get(k)
                    .ok_or_else(|| InvariantError::new(format!("bucket {} links a dead node", b)))?;
                if self.bucket_of(node.hash) != b {
                    return Err(InvariantError::new(format!(
                        "node chained in bucket {} hashes elsewhere",
                        b
                    )));
                }
                if node.chain_prev != prev {
                    return Err(InvariantError::new(format!(
                        "asymmetric chain link in bucket {}",
                        b
                    )));
                }
                reached += 1;
                if reached > self.nodes.len() {
                    return Err(InvariantError::new("bucket chains contain a cycle"));
                }
                prev = Some(k);
                cursor = node.chain_next;
            }
        }
        if reached != self.nodes.len() {
            return Err(InvariantError::new(format!(
                "{} nodes stored but {} reachable from buckets",
                self.nodes.len(),
                reached
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::hash::Hasher;

    #[derive(Clone, Default)]
    struct ConstBuildHasher;
    struct ConstHasher;
    impl BuildHasher for ConstBuildHasher {
        type Hasher = ConstHasher;
        fn build_hasher(&self) -> Self::Hasher {
            ConstHasher
        }
    }
    impl Hasher for ConstHasher {
        fn write(&mut self, _bytes: &[u8]) {}
        fn finish(&self) -> u64 {
            0
        } // every key lands in bucket 0
    }

    /// Invariant: `find(k).is_some() == contains_key(k)` for present/absent keys.
    #[test]
    fn find_contains_parity() {
        let mut t: ChainedHashTable<String, i32> = ChainedHashTable::new();
        let present = ["a", "b", "c"];
        for (i, k) in present.iter().enumerate() {
            t.insert((*k).to_string(), i as i32).unwrap();
        }

        for k in present {
            assert!(t.find(k).is_some());
            assert!(t.contains_key(k));
        }
        for k in ["x", "y", "z"] {
            assert!(t.find(k).is_none());
            assert!(!t.contains_key(k));
        }
        t.check_chains().unwrap();
    }

    /// Invariant: handle access yields the payload while the node lives and
    /// `None` after removal; `get_mut` updates are visible through `get`.
    #[test]
    fn handle_access_and_mutation() {
        let mut t: ChainedHashTable<String, i32> = ChainedHashTable::new();
        let h = t.insert("k1".to_string(), 10).unwrap();
        assert_eq!(t.key(h), Some(&"k1".to_string()));
        assert_eq!(t.get(h), Some(&10));
        *t.get_mut(h).unwrap() += 5;
        assert_eq!(t.get(h), Some(&15));

        let (k, v) = t.remove(h).unwrap();
        assert_eq!((k.as_str(), v), ("k1", 15));
        assert!(t.get(h).is_none());
        assert!(t.remove(h).is_none());
    }

    /// Invariant: a stale handle never aliases a node inserted into the
    /// reused arena slot.
    #[test]
    fn stale_handle_does_not_alias_new_node() {
        let mut t: ChainedHashTable<String, i32> = ChainedHashTable::new();
        let h1 = t.insert("old".to_string(), 1).unwrap();
        t.remove(h1).unwrap();
        let h2 = t.insert("new".to_string(), 2).unwrap();
        assert_ne!(h1, h2);
        assert!(t.get(h1).is_none());
        assert!(t.contains_key("new"));
        assert!(!t.contains_key("old"));
    }

    /// Invariant: a handle from one table never resolves in another, even
    /// when both tables hold a node in the same arena slot.
    #[test]
    fn foreign_handle_resolves_to_nothing() {
        let mut a: ChainedHashTable<u32, &str> = ChainedHashTable::new();
        let mut b: ChainedHashTable<u32, &str> = ChainedHashTable::new();
        let ha = a.insert(1, "a").unwrap();
        let hb = b.insert(99, "b").unwrap();

        assert!(a.owns(ha) && !b.owns(ha));
        assert!(b.get(ha).is_none());
        assert!(b.key(ha).is_none());
        assert!(b.get_mut(ha).is_none());
        assert!(b.remove(ha).is_none());
        assert_eq!(b.len(), 1);
        assert_eq!(b.get(hb), Some(&"b"));
        assert_eq!(a.get(ha), Some(&"a"));
        b.check_chains().unwrap();
    }

    /// Invariant: growth that cannot double reports the bucket count it
    /// started from.
    #[test]
    fn doubling_overflow_reports_current_count() {
        let current = usize::MAX / 2 + 1;
        assert_eq!(
            doubled(current),
            Err(CacheError::CapacityOverflow { requested: current })
        );
        assert_eq!(doubled(MIN_BUCKETS), Ok(2 * MIN_BUCKETS));
    }

    /// Invariant: inserting past the bucket count grows the array while the
    /// insert's guard is held, and every node stays reachable.
    #[test]
    fn insert_growth_relinks_under_guard() {
        let mut t: ChainedHashTable<u32, u32> = ChainedHashTable::new();
        for i in 0..(MIN_BUCKETS as u32 * 8 + 1) {
            t.insert(i, i).unwrap();
        }
        assert_eq!(t.bucket_count(), MIN_BUCKETS * 16);
        t.rehash(0).unwrap();
        assert_eq!(t.bucket_count(), MIN_BUCKETS * 16);
        t.check_chains().unwrap();
    }

    /// Invariant: when every key collides, equality alone separates them and
    /// removing from the middle of the chain keeps the others reachable.
    #[test]
    fn collisions_share_one_chain() {
        let mut t: ChainedHashTable<String, i32, ConstBuildHasher> =
            ChainedHashTable::with_hasher(ConstBuildHasher);
        let ha = t.insert("a".to_string(), 1).unwrap();
        let hb = t.insert("b".to_string(), 2).unwrap();
        let hc = t.insert("c".to_string(), 3).unwrap();
        assert_eq!(t.find("a"), Some(ha));
        assert_eq!(t.find("b"), Some(hb));
        assert_eq!(t.find("c"), Some(hc));

        t.remove(hb).unwrap();
        t.check_chains().unwrap();
        assert_eq!(t.find("a"), Some(ha));
        assert_eq!(t.find("c"), Some(hc));
        assert!(t.find("b").is_none());

        t.remove(hc).unwrap();
        t.remove(ha).unwrap();
        t.check_chains().unwrap();
        assert!(t.is_empty());
    }

    /// Invariant: the bucket array doubles as soon as the node count would
    /// exceed it, and stays a power of two.
    #[test]
    fn grows_by_doubling() {
        let mut t: ChainedHashTable<u32, ()> = ChainedHashTable::new();
        assert_eq!(t.bucket_count(), MIN_BUCKETS);
        for i in 0..4 {
            t.insert(i, ()).unwrap();
        }
        assert_eq!(t.bucket_count(), 4);
        t.insert(4, ()).unwrap();
        assert_eq!(t.bucket_count(), 8);
        for i in 5..100 {
            t.insert(i, ()).unwrap();
        }
        assert_eq!(t.bucket_count(), 128);
        assert!(t.bucket_count().is_power_of_two());
        t.check_chains().unwrap();
        for i in 0..100 {
            assert!(t.contains_key(&i));
        }
    }

    /// Invariant: `rehash` can shrink but never below the node count, and all
    /// nodes stay reachable through the new chains.
    #[test]
    fn rehash_shrinks_and_relinks() {
        let mut t: ChainedHashTable<u32, u32> = ChainedHashTable::new();
        let handles: Vec<_> = (0..64).map(|i| t.insert(i, i * 10).unwrap()).collect();
        assert_eq!(t.bucket_count(), 64);
        let before = t.bucket_bytes();

        for h in &handles[..60] {
            t.remove(*h).unwrap();
        }
        t.rehash(0).unwrap();
        assert_eq!(t.bucket_count(), MIN_BUCKETS);
        assert!(t.bucket_bytes() < before);
        t.check_chains().unwrap();
        for i in 60..64 {
            let h = t.find(&i).unwrap();
            assert_eq!(t.get(h), Some(&(i * 10)));
        }

        t.rehash(1).unwrap();
        assert_eq!(t.bucket_count(), MIN_BUCKETS);
        t.rehash(5).unwrap();
        assert_eq!(t.bucket_count(), 8);
    }

    /// Invariant: a bucket count that cannot be represented fails without
    /// touching the table.
    #[test]
    fn rehash_overflow_leaves_table_intact() {
        let mut t: ChainedHashTable<u32, ()> = ChainedHashTable::new();
        t.insert(1, ()).unwrap();
        let err = t.rehash(usize::MAX).unwrap_err();
        assert_eq!(
            err,
            CacheError::CapacityOverflow {
                requested: usize::MAX
            }
        );
        assert_eq!(t.bucket_count(), MIN_BUCKETS);
        assert!(t.contains_key(&1));
    }

    /// Invariant: an allocation the allocator refuses is reported as
    /// `BucketAlloc` and the previous bucket array keeps serving lookups.
    #[cfg(target_pointer_width = "64")]
    #[test]
    fn rehash_alloc_failure_is_reported() {
        let mut t: ChainedHashTable<u32, ()> = ChainedHashTable::new();
        t.insert(7, ()).unwrap();
        match t.rehash(1 << 62) {
            Err(CacheError::BucketAlloc { buckets, .. }) => assert_eq!(buckets, 1 << 62),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(t.bucket_count(), MIN_BUCKETS);
        assert!(t.contains_key(&7));

        assert!(matches!(
            ChainedHashTable::<u32, ()>::try_with_buckets_and_hasher(
                1 << 62,
                DefaultHashBuilder::default()
            ),
            Err(CacheError::BucketAlloc { .. })
        ));
    }

    /// Invariant: iteration yields each live node exactly once; `iter_mut`
    /// updates are visible to later lookups.
    #[test]
    fn iteration_and_mutation() {
        let mut t: ChainedHashTable<String, i32> = ChainedHashTable::new();
        let keys = ["k1", "k2", "k3"];
        for (i, k) in keys.iter().enumerate() {
            t.insert((*k).to_string(), i as i32).unwrap();
        }

        let seen: BTreeSet<String> = t.iter().map(|(_h, k, _v)| k.clone()).collect();
        let expected: BTreeSet<String> = keys.iter().map(|s| (*s).to_string()).collect();
        assert_eq!(seen, expected);

        for (_h, _k, v) in t.iter_mut() {
            *v += 10;
        }
        let h = t.find("k3").unwrap();
        assert_eq!(t.get(h), Some(&12));
    }

    /// Invariant: `clear` empties the table but keeps the bucket array size.
    #[test]
    fn clear_keeps_buckets() {
        let mut t: ChainedHashTable<u32, ()> = ChainedHashTable::new();
        for i in 0..20 {
            t.insert(i, ()).unwrap();
        }
        let buckets = t.bucket_count();
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.bucket_count(), buckets);
        assert!(!t.contains_key(&3));
        t.check_chains().unwrap();
        t.insert(3, ()).unwrap();
        assert!(t.contains_key(&3));
    }

    /// Invariant (debug-only): re-entering the table from `K: Eq` during a
    /// chain walk panics.
    #[cfg(debug_assertions)]
    #[test]
    fn reentrancy_panics_from_eq_during_find() {
        struct ReentryKey {
            id: &'static str,
            table: *const ChainedHashTable<ReentryKey, i32, ConstBuildHasher>,
            trigger: bool,
        }
        impl PartialEq for ReentryKey {
            fn eq(&self, other: &Self) -> bool {
                if self.id == other.id {
                    return true;
                }
                if other.trigger {
                    unsafe {
                        let t = &*other.table;
                        let _ = t.contains_key(self.id);
                    }
                }
                false
            }
        }
        impl Eq for ReentryKey {}
        impl Hash for ReentryKey {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.id.hash(state);
            }
        }
        impl Borrow<str> for ReentryKey {
            fn borrow(&self) -> &str {
                self.id
            }
        }

        let mut t: ChainedHashTable<ReentryKey, i32, ConstBuildHasher> =
            ChainedHashTable::with_hasher(ConstBuildHasher);
        let ptr = &t as *const _;
        t.insert(
            ReentryKey {
                id: "a",
                table: ptr,
                trigger: false,
            },
            1,
        )
        .unwrap();

        let query = ReentryKey {
            id: "b",
            table: &t as *const _,
            trigger: true,
        };
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = t.find(&query);
        }));
        assert!(res.is_err(), "expected reentrancy to panic in debug builds");
    }
}
