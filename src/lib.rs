//! rc-cachemap: a single-threaded, size-bounded LRU cache whose entries are
//! reference-counted and can be partially released instead of destroyed.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: one generic engine behind every resource cache (decoded images,
//!   fonts, text layouts, snapshots) with O(1) average lookup, strict
//!   recency order, weight-bounded eviction, and safety for values that are
//!   still referenced after their slot is reclaimed.
//! - Layers:
//!   - ChainedHashTable<K, T, S>: open hashing over a power-of-two bucket
//!     array; collision chains are links stored in the nodes themselves,
//!     which live in a generational arena and are addressed by `Handle`.
//!   - CacheMap<V, P, S>: threads an MRU→LRU list through the same nodes,
//!     tracks `size` against `capacity`, and evicts through a `CachePolicy`.
//!   - CachePolicy<V>: key extraction, logical size, and in-place release.
//!   - Ref<V>: shared handle to a value; eviction defers to outside holders.
//!
//! Constraints
//! - Single-threaded: `Ref` wraps `Rc`, so the map is `!Send`/`!Sync`.
//!   Callers on other threads must hand work to the owning thread.
//! - No pointers between nodes: chain and recency links are arena keys, so a
//!   stale `Handle` resolves to nothing rather than to freed memory. Handles
//!   carry the id of the table that issued them, so another table's handle
//!   resolves to nothing as well.
//! - `put` on a present key returns the existing entry without promoting it;
//!   `get` promotes.
//! - Eviction never destroys a value with `use_count() > 1`. Falling short of
//!   the requested reclaim is a normal outcome, and `size() > capacity()` can
//!   persist while values are pinned.
//!
//! Eviction
//! - Scan from the LRU end. For each entry: ask the policy to release up to
//!   the remaining deficit; if it frees anything, credit it and move the
//!   entry to the MRU end. Otherwise erase the entry if the map is its only
//!   owner, else skip it.
//! - Sweeps repeat, offering moved entries again, until the target is met or
//!   a sweep frees nothing.
//! - `evict()` reclaims `size - capacity` and never visits the entry that
//!   was MRU when it was called. `evict_by(n)` reclaims `n` from any entry.
//! - After a pass the bucket array shrinks once it is at least four times
//!   larger than the live count.
//!
//! Hashing
//! - Each node stores its `u64` hash; growth and shrink relink by stored
//!   hash, so `K: Hash` never runs after insertion. Chains are doubly linked
//!   so removal does not walk the bucket.
//! - A debug-only reentrancy guard rejects calls back into the table from
//!   `K: Hash`/`K: Eq` while a chain is being walked.
//!
//! Errors
//! - Bucket array allocation failure is returned as `CacheError` and the
//!   operation has no effect. A failed shrink is logged and ignored.

pub mod cache_map;
pub mod chained_hash_table;
mod chained_hash_table_proptest;
pub mod error;
pub mod policy;
mod rc_ref;
mod reentrancy;

// Public surface
pub use cache_map::{CacheConfig, CacheMap, CacheStats};
pub use chained_hash_table::{ChainedHashTable, Handle};
pub use error::{CacheError, InvariantError};
pub use policy::{CachePolicy, SlotPolicy, WeightedPolicy};
pub use rc_ref::Ref;
