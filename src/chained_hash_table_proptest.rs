#![cfg(test)]

// Property tests for ChainedHashTable kept inside the crate so they can
// call the chain checker on every step.

use crate::chained_hash_table::{ChainedHashTable, Handle, MIN_BUCKETS};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hasher};

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Operations index into a small key pool so shrinking converges on short,
// readable counterexamples.
#[derive(Clone, Debug)]
enum Op {
    Insert(usize, i32),
    Remove(usize),
    Find(usize),
    Contains(String),
    Mutate(usize, i32),
    Rehash(usize),
    Iterate,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<Op>)> {
    proptest::collection::vec("[a-z]{0,5}", 1..=24).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Insert(i, v)),
            2 => idx.clone().prop_map(Op::Remove),
            2 => idx.clone().prop_map(Op::Find),
            1 => prop_oneof![contains_pool, "[a-z]{0,5}"].prop_map(Op::Contains),
            1 => (idx.clone(), any::<i32>()).prop_map(|(i, d)| Op::Mutate(i, d)),
            1 => (0usize..80).prop_map(Op::Rehash),
            1 => Just(Op::Iterate),
        ];
        proptest::collection::vec(op, 1..120).prop_map(move |ops| (pool.clone(), ops))
    })
}

// State-machine equivalence against std::collections::HashMap:
// - insert of an absent key yields a handle that `find` returns afterwards;
// - `remove(handle)` returns the model's pair and invalidates the handle;
// - `iter` yields exactly the model's key set;
// - bucket count stays a power of two, at least `len` and `MIN_BUCKETS`;
// - every chain is symmetric and reaches every node once.
fn run_scenario<S: BuildHasher>(
    mut sut: ChainedHashTable<Key, i32, S>,
    pool: &[String],
    ops: Vec<Op>,
) -> Result<(), TestCaseError> {
    let mut model: HashMap<Key, i32> = HashMap::new();
    let mut live: HashMap<Key, Handle> = HashMap::new();
    let mut stale: Vec<Handle> = Vec::new();

    for op in ops {
        match op {
            Op::Insert(i, v) => {
                let k = Key(pool[i].clone());
                if model.contains_key(&k) {
                    // The table requires absent keys; the cache map looks up first.
                    prop_assert!(sut.find(&k).is_some());
                } else {
                    let h = sut.insert(k.clone(), v).expect("small tables always allocate");
                    live.insert(k.clone(), h);
                    model.insert(k, v);
                }
            }
            Op::Remove(i) => {
                let k = Key(pool[i].clone());
                if let Some(h) = live.remove(&k) {
                    let (kk, vv) = sut.remove(h).expect("live handle removes");
                    prop_assert!(kk == k);
                    prop_assert_eq!(Some(vv), model.remove(&kk));
                    stale.push(h);
                } else {
                    prop_assert!(sut.find(&k).is_none());
                }
            }
            Op::Find(i) => {
                let k = Key(pool[i].clone());
                let found = sut.find(&k);
                prop_assert_eq!(found, live.get(&k).copied());
                if let Some(h) = found {
                    prop_assert_eq!(sut.get(h), model.get(&k));
                }
            }
            Op::Contains(s) => {
                let has_model = model.keys().any(|k| k.0 == s);
                prop_assert_eq!(sut.contains_key(s.as_str()), has_model);
            }
            Op::Mutate(i, d) => {
                let k = Key(pool[i].clone());
                if let Some(&h) = live.get(&k) {
                    let vr = sut.get_mut(h).expect("live handle resolves");
                    *vr = vr.saturating_add(d);
                    if let Some(mv) = model.get_mut(&k) {
                        *mv = mv.saturating_add(d);
                    }
                }
            }
            Op::Rehash(n) => {
                sut.rehash(n).expect("small rehash always allocates");
            }
            Op::Iterate => {
                let s_keys: BTreeSet<_> = sut.iter().map(|(_, k, _)| k.clone()).collect();
                let m_keys: BTreeSet<_> = model.keys().cloned().collect();
                prop_assert_eq!(s_keys, m_keys);
            }
        }

        for &h in &stale {
            prop_assert!(sut.get(h).is_none());
        }
        prop_assert_eq!(sut.len(), model.len());
        let buckets = sut.bucket_count();
        prop_assert!(buckets.is_power_of_two());
        prop_assert!(buckets >= MIN_BUCKETS && buckets >= sut.len());
        if let Err(e) = sut.check_chains() {
            prop_assert!(false, "chain invariant: {}", e);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(ChainedHashTable::new(), &pool, ops)?;
    }
}

// Every key hashes to 0, so all nodes share one chain.
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
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(ChainedHashTable::with_hasher(ConstBuildHasher), &pool, ops)?;
    }
}
