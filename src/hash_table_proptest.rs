#![cfg(test)]

// Property tests for HashTable kept inside the crate so they can check
// structural invariants after every step.

use crate::hash_table::{HashTable, MAX_CAPACITY, MIN_CAPACITY};
use proptest::prelude::*;
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

#[derive(Clone, Debug)]
enum Op {
    Insert(usize, i32),
    Remove(usize),
    Get(usize),
    Contains(String),
    Mutate(usize, i32),
    Iterate,
    Clear,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<Op>)> {
    proptest::collection::vec("[a-z]{0,5}", 1..=64).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let op = prop_oneof![
            6 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Insert(i, v)),
            4 => idx.clone().prop_map(Op::Remove),
            2 => idx.clone().prop_map(Op::Get),
            1 => "[a-z]{0,5}".prop_map(Op::Contains),
            1 => (idx.clone(), any::<i32>()).prop_map(|(i, d)| Op::Mutate(i, d)),
            1 => Just(Op::Iterate),
            1 => Just(Op::Clear),
        ];
        proptest::collection::vec(op, 1..200).prop_map(move |ops| (pool.clone(), ops))
    })
}

fn pos(model: &[(Key, i32)], k: &Key) -> Option<usize> {
    model.iter().position(|(mk, _)| mk == k)
}

// Model: a Vec of (key, value) in first-insertion order.
fn run_scenario<S: BuildHasher>(
    mut sut: HashTable<Key, i32, S>,
    pool: &[String],
    ops: Vec<Op>,
) -> Result<(), TestCaseError> {
    let mut model: Vec<(Key, i32)> = Vec::new();

    for op in ops {
        match op {
            Op::Insert(i, v) => {
                let k = Key(pool[i].clone());
                let fresh = sut.insert(k.clone(), v).expect("allocation");
                match pos(&model, &k) {
                    Some(p) => {
                        prop_assert!(!fresh, "existing key reported as new");
                        model[p].1 = v;
                    }
                    None => {
                        prop_assert!(fresh, "new key reported as existing");
                        model.push((k, v));
                    }
                }
            }
            Op::Remove(i) => {
                let k = Key(pool[i].clone());
                let removed = sut.remove_entry(&k);
                match pos(&model, &k) {
                    Some(p) => {
                        let expected = model.remove(p);
                        prop_assert_eq!(removed, Some(expected));
                    }
                    None => prop_assert!(removed.is_none()),
                }
            }
            Op::Get(i) => {
                let k = Key(pool[i].clone());
                let expected = pos(&model, &k).map(|p| &model[p].1);
                prop_assert_eq!(sut.get(&k), expected);
            }
            Op::Contains(s) => {
                let has_model = model.iter().any(|(k, _)| k.0 == s);
                prop_assert_eq!(sut.contains_key(s.as_str()), has_model);
            }
            Op::Mutate(i, d) => {
                let k = Key(pool[i].clone());
                if let Some(p) = pos(&model, &k) {
                    let v = sut.get_mut(&k).expect("live key resolves");
                    *v = v.saturating_add(d);
                    model[p].1 = model[p].1.saturating_add(d);
                } else {
                    prop_assert!(sut.get_mut(&k).is_none());
                }
            }
            Op::Iterate => {
                let seen: Vec<(Key, i32)> = sut.iter().map(|(k, v)| (k.clone(), *v)).collect();
                prop_assert_eq!(&seen, &model);
            }
            Op::Clear => {
                sut.clear();
                model.clear();
                prop_assert_eq!(sut.capacity(), sut.minimum_capacity());
            }
        }

        // Post-conditions after each op
        if let Err(e) = sut.check_invariants() {
            return Err(TestCaseError::fail(e.to_string()));
        }
        prop_assert_eq!(sut.len(), model.len());
        let cap = sut.capacity();
        prop_assert!(cap.is_power_of_two());
        prop_assert!((MIN_CAPACITY..=MAX_CAPACITY).contains(&cap));
        prop_assert!(cap >= sut.minimum_capacity());
    }

    let order: Vec<&Key> = sut.keys().collect();
    let expected: Vec<&Key> = model.iter().map(|(k, _)| k).collect();
    prop_assert_eq!(order, expected);
    Ok(())
}

// Property: state-machine equivalence against an ordered Vec model.
// Invariants exercised across random operation sequences:
// - lookups return the last value written for a live key;
// - iteration order equals first-insertion order among live keys, across
//   any number of grow/shrink cycles;
// - len matches the number of distinct live keys;
// - capacity stays a power of two inside the allowed bounds.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(HashTable::new(), &pool, ops)?;
    }
}

// Property: the same model with a raised minimum capacity; shrinking must
// stop at that floor.
proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_minimum(min in 0u32..200, (pool, ops) in arb_scenario()) {
        run_scenario(HashTable::with_capacity(min), &pool, ops)?;
    }
}

// Hasher that keeps only the low bits of the default code, forcing long
// chains while still exercising the grow split.
#[derive(Clone, Default)]
struct NarrowBuildHasher;
struct NarrowHasher(crate::hasher::BytesHasher);
impl BuildHasher for NarrowBuildHasher {
    type Hasher = NarrowHasher;
    fn build_hasher(&self) -> Self::Hasher {
        NarrowHasher(Default::default())
    }
}
impl Hasher for NarrowHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes);
    }
    fn finish(&self) -> u64 {
        self.0.finish() & 0x3f
    }
}

// Property: same invariants under heavy collisions.
proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(HashTable::with_hasher(NarrowBuildHasher), &pool, ops)?;
    }
}
