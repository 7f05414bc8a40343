#![cfg(test)]

// Property tests for LocalMap/Table kept inside the crate so they can drive
// the owner and remover paths directly.

use crate::key::{KeyRef, Payload};
use crate::local_map::LocalMap;
use crate::reentrancy::DebugReentrancy;
use crate::table::{Value, MIN_LENGTH};
use crossbeam_epoch::{self as epoch, Owned};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
enum Op {
    Set(usize, i32),
    Get(usize),
    // Get whose default function first sets the listed pool keys.
    GetSetting(usize, Vec<(usize, i32)>),
    Remove(usize),
    // Drop the handle: the key dies and a fresh one with the same hash
    // takes its pool slot.
    Kill(usize),
    // Remove every dead key, as the worker would.
    Sweep,
}

fn arb_scenario() -> impl Strategy<Value = (usize, Vec<usize>, Vec<Op>)> {
    let length = prop_oneof![Just(MIN_LENGTH), Just(32)];
    // Few distinct hash buckets so probe chains collide constantly.
    let hashes = proptest::collection::vec(0usize..6, 1..=12);
    (length, hashes).prop_flat_map(|(length, hashes)| {
        let idx = 0..hashes.len();
        let nested = proptest::collection::vec((idx.clone(), any::<i32>()), 0..8);
        let op = prop_oneof![
            4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Set(i, v)),
            3 => idx.clone().prop_map(Op::Get),
            1 => (idx.clone(), nested).prop_map(|(i, sets)| Op::GetSetting(i, sets)),
            2 => idx.clone().prop_map(Op::Remove),
            1 => idx.clone().prop_map(Op::Kill),
            1 => Just(Op::Sweep),
        ];
        proptest::collection::vec(op, 1..120).prop_map(move |ops| (length, hashes.clone(), ops))
    })
}

fn read(map: &LocalMap, key: &KeyRef, r: &DebugReentrancy, init: i32) -> i32 {
    let guard = epoch::pin();
    let value = match map.lookup(key, &guard) {
        Some(v) => v,
        None => map.get_after_miss(key, &mut || -> Payload { Box::new(init) }, r, &guard),
    };
    *value.payload().downcast_ref::<i32>().expect("i32 payload")
}

// Property: a map driven by the owner and a sweeping remover agrees with a
// HashMap model of the live keys.
// - Gets return the last set value, or compute the default exactly once.
// - A default that sets other keys (possibly replacing the table) keeps
//   both its own value and theirs.
// - Removed and swept keys are absent; live keys survive every rehash.
// - After each op the table keeps load below its maximum, so probes end.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((length, hashes, ops) in arb_scenario()) {
        let map = LocalMap::with_initial_length(length);
        let r = DebugReentrancy::new();
        let mut pool: Vec<Arc<KeyRef>> =
            hashes.iter().map(|h| KeyRef::with_hash(h * 2, None)).collect();
        let mut model: HashMap<usize, i32> = HashMap::new();
        let mut dead: Vec<Arc<KeyRef>> = Vec::new();
        let mut swept: Vec<Arc<KeyRef>> = Vec::new();

        for op in ops {
            match op {
                Op::Set(i, v) => {
                    map.set(&pool[i], Owned::new(Value::new(Box::new(v))), &r, &epoch::pin());
                    model.insert(i, v);
                }
                Op::Get(i) => {
                    let default = -(i as i32) - 1;
                    let got = read(&map, &pool[i], &r, default);
                    let expected = *model.entry(i).or_insert(default);
                    prop_assert_eq!(got, expected);
                }
                Op::GetSetting(i, sets) => {
                    let default = -(i as i32) - 1;
                    let guard = epoch::pin();
                    let got = match map.lookup(&pool[i], &guard) {
                        Some(v) => v,
                        None => {
                            let mut init = || -> Payload {
                                for &(j, v) in &sets {
                                    let value = Owned::new(Value::new(Box::new(v) as Payload));
                                    map.set(&pool[j], value, &r, &epoch::pin());
                                }
                                Box::new(default)
                            };
                            map.get_after_miss(&pool[i], &mut init, &r, &guard)
                        }
                    };
                    let got = *got.payload().downcast_ref::<i32>().expect("i32 payload");
                    if !model.contains_key(&i) {
                        model.extend(sets.iter().copied());
                        model.insert(i, default);
                    }
                    prop_assert_eq!(got, model[&i]);
                }
                Op::Remove(i) => {
                    let was = map.remove(&pool[i], &epoch::pin());
                    prop_assert_eq!(was, model.remove(&i).is_some());
                }
                Op::Kill(i) => {
                    let fresh = KeyRef::with_hash(hashes[i] * 2, None);
                    let old = std::mem::replace(&mut pool[i], fresh);
                    prop_assert!(old.retire());
                    dead.push(old);
                    model.remove(&i);
                }
                Op::Sweep => {
                    let guard = epoch::pin();
                    for key in dead.drain(..) {
                        map.remove(&key, &guard);
                        swept.push(key);
                    }
                }
            }

            // Post-conditions after each op
            for (i, key) in pool.iter().enumerate() {
                prop_assert_eq!(map.contains(key), model.contains_key(&i));
            }
            for key in &swept {
                prop_assert!(!map.contains(key));
            }
            let guard = epoch::pin();
            if let Some(table) = map.table(&guard) {
                prop_assert!(table.load() < table.maximum_load());
                prop_assert!(table.tombstones() >= 0);
                prop_assert!(table.tombstones() as usize <= table.load());
                prop_assert!(model.len() <= table.load() - table.tombstones() as usize);
            }
        }
    }
}
