use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tlmap::ThreadLocal;

#[derive(Clone, Debug)]
enum Op {
    Set(usize, i32),
    Get(usize),
    Remove(usize),
    // Drop the handle and declare a fresh one in its place.
    Replace(usize),
    // Spawn an inheriting child and compare what it sees.
    Spawn,
}

fn default_for(i: usize) -> i32 {
    -(i as i32) - 1
}

fn declare(i: usize) -> Arc<ThreadLocal<i32>> {
    let init = move || default_for(i);
    Arc::new(if i % 2 == 0 {
        ThreadLocal::inheritable(init)
    } else {
        ThreadLocal::new(init)
    })
}

fn arb_ops() -> impl Strategy<Value = (usize, Vec<Op>)> {
    (1usize..=10).prop_flat_map(|n| {
        let idx = 0..n;
        let op = prop_oneof![
            4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Set(i, v)),
            3 => idx.clone().prop_map(Op::Get),
            2 => idx.clone().prop_map(Op::Remove),
            1 => idx.clone().prop_map(Op::Replace),
            1 => Just(Op::Spawn),
        ];
        (Just(n), proptest::collection::vec(op, 1..80))
    })
}

// Model handle operations on the calling thread and assert:
// - get returns the last set value, else the handle's default;
// - remove and replace forget the value;
// - an inheriting child sees the parent's values for inheritable handles
//   and defaults for everything else.
proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]
    #[test]
    fn prop_handles_match_model((n, ops) in arb_ops()) {
        let mut handles: Vec<Arc<ThreadLocal<i32>>> = (0..n).map(declare).collect();
        let mut model: HashMap<usize, i32> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(i, v) => {
                    handles[i].set(v);
                    model.insert(i, v);
                }
                Op::Get(i) => {
                    let expected = *model.entry(i).or_insert(default_for(i));
                    prop_assert_eq!(handles[i].get(), expected);
                }
                Op::Remove(i) => {
                    handles[i].remove();
                    model.remove(&i);
                }
                Op::Replace(i) => {
                    handles[i] = declare(i);
                    model.remove(&i);
                }
                Op::Spawn => {
                    let child: Vec<_> = handles.iter().map(Arc::clone).collect();
                    let seen = tlmap::thread::spawn(move || {
                        child.iter().map(|h| h.get()).collect::<Vec<_>>()
                    })
                    .join()
                    .expect("join");
                    for (i, got) in seen.into_iter().enumerate() {
                        let expected = if handles[i].is_inheritable() {
                            model.get(&i).copied().unwrap_or(default_for(i))
                        } else {
                            default_for(i)
                        };
                        prop_assert_eq!(got, expected);
                    }
                }
            }
        }

        for (i, h) in handles.iter().enumerate() {
            let expected = model.get(&i).copied().unwrap_or(default_for(i));
            prop_assert_eq!(h.get(), expected);
        }
    }
}
