//! LocalMap: one thread's variables of one kind, over a swappable `Table`.
//!
//! The map is a single atomic table pointer, null until first use. Only the
//! owning thread installs or replaces tables (the parent does it once for a
//! child before the child exists); the reclamation worker only loads the
//! pointer and removes entries from whatever table it finds.
//!
//! Replacement publishes the new table before moving entries into it, so a
//! sweep that races with a rehash either removes a dead key from the old
//! table (which rehash then skips, the key no longer pins) or finds it in
//! the new one.

use core::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::config;
use crate::key::{KeyRef, Payload};
use crate::reentrancy::DebugReentrancy;
use crate::table::{Table, Value, TOMBSTONE};

pub(crate) struct LocalMap {
    table: Atomic<Table>,
    initial_length: usize,
}

impl LocalMap {
    pub(crate) fn new() -> Self {
        Self::with_initial_length(config::get().table_length())
    }

    /// A map whose first table will have `length` cells. `length` is
    /// checked when that table is allocated.
    pub(crate) fn with_initial_length(length: usize) -> Self {
        Self {
            table: Atomic::null(),
            initial_length: length,
        }
    }

    /// The current table, if one was ever created.
    pub(crate) fn table<'g>(&self, guard: &'g Guard) -> Option<&'g Table> {
        // SAFETY: tables are freed through the epoch; `guard` keeps this one.
        unsafe { self.table.load(Ordering::Acquire, guard).as_ref() }
    }

    fn current<'g>(&self, guard: &'g Guard) -> Shared<'g, Table> {
        self.table.load(Ordering::Acquire, guard)
    }

    fn get_or_create<'g>(&self, guard: &'g Guard) -> Shared<'g, Table> {
        let table = self.current(guard);
        if !table.is_null() {
            return table;
        }
        let fresh = Owned::new(Table::with_length(self.initial_length)).into_shared(guard);
        self.table.store(fresh, Ordering::Release);
        fresh
    }

    /// Fast path: one load of the probe-start key cell. Lock-free and
    /// allocation-free; any miss falls through to `get_after_miss`.
    #[inline]
    pub(crate) fn lookup<'g>(&self, key: &KeyRef, guard: &'g Guard) -> Option<&'g Value> {
        let table = self.table(guard)?;
        let index = table.probe_start(key.hash());
        if table.key_at(index) != key.as_ptr() as *mut KeyRef {
            return None;
        }
        // SAFETY: only the owner dereferences values, under `guard`.
        unsafe { table.value_at(index, guard).as_ref() }
    }

    /// Slow path: finish the probe, and on a miss compute the default with
    /// `init` and insert it.
    ///
    /// `init` runs with no section held and may do anything, including
    /// setting this same variable or growing the table. The insert therefore
    /// goes through a full `put` against whichever table is current once
    /// `init` returns, which re-probes and never duplicates a key.
    pub(crate) fn get_after_miss<'g>(
        &self,
        key: &KeyRef,
        init: &mut dyn FnMut() -> Payload,
        reentrancy: &DebugReentrancy,
        guard: &'g Guard,
    ) -> &'g Value {
        let table = self.get_or_create(guard);
        // SAFETY: non-null and protected by `guard`.
        let probed = unsafe { table.deref() };
        let key_ptr = key.as_ptr() as *mut KeyRef;
        let mut index = probed.probe_start(key.hash());
        loop {
            let k = probed.key_at(index);
            if k == key_ptr {
                // SAFETY: owner-only dereference under `guard`.
                if let Some(value) = unsafe { probed.value_at(index, guard).as_ref() } {
                    return value;
                }
                break;
            }
            if k.is_null() {
                break;
            }
            index = probed.next(index);
        }

        let value = Owned::new(Value::new(init()));

        let target = if self.current(guard) == table {
            probed
        } else {
            // Replaced while `init` ran; that table may sit at its threshold.
            self.maybe_rehash(reentrancy, guard)
        };
        let stored = {
            let _g = reentrancy.enter("put");
            target.put(key, value, guard).1
        };
        self.maybe_rehash(reentrancy, guard);
        stored
    }

    pub(crate) fn set(
        &self,
        key: &KeyRef,
        value: Owned<Value>,
        reentrancy: &DebugReentrancy,
        guard: &Guard,
    ) {
        let table = self.get_or_create(guard);
        {
            let _g = reentrancy.enter("put");
            // SAFETY: non-null and protected by `guard`.
            unsafe { table.deref() }.put(key, value, guard);
        }
        self.maybe_rehash(reentrancy, guard);
    }

    /// Remove `key` if this map holds it. Also called by the worker on
    /// other threads' maps.
    pub(crate) fn remove(&self, key: &KeyRef, guard: &Guard) -> bool {
        match self.table(guard) {
            Some(table) => table.remove(key, guard),
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &KeyRef) -> bool {
        let guard = epoch::pin();
        self.table(&guard).is_some_and(|t| t.contains(key))
    }

    /// Replace the table once `load` reaches `maximum_load`: double it if
    /// more than half the buckets are estimated live, otherwise rebuild at
    /// the same size to shed tombstones. Dead keys are left behind.
    pub(crate) fn maybe_rehash<'g>(
        &self,
        reentrancy: &DebugReentrancy,
        guard: &'g Guard,
    ) -> &'g Table {
        let old = self.get_or_create(guard);
        // SAFETY: non-null and protected by `guard`.
        let old_table = unsafe { old.deref() };
        if old_table.load() < old_table.maximum_load() {
            return old_table;
        }

        let capacity = old_table.capacity();
        let live_estimate = old_table.load() as isize - old_table.tombstones();
        let new_capacity = if live_estimate > (capacity >> 1) as isize {
            capacity << 1
        } else {
            capacity
        };

        let fresh = Owned::new(Table::with_length(new_capacity << 1)).into_shared(guard);
        // SAFETY: just allocated; protected by `guard`.
        let new_table = unsafe { fresh.deref() };
        let mut moved = 0usize;
        {
            let _g = reentrancy.enter("rehash");
            self.table.store(fresh, Ordering::Release);
            for index in old_table.key_indices_rev() {
                let k = old_table.key_at(index);
                if k.is_null() || k == TOMBSTONE {
                    continue;
                }
                // SAFETY: the cell owns a strong count and its release is
                // deferred past `guard`.
                let key = unsafe { &*k };
                // Held across the move: the key cannot be reclaimed between
                // the liveness check and its insertion.
                let Some(_pin) = key.pin() else {
                    continue;
                };
                if let Some(value) = old_table.take_value(index, guard) {
                    new_table.put(key, value, guard);
                    moved += 1;
                }
            }
            // SAFETY: unlinked by the store above; readers hold guards.
            unsafe { guard.defer_destroy(old) };
        }
        tracing::trace!(
            old_capacity = capacity,
            new_capacity,
            live_estimate,
            moved,
            "rehashed thread-local table"
        );
        new_table
    }

    /// Fill this freshly created child map from `parent`, running in the
    /// parent's thread. The child table gets the parent's length and is
    /// published before it is filled. Returns the number of entries copied.
    ///
    /// A panicking child-value transform propagates; nothing is caught.
    pub(crate) fn inherit_from(&self, parent: &LocalMap, guard: &Guard) -> usize {
        let Some(source) = parent.table(guard) else {
            return 0;
        };
        let child = Owned::new(Table::with_length(source.length())).into_shared(guard);
        self.table.store(child, Ordering::Release);
        // SAFETY: just allocated; protected by `guard`.
        let target = unsafe { child.deref() };

        let mut inherited = 0;
        for index in source.key_indices_rev() {
            let k = source.key_at(index);
            if k.is_null() || k == TOMBSTONE {
                continue;
            }
            // SAFETY: as in `maybe_rehash`.
            let key = unsafe { &*k };
            if !key.is_inheritable() {
                continue;
            }
            let Some(_pin) = key.pin() else {
                continue;
            };
            // SAFETY: the parent owns `source`; dereferenced under `guard`.
            let value = unsafe { source.value_at(index, guard).as_ref() }
                // An earlier transform may have rehashed the parent.
                .or_else(|| parent.table(guard).and_then(|t| t.find(key, guard)));
            let Some(value) = value else {
                continue;
            };
            let Some(payload) = key.child_value(value.payload()) else {
                continue;
            };
            target.put(key, Owned::new(Value::new(payload)), guard);
            inherited += 1;
        }
        inherited
    }
}

impl Drop for LocalMap {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no thread holds this map, and every
        // reader of its table reaches it through the map.
        unsafe {
            let table = self.table.load(Ordering::Relaxed, epoch::unprotected());
            if !table.is_null() {
                drop(table.into_owned());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ChildValueFn;
    use crate::table::MIN_LENGTH;
    use core::any::Any;
    use std::cell::Cell;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn boxed(v: i32) -> Owned<Value> {
        Owned::new(Value::new(Box::new(v)))
    }

    fn int(v: &Value) -> i32 {
        *v.payload().downcast_ref::<i32>().expect("i32 payload")
    }

    fn get(map: &LocalMap, key: &KeyRef, r: &DebugReentrancy, init: i32) -> i32 {
        let guard = epoch::pin();
        match map.lookup(key, &guard) {
            Some(v) => int(v),
            None => int(map.get_after_miss(key, &mut || Box::new(init) as Payload, r, &guard)),
        }
    }

    fn set(map: &LocalMap, key: &KeyRef, r: &DebugReentrancy, v: i32) {
        map.set(key, boxed(v), r, &epoch::pin());
    }

    fn load_and_capacity(map: &LocalMap) -> (usize, usize) {
        let guard = epoch::pin();
        let table = map.table(&guard).expect("table exists");
        (table.load(), table.capacity())
    }

    /// Invariant: the default is computed once; later gets hit the table.
    #[test]
    fn default_is_computed_once() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let key = KeyRef::new(None);
        let calls = Cell::new(0);
        let mut init = || {
            calls.set(calls.get() + 1);
            Box::new(11) as Payload
        };

        let guard = epoch::pin();
        assert!(map.lookup(&key, &guard).is_none());
        assert_eq!(int(map.get_after_miss(&key, &mut init, &r, &guard)), 11);
        assert_eq!(map.lookup(&key, &guard).map(int), Some(11));
        assert_eq!(int(map.get_after_miss(&key, &mut init, &r, &guard)), 11);
        assert_eq!(calls.get(), 1);
    }

    /// Invariant: remove followed by get recomputes the default.
    #[test]
    fn remove_then_get_reinitialises() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let key = KeyRef::new(None);
        set(&map, &key, &r, 5);
        assert_eq!(get(&map, &key, &r, 0), 5);
        assert!(map.remove(&key, &epoch::pin()));
        assert!(!map.remove(&key, &epoch::pin()));
        assert_eq!(get(&map, &key, &r, 42), 42);
    }

    #[test]
    fn remove_without_table_is_noop() {
        let map = LocalMap::new();
        let key = KeyRef::new(None);
        assert!(!map.remove(&key, &epoch::pin()));
        assert!(map.table(&epoch::pin()).is_none());
    }

    /// Invariant: 1000 keys inserted from capacity 16 all keep their values
    /// across the rehashes they force.
    #[test]
    fn many_keys_survive_growth() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let keys: Vec<_> = (0..1000).map(|_| KeyRef::new(None)).collect();
        for (i, k) in keys.iter().enumerate() {
            set(&map, k, &r, i as i32);
        }
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(get(&map, k, &r, -1), i as i32);
        }
        let (load, capacity) = load_and_capacity(&map);
        assert!(capacity >= 1024, "capacity {capacity}");
        assert!(load < capacity);
    }

    /// Invariant: reaching the threshold with mostly tombstones rebuilds at
    /// the same capacity and clears them.
    #[test]
    fn rehash_compacts_tombstones_at_same_size() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let keys: Vec<_> = (0..9).map(|i| KeyRef::with_hash(i * 2, None)).collect();
        for (i, k) in keys.iter().enumerate() {
            set(&map, k, &r, i as i32);
        }
        for k in &keys[1..] {
            assert!(map.remove(k, &epoch::pin()));
        }
        assert_eq!(load_and_capacity(&map), (9, 16));

        let late = KeyRef::with_hash(20, None);
        set(&map, &late, &r, 99);

        let guard = epoch::pin();
        let table = map.table(&guard).expect("table");
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.load(), 2);
        assert_eq!(table.tombstones(), 0);
        assert_eq!(map.lookup(&keys[0], &guard).map(int), Some(0));
        assert_eq!(table.find(&late, &guard).map(int), Some(99));
    }

    /// Invariant: reaching the threshold with mostly live entries doubles.
    #[test]
    fn rehash_doubles_when_live() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let keys: Vec<_> = (0..10).map(|i| KeyRef::with_hash(i * 2, None)).collect();
        for k in &keys {
            set(&map, k, &r, 1);
        }
        assert_eq!(load_and_capacity(&map), (10, 32));
    }

    /// Invariant: rehash keeps live entries with their values and leaves
    /// entries of dropped handles behind.
    #[test]
    fn rehash_drops_dead_entries() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let keys: Vec<_> = (0..9).map(|i| KeyRef::with_hash(i * 2, None)).collect();
        for (i, k) in keys.iter().enumerate() {
            set(&map, k, &r, i as i32);
        }
        let (dead, live): (Vec<_>, Vec<_>) = keys.iter().enumerate().partition(|(i, _)| i % 2 == 0);
        for (_, k) in &dead {
            k.retire();
        }

        // Tenth fill reaches the threshold.
        let trigger = KeyRef::with_hash(40, None);
        set(&map, &trigger, &r, 100);

        let guard = epoch::pin();
        let table = map.table(&guard).expect("table");
        assert_eq!(table.load(), live.len() + 1);
        for (i, k) in &live {
            assert_eq!(table.find(k, &guard).map(int), Some(*i as i32));
        }
        for (_, k) in &dead {
            assert!(!table.contains(k));
        }
        assert_eq!(table.find(&trigger, &guard).map(int), Some(100));
    }

    /// Invariant: a default function that sets the same variable does not
    /// produce a second entry; the default wins.
    #[test]
    fn recursive_set_during_init_keeps_single_entry() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let key = KeyRef::new(None);
        let guard = epoch::pin();
        let mut init = || {
            set(&map, &key, &r, 5);
            Box::new(7) as Payload
        };
        assert_eq!(int(map.get_after_miss(&key, &mut init, &r, &guard)), 7);
        assert_eq!(get(&map, &key, &r, -1), 7);
        assert_eq!(load_and_capacity(&map).0, 1);
    }

    /// Invariant: a default function that forces a rehash still gets its
    /// value stored in the latest table.
    #[test]
    fn init_that_rehashes_inserts_into_latest_table() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let key = KeyRef::new(None);
        let others: Vec<_> = (0..40).map(|_| KeyRef::new(None)).collect();
        let guard = epoch::pin();
        let before = map.get_or_create(&guard);
        let mut init = || {
            for (i, k) in others.iter().enumerate() {
                set(&map, k, &r, i as i32);
            }
            Box::new(-3) as Payload
        };
        assert_eq!(int(map.get_after_miss(&key, &mut init, &r, &guard)), -3);
        assert!(map.current(&guard) != before, "table must have been replaced");
        assert_eq!(get(&map, &key, &r, 0), -3);
        for (i, k) in others.iter().enumerate() {
            assert_eq!(get(&map, k, &r, -1), i as i32);
        }
    }

    fn below_threshold(map: &LocalMap) -> bool {
        let guard = epoch::pin();
        let table = map.table(&guard).expect("table exists");
        table.load() < table.maximum_load()
    }

    /// Invariant: at the smallest length, overwriting and re-adding a few
    /// keys neither replaces the table nor reaches the threshold.
    #[test]
    fn small_key_set_churn_at_minimum_length() {
        let map = LocalMap::with_initial_length(MIN_LENGTH);
        let r = DebugReentrancy::new();
        for count in 2..=4 {
            let keys: Vec<_> = (0..count).map(|_| KeyRef::new(None)).collect();
            for k in &keys {
                set(&map, k, &r, 0);
            }
            let guard = epoch::pin();
            let before = map.current(&guard);
            for round in 0..100 {
                let k = &keys[round % count];
                set(&map, k, &r, round as i32);
                assert_eq!(get(&map, k, &r, -1), round as i32);
                assert!(below_threshold(&map));
            }
            assert!(map.current(&guard) == before, "overwrites replaced the table");

            for round in 0..100 {
                let k = &keys[round % count];
                assert!(map.remove(k, &epoch::pin()));
                assert_eq!(get(&map, k, &r, round as i32), round as i32);
                assert!(below_threshold(&map));
            }
            for k in &keys {
                k.retire();
            }
        }
    }

    /// Invariant: whatever an init function inserts first, the map ends the
    /// miss below its threshold with every value readable.
    #[test]
    fn init_inserting_others_leaves_room_at_minimum_length() {
        for n in 0..12 {
            let map = LocalMap::with_initial_length(MIN_LENGTH);
            let r = DebugReentrancy::new();
            let key = KeyRef::new(None);
            let others: Vec<_> = (0..n).map(|_| KeyRef::new(None)).collect();
            let guard = epoch::pin();
            let mut init = || {
                for (i, k) in others.iter().enumerate() {
                    set(&map, k, &r, i as i32);
                }
                Box::new(-1) as Payload
            };
            assert_eq!(int(map.get_after_miss(&key, &mut init, &r, &guard)), -1);
            assert!(below_threshold(&map), "{n} keys set during init");
            assert_eq!(get(&map, &key, &r, 0), -1);
            for (i, k) in others.iter().enumerate() {
                assert_eq!(get(&map, k, &r, -2), i as i32);
            }
        }
    }

    /// Invariant: a panicking default commits nothing.
    #[test]
    fn panicking_init_commits_nothing() {
        let map = LocalMap::new();
        let r = DebugReentrancy::new();
        let key = KeyRef::new(None);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let guard = epoch::pin();
            map.get_after_miss(&key, &mut || -> Payload { panic!("init failed") }, &r, &guard);
        }));
        assert!(res.is_err());
        assert!(!map.contains(&key));
        assert!(!r.is_held());
        assert_eq!(get(&map, &key, &r, 8), 8);
    }

    fn doubling() -> Box<ChildValueFn> {
        Box::new(|parent: &(dyn Any + Send)| -> Payload {
            Box::new(parent.downcast_ref::<i32>().expect("i32 payload") * 2)
        })
    }

    /// Invariant: inheritance copies live inheritable entries through the
    /// transform, into a table of the parent's length, and skips the rest.
    #[test]
    fn inherit_copies_live_inheritable_entries() {
        let parent = LocalMap::new();
        let r = DebugReentrancy::new();
        let kept = KeyRef::new(Some(doubling()));
        let dead = KeyRef::new(Some(doubling()));
        let plain = KeyRef::new(None);
        set(&parent, &kept, &r, 21);
        set(&parent, &dead, &r, 5);
        set(&parent, &plain, &r, 9);
        dead.retire();

        let child = LocalMap::new();
        let guard = epoch::pin();
        assert_eq!(child.inherit_from(&parent, &guard), 1);

        let table = child.table(&guard).expect("child table");
        assert_eq!(table.length(), parent.table(&guard).expect("parent").length());
        assert_eq!(table.find(&kept, &guard).map(int), Some(42));
        assert!(!table.contains(&dead));
        assert!(!table.contains(&plain));
        // The parent is untouched.
        assert_eq!(get(&parent, &kept, &r, 0), 21);
    }

    #[test]
    fn inherit_from_empty_parent_leaves_child_unallocated() {
        let parent = LocalMap::new();
        let child = LocalMap::new();
        let guard = epoch::pin();
        assert_eq!(child.inherit_from(&parent, &guard), 0);
        assert!(child.table(&guard).is_none());
    }

    /// Invariant: a panicking transform propagates out of the transfer.
    #[test]
    fn panicking_transform_propagates() {
        let parent = LocalMap::new();
        let r = DebugReentrancy::new();
        let boom: Box<ChildValueFn> =
            Box::new(|_: &(dyn Any + Send)| -> Payload { panic!("transform failed") });
        let key = KeyRef::new(Some(boom));
        set(&parent, &key, &r, 1);

        let child = LocalMap::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            child.inherit_from(&parent, &epoch::pin());
        }));
        assert!(res.is_err());
        assert_eq!(get(&parent, &key, &r, 0), 1);
    }

    /// Invariant: a remover on another thread tombstoning dead keys never
    /// disturbs the owner's live entries, even while the owner keeps
    /// inserting and rehashing.
    #[test]
    fn concurrent_removal_of_dead_keys() {
        let map = Arc::new(LocalMap::new());
        let r = DebugReentrancy::new();
        let dead: Vec<_> = (0..64).map(|_| KeyRef::new(None)).collect();
        for k in &dead {
            set(&map, k, &r, -1);
            k.retire();
        }
        let done = Arc::new(AtomicBool::new(false));

        let remover = {
            let map = Arc::clone(&map);
            let dead = dead.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for k in &dead {
                        map.remove(k, &epoch::pin());
                    }
                }
            })
        };

        let live: Vec<_> = (0..500).map(|_| KeyRef::new(None)).collect();
        for round in 0..4 {
            for (i, k) in live.iter().enumerate() {
                set(&map, k, &r, (i + round) as i32);
            }
            for (i, k) in live.iter().enumerate() {
                assert_eq!(get(&map, k, &r, -2), (i + round) as i32);
            }
        }
        done.store(true, Ordering::Release);
        remover.join().expect("remover thread");

        for k in &dead {
            assert!(!map.contains(k));
        }
    }
}
