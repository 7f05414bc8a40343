//! Table: the fixed-length open-addressing array behind a per-thread map.
//!
//! Cells are addressed as a flat `[key, value, key, value, ...]` array:
//! keys at even indices, each followed by its value. Hashes are even, so
//! `hash & mask` always lands on a key cell and probing steps two cells at a
//! time. Each pair is backed by one `Bucket` of two atomics.
//!
//! Concurrency contract
//! - Only the owning thread writes keys into null or tombstone cells and
//!   only it dereferences values.
//! - The reclamation worker may tombstone entries whose key is dead. Both
//!   removal and claiming write the value cell before the key cell, so a
//!   `put` that reuses a fresh tombstone can never have its value clobbered
//!   by the remover's late write.
//! - A null key cell ends every probe. `maximum_load` keeps at least a third
//!   of the buckets null between rehashes.
//!
//! Memory
//! - An occupied key cell owns one strong count of its `KeyRef` (written as
//!   `Arc::into_raw`). Counts released by `remove` and values replaced or
//!   removed are freed through the epoch guard, so a racing reader that
//!   already loaded the pointer stays valid until it unpins.

use core::any::Any;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::key::{KeyRef, Payload};

/// Marker written into a key cell on removal. Never a real allocation.
pub(crate) const TOMBSTONE: *mut KeyRef = NonNull::<KeyRef>::dangling().as_ptr();

/// Smallest array length whose same-size rebuild (at most `capacity / 2`
/// entries) starts below `maximum_load`, so every `put` that follows a
/// rehash still finds a null bucket.
pub(crate) const MIN_LENGTH: usize = 16;

/// A boxed value held in a value cell.
pub(crate) struct Value {
    payload: Payload,
}

// SAFETY: a payload is only ever dereferenced by the thread that owns the
// table holding it (a parent reading its own table during inheritance is
// that owner). Other threads move the box between cells or drop it, which
// `Send` already permits.
unsafe impl Sync for Value {}

impl Value {
    pub(crate) fn new(payload: Payload) -> Self {
        Self { payload }
    }

    pub(crate) fn payload(&self) -> &(dyn Any + Send) {
        &*self.payload
    }
}

struct Bucket {
    key: AtomicPtr<KeyRef>,
    value: Atomic<Value>,
}

impl Bucket {
    fn empty() -> Self {
        Self {
            key: AtomicPtr::new(core::ptr::null_mut()),
            value: Atomic::null(),
        }
    }
}

/// Where `put` left an entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Placement {
    /// The key was present; its value was overwritten in place.
    Replaced,
    /// A null bucket was filled; `load` grew by one.
    Filled,
    /// The first tombstone on the probe path was reused.
    Reused,
}

pub(crate) struct Table {
    buckets: Box<[Bucket]>,
    mask: usize,
    load: AtomicUsize,
    tombstones: AtomicIsize,
    maximum_load: usize,
}

impl Table {
    /// Allocate an empty table of `length` cells (`length / 2` entries).
    pub(crate) fn with_length(length: usize) -> Self {
        assert!(
            length >= MIN_LENGTH && length.is_power_of_two(),
            "table length must be a power of two >= {MIN_LENGTH}, got {length}"
        );
        let buckets = (0..length / 2).map(|_| Bucket::empty()).collect();
        Self {
            buckets,
            mask: length - 1,
            load: AtomicUsize::new(0),
            tombstones: AtomicIsize::new(0),
            maximum_load: length / 3,
        }
    }

    pub(crate) fn length(&self) -> usize {
        self.mask + 1
    }

    pub(crate) fn capacity(&self) -> usize {
        self.length() >> 1
    }

    pub(crate) fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Approximate; the worker and the owner update it without coordination
    /// and it may briefly go negative.
    pub(crate) fn tombstones(&self) -> isize {
        self.tombstones.load(Ordering::Relaxed)
    }

    pub(crate) fn maximum_load(&self) -> usize {
        self.maximum_load
    }

    #[inline]
    pub(crate) fn probe_start(&self, hash: usize) -> usize {
        hash & self.mask
    }

    #[inline]
    pub(crate) fn next(&self, index: usize) -> usize {
        (index + 2) & self.mask
    }

    #[inline]
    fn bucket(&self, index: usize) -> &Bucket {
        debug_assert_eq!(index & 1, 0, "keys live at even indices");
        &self.buckets[index >> 1]
    }

    #[inline]
    pub(crate) fn key_at(&self, index: usize) -> *mut KeyRef {
        self.bucket(index).key.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn value_at<'g>(&self, index: usize, guard: &'g Guard) -> Shared<'g, Value> {
        self.bucket(index).value.load(Ordering::Acquire, guard)
    }

    /// Key cell indices from the end of the array towards the start.
    pub(crate) fn key_indices_rev(&self) -> impl Iterator<Item = usize> {
        (0..self.length()).step_by(2).rev()
    }

    /// Insert or overwrite the entry for `key`, taking ownership of `value`.
    /// Returns where the entry went and a reference to the stored value.
    pub(crate) fn put<'g>(
        &self,
        key: &KeyRef,
        value: Owned<Value>,
        guard: &'g Guard,
    ) -> (Placement, &'g Value) {
        let key_ptr = key.as_ptr() as *mut KeyRef;
        let value = value.into_shared(guard);
        // SAFETY: `value` was just allocated; only the owner reads it.
        let stored = unsafe { value.deref() };

        let mut first_tombstone = None;
        let mut index = self.probe_start(key.hash());
        loop {
            let k = self.key_at(index);
            if k == key_ptr {
                let old = self.bucket(index).value.swap(value, Ordering::AcqRel, guard);
                if !old.is_null() {
                    // SAFETY: the old value is unlinked; readers hold guards.
                    unsafe { guard.defer_destroy(old) };
                }
                return (Placement::Replaced, stored);
            }
            if k.is_null() {
                let placement = match first_tombstone {
                    None => {
                        self.claim(index, key, value, guard);
                        self.load.fetch_add(1, Ordering::Relaxed);
                        Placement::Filled
                    }
                    Some(tombstone) => {
                        self.claim(tombstone, key, value, guard);
                        self.tombstones.fetch_sub(1, Ordering::Relaxed);
                        Placement::Reused
                    }
                };
                return (placement, stored);
            }
            if first_tombstone.is_none() && k == TOMBSTONE {
                first_tombstone = Some(index);
            }
            index = self.next(index);
        }
    }

    /// Write `value` then `key` into a null or tombstone bucket.
    fn claim<'g>(&self, index: usize, key: &KeyRef, value: Shared<'g, Value>, guard: &'g Guard) {
        let bucket = self.bucket(index);
        let stale = bucket.value.swap(value, Ordering::AcqRel, guard);
        if !stale.is_null() {
            // SAFETY: unlinked above; readers hold guards.
            unsafe { guard.defer_destroy(stale) };
        }
        let ptr = key.as_ptr();
        // SAFETY: KeyRefs are always `Arc`-allocated and `key` is borrowed,
        // so the allocation is live. The cell now owns this extra count.
        unsafe { Arc::increment_strong_count(ptr) };
        bucket.key.store(ptr as *mut KeyRef, Ordering::Release);
    }

    /// Tombstone the entry for `key`. Returns false if it was absent.
    pub(crate) fn remove(&self, key: &KeyRef, guard: &Guard) -> bool {
        let Some(index) = self.position(key) else {
            return false;
        };
        let bucket = self.bucket(index);
        // Value before key; see the module docs.
        let old = bucket.value.swap(Shared::null(), Ordering::AcqRel, guard);
        if !old.is_null() {
            // SAFETY: unlinked above; readers hold guards.
            unsafe { guard.defer_destroy(old) };
        }
        let released = bucket.key.swap(TOMBSTONE, Ordering::AcqRel);
        debug_assert_eq!(released, key.as_ptr() as *mut KeyRef);
        self.tombstones.fetch_add(1, Ordering::Relaxed);
        // SAFETY: `released` carries the count taken in `claim`. Owner-side
        // walks may still dereference it under their guard, so defer.
        unsafe {
            guard.defer_unchecked(move || drop(Arc::from_raw(released as *const KeyRef)));
        }
        true
    }

    /// Full probe for `key`.
    pub(crate) fn find<'g>(&self, key: &KeyRef, guard: &'g Guard) -> Option<&'g Value> {
        let index = self.position(key)?;
        // SAFETY: values are only dereferenced by the owner, under `guard`.
        unsafe { self.value_at(index, guard).as_ref() }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &KeyRef) -> bool {
        self.position(key).is_some()
    }

    fn position(&self, key: &KeyRef) -> Option<usize> {
        let key_ptr = key.as_ptr() as *mut KeyRef;
        let mut index = self.probe_start(key.hash());
        loop {
            let k = self.key_at(index);
            if k == key_ptr {
                return Some(index);
            }
            if k.is_null() {
                return None;
            }
            index = self.next(index);
        }
    }

    /// Detach the value at `index`, leaving the cell null. Used by rehash to
    /// move a live entry into the replacement table.
    pub(crate) fn take_value(&self, index: usize, guard: &Guard) -> Option<Owned<Value>> {
        let value = self
            .bucket(index)
            .value
            .swap(Shared::null(), Ordering::AcqRel, guard);
        if value.is_null() {
            None
        } else {
            // SAFETY: the swap made this the only reference to the value.
            Some(unsafe { value.into_owned() })
        }
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no thread can reach this table anymore.
        let guard = unsafe { epoch::unprotected() };
        for bucket in self.buckets.iter() {
            let key = bucket.key.load(Ordering::Relaxed);
            if !key.is_null() && key != TOMBSTONE {
                // SAFETY: the occupied cell owns one strong count.
                unsafe { drop(Arc::from_raw(key as *const KeyRef)) };
            }
            let value = bucket.value.load(Ordering::Relaxed, guard);
            if !value.is_null() {
                // SAFETY: exclusive access, see above.
                unsafe { drop(value.into_owned()) };
            }
        }
    }
}
