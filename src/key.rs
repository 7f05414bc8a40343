//! Key references and pins.
//!
//! A `KeyRef` is what per-thread tables store in place of the handle. It
//! stays allocated for as long as any table cell or queued notice holds a
//! strong count, long after the `ThreadLocal` that created it is gone.
//!
//! Liveness and pins share one atomic word:
//! - bit 0 (`LIVE`) is set from creation until the handle is dropped;
//! - the remaining bits count outstanding `Pinned` guards.
//!
//! A pin can only be taken while `LIVE` is set, and whichever party clears
//! the last of `LIVE`/pins hands the key to the reclamation queue. That makes
//! the notice fire exactly once and never while a pin is outstanding.

use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::reclaim::Reclaimer;

/// Step between consecutive key hashes: twice the 32-bit golden ratio.
/// Keys sit at even cell indices, so hashes must stay even.
const HASH_INCREMENT: usize = 0x61c8_8647 << 1;

static NEXT_HASH: AtomicUsize = AtomicUsize::new(0);

const LIVE: usize = 1;
const PIN: usize = 2;

/// Type-erased value stored in a table.
pub(crate) type Payload = Box<dyn Any + Send>;

/// Type-erased child-value transform of an inheritable variable.
pub(crate) type ChildValueFn = dyn Fn(&(dyn Any + Send)) -> Payload + Send + Sync;

pub(crate) struct KeyRef {
    hash: usize,
    state: AtomicUsize,
    child_value: Option<Box<ChildValueFn>>,
}

impl KeyRef {
    /// Allocate a fresh, live key. `child_value` is `Some` exactly for
    /// inheritable variables.
    pub(crate) fn new(child_value: Option<Box<ChildValueFn>>) -> Arc<Self> {
        let hash = NEXT_HASH.fetch_add(HASH_INCREMENT, Ordering::Relaxed);
        Self::with_hash(hash, child_value)
    }

    pub(crate) fn with_hash(hash: usize, child_value: Option<Box<ChildValueFn>>) -> Arc<Self> {
        debug_assert_eq!(hash & 1, 0, "key hashes must be even");
        Arc::new(Self {
            hash,
            state: AtomicUsize::new(LIVE),
            child_value,
        })
    }

    #[inline]
    pub(crate) fn hash(&self) -> usize {
        self.hash
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const KeyRef {
        self
    }

    pub(crate) fn is_inheritable(&self) -> bool {
        self.child_value.is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self) -> bool {
        self.state.load(Ordering::Acquire) & LIVE != 0
    }

    /// Compute the child's value from the parent's. `None` for keys that
    /// are not inheritable.
    pub(crate) fn child_value(&self, parent: &(dyn Any + Send)) -> Option<Payload> {
        self.child_value.as_ref().map(|f| f(parent))
    }

    /// Hold the key live until the returned guard drops. Fails once the
    /// handle has been dropped.
    pub(crate) fn pin(&self) -> Option<Pinned<'_>> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur & LIVE == 0 {
                return None;
            }
            if cur > usize::MAX - PIN {
                // Same policy as `Rc`: abort rather than wrap.
                std::process::abort();
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + PIN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(Pinned { key: self }),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Mark the key dead. Returns true if the caller observed the final
    /// transition and must enqueue the reclamation notice; false if a pin
    /// is still outstanding and its release will do it.
    pub(crate) fn retire(&self) -> bool {
        let prev = self.state.fetch_and(!LIVE, Ordering::AcqRel);
        debug_assert!(prev & LIVE != 0, "key retired twice");
        prev == LIVE
    }

    /// Recover an owning `Arc` from a borrowed key.
    fn to_arc(&self) -> Arc<KeyRef> {
        let ptr = self.as_ptr();
        // SAFETY: every KeyRef is allocated by `with_hash` inside an `Arc`,
        // and `&self` proves at least one strong count is still held.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    #[cfg(test)]
    pub(crate) fn pins(&self) -> usize {
        self.state.load(Ordering::Acquire) / PIN
    }
}

impl fmt::Debug for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("KeyRef")
            .field("hash", &format_args!("{:#x}", self.hash))
            .field("live", &(state & LIVE != 0))
            .field("pins", &(state / PIN))
            .field("inheritable", &self.is_inheritable())
            .finish()
    }
}

/// RAII pin returned by `KeyRef::pin`.
pub(crate) struct Pinned<'a> {
    key: &'a KeyRef,
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        let prev = self.key.state.fetch_sub(PIN, Ordering::AcqRel);
        if prev == PIN {
            // Last pin of a key whose handle is already gone.
            Reclaimer::global().notify(self.key.to_arc());
        }
    }
}
