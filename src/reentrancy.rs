//! Debug-only reentrancy guard for owner-side table mutations.
//!
//! Each thread carries one `DebugReentrancy`. The owner enters it around
//! every stretch where a table is transiently inconsistent (a put in
//! progress, a rehash copy). User code is never called from inside such a
//! stretch, so nested entry means a bug in this crate, not in the caller.
//! In debug builds nesting panics and names both sections; in release builds
//! the guard is a zero-sized no-op.

#[cfg(debug_assertions)]
use core::cell::Cell;
use core::marker::PhantomData;

#[derive(Debug)]
pub(crate) struct DebugReentrancy {
    #[cfg(debug_assertions)]
    held: Cell<Option<&'static str>>,
    // Per-thread by construction.
    _nosend: PhantomData<*mut ()>,
}

impl DebugReentrancy {
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            held: Cell::new(None),
            _nosend: PhantomData,
        }
    }

    /// Enter the section called `name`. Panics in debug builds if another
    /// section on this thread is still held.
    #[inline]
    pub(crate) fn enter(&self, name: &'static str) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            if let Some(outer) = self.held.get() {
                panic!("reentrancy detected: entered `{name}` while `{outer}` is in progress");
            }
            self.held.set(Some(name));
            ReentrancyGuard { owner: self }
        }

        #[cfg(not(debug_assertions))]
        {
            let _ = name;
            ReentrancyGuard { _z: PhantomData }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        #[cfg(debug_assertions)]
        {
            self.held.get().is_some()
        }
        #[cfg(not(debug_assertions))]
        {
            false
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub(crate) struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let prev = self.owner.held.take();
            debug_assert!(prev.is_some());
        }
    }
}
