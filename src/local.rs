//! ThreadLocal: the public handle to a per-thread variable.

use core::any::Any;
use core::fmt;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Owned};

use crate::context;
use crate::error::AccessError;
use crate::key::{ChildValueFn, KeyRef, Payload};
use crate::reclaim::Reclaimer;
use crate::table::Value;

/// A variable with an independent value in every thread.
///
/// Unlike `std::thread_local!`, handles are ordinary values: they can be
/// created at runtime, stored in structs, shared between threads and
/// dropped. Each thread that reads a handle before writing it gets the
/// value produced by the handle's default function, computed once in that
/// thread.
///
/// Dropping the handle does not drop the values it left in other threads
/// right away. Those are collected in the background (see
/// [`sync_reclamation`](crate::sync_reclamation)) or when their thread
/// exits.
///
/// ```
/// use std::sync::Arc;
/// use tlmap::ThreadLocal;
///
/// let counter = Arc::new(ThreadLocal::new(|| 0u32));
/// counter.set(5);
///
/// let other = Arc::clone(&counter);
/// std::thread::spawn(move || assert_eq!(other.get(), 0))
///     .join()
///     .unwrap();
/// assert_eq!(counter.get(), 5);
/// ```
pub struct ThreadLocal<T> {
    key: Arc<KeyRef>,
    init: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T: Send + 'static> ThreadLocal<T> {
    /// Create a variable whose per-thread default is produced by `init`.
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_key(KeyRef::new(None), init)
    }

    /// Create an inheritable variable with the given child-value transform.
    ///
    /// A thread spawned through [`thread`](crate::thread) starts with
    /// `child_value(&v)` wherever the spawning thread holds `v`. The
    /// transform runs in the spawning thread, before the child starts; if
    /// it panics, the spawn panics.
    pub fn inheritable_with<F, C>(init: F, child_value: C) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        C: Fn(&T) -> T + Send + Sync + 'static,
    {
        let transform: Box<ChildValueFn> =
            Box::new(move |parent: &(dyn Any + Send)| -> Payload {
                Box::new(child_value(downcast::<T>(parent)))
            });
        Self::with_key(KeyRef::new(Some(transform)), init)
    }

    fn with_key<F>(key: Arc<KeyRef>, init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        // Start the worker before any value exists that it may need to
        // collect.
        Reclaimer::global();
        Self {
            key,
            init: Box::new(init),
        }
    }

    /// Whether threads spawned through [`crate::thread`] copy this variable.
    pub fn is_inheritable(&self) -> bool {
        self.key.is_inheritable()
    }

    /// Run `f` on this thread's value, computing the default first if the
    /// thread has none.
    ///
    /// # Panics
    ///
    /// If called from a thread-local destructor after this thread's
    /// storage has been torn down. See [`try_with`](Self::try_with).
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        alive(self.try_with(f))
    }

    /// Like [`with`](Self::with), but reports a torn-down thread instead of
    /// panicking.
    pub fn try_with<F, R>(&self, f: F) -> Result<R, AccessError>
    where
        F: FnOnce(&T) -> R,
    {
        context::with_owner(|owner| {
            let guard = epoch::pin();
            let map = owner.context().map(self.key.is_inheritable());
            let value = match map.lookup(&self.key, &guard) {
                Some(value) => value,
                None => {
                    let mut init = || -> Payload { Box::new((self.init)()) };
                    map.get_after_miss(&self.key, &mut init, owner.reentrancy(), &guard)
                }
            };
            // `guard` keeps the value alive even if `f` replaces it.
            f(downcast::<T>(value.payload()))
        })
    }

    /// This thread's value, cloned.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Replace this thread's value. The previous value, if any, is dropped
    /// once no reader can still observe it.
    ///
    /// # Panics
    ///
    /// Under the same conditions as [`with`](Self::with).
    pub fn set(&self, value: T) {
        alive(context::with_owner(|owner| {
            let guard = epoch::pin();
            let map = owner.context().map(self.key.is_inheritable());
            map.set(
                &self.key,
                Owned::new(Value::new(Box::new(value))),
                owner.reentrancy(),
                &guard,
            );
        }))
    }

    /// Forget this thread's value; the next read recomputes the default.
    /// A no-op on threads that never touched any variable.
    pub fn remove(&self) {
        context::with_existing_owner(|owner| {
            let guard = epoch::pin();
            let _g = owner.reentrancy().enter("remove");
            owner
                .context()
                .map(self.key.is_inheritable())
                .remove(&self.key, &guard);
        });
    }
}

impl<T: Clone + Send + 'static> ThreadLocal<T> {
    /// Create an inheritable variable whose children start with a clone of
    /// the parent's value.
    pub fn inheritable<F>(init: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::inheritable_with(init, T::clone)
    }
}

impl<T: Default + Send + 'static> Default for ThreadLocal<T> {
    fn default() -> Self {
        Self::new(T::default)
    }
}

impl<T> fmt::Debug for ThreadLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocal")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for ThreadLocal<T> {
    fn drop(&mut self) {
        if self.key.retire() {
            Reclaimer::global().notify(Arc::clone(&self.key));
        }
    }
}

fn downcast<T: 'static>(payload: &(dyn Any + Send)) -> &T {
    payload
        .downcast_ref::<T>()
        .expect("stored value has its handle's type")
}

fn alive<R>(result: Result<R, AccessError>) -> R {
    match result {
        Ok(r) => r,
        Err(err) => panic!("{err}"),
    }
}
