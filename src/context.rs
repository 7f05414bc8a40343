//! Per-thread contexts and the process-wide roster of them.
//!
//! Every thread that touches a variable (or is spawned through
//! [`crate::thread`]) owns one `ThreadContext` holding its two maps. The
//! context is shared with the roster so the reclamation worker can reach
//! it; the thread's own `Owner` slot holds the `Registration` that takes it
//! off the roster again when the thread's storage is torn down.

use std::cell::OnceCell;
use std::sync::{Arc, OnceLock};

use crossbeam_epoch as epoch;
use parking_lot::Mutex;
use slotmap::{DefaultKey, SlotMap};

use crate::error::AccessError;
use crate::local_map::LocalMap;
use crate::reentrancy::DebugReentrancy;

pub(crate) struct ThreadContext {
    normal: LocalMap,
    inheritable: LocalMap,
}

impl ThreadContext {
    fn new() -> Self {
        Self {
            normal: LocalMap::new(),
            inheritable: LocalMap::new(),
        }
    }

    #[inline]
    pub(crate) fn map(&self, inheritable: bool) -> &LocalMap {
        if inheritable {
            &self.inheritable
        } else {
            &self.normal
        }
    }

    pub(crate) fn normal(&self) -> &LocalMap {
        &self.normal
    }

    pub(crate) fn inheritable(&self) -> &LocalMap {
        &self.inheritable
    }
}

/// Registered contexts, keyed by a generational slot.
pub(crate) struct Roster {
    contexts: Mutex<SlotMap<DefaultKey, Arc<ThreadContext>>>,
}

impl Roster {
    pub(crate) fn new() -> Self {
        Self {
            contexts: Mutex::new(SlotMap::new()),
        }
    }

    pub(crate) fn global() -> &'static Roster {
        static ROSTER: OnceLock<Roster> = OnceLock::new();
        ROSTER.get_or_init(Roster::new)
    }

    /// Create a context and put it on the roster.
    pub(crate) fn register(&'static self) -> Registration {
        let context = Arc::new(ThreadContext::new());
        let key = self.contexts.lock().insert(Arc::clone(&context));
        tracing::trace!(?key, "registered thread context");
        Registration {
            roster: self,
            key,
            context,
        }
    }

    /// Copy registered contexts into `out`, up to its length. Returns how
    /// many were written; a result equal to `out.len()` may mean the roster
    /// holds more.
    pub(crate) fn enumerate(&self, out: &mut [Option<Arc<ThreadContext>>]) -> usize {
        let contexts = self.contexts.lock();
        let mut written = 0;
        for (slot, context) in out.iter_mut().zip(contexts.values()) {
            *slot = Some(Arc::clone(context));
            written += 1;
        }
        written
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.contexts.lock().len()
    }
}

/// A context's place on the roster. Dropping it unregisters the context.
pub(crate) struct Registration {
    roster: &'static Roster,
    key: DefaultKey,
    context: Arc<ThreadContext>,
}

impl Registration {
    pub(crate) fn context(&self) -> &ThreadContext {
        &self.context
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = self.roster.contexts.lock().remove(self.key);
        debug_assert!(removed.is_some(), "context unregistered twice");
        tracing::trace!(key = ?self.key, "unregistered thread context");
        // `removed` and `self.context` drop here, outside the lock. If the
        // worker holds no clone, this thread frees its values now.
    }
}

/// What a thread keeps in its own storage.
pub(crate) struct Owner {
    registration: Registration,
    reentrancy: DebugReentrancy,
}

impl Owner {
    fn new(registration: Registration) -> Self {
        Self {
            registration,
            reentrancy: DebugReentrancy::new(),
        }
    }

    pub(crate) fn context(&self) -> &ThreadContext {
        self.registration.context()
    }

    pub(crate) fn reentrancy(&self) -> &DebugReentrancy {
        &self.reentrancy
    }
}

thread_local! {
    static OWNER: OnceCell<Owner> = const { OnceCell::new() };
}

/// Run `f` with the calling thread's owner, registering a context on first
/// use. Fails once the thread's storage is being destroyed.
pub(crate) fn with_owner<R>(f: impl FnOnce(&Owner) -> R) -> Result<R, AccessError> {
    OWNER
        .try_with(|cell| f(cell.get_or_init(|| Owner::new(Roster::global().register()))))
        .map_err(|_| AccessError::Destroyed)
}

/// Like `with_owner`, but never registers: `None` if this thread has no
/// context yet or has already lost it.
pub(crate) fn with_existing_owner<R>(f: impl FnOnce(&Owner) -> R) -> Option<R> {
    OWNER.try_with(|cell| cell.get().map(f)).ok().flatten()
}

/// Adopt a context prepared by the spawning thread. Must be the first thing
/// a spawned thread does.
pub(crate) fn install(registration: Registration) {
    OWNER.with(|cell| {
        let installed = cell.set(Owner::new(registration)).is_ok();
        debug_assert!(installed, "thread already had a context");
    });
}

/// Register a context for a thread that is about to be spawned, filled
/// with the calling thread's inheritable values.
pub(crate) fn prepare_child() -> Registration {
    let registration = Roster::global().register();
    let inherited = with_existing_owner(|parent| {
        let guard = epoch::pin();
        registration
            .context()
            .inheritable()
            .inherit_from(parent.context().inheritable(), &guard)
    })
    .unwrap_or(0);
    tracing::debug!(inherited, "prepared child thread context");
    registration
}
