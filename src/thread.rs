//! Spawning threads that inherit the caller's inheritable variables.
//!
//! Threads started with `std::thread` begin with empty maps. Threads started
//! here begin with a copy of every inheritable variable the spawning thread
//! currently holds, passed through that variable's child-value transform.
//! The copy is made in the spawning thread, before the child runs.

use std::io;
use std::thread::JoinHandle;

use crate::context;

/// Thread factory mirroring [`std::thread::Builder`].
#[derive(Debug)]
pub struct Builder {
    inner: std::thread::Builder,
}

impl Builder {
    /// A builder with no name and the default stack size.
    pub fn new() -> Self {
        Self {
            inner: std::thread::Builder::new(),
        }
    }

    /// Name the new thread.
    pub fn name(self, name: String) -> Self {
        Self {
            inner: self.inner.name(name),
        }
    }

    /// Stack size of the new thread, in bytes.
    pub fn stack_size(self, size: usize) -> Self {
        Self {
            inner: self.inner.stack_size(size),
        }
    }

    /// Spawn `f` on a new thread that inherits from the caller.
    ///
    /// # Panics
    ///
    /// If a child-value transform panics. The child is not started.
    pub fn spawn<F, T>(self, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let registration = context::prepare_child();
        self.inner.spawn(move || {
            context::install(registration);
            f()
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn `f` on a new thread that inherits from the caller.
///
/// ```
/// use std::sync::Arc;
/// use tlmap::ThreadLocal;
///
/// let request_id = Arc::new(ThreadLocal::inheritable(|| 0u64));
/// request_id.set(42);
///
/// let child = Arc::clone(&request_id);
/// let seen = tlmap::thread::spawn(move || child.get()).join().unwrap();
/// assert_eq!(seen, 42);
/// ```
///
/// # Panics
///
/// If the OS fails to create the thread, or a child-value transform panics.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Builder::new().spawn(f).expect("failed to spawn thread")
}
