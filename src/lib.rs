//! tlmap: runtime-created thread-local variables, with inheritance into
//! spawned threads and background cleanup of dropped handles.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: per-thread storage whose reads on the owning thread cost one
//!   atomic load and a compare on the hit path, while handles can be
//!   created and dropped at any time from any thread.
//! - Layers:
//!   - Table: fixed-length open-addressing array of (key, value) cells with
//!     linear probing, tombstones and an approximate load/tombstone count.
//!   - LocalMap: a swappable pointer to the current Table, with the
//!     owner-side operations (lookup, miss path, set, remove, rehash,
//!     inheritance).
//!   - ThreadContext / Roster: each thread's two maps (normal and
//!     inheritable) and the process-wide list of them.
//!   - ThreadLocal<T>: public handle; a typed view over a shared `KeyRef`.
//!   - Reclaimer: a queue plus one worker thread that removes the entries
//!     of dropped handles from every registered thread.
//!
//! Ownership and lifetimes
//! - A `KeyRef` is reference counted. Every occupied key cell holds one
//!   count, so a table never points at freed key memory, whatever order
//!   handles, tables and threads go away in.
//! - Tables and values are freed through `crossbeam_epoch`. Any pointer
//!   loaded under a guard stays valid until that guard drops, including
//!   across a concurrent rehash or a removal by the worker.
//! - A thread's context is shared between its own storage and the roster.
//!   It is freed, values included, when the thread's storage is torn down
//!   and the worker holds no snapshot of it.
//!
//! Concurrency model
//! - Each map has one writer for live keys (its owner) and one remover for
//!   dead keys (the worker). They never target the same key: the worker
//!   only learns about a key once its handle is dropped and no owner holds
//!   a pin on it.
//! - Only the owner dereferences values, which is why `T: Send` is all a
//!   value needs.
//! - Replacement tables are published before they are filled, and every
//!   entry moved into one is pinned for the duration of the move. A sweep
//!   that overlaps a rehash therefore cannot leave a dead entry behind in
//!   the new table.
//!
//! Reentrancy policy
//! - User code (default functions, child-value transforms, `Drop` of
//!   values and closures) may call back into any handle. It is never run
//!   while a table is transiently inconsistent; a debug-only guard per
//!   thread enforces this around puts, removals and rehash copies.
//!
//! Notes and non-goals
//! - No iteration over a thread's variables and no way to read another
//!   thread's value.
//! - Dead entries are collected eventually, not synchronously; use
//!   [`sync_reclamation`] to wait for the worker.

mod config;
mod context;
mod error;
mod key;
mod local;
mod local_map;
mod reclaim;
mod reentrancy;
mod table;
mod table_proptest;
pub mod thread;

pub use config::{configure, Config};
pub use error::{AccessError, ConfigError};
pub use local::ThreadLocal;

/// Block until the background worker has removed the entries of every
/// handle dropped before this call from every registered thread. The
/// removed values are freed once no reader can still observe them.
///
/// Returns immediately when background reclamation is disabled, the
/// worker could not be started, or the caller is the worker itself (a
/// value's destructor running during a sweep).
pub fn sync_reclamation() {
    reclaim::Reclaimer::global().sync();
}
