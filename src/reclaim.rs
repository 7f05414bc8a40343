//! Background reclamation of entries left behind by dropped handles.
//!
//! Dropping a `ThreadLocal` cannot reach into other threads' maps, so it
//! queues a notice instead. A single worker thread drains the queue in
//! batches: it enumerates the roster once per batch and tombstones every
//! dead key in every registered context. Owners never wait on the worker;
//! a map the worker has not swept yet simply keeps the dead entry until the
//! sweep or the map's next rehash, whichever comes first.

use std::cell::Cell;
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_epoch as epoch;

use crate::config;
use crate::context::{Roster, ThreadContext};
use crate::key::KeyRef;

thread_local! {
    /// Set on the worker thread, which must never wait on its own queue.
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

fn on_worker() -> bool {
    ON_WORKER.try_with(Cell::get).unwrap_or(false)
}

pub(crate) enum Notice {
    /// A key whose handle is gone and that no thread still pins.
    Reclaimed(Arc<KeyRef>),
    /// Answered once every notice queued before it has been swept.
    Sync(Sender<()>),
}

pub(crate) struct Reclaimer {
    notices: Option<Sender<Notice>>,
}

impl Reclaimer {
    /// The process-wide queue. The first call starts the worker unless
    /// background reclamation is disabled.
    pub(crate) fn global() -> &'static Reclaimer {
        static RECLAIMER: OnceLock<Reclaimer> = OnceLock::new();
        RECLAIMER.get_or_init(Reclaimer::start)
    }

    fn start() -> Self {
        let config = config::get();
        if !config.is_background_reclamation() {
            tracing::debug!("background reclamation disabled");
            return Self { notices: None };
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = Worker::new(rx, Roster::global(), config.roster_len());
        let spawned = std::thread::Builder::new()
            .name(config.thread_name().to_owned())
            .spawn(move || worker.run());
        match spawned {
            Ok(_) => {
                tracing::debug!(name = config.thread_name(), "started reclamation worker");
                Self { notices: Some(tx) }
            }
            Err(err) => {
                // Entries of dropped handles then only go away on rehash.
                tracing::warn!(%err, "failed to start reclamation worker");
                Self { notices: None }
            }
        }
    }

    pub(crate) fn notify(&self, key: Arc<KeyRef>) {
        let Some(notices) = &self.notices else {
            return;
        };
        if let Err(err) = notices.send(Notice::Reclaimed(key)) {
            tracing::warn!(key = ?err.0.key(), "reclamation worker is gone; dropping notice");
        }
    }

    /// Block until every notice queued before this call has been swept.
    /// Returns at once when no worker runs, or when called from the worker
    /// itself (a value dropped during a sweep).
    pub(crate) fn sync(&self) {
        let Some(notices) = &self.notices else {
            return;
        };
        if on_worker() {
            tracing::trace!("sync requested from the reclamation worker; not waiting");
            return;
        }
        let (done, wait) = crossbeam_channel::bounded(1);
        if notices.send(Notice::Sync(done)).is_ok() {
            let _ = wait.recv();
        }
    }
}

impl Notice {
    fn key(&self) -> Option<&KeyRef> {
        match self {
            Notice::Reclaimed(key) => Some(key),
            Notice::Sync(_) => None,
        }
    }
}

#[derive(Default)]
struct Batch {
    normal: Vec<Arc<KeyRef>>,
    inheritable: Vec<Arc<KeyRef>>,
    waiters: Vec<Sender<()>>,
}

impl Batch {
    fn accept(&mut self, notice: Notice) {
        match notice {
            Notice::Reclaimed(key) if key.is_inheritable() => self.inheritable.push(key),
            Notice::Reclaimed(key) => self.normal.push(key),
            Notice::Sync(waiter) => self.waiters.push(waiter),
        }
    }

    fn keys(&self) -> usize {
        self.normal.len() + self.inheritable.len()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WorkerState {
    /// Blocked on the queue.
    Waiting,
    /// Taking everything already queued, without blocking.
    Draining,
    /// Removing the batch from every registered context.
    Sweeping,
}

pub(crate) struct Worker {
    notices: Receiver<Notice>,
    roster: &'static Roster,
    threads: Vec<Option<Arc<ThreadContext>>>,
    batch: Batch,
    state: WorkerState,
}

impl Worker {
    pub(crate) fn new(notices: Receiver<Notice>, roster: &'static Roster, buffer_len: usize) -> Self {
        Self {
            notices,
            roster,
            threads: vec![None; buffer_len.max(1)],
            batch: Batch::default(),
            state: WorkerState::Waiting,
        }
    }

    fn enter(&mut self, next: WorkerState) {
        tracing::trace!(from = ?self.state, to = ?next, "reclamation worker");
        self.state = next;
    }

    pub(crate) fn run(mut self) {
        ON_WORKER.with(|flag| flag.set(true));
        while self.step() {}
        tracing::debug!("reclamation queue closed; worker exiting");
    }

    /// Wait for one notice, take whatever else is already queued, sweep,
    /// then release sync waiters. Returns false once every sender is gone.
    pub(crate) fn step(&mut self) -> bool {
        debug_assert_eq!(self.state, WorkerState::Waiting);
        let Ok(first) = self.notices.recv() else {
            return false;
        };

        self.enter(WorkerState::Draining);
        self.batch.accept(first);
        while let Ok(notice) = self.notices.try_recv() {
            self.batch.accept(notice);
        }

        self.enter(WorkerState::Sweeping);
        self.sweep();
        for waiter in self.batch.waiters.drain(..) {
            let _ = waiter.send(());
        }

        self.enter(WorkerState::Waiting);
        true
    }

    fn sweep(&mut self) {
        let keys = self.batch.keys();
        if keys == 0 {
            return;
        }
        let threads = self.enumerate();
        let mut removed = 0usize;
        for context in self.threads[..threads].iter_mut().filter_map(Option::take) {
            let guard = epoch::pin();
            for key in &self.batch.normal {
                removed += usize::from(context.normal().remove(key, &guard));
            }
            for key in &self.batch.inheritable {
                removed += usize::from(context.inheritable().remove(key, &guard));
            }
        }
        self.batch.normal.clear();
        self.batch.inheritable.clear();
        // Hand the garbage over rather than leave it in an idle worker's bag.
        epoch::pin().flush();
        tracing::debug!(keys, threads, removed, "swept dead thread-local entries");
    }

    /// Snapshot the roster, doubling the buffer until it holds everyone.
    fn enumerate(&mut self) -> usize {
        loop {
            let count = self.roster.enumerate(&mut self.threads);
            if count < self.threads.len() {
                return count;
            }
            let len = self.threads.len() * 2;
            self.threads.resize(len, None);
            tracing::trace!(len, "grew roster buffer");
        }
    }
}
