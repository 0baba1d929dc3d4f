//! Change notifications for control words.
//!
//! Each event channel owns a [`WordWatcher`]: a thread that parks on one
//! control word and, whenever the word moves, records the new value as its
//! next expectation before handing the change to a dispatcher thread. Slow
//! callbacks only ever delay the dispatcher, never the re-arm.
//!
//! Changes that happen faster than the watcher wakes are coalesced, and a
//! word that moves away and back between two observations is not seen at
//! all. Consumers that need every header drain; events only say "look now".

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as StdOrdering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use shm_primitives::futex_wait;
use shm_primitives::sync::Ordering;
use tokio::sync::watch;

use crate::buffer::PoolBuffer;
use crate::control::Word;
use crate::wait::notify_all;

/// Upper bound on one watcher park, so a stop request is seen promptly even
/// when nobody wakes the word.
pub const WATCH_SLICE: Duration = Duration::from_millis(100);

/// Handle returned when registering a callback; pass it to `off` to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Decides whether a change from `prev` to `cur` is an event on a channel.
pub(crate) type ChangeFilter = fn(prev: u32, cur: u32) -> bool;

/// The header count moved to a non-zero value.
pub(crate) fn data_arrived(prev: u32, cur: u32) -> bool {
    cur != prev && cur != 0
}

/// The header count dropped, i.e. a drain freed slots.
pub(crate) fn space_freed(prev: u32, cur: u32) -> bool {
    cur < prev
}

pub(crate) fn any_change(prev: u32, cur: u32) -> bool {
    cur != prev
}

/// Ids are process-wide so one `off` can be routed to any channel.
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct Listeners {
    persistent: Mutex<Vec<(ListenerId, Callback)>>,
    once: Mutex<Vec<(ListenerId, Callback)>>,
}

impl Listeners {
    fn on(&self, callback: Callback) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, StdOrdering::Relaxed));
        self.persistent.lock().push((id, callback));
        id
    }

    fn once(&self, callback: Callback) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, StdOrdering::Relaxed));
        self.once.lock().push((id, callback));
        id
    }

    fn off(&self, id: ListenerId) -> bool {
        let mut removed = false;
        for list in [&self.persistent, &self.once] {
            let mut list = list.lock();
            let before = list.len();
            list.retain(|(existing, _)| *existing != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Run every listener once; one-shot listeners are consumed.
    ///
    /// Locks are released before any callback runs, so callbacks may register
    /// or remove listeners.
    fn dispatch(&self) {
        let persistent: Vec<Callback> = self
            .persistent
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        let once = std::mem::take(&mut *self.once.lock());

        for callback in persistent {
            callback();
        }
        for (_, callback) in once {
            callback();
        }
    }
}

struct Shared {
    name: &'static str,
    listeners: Listeners,
    latest: watch::Sender<u32>,
    stop: AtomicBool,
}

struct Threads {
    watcher: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Watches one control word and fans changes out to callbacks and
/// [`watch`] subscribers. Threads start on first use and stop on drop.
pub(crate) struct WordWatcher {
    buffer: PoolBuffer,
    word: Word,
    filter: ChangeFilter,
    shared: Arc<Shared>,
    threads: Mutex<Option<Threads>>,
}

impl WordWatcher {
    pub(crate) fn new(
        name: &'static str,
        buffer: PoolBuffer,
        word: Word,
        filter: ChangeFilter,
    ) -> Self {
        let current = buffer.control().word(word).load(Ordering::SeqCst);
        let (latest, _) = watch::channel(current);
        Self {
            buffer,
            word,
            filter,
            shared: Arc::new(Shared {
                name,
                listeners: Listeners::default(),
                latest,
                stop: AtomicBool::new(false),
            }),
            threads: Mutex::new(None),
        }
    }

    pub(crate) fn on(&self, callback: Callback) -> ListenerId {
        let id = self.shared.listeners.on(callback);
        self.ensure_running();
        id
    }

    pub(crate) fn once(&self, callback: Callback) -> ListenerId {
        let id = self.shared.listeners.once(callback);
        self.ensure_running();
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        self.shared.listeners.off(id)
    }

    /// Receiver whose value is the word as of the last event on this channel.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u32> {
        self.ensure_running();
        self.shared.latest.subscribe()
    }

    fn ensure_running(&self) {
        let mut threads = self.threads.lock();
        if threads.is_some() {
            return;
        }
        match self.spawn() {
            Ok(spawned) => *threads = Some(spawned),
            // Left unset so the next registration retries.
            Err(e) => tracing::warn!(
                channel = self.shared.name,
                error = %e,
                "failed to start event watcher"
            ),
        }
    }

    fn spawn(&self) -> std::io::Result<Threads> {
        let (events_tx, events_rx) = mpsc::channel::<u32>();

        let dispatcher = {
            let shared = self.shared.clone();
            thread::Builder::new()
                .name(format!("{}-dispatch", self.shared.name))
                .spawn(move || dispatch_loop(&shared, events_rx))?
        };

        let watcher = {
            let shared = self.shared.clone();
            let buffer = self.buffer.clone();
            let word = self.word;
            let filter = self.filter;
            let baseline = buffer.control().word(word).load(Ordering::SeqCst);
            thread::Builder::new()
                .name(format!("{}-watch", self.shared.name))
                .spawn(move || watch_loop(&shared, &buffer, word, filter, baseline, events_tx))?
        };

        tracing::debug!(channel = self.shared.name, word = ?self.word, "event watcher started");
        Ok(Threads {
            watcher,
            dispatcher,
        })
    }
}

fn watch_loop(
    shared: &Shared,
    buffer: &PoolBuffer,
    word: Word,
    filter: ChangeFilter,
    baseline: u32,
    events: mpsc::Sender<u32>,
) {
    let atomic = buffer.control().word(word);
    // Read by the registering thread, so changes made before this thread got
    // scheduled still count.
    let mut last = baseline;

    while !shared.stop.load(StdOrdering::Acquire) {
        futex_wait(atomic, last, Some(WATCH_SLICE));

        let current = atomic.load(Ordering::SeqCst);
        if current == last {
            continue;
        }
        let prev = last;
        last = current;
        if !filter(prev, current) {
            continue;
        }
        // Published here, not on the dispatcher, which may be stuck in a callback.
        shared.latest.send_replace(current);
        if events.send(current).is_err() {
            break;
        }
    }
}

fn dispatch_loop(shared: &Shared, events: mpsc::Receiver<u32>) {
    while let Ok(mut value) = events.recv() {
        // Collapse a backlog into one callback round.
        while let Ok(newer) = events.try_recv() {
            value = newer;
        }
        tracing::trace!(channel = shared.name, value, "dispatching listeners");
        shared.listeners.dispatch();
    }
}

impl Drop for WordWatcher {
    fn drop(&mut self) {
        let Some(threads) = self.threads.get_mut().take() else {
            return;
        };
        self.shared.stop.store(true, StdOrdering::Release);
        notify_all(self.buffer.control().word(self.word));

        // A callback that drops its own harvester or writer runs on the
        // dispatcher; joining it from there would deadlock.
        let current = thread::current().id();
        for handle in [threads.watcher, threads.dispatcher] {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(channel = self.shared.name, "event thread panicked");
            }
        }
    }
}
