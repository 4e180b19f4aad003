//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Blocking FIFO used to hand items from substrate threads to workers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Multi-producer, multi-consumer FIFO with blocking `pull`, non-blocking
//! `push` and an explicit exit signal.
//!
//! After [`BoundedQueue::exit`] the queue still hands out every item that was
//! pushed before the signal; only once it is empty do `pull` calls return
//! `None`. Pushes after the signal are handed back as [`PushError::Closed`].

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pt_common::OverflowPolicy;
use tracing::warn;

/// Reason a push did not enqueue its item. The item is handed back.
pub enum PushError<T> {
    /// Bounded queue was full and the overflow policy rejects new items.
    Full(T),
    /// The queue has been told to exit.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the item that was not enqueued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }

    /// True when the push failed because the queue was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, PushError::Closed(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("queue is full"),
            PushError::Closed(_) => f.write_str("queue has exited"),
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Snapshot of queue activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Items accepted by `push`.
    pub pushed: u64,
    /// Items handed out by `pull`/`try_pull`.
    pub pulled: u64,
    /// Pushes refused because the queue was full.
    pub rejected: u64,
    /// Items evicted by the drop-oldest policy.
    pub evicted: u64,
    /// Pushes refused because the queue had exited.
    pub closed: u64,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    pulled: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicU64,
}

struct State<T> {
    items: VecDeque<T>,
    exited: bool,
}

/// Thread-safe FIFO, unbounded or bounded with an explicit overflow policy.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    capacity: Option<NonZeroUsize>,
    overflow: OverflowPolicy,
    counters: Counters,
}

impl<T> BoundedQueue<T> {
    /// Queue that never refuses an item while running.
    pub fn unbounded() -> Self {
        Self::with_limits(None, OverflowPolicy::Reject)
    }

    /// Queue holding at most `capacity` items.
    pub fn bounded(capacity: NonZeroUsize, overflow: OverflowPolicy) -> Self {
        Self::with_limits(Some(capacity), overflow)
    }

    /// Build from configuration values; `None` or `Some(0)` means unbounded.
    pub fn from_config(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self::with_limits(capacity.and_then(NonZeroUsize::new), overflow)
    }

    fn with_limits(capacity: Option<NonZeroUsize>, overflow: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                exited: false,
            }),
            available: Condvar::new(),
            capacity,
            overflow,
            counters: Counters::default(),
        }
    }

    /// Enqueue without blocking.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let evicted = {
            let mut state = self.state.lock();
            if state.exited {
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
                return Err(PushError::Closed(item));
            }
            let mut evicted = None;
            if let Some(capacity) = self.capacity {
                if state.items.len() >= capacity.get() {
                    match self.overflow {
                        OverflowPolicy::Reject => {
                            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                            return Err(PushError::Full(item));
                        }
                        OverflowPolicy::DropOldest => {
                            evicted = state.items.pop_front();
                            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            state.items.push_back(item);
            self.counters.pushed.fetch_add(1, Ordering::Relaxed);
            evicted
        };
        self.available.notify_one();
        if evicted.is_some() {
            warn!(
                capacity = self.capacity.map(NonZeroUsize::get).unwrap_or_default(),
                "queue full; evicted oldest item"
            );
        }
        // `evicted` drops here, outside the lock.
        Ok(())
    }

    /// Block until an item is available or the queue has exited and drained.
    pub fn pull(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.counters.pulled.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            if state.exited {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`pull`](Self::pull) but gives up after `timeout`. A timeout
    /// too large to represent as a deadline behaves like `pull`.
    pub fn pull_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.pull();
        };
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.counters.pulled.fetch_add(1, Ordering::Relaxed);
                return Some(item);
            }
            if state.exited {
                return None;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                let item = state.items.pop_front();
                if item.is_some() {
                    self.counters.pulled.fetch_add(1, Ordering::Relaxed);
                }
                return item;
            }
        }
    }

    /// Take the head item if one is queued.
    pub fn try_pull(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.counters.pulled.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Signal shutdown and wake every blocked consumer. Idempotent.
    pub fn exit(&self) {
        self.state.lock().exited = true;
        self.available.notify_all();
    }

    pub fn is_exited(&self) -> bool {
        self.state.lock().exited
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` for an unbounded queue.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity.map(NonZeroUsize::get)
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.counters.pushed.load(Ordering::Relaxed),
            pulled: self.counters.pulled.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
        }
    }
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("overflow", &self.overflow)
            .field("exited", &self.is_exited())
            .finish()
    }
}
