//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fixed-size worker pool draining a BoundedQueue."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::logging::TransportMetricsExporter;
use crate::queue::BoundedQueue;
use crate::PoolError;

/// Snapshot of work performed by a pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Work items that completed normally.
    pub processed: u64,
    /// Work items whose unit of work panicked.
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    panicked: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            processed: self.processed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of a pool's counters that outlives the pool itself.
#[derive(Clone)]
pub struct PoolMonitor {
    counters: Arc<Counters>,
}

impl PoolMonitor {
    /// Processed and panicked counts so far.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

/// Naming, sizing and metrics for a pool about to be spawned.
#[derive(Clone)]
pub struct PoolSpec {
    name: String,
    thread_count: usize,
    metrics: Option<TransportMetricsExporter>,
}

impl PoolSpec {
    /// Threads are named `{name}-{index}`.
    pub fn new(name: impl Into<String>, thread_count: usize) -> Self {
        Self {
            name: name.into(),
            thread_count,
            metrics: None,
        }
    }

    /// Record callback panics into a Prometheus exporter as well.
    pub fn with_metrics(mut self, metrics: Option<TransportMetricsExporter>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Fixed set of threads running the same pull-then-work loop over one queue.
///
/// Every worker exits once the queue has exited and drained. Dropping the
/// pool signals the queue and joins all workers.
pub struct WorkerPool {
    name: String,
    handles: Vec<JoinHandle<()>>,
    exit: Box<dyn Fn() + Send + Sync>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Start `spec.thread_count` workers, each calling `work(worker_index, item)`
    /// for every item it pulls.
    ///
    /// A panic inside `work` is caught, logged and counted; the worker moves on
    /// to the next item.
    pub fn spawn<T, F>(spec: PoolSpec, queue: Arc<BoundedQueue<T>>, work: F) -> Result<Self, PoolError>
    where
        T: Send + 'static,
        F: Fn(usize, T) + Send + Sync + 'static,
    {
        if spec.thread_count == 0 {
            return Err(PoolError::ZeroThreads);
        }

        let work = Arc::new(work);
        let counters = Arc::new(Counters::default());
        let exit_queue = Arc::clone(&queue);
        let mut pool = Self {
            name: spec.name.clone(),
            handles: Vec::with_capacity(spec.thread_count),
            exit: Box::new(move || exit_queue.exit()),
            counters: Arc::clone(&counters),
        };

        for index in 0..spec.thread_count {
            let queue = Arc::clone(&queue);
            let work = Arc::clone(&work);
            let counters = Arc::clone(&counters);
            let metrics = spec.metrics.clone();
            let name = spec.name.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", spec.name, index))
                .spawn(move || {
                    worker_loop(&name, index, &queue, work.as_ref(), &counters, metrics.as_ref())
                });
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(err) => {
                    // Dropping `pool` exits the queue and joins what was started.
                    error!(pool = %spec.name, worker = index, error = %err, "failed to spawn worker");
                    return Err(PoolError::Spawn(err));
                }
            }
        }

        debug!(pool = %pool.name, threads = spec.thread_count, "worker pool started");
        Ok(pool)
    }

    /// Prefix used for worker thread names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers not yet joined.
    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Processed and panicked counts so far.
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Handle for reading counters without holding the pool.
    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Exit the queue and join every worker. Safe to call more than once.
    ///
    /// Workers finish the item they are processing; queued items are drained
    /// first. Called from one of the pool's own workers, that worker is
    /// detached instead of joined.
    pub fn shutdown(&mut self) {
        (self.exit)();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                warn!(pool = %self.name, "shutdown requested from a pool worker; detaching it");
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.handles.len())
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop<T, F>(
    name: &str,
    index: usize,
    queue: &BoundedQueue<T>,
    work: &F,
    counters: &Counters,
    metrics: Option<&TransportMetricsExporter>,
) where
    F: Fn(usize, T),
{
    while let Some(item) = queue.pull() {
        match panic::catch_unwind(AssertUnwindSafe(|| work(index, item))) {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                counters.panicked.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = metrics {
                    metrics.observe_callback_panic();
                }
                error!(
                    pool = %name,
                    worker = index,
                    panic = %panic_message(payload.as_ref()),
                    "work item panicked; worker continues"
                );
            }
        }
    }
    debug!(pool = %name, worker = index, "worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
