//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message value type, fan-in queue and worker pool primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod logging;
pub mod pool;
pub mod queue;
pub mod types;

/// Errors raised while starting a worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A pool needs at least one worker.
    #[error("worker pool requires at least one thread")]
    ZeroThreads,
    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub use logging::{log_message, MessageDirection, TransportMetricsExporter};
pub use pool::{PoolMonitor, PoolSpec, PoolStats, WorkerPool};
pub use pt_common::OverflowPolicy;
pub use queue::{BoundedQueue, PushError, QueueStats};
pub use types::Message;
