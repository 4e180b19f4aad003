//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Queue, worker pool and declaration lifecycle shared by subscriber and RPC server."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use pt_common::WorkerConfig;
use pt_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use pt_msg::{BoundedQueue, PoolMonitor, PoolSpec, PoolStats, QueueStats, WorkerPool};
use pt_substrate::{Declaration, KeyExpr, SubstrateError};

use crate::error::TransportError;
use crate::session::Session;
use crate::Result;

/// Lifecycle of a subscriber or RPC server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Queue and workers exist, declaration not yet accepted.
    Created,
    /// Declared and delivering.
    Running,
    /// Workers are draining the queue.
    ShuttingDown,
    /// Workers joined and declaration revoked.
    Stopped,
}

struct Parts {
    pool: Option<WorkerPool>,
    declaration: Option<Box<dyn Declaration>>,
}

/// A declaration whose inbound items are handed to a worker pool through a
/// queue.
pub(crate) struct DrainingService<T> {
    component: &'static str,
    topic: KeyExpr,
    session: Session,
    queue: Arc<BoundedQueue<T>>,
    state: Mutex<ComponentState>,
    parts: Mutex<Parts>,
    monitor: PoolMonitor,
}

impl<T: Send + 'static> DrainingService<T> {
    /// Start the workers, then declare with the substrate.
    ///
    /// `declare` receives the key and the queue the substrate handler must
    /// push onto.
    pub(crate) fn start<W, D>(
        session: &Session,
        component: &'static str,
        topic: KeyExpr,
        workers: &WorkerConfig,
        work: W,
        declare: D,
    ) -> Result<Self>
    where
        W: Fn(usize, T) + Send + Sync + 'static,
        D: FnOnce(&KeyExpr, Arc<BoundedQueue<T>>) -> std::result::Result<Box<dyn Declaration>, SubstrateError>,
    {
        if workers.thread_count == 0 {
            return Err(TransportError::InvalidThreadCount {
                topic: topic.to_string(),
                count: 0,
            });
        }

        let queue = Arc::new(BoundedQueue::from_config(workers.queue_capacity, workers.overflow));
        let spec = PoolSpec::new(format!("{component}:{topic}"), workers.thread_count)
            .with_metrics(session.metrics());
        let pool = WorkerPool::spawn(spec, Arc::clone(&queue), work).map_err(|source| {
            TransportError::Workers {
                topic: topic.to_string(),
                source,
            }
        })?;

        let service = Self {
            component,
            session: session.clone(),
            queue: Arc::clone(&queue),
            state: Mutex::new(ComponentState::Created),
            monitor: pool.monitor(),
            parts: Mutex::new(Parts {
                pool: Some(pool),
                declaration: None,
            }),
            topic,
        };

        match declare(&service.topic, queue) {
            Ok(declaration) => {
                service.parts.lock().declaration = Some(declaration);
                *service.state.lock() = ComponentState::Running;
                service.lifecycle(
                    "declared",
                    &format!("{} worker(s) running", workers.thread_count),
                    LifecycleOutcome::Success,
                );
                Ok(service)
            }
            Err(err) => {
                service.lifecycle("declared", &err.to_string(), LifecycleOutcome::Fault);
                // Dropping `service` stops the workers that were started.
                Err(TransportError::declaration(service.topic.as_str(), err))
            }
        }
    }

    pub(crate) fn topic(&self) -> &KeyExpr {
        &self.topic
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    pub(crate) fn pool_stats(&self) -> PoolStats {
        self.monitor.stats()
    }

    pub(crate) fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Drain the queue, join the workers, then revoke the declaration.
    ///
    /// Only the first call does the work; later or concurrent calls return
    /// immediately. The `parts` lock is not held while joining, so a callback
    /// may shut down its own component.
    pub(crate) fn shutdown(&self) {
        let Some(mut pool) = self.parts.lock().pool.take() else {
            return;
        };
        *self.state.lock() = ComponentState::ShuttingDown;

        pool.shutdown();
        drop(pool);

        let declaration = self.parts.lock().declaration.take();
        let outcome = match declaration.map(|declaration| declaration.undeclare()) {
            Some(Err(err)) => {
                self.lifecycle("shutdown", &format!("undeclare failed: {err}"), LifecycleOutcome::Fault);
                LifecycleOutcome::Fault
            }
            _ => LifecycleOutcome::Success,
        };
        *self.state.lock() = ComponentState::Stopped;
        if outcome == LifecycleOutcome::Success {
            let stats = self.monitor.stats();
            self.lifecycle(
                "shutdown",
                &format!("processed {} item(s), {} panicked", stats.processed, stats.panicked),
                LifecycleOutcome::Success,
            );
        }
    }

    fn lifecycle(&self, event: &str, message: &str, outcome: LifecycleOutcome) {
        let ctx = LogContext::new()
            .with_session(self.session.id())
            .with_component(self.component)
            .with_topic(self.topic.as_str());
        log_lifecycle_event(Some(&ctx), event, message, outcome);
    }
}

impl<T> Drop for DrainingService<T> {
    fn drop(&mut self) {
        // Parts drop in field order otherwise; keep drain-join-revoke.
        let parts = self.parts.get_mut();
        if let Some(mut pool) = parts.pool.take() {
            pool.shutdown();
        }
        parts.declaration.take();
    }
}
