//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Subscriber: substrate deliveries fanned out to a worker pool."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pt_common::WorkerConfig;
use pt_logging::{pt_debug, pt_warn, LogContext};
use pt_msg::{log_message, Message, MessageDirection, TransportMetricsExporter};
use pt_substrate::{KeyExpr, Sample, SampleHandler};

use crate::attributes::message_from;
use crate::error::TransportError;
use crate::service::{ComponentState, DrainingService};
use crate::session::Session;
use crate::Result;

/// User callback invoked as `(origin_topic, subscribed_topic, message)` on a
/// worker thread.
pub type SubscriberCallback = Arc<dyn Fn(&str, &str, &Message) + Send + Sync>;

struct SubInfo {
    origin_topic: KeyExpr,
    message: Message,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

/// Counters of a subscriber.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Samples accepted onto the queue.
    pub received: u64,
    /// Callbacks that returned normally.
    pub processed: u64,
    /// Callbacks that panicked.
    pub panicked: u64,
    /// Samples without the attributes attachment.
    pub malformed: u64,
    /// Samples the queue refused (full, or shutting down).
    pub dropped: u64,
    /// Samples evicted by a drop-oldest queue.
    pub evicted: u64,
}

/// Receive capability bound to one topic key.
///
/// The substrate handler only enqueues; `thread_count` workers run the
/// callback. With one worker, callbacks observe delivery order.
pub struct Subscriber {
    service: DrainingService<SubInfo>,
    counters: Arc<Counters>,
}

impl Subscriber {
    /// Declare a subscriber with an unbounded queue and `thread_count`
    /// workers.
    pub fn new(
        session: &Session,
        topic: &str,
        callback: SubscriberCallback,
        thread_count: usize,
    ) -> Result<Self> {
        Self::with_config(
            session,
            topic,
            callback,
            &WorkerConfig::default().with_thread_count(thread_count),
        )
    }

    /// Declare a subscriber using an explicit worker and queue configuration.
    pub fn with_config(
        session: &Session,
        topic: &str,
        callback: SubscriberCallback,
        workers: &WorkerConfig,
    ) -> Result<Self> {
        let key = KeyExpr::new(topic).map_err(|err| TransportError::declaration(topic, err))?;
        let counters = Arc::new(Counters::default());
        let metrics = session.metrics();

        let subscribed = key.clone();
        let worker_metrics = metrics.clone();
        let work = move |_worker: usize, item: SubInfo| {
            log_message(MessageDirection::Inbound, item.origin_topic.as_str(), &item.message);
            callback(item.origin_topic.as_str(), subscribed.as_str(), &item.message);
            if let Some(metrics) = &worker_metrics {
                metrics.observe_delivered();
            }
        };

        let handler_counters = Arc::clone(&counters);
        let session_id = session.id().to_owned();
        let connection = session.connection();
        let service = DrainingService::start(session, "subscriber", key, workers, work, |key, queue| {
            let subscribed = topic.to_owned();
            let handler: SampleHandler = Arc::new(move |sample: Sample| {
                let Some(message) = message_from(&sample) else {
                    handler_counters.malformed.fetch_add(1, Ordering::Relaxed);
                    observe_dropped(metrics.as_ref());
                    pt_warn!(
                        context = LogContext::new()
                            .with_session(&session_id)
                            .with_component("subscriber")
                            .with_topic(&subscribed),
                        "dropping sample from {} without attributes attachment",
                        sample.key_expr
                    );
                    return;
                };
                let item = SubInfo {
                    origin_topic: sample.key_expr,
                    message,
                };
                match queue.push(item) {
                    Ok(()) => {
                        handler_counters.received.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        handler_counters.dropped.fetch_add(1, Ordering::Relaxed);
                        observe_dropped(metrics.as_ref());
                        pt_debug!(
                            context = LogContext::new()
                                .with_session(&session_id)
                                .with_component("subscriber")
                                .with_topic(&subscribed),
                            "sample not queued: {}",
                            err
                        );
                    }
                }
            });
            connection.declare_subscriber(key, handler)
        })?;

        Ok(Self { service, counters })
    }

    pub fn topic(&self) -> &str {
        self.service.topic().as_str()
    }

    pub fn session(&self) -> &Session {
        self.service.session()
    }

    pub fn state(&self) -> ComponentState {
        self.service.state()
    }

    pub fn stats(&self) -> SubscriberStats {
        let pool = self.service.pool_stats();
        SubscriberStats {
            received: self.counters.received.load(Ordering::Relaxed),
            processed: pool.processed,
            panicked: pool.panicked,
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            evicted: self.service.queue_stats().evicted,
        }
    }

    /// Stop delivery: queued samples are still handed to the callback, then
    /// the workers are joined and the declaration revoked. Idempotent; also
    /// run on drop.
    pub fn shutdown(&self) {
        self.service.shutdown();
    }
}

fn observe_dropped(metrics: Option<&TransportMetricsExporter>) {
    if let Some(metrics) = metrics {
        metrics.observe_dropped();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.service.shutdown();
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}
