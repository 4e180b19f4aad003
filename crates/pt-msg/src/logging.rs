//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message activity logging and Prometheus metric handles."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

use crate::types::Message;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message handed to the substrate by a publisher.
    Outbound,
    /// Message delivered to a subscriber callback.
    Inbound,
    /// Request sent by an RPC client.
    Request,
    /// Reply produced by an RPC server.
    Reply,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, topic: &str, message: &Message) {
    debug!(
        topic = %topic,
        payload_bytes = message.payload().len(),
        attribute_bytes = message.attributes().len(),
        direction = ?direction,
        "transport activity"
    );
}

/// Prometheus metric handles for transport activity.
///
/// Cloning shares the underlying counters, so one exporter can be handed to
/// every primitive opened on a session.
#[derive(Clone)]
pub struct TransportMetricsExporter {
    published: IntCounter,
    delivered: IntCounter,
    dropped: IntCounter,
    callback_panics: IntCounter,
    replies_sent: IntCounter,
    unanswered: IntCounter,
    call_latency: Histogram,
}

impl TransportMetricsExporter {
    /// Register transport metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounter::with_opts(Opts::new(
            "pt_messages_published_total",
            "Messages handed to the substrate by publishers",
        ))?;
        let delivered = IntCounter::with_opts(Opts::new(
            "pt_messages_delivered_total",
            "Messages delivered to subscriber callbacks",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "pt_messages_dropped_total",
            "Incoming samples or queries dropped before reaching a callback",
        ))?;
        let callback_panics = IntCounter::with_opts(Opts::new(
            "pt_callback_panics_total",
            "User callbacks that panicked on a worker thread",
        ))?;
        let replies_sent = IntCounter::with_opts(Opts::new(
            "pt_rpc_replies_sent_total",
            "Replies sent by RPC servers",
        ))?;
        let unanswered = IntCounter::with_opts(Opts::new(
            "pt_rpc_unanswered_total",
            "Queries an RPC server callback declined to answer",
        ))?;
        let call_latency = Histogram::with_opts(HistogramOpts::new(
            "pt_rpc_call_latency_seconds",
            "Observed latency between an RPC request and its first reply",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(callback_panics.clone()))?;
        registry.register(Box::new(replies_sent.clone()))?;
        registry.register(Box::new(unanswered.clone()))?;
        registry.register(Box::new(call_latency.clone()))?;

        Ok(Self {
            published,
            delivered,
            dropped,
            callback_panics,
            replies_sent,
            unanswered,
            call_latency,
        })
    }

    /// Record a published message.
    pub fn observe_published(&self) {
        self.published.inc();
    }

    /// Record a message delivered to a callback.
    pub fn observe_delivered(&self) {
        self.delivered.inc();
    }

    /// Record an incoming item dropped before reaching a callback.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record a callback panic caught on a worker.
    pub fn observe_callback_panic(&self) {
        self.callback_panics.inc();
    }

    /// Record a reply sent by an RPC server.
    pub fn observe_reply_sent(&self) {
        self.replies_sent.inc();
    }

    /// Record a query left unanswered by an RPC server callback.
    pub fn observe_unanswered(&self) {
        self.unanswered.inc();
    }

    /// Record RPC call latency.
    pub fn observe_call_latency(&self, duration: Duration) {
        self.call_latency.observe(duration.as_secs_f64());
    }
}

impl std::fmt::Debug for TransportMetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetricsExporter")
            .field("published", &self.published.get())
            .field("delivered", &self.delivered.get())
            .field("dropped", &self.dropped.get())
            .finish_non_exhaustive()
    }
}
