//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Logging helpers shared by every transport component.
//!
//! Components attach a [`LogContext`] (session, component kind, topic key,
//! worker index) to their events so that a single subscription or queryable
//! can be followed across the substrate delivery thread and the worker pool.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for development.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Session identifier that owns the component.
    pub session: Option<&'a str>,
    /// Component kind (publisher, subscriber, rpc-client, rpc-server).
    pub component: Option<&'a str>,
    /// Topic key the component is bound to.
    pub topic: Option<&'a str>,
    /// Worker index inside the component's pool.
    pub worker: Option<usize>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session identifier.
    pub fn with_session(mut self, session: &'a str) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach a component kind.
    pub fn with_component(mut self, component: &'a str) -> Self {
        self.component = Some(component);
        self
    }

    /// Attach a topic key.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach a worker index.
    pub fn with_worker(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// High-level outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The transition completed successfully.
    Success,
    /// The transition failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (declared, shutdown, opened, closed).
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    // `tracing::event!` needs a constant level, hence the split.
    match outcome {
        LifecycleOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            session = ctx.session.unwrap_or(""),
            component = ctx.component.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            session = ctx.session.unwrap_or(""),
            component = ctx.component.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            message = %message
        ),
    }
}
