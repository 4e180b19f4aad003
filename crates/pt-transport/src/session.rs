//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Session: shared owner of one substrate connection."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use pt_common::SessionConfig;
use pt_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use pt_msg::TransportMetricsExporter;
use pt_substrate::{registry, Connection, Substrate, SubstrateError};

use crate::error::TransportError;
use crate::Result;

/// Owns one live substrate connection.
///
/// Cloning is cheap and shares the connection. Every publisher, subscriber
/// and RPC endpoint keeps a clone, so the connection stays open until the
/// last of them and the caller's own handle are gone; it is closed then.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connection: Arc<dyn Connection>,
    config: SessionConfig,
    metrics: RwLock<Option<TransportMetricsExporter>>,
}

impl Session {
    /// Open a session described by a TOML start document, resolving the
    /// backend through the substrate registry. An empty document uses the
    /// defaults.
    pub fn open(start_doc: &str) -> Result<Self> {
        let config = parse_start_doc(start_doc)?;
        let substrate = registry::lookup(&config.backend).map_err(TransportError::Connection)?;
        Self::establish(substrate.as_ref(), config)
    }

    /// Open a session on a substrate supplied by the caller. The document's
    /// `backend` entry is ignored.
    pub fn with_substrate(substrate: &dyn Substrate, start_doc: &str) -> Result<Self> {
        let config = parse_start_doc(start_doc)?;
        Self::establish(substrate, config)
    }

    /// Open a session from an already parsed configuration.
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let substrate = registry::lookup(&config.backend).map_err(TransportError::Connection)?;
        Self::establish(substrate.as_ref(), config.clone())
    }

    fn establish(substrate: &dyn Substrate, config: SessionConfig) -> Result<Self> {
        let connection = match substrate.open(&config) {
            Ok(connection) => connection,
            Err(err) => {
                let ctx = LogContext::new().with_component("session");
                log_lifecycle_event(
                    Some(&ctx),
                    "opened",
                    &format!("backend {} refused connection: {err}", substrate.name()),
                    LifecycleOutcome::Fault,
                );
                return Err(TransportError::Connection(err));
            }
        };
        let ctx = LogContext::new()
            .with_session(connection.id())
            .with_component("session");
        log_lifecycle_event(
            Some(&ctx),
            "opened",
            &format!("backend {} network {}", substrate.name(), config.network),
            LifecycleOutcome::Success,
        );
        Ok(Self {
            inner: Arc::new(SessionInner {
                connection,
                config,
                metrics: RwLock::new(None),
            }),
        })
    }

    /// Record activity of every component created afterwards into `metrics`.
    pub fn with_metrics(self, metrics: TransportMetricsExporter) -> Self {
        *self.inner.metrics.write() = Some(metrics);
        self
    }

    /// Connection identifier, used as the `session` log field.
    pub fn id(&self) -> &str {
        self.inner.connection.id()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.connection.is_closed()
    }

    pub(crate) fn connection(&self) -> &dyn Connection {
        self.inner.connection.as_ref()
    }

    pub(crate) fn metrics(&self) -> Option<TransportMetricsExporter> {
        self.inner.metrics.read().clone()
    }
}

fn parse_start_doc(start_doc: &str) -> Result<SessionConfig> {
    SessionConfig::from_start_doc(start_doc)
        .map_err(|err| TransportError::Connection(SubstrateError::StartDoc(format!("{err:#}"))))
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let ctx = LogContext::new()
            .with_session(self.connection.id())
            .with_component("session");
        match self.connection.close() {
            Ok(()) => log_lifecycle_event(Some(&ctx), "closed", "connection closed", LifecycleOutcome::Success),
            Err(err) => log_lifecycle_event(
                Some(&ctx),
                "closed",
                &format!("connection close failed: {err}"),
                LifecycleOutcome::Fault,
            ),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("backend", &self.inner.config.backend)
            .field("network", &self.inner.config.network)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_substrate::InMemorySubstrate;

    fn start_doc() -> String {
        format!("network = \"session-{}\"", uuid::Uuid::new_v4())
    }

    #[test]
    fn empty_start_doc_opens_default_backend() {
        let session = Session::open("").expect("session opens");
        assert_eq!(session.config().backend, "in-memory");
        assert!(!session.is_closed());
    }

    #[test]
    fn malformed_start_doc_is_a_connection_error() {
        let err = Session::open("network = ").expect_err("malformed doc");
        assert!(matches!(err, TransportError::Connection(SubstrateError::StartDoc(_))));
    }

    #[test]
    fn unknown_backend_is_a_connection_error() {
        let err = Session::open("backend = \"no-such-backend\"").expect_err("unknown backend");
        assert!(matches!(err, TransportError::Connection(SubstrateError::UnknownBackend(_))));
    }

    #[test]
    fn zero_reply_capacity_is_refused() {
        let err = Session::with_substrate(&InMemorySubstrate, "reply_capacity = 0").expect_err("refused");
        assert!(matches!(err, TransportError::Connection(_)));
    }

    #[test]
    fn clones_share_the_connection_until_last_drop() {
        let session = Session::with_substrate(&InMemorySubstrate, &start_doc()).expect("session opens");
        let clone = session.clone();
        assert_eq!(session.id(), clone.id());
        let connection = Arc::clone(&session.inner.connection);
        drop(session);
        assert!(!connection.is_closed());
        drop(clone);
        assert!(connection.is_closed());
    }
}
