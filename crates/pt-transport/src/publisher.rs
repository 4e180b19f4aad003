//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Publisher: fire-and-forget send bound to one topic."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use parking_lot::Mutex;
use pt_logging::{pt_debug, LogContext};
use pt_msg::{log_message, Message, MessageDirection, TransportMetricsExporter};
use pt_substrate::{KeyExpr, PublisherHandle};

use crate::attributes::attachment_for;
use crate::error::TransportError;
use crate::session::Session;
use crate::Result;

/// Send capability bound to one concrete topic key.
///
/// `send` may be called from several threads; calls are serialised so the
/// substrate sees one write at a time. Dropping the publisher revokes the
/// declaration after any in-flight send has returned.
pub struct Publisher {
    topic: KeyExpr,
    handle: Mutex<Box<dyn PublisherHandle>>,
    metrics: Option<TransportMetricsExporter>,
    session: Session,
}

impl Publisher {
    /// Declare a publisher on `topic`. Wildcard keys are refused.
    pub fn declare(session: &Session, topic: &str) -> Result<Self> {
        let key = KeyExpr::concrete(topic).map_err(|err| TransportError::declaration(topic, err))?;
        let handle = session
            .connection()
            .declare_publisher(&key)
            .map_err(|err| TransportError::declaration(topic, err))?;
        pt_debug!(
            context = LogContext::new()
                .with_session(session.id())
                .with_component("publisher")
                .with_topic(topic),
            "publisher declared"
        );
        Ok(Self {
            topic: key,
            handle: Mutex::new(handle),
            metrics: session.metrics(),
            session: session.clone(),
        })
    }

    /// Publish `message` under the declared topic.
    pub fn send(&self, message: &Message) -> Result<()> {
        let attachment = attachment_for(message);
        {
            let handle = self.handle.lock();
            handle
                .put(message.payload().clone(), &attachment)
                .map_err(|source| TransportError::Send {
                    topic: self.topic.to_string(),
                    source,
                })?;
        }
        log_message(MessageDirection::Outbound, self.topic.as_str(), message);
        if let Some(metrics) = &self.metrics {
            metrics.observe_published();
        }
        Ok(())
    }

    pub fn topic(&self) -> &str {
        self.topic.as_str()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic.as_str())
            .field("session", &self.session.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_substrate::{InMemorySubstrate, SubstrateError};
    use std::sync::Arc;
    use std::thread;

    fn session() -> Session {
        let doc = format!("network = \"publisher-{}\"", uuid::Uuid::new_v4());
        Session::with_substrate(&InMemorySubstrate, &doc).expect("session opens")
    }

    #[test]
    fn invalid_topics_are_declaration_errors() {
        let session = session();
        for topic in ["", "t//1", "t/*", "t/**", "t/#"] {
            let err = Publisher::declare(&session, topic).expect_err("invalid topic");
            assert!(matches!(err, TransportError::Declaration { .. }), "{topic:?}");
        }
    }

    #[test]
    fn send_without_subscribers_succeeds() {
        let session = session();
        let publisher = Publisher::declare(&session, "t/1").expect("publisher");
        publisher
            .send(&Message::from_static(b"hello", b"k=v"))
            .expect("send");
        assert_eq!(publisher.topic(), "t/1");
    }

    #[test]
    fn concurrent_sends_are_serialised() {
        let session = session();
        let publisher = Arc::new(Publisher::declare(&session, "t/1").expect("publisher"));
        let senders: Vec<_> = (0..4)
            .map(|i| {
                let publisher = Arc::clone(&publisher);
                thread::spawn(move || {
                    for _ in 0..50 {
                        publisher
                            .send(&Message::new(vec![i as u8], Vec::new()))
                            .expect("send");
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().expect("sender thread");
        }
    }

    #[test]
    fn send_after_connection_closed_is_a_send_error() {
        let session = session();
        let publisher = Publisher::declare(&session, "t/1").expect("publisher");
        session.connection().close().expect("close");
        let err = publisher
            .send(&Message::from_static(b"late", b""))
            .expect_err("closed connection");
        match err {
            TransportError::Send { topic, source } => {
                assert_eq!(topic, "t/1");
                assert!(matches!(source, SubstrateError::Closed(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
