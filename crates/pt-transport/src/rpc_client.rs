//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "RPC client: blocking first-reply-wins query."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::{Duration, Instant};

use pt_logging::{pt_debug, LogContext};
use pt_msg::{log_message, Message, MessageDirection};
use pt_substrate::{KeyExpr, ReplyError};

use crate::attributes::{attachment_for, message_from};
use crate::error::TransportError;
use crate::session::Session;
use crate::Result;

/// Result of a successful call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    /// Key the replier answered under.
    pub replier_topic: String,
    pub message: Message,
}

/// Issues queries against one topic key.
pub struct RpcClient {
    topic: KeyExpr,
    session: Session,
}

impl RpcClient {
    pub fn new(session: &Session, topic: &str) -> Result<Self> {
        let topic = KeyExpr::new(topic).map_err(|err| TransportError::declaration(topic, err))?;
        Ok(Self {
            topic,
            session: session.clone(),
        })
    }

    /// Validate `topic` and perform a single call.
    pub fn call_once(
        session: &Session,
        topic: &str,
        message: &Message,
        timeout: Duration,
    ) -> Result<RpcReply> {
        Self::new(session, topic)?.call(message, timeout)
    }

    /// Send `message` and block until the first reply arrives.
    ///
    /// The deadline is enforced by the substrate, which reports it as
    /// [`TransportError::Timeout`]. Replies after the first are discarded
    /// when the reply channel is dropped on return.
    pub fn call(&self, message: &Message, timeout: Duration) -> Result<RpcReply> {
        let started = Instant::now();
        log_message(MessageDirection::Request, self.topic.as_str(), message);
        let replies = self
            .session
            .connection()
            .query(
                &self.topic,
                message.payload().clone(),
                attachment_for(message),
                timeout,
            )
            .map_err(|err| self.query_error(err.to_string()))?;

        let outcome = match replies.recv() {
            Some(Ok(sample)) => match message_from(&sample) {
                Some(reply) => Ok(RpcReply {
                    replier_topic: sample.key_expr.to_string(),
                    message: reply,
                }),
                None => Err(TransportError::MissingAttachment {
                    topic: self.topic.to_string(),
                }),
            },
            Some(Err(ReplyError::Timeout)) => Err(TransportError::Timeout {
                topic: self.topic.to_string(),
                timeout,
            }),
            Some(Err(ReplyError::Failed(reason))) => Err(self.query_error(reason)),
            None => Err(self.query_error("query finished without a reply".into())),
        };
        drop(replies);

        let elapsed = started.elapsed();
        pt_debug!(
            context = LogContext::new()
                .with_session(self.session.id())
                .with_component("rpc-client")
                .with_topic(self.topic.as_str()),
            "call finished in {:?}: {}",
            elapsed,
            if outcome.is_ok() { "reply" } else { "error" }
        );
        if let Ok(reply) = &outcome {
            log_message(MessageDirection::Reply, &reply.replier_topic, &reply.message);
            if let Some(metrics) = self.session.metrics() {
                metrics.observe_call_latency(elapsed);
            }
        }
        outcome
    }

    pub fn topic(&self) -> &str {
        self.topic.as_str()
    }

    fn query_error(&self, reason: String) -> TransportError {
        TransportError::Query {
            topic: self.topic.to_string(),
            reason,
        }
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("topic", &self.topic.as_str())
            .field("session", &self.session.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_substrate::{InMemorySubstrate, QueryHandler, Sample};
    use std::sync::Arc;

    fn session() -> Session {
        let doc = format!("network = \"rpc-client-{}\"", uuid::Uuid::new_v4());
        Session::with_substrate(&InMemorySubstrate, &doc).expect("session opens")
    }

    #[test]
    fn invalid_topic_is_a_declaration_error() {
        let session = session();
        let err = RpcClient::new(&session, "svc//echo").expect_err("invalid");
        assert!(matches!(err, TransportError::Declaration { .. }));
    }

    #[test]
    fn no_queryable_times_out() {
        let session = session();
        let client = RpcClient::new(&session, "svc/none").expect("client");
        let err = client
            .call(&Message::from_static(b"ping", b""), Duration::from_millis(100))
            .expect_err("timeout");
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[test]
    fn reply_without_attachment_is_missing_attachment() {
        let session = session();
        let handler: QueryHandler = Arc::new(|query: pt_substrate::Query| {
            let reply = Sample::new(query.key_expr.clone(), query.payload.clone(), None);
            query.responder.reply(reply).expect("reply");
        });
        let key = KeyExpr::new("svc/bare").expect("key");
        let _queryable = session
            .connection()
            .declare_queryable(&key, handler)
            .expect("queryable");

        let err = RpcClient::call_once(
            &session,
            "svc/bare",
            &Message::from_static(b"ping", b""),
            Duration::from_secs(2),
        )
        .expect_err("malformed reply");
        assert!(matches!(err, TransportError::MissingAttachment { .. }));
    }

    #[test]
    fn maximum_timeout_still_returns_the_reply() {
        let session = session();
        let echo: crate::RpcServerCallback = Arc::new(|_: &str, request: &Message| Some(request.clone()));
        let _server = crate::RpcServer::new(&session, "svc/echo", echo, 1).expect("server");

        let reply = RpcClient::call_once(
            &session,
            "svc/echo",
            &Message::from_static(b"ping", b"k=v"),
            Duration::MAX,
        )
        .expect("reply");
        assert_eq!(reply.message.payload().as_ref(), b"ping");
        assert_eq!(reply.message.attributes().as_ref(), b"k=v");
    }

    #[test]
    fn closed_session_is_a_query_error() {
        let session = session();
        let client = RpcClient::new(&session, "svc/echo").expect("client");
        session.connection().close().expect("close");
        let err = client
            .call(&Message::default(), Duration::from_millis(50))
            .expect_err("closed");
        assert!(matches!(err, TransportError::Query { .. }));
    }
}
