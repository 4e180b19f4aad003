//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "RPC server: queries answered by a worker pool through one-shot responders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pt_common::WorkerConfig;
use pt_logging::{pt_debug, pt_warn, LogContext};
use pt_msg::{log_message, Message, MessageDirection};
use pt_substrate::{KeyExpr, Query, QueryHandler, Responder, Sample};

use crate::attributes::{attachment_for, attributes_of};
use crate::error::TransportError;
use crate::service::{ComponentState, DrainingService};
use crate::session::Session;
use crate::Result;

/// User callback invoked as `(query_key, request)`. Returning `None` leaves
/// the query unanswered.
pub type RpcServerCallback = Arc<dyn Fn(&str, &Message) -> Option<Message> + Send + Sync>;

struct RpcRequest {
    query_key: KeyExpr,
    message: Message,
    responder: Responder,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    replied: AtomicU64,
    unanswered: AtomicU64,
    reply_failures: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

/// Counters of an RPC server.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RpcServerStats {
    pub received: u64,
    pub replied: u64,
    /// Queries whose callback returned `None`.
    pub unanswered: u64,
    /// Replies the substrate refused.
    pub reply_failures: u64,
    /// Queries without the attributes attachment.
    pub malformed: u64,
    /// Queries the queue refused.
    pub dropped: u64,
    pub panicked: u64,
}

/// Query-answering capability bound to one topic key.
pub struct RpcServer {
    service: DrainingService<RpcRequest>,
    counters: Arc<Counters>,
}

impl RpcServer {
    pub fn new(
        session: &Session,
        topic: &str,
        callback: RpcServerCallback,
        thread_count: usize,
    ) -> Result<Self> {
        Self::with_config(
            session,
            topic,
            callback,
            &WorkerConfig::default().with_thread_count(thread_count),
        )
    }

    pub fn with_config(
        session: &Session,
        topic: &str,
        callback: RpcServerCallback,
        workers: &WorkerConfig,
    ) -> Result<Self> {
        let key = KeyExpr::new(topic).map_err(|err| TransportError::declaration(topic, err))?;
        let counters = Arc::new(Counters::default());
        let metrics = session.metrics();
        let session_id = session.id().to_owned();

        let worker_counters = Arc::clone(&counters);
        let worker_metrics = metrics.clone();
        let worker_session = session_id.clone();
        let served = topic.to_owned();
        let work = move |worker: usize, request: RpcRequest| {
            let RpcRequest {
                query_key,
                message,
                responder,
            } = request;
            log_message(MessageDirection::Request, query_key.as_str(), &message);
            let ctx = LogContext::new()
                .with_session(&worker_session)
                .with_component("rpc-server")
                .with_topic(&served)
                .with_worker(worker);

            match callback(query_key.as_str(), &message) {
                Some(result) => {
                    let reply = Sample::new(
                        query_key.clone(),
                        result.payload().clone(),
                        Some(attachment_for(&result)),
                    );
                    match responder.reply(reply) {
                        Ok(()) => {
                            worker_counters.replied.fetch_add(1, Ordering::Relaxed);
                            if let Some(metrics) = &worker_metrics {
                                metrics.observe_reply_sent();
                            }
                            log_message(MessageDirection::Reply, query_key.as_str(), &result);
                        }
                        Err(err) => {
                            worker_counters.reply_failures.fetch_add(1, Ordering::Relaxed);
                            pt_warn!(context = ctx, "reply to {} failed: {}", query_key, err);
                        }
                    }
                }
                None => {
                    responder.release();
                    worker_counters.unanswered.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &worker_metrics {
                        metrics.observe_unanswered();
                    }
                    pt_debug!(context = ctx, "no result to send for query {}", query_key);
                }
            }
        };

        let handler_counters = Arc::clone(&counters);
        let connection = session.connection();
        let service = DrainingService::start(session, "rpc-server", key, workers, work, |key, queue| {
            let served = topic.to_owned();
            let handler: QueryHandler = Arc::new(move |query: Query| {
                let ctx = || {
                    LogContext::new()
                        .with_session(&session_id)
                        .with_component("rpc-server")
                        .with_topic(&served)
                };
                let Query {
                    key_expr,
                    payload,
                    attachment,
                    responder,
                } = query;
                let Some(attributes) = attributes_of(attachment.as_ref()) else {
                    responder.release();
                    handler_counters.malformed.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &metrics {
                        metrics.observe_dropped();
                    }
                    pt_warn!(context = ctx(), "releasing query {} without attributes attachment", key_expr);
                    return;
                };
                let request = RpcRequest {
                    query_key: key_expr,
                    message: Message::new(payload, attributes),
                    responder,
                };
                match queue.push(request) {
                    Ok(()) => {
                        handler_counters.received.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        // The rejected request drops here, releasing its responder.
                        handler_counters.dropped.fetch_add(1, Ordering::Relaxed);
                        if let Some(metrics) = &metrics {
                            metrics.observe_dropped();
                        }
                        pt_debug!(context = ctx(), "query not queued: {}", err);
                    }
                }
            });
            connection.declare_queryable(key, handler)
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

    pub fn stats(&self) -> RpcServerStats {
        RpcServerStats {
            received: self.counters.received.load(Ordering::Relaxed),
            replied: self.counters.replied.load(Ordering::Relaxed),
            unanswered: self.counters.unanswered.load(Ordering::Relaxed),
            reply_failures: self.counters.reply_failures.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            panicked: self.service.pool_stats().panicked,
        }
    }

    /// Answer the queries already queued, join the workers, then revoke the
    /// queryable. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        self.service.shutdown();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.service.shutdown();
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("topic", &self.topic())
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pt_substrate::{Attachment, InMemorySubstrate, ReplyError};
    use std::time::Duration;

    fn session() -> Session {
        let doc = format!("network = \"rpc-server-{}\"", uuid::Uuid::new_v4());
        Session::with_substrate(&InMemorySubstrate, &doc).expect("session opens")
    }

    fn echo() -> RpcServerCallback {
        Arc::new(|_: &str, message: &Message| Some(message.clone()))
    }

    #[test]
    fn zero_threads_is_rejected() {
        let session = session();
        let err = RpcServer::new(&session, "svc/echo", echo(), 0).expect_err("zero threads");
        assert!(matches!(err, TransportError::InvalidThreadCount { .. }));
    }

    #[test]
    fn reply_is_tagged_with_query_key_and_result_attributes() {
        let session = session();
        let callback: RpcServerCallback =
            Arc::new(|_: &str, _: &Message| Some(Message::from_static(b"pong", b"served-by=unit")));
        let server = RpcServer::new(&session, "svc/echo", callback, 1).expect("server");

        let key = KeyExpr::new("svc/echo").expect("key");
        let replies = session
            .connection()
            .query(
                &key,
                Bytes::from_static(b"ping"),
                Attachment::single(crate::ATTRIBUTES_KEY, "k=v"),
                Duration::from_secs(2),
            )
            .expect("query issued");
        let sample = replies.recv().expect("reply").expect("ok");
        assert_eq!(sample.key_expr.as_str(), "svc/echo");
        assert_eq!(sample.payload.as_ref(), b"pong");
        assert_eq!(
            attributes_of(sample.attachment.as_ref()),
            Some(Bytes::from_static(b"served-by=unit"))
        );
        drop(replies);
        server.shutdown();
        assert_eq!(server.stats().replied, 1);
    }

    #[test]
    fn query_without_attachment_is_released_and_counted() {
        let session = session();
        let server = RpcServer::new(&session, "svc/echo", echo(), 1).expect("server");
        let key = KeyExpr::new("svc/echo").expect("key");
        let replies = session
            .connection()
            .query(&key, Bytes::from_static(b"ping"), Attachment::new(), Duration::from_millis(100))
            .expect("query issued");
        assert_eq!(replies.recv(), Some(Err(ReplyError::Timeout)));
        let stats = server.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.received, 0);
    }

    #[test]
    fn shutdown_twice_stops_cleanly() {
        let session = session();
        let server = RpcServer::new(&session, "svc/echo", echo(), 3).expect("server");
        assert_eq!(server.state(), ComponentState::Running);
        server.shutdown();
        server.shutdown();
        assert_eq!(server.state(), ComponentState::Stopped);
    }
}
