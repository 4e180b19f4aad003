//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process substrate used for tests, demos and single-process hosts."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Connections opened with the same `network` name share one router and see
//! each other's publications and queryables. Handlers are invoked on the
//! thread calling `put` or `query`, after the router lock is released.
//!
//! Every query is finished by a watchdog thread. The reply channel closes as
//! soon as all matched responders are released and at least one reply was
//! sent. Otherwise the deadline pushes [`ReplyError::Timeout`] (when nothing
//! was sent) and then closes the channel.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex, RwLock};
use pt_common::SessionConfig;
use pt_msg::PushError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::keyexpr::KeyExpr;
use crate::reply::{reply_channel, ReplyError, ReplyReceiver, ReplySender};
use crate::sample::{Attachment, Query, QueryHandler, ReplySink, Responder, Sample, SampleHandler};
use crate::{Connection, Declaration, PublisherHandle, Result, Substrate, SubstrateError};

/// Registry name of the in-process substrate.
pub const IN_MEMORY_BACKEND: &str = "in-memory";

static NETWORKS: Lazy<Mutex<IndexMap<String, Weak<Router>>>> =
    Lazy::new(|| Mutex::new(IndexMap::new()));

/// Substrate whose network lives inside the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemorySubstrate;

impl Substrate for InMemorySubstrate {
    fn name(&self) -> &str {
        IN_MEMORY_BACKEND
    }

    fn open(&self, config: &SessionConfig) -> Result<Arc<dyn Connection>> {
        config
            .validate()
            .map_err(|err| SubstrateError::StartDoc(format!("{err:#}")))?;
        let reply_capacity = NonZeroUsize::new(config.reply_capacity)
            .ok_or_else(|| SubstrateError::StartDoc("reply_capacity must be at least 1".into()))?;
        let connection = MemoryConnection::new(Router::for_network(&config.network), reply_capacity);
        info!(connection = %connection.id(), network = %config.network, "in-memory connection opened");
        Ok(Arc::new(connection))
    }
}

struct Route<H> {
    owner: Arc<str>,
    key_expr: KeyExpr,
    handler: H,
}

#[derive(Default)]
struct Tables {
    subscribers: IndexMap<u64, Route<SampleHandler>>,
    queryables: IndexMap<u64, Route<QueryHandler>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteKind {
    Subscriber,
    Queryable,
}

struct Router {
    network: String,
    next_id: AtomicU64,
    tables: RwLock<Tables>,
}

impl Router {
    fn for_network(network: &str) -> Arc<Router> {
        let mut networks = NETWORKS.lock();
        if let Some(router) = networks.get(network).and_then(Weak::upgrade) {
            return router;
        }
        networks.retain(|_, router| router.strong_count() > 0);
        let router = Arc::new(Router {
            network: network.to_owned(),
            next_id: AtomicU64::new(1),
            tables: RwLock::new(Tables::default()),
        });
        networks.insert(network.to_owned(), Arc::downgrade(&router));
        debug!(network = %network, "in-memory network created");
        router
    }

    fn add_subscriber(&self, owner: &Arc<str>, key_expr: &KeyExpr, handler: SampleHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let route = Route {
            owner: Arc::clone(owner),
            key_expr: key_expr.clone(),
            handler,
        };
        self.tables.write().subscribers.insert(id, route);
        id
    }

    fn add_queryable(&self, owner: &Arc<str>, key_expr: &KeyExpr, handler: QueryHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let route = Route {
            owner: Arc::clone(owner),
            key_expr: key_expr.clone(),
            handler,
        };
        self.tables.write().queryables.insert(id, route);
        id
    }

    fn remove(&self, kind: RouteKind, id: u64) -> bool {
        let mut tables = self.tables.write();
        match kind {
            RouteKind::Subscriber => tables.subscribers.shift_remove(&id).is_some(),
            RouteKind::Queryable => tables.queryables.shift_remove(&id).is_some(),
        }
    }

    fn remove_owner(&self, owner: &str) -> usize {
        let mut tables = self.tables.write();
        let before = tables.subscribers.len() + tables.queryables.len();
        tables.subscribers.retain(|_, route| &*route.owner != owner);
        tables.queryables.retain(|_, route| &*route.owner != owner);
        before - tables.subscribers.len() - tables.queryables.len()
    }

    fn matching_subscribers(&self, key_expr: &KeyExpr) -> Vec<SampleHandler> {
        self.tables
            .read()
            .subscribers
            .values()
            .filter(|route| route.key_expr.intersects(key_expr))
            .map(|route| Arc::clone(&route.handler))
            .collect()
    }

    fn matching_queryables(&self, key_expr: &KeyExpr) -> Vec<QueryHandler> {
        self.tables
            .read()
            .queryables
            .values()
            .filter(|route| route.key_expr.intersects(key_expr))
            .map(|route| Arc::clone(&route.handler))
            .collect()
    }
}

struct ConnectionShared {
    id: Arc<str>,
    router: Arc<Router>,
    closed: AtomicBool,
}

impl ConnectionShared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SubstrateError::Closed(self.id.to_string()));
        }
        Ok(())
    }
}

/// Connection to an in-process network.
pub struct MemoryConnection {
    shared: Arc<ConnectionShared>,
    reply_capacity: NonZeroUsize,
}

impl MemoryConnection {
    fn new(router: Arc<Router>, reply_capacity: NonZeroUsize) -> Self {
        let id: Arc<str> = Arc::from(format!("mem-{}", Uuid::new_v4()));
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                router,
                closed: AtomicBool::new(false),
            }),
            reply_capacity,
        }
    }

    /// Network name this connection routes on.
    pub fn network(&self) -> &str {
        &self.shared.router.network
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn declare_publisher(&self, key_expr: &KeyExpr) -> Result<Box<dyn PublisherHandle>> {
        self.shared.ensure_open()?;
        if key_expr.is_wild() {
            return Err(SubstrateError::Refused {
                key: key_expr.to_string(),
                reason: "publishers need a concrete key".into(),
            });
        }
        debug!(connection = %self.shared.id, key = %key_expr, "publisher declared");
        Ok(Box::new(MemoryPublisher {
            key_expr: key_expr.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn declare_subscriber(
        &self,
        key_expr: &KeyExpr,
        handler: SampleHandler,
    ) -> Result<Box<dyn Declaration>> {
        self.shared.ensure_open()?;
        let id = self
            .shared
            .router
            .add_subscriber(&self.shared.id, key_expr, handler);
        debug!(connection = %self.shared.id, key = %key_expr, id, "subscriber declared");
        Ok(Box::new(MemoryDeclaration {
            id,
            kind: RouteKind::Subscriber,
            key_expr: key_expr.clone(),
            shared: Arc::clone(&self.shared),
            active: true,
        }))
    }

    fn declare_queryable(
        &self,
        key_expr: &KeyExpr,
        handler: QueryHandler,
    ) -> Result<Box<dyn Declaration>> {
        self.shared.ensure_open()?;
        let id = self
            .shared
            .router
            .add_queryable(&self.shared.id, key_expr, handler);
        debug!(connection = %self.shared.id, key = %key_expr, id, "queryable declared");
        Ok(Box::new(MemoryDeclaration {
            id,
            kind: RouteKind::Queryable,
            key_expr: key_expr.clone(),
            shared: Arc::clone(&self.shared),
            active: true,
        }))
    }

    fn query(
        &self,
        key_expr: &KeyExpr,
        payload: Bytes,
        attachment: Attachment,
        timeout: Duration,
    ) -> Result<ReplyReceiver> {
        self.shared.ensure_open()?;
        let queryables = self.shared.router.matching_queryables(key_expr);
        let (sender, receiver) = reply_channel(self.reply_capacity);
        let tracker = Arc::new(QueryTracker::new(key_expr.clone(), sender, queryables.len()));

        // `None` when the timeout is too large to represent: wait without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let watchdog = Arc::clone(&tracker);
        thread::Builder::new()
            .name("pt-mem-query".into())
            .spawn(move || watchdog.finish(deadline))
            .map_err(|err| SubstrateError::Rejected {
                key: key_expr.to_string(),
                reason: format!("failed to start query watchdog: {err}"),
            })?;

        let abandoned = Arc::clone(&tracker);
        let receiver = receiver.on_close(move || abandoned.abandon());

        debug!(
            connection = %self.shared.id,
            key = %key_expr,
            queryables = queryables.len(),
            timeout_ms = timeout.as_millis() as u64,
            "query issued"
        );
        let attachment = (!attachment.is_empty()).then_some(attachment);
        for handler in queryables {
            let sink = MemoryReplySink {
                tracker: Arc::clone(&tracker),
            };
            handler(Query {
                key_expr: key_expr.clone(),
                payload: payload.clone(),
                attachment: attachment.clone(),
                responder: Responder::new(key_expr.clone(), Box::new(sink)),
            });
        }
        Ok(receiver)
    }

    fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let removed = self.shared.router.remove_owner(&self.shared.id);
        info!(connection = %self.shared.id, network = %self.shared.router.network, removed, "in-memory connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MemoryPublisher {
    key_expr: KeyExpr,
    shared: Arc<ConnectionShared>,
}

impl PublisherHandle for MemoryPublisher {
    fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    fn put(&self, payload: Bytes, attachment: &Attachment) -> Result<()> {
        self.shared.ensure_open()?;
        let handlers = self.shared.router.matching_subscribers(&self.key_expr);
        let sample = Sample::new(
            self.key_expr.clone(),
            payload,
            (!attachment.is_empty()).then(|| attachment.clone()),
        );
        for handler in handlers {
            handler(sample.clone());
        }
        Ok(())
    }
}

struct MemoryDeclaration {
    id: u64,
    kind: RouteKind,
    key_expr: KeyExpr,
    shared: Arc<ConnectionShared>,
    active: bool,
}

impl MemoryDeclaration {
    fn revoke(&mut self) {
        if std::mem::take(&mut self.active) && self.shared.router.remove(self.kind, self.id) {
            debug!(connection = %self.shared.id, key = %self.key_expr, kind = ?self.kind, "undeclared");
        }
    }
}

impl Declaration for MemoryDeclaration {
    fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    fn undeclare(mut self: Box<Self>) -> Result<()> {
        self.revoke();
        Ok(())
    }
}

impl Drop for MemoryDeclaration {
    fn drop(&mut self) {
        self.revoke();
    }
}

#[derive(Default)]
struct Progress {
    outstanding: usize,
    replies: usize,
    abandoned: bool,
}

struct QueryTracker {
    key_expr: KeyExpr,
    sender: ReplySender,
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl QueryTracker {
    fn new(key_expr: KeyExpr, sender: ReplySender, outstanding: usize) -> Self {
        Self {
            key_expr,
            sender,
            progress: Mutex::new(Progress {
                outstanding,
                ..Progress::default()
            }),
            changed: Condvar::new(),
        }
    }

    fn deliver(&self, sample: Sample) -> Result<()> {
        let mut progress = self.progress.lock();
        match self.sender.send(Ok(sample)) {
            Ok(()) => {
                progress.replies += 1;
                Ok(())
            }
            Err(PushError::Full(_)) => Err(SubstrateError::Rejected {
                key: self.key_expr.to_string(),
                reason: "reply channel full".into(),
            }),
            Err(PushError::Closed(_)) => Err(SubstrateError::Rejected {
                key: self.key_expr.to_string(),
                reason: "query already finished".into(),
            }),
        }
    }

    fn release(&self) {
        let mut progress = self.progress.lock();
        progress.outstanding = progress.outstanding.saturating_sub(1);
        self.changed.notify_all();
    }

    fn abandon(&self) {
        self.progress.lock().abandoned = true;
        self.changed.notify_all();
    }

    fn finish(&self, deadline: Option<Instant>) {
        let mut progress = self.progress.lock();
        loop {
            if progress.abandoned || (progress.outstanding == 0 && progress.replies > 0) {
                break;
            }
            let Some(deadline) = deadline else {
                if progress.outstanding == 0 {
                    // Nothing left that could answer.
                    let failed = ReplyError::Failed("every queryable released the query unanswered".into());
                    if self.sender.send(Err(failed)).is_err() {
                        warn!(key = %self.key_expr, "could not report unanswered query");
                    }
                    break;
                }
                self.changed.wait(&mut progress);
                continue;
            };
            if Instant::now() >= deadline {
                if progress.replies == 0 && self.sender.send(Err(ReplyError::Timeout)).is_err() {
                    warn!(key = %self.key_expr, "could not report query timeout");
                }
                debug!(key = %self.key_expr, replies = progress.replies, "query deadline reached");
                break;
            }
            self.changed.wait_until(&mut progress, deadline);
        }
        drop(progress);
        self.sender.close();
    }
}

struct MemoryReplySink {
    tracker: Arc<QueryTracker>,
}

impl ReplySink for MemoryReplySink {
    fn send(self: Box<Self>, sample: Sample) -> Result<()> {
        self.tracker.deliver(sample)
    }
}

impl Drop for MemoryReplySink {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn open(network: &str) -> Arc<dyn Connection> {
        let config = SessionConfig {
            network: network.to_owned(),
            ..SessionConfig::default()
        };
        InMemorySubstrate.open(&config).expect("open connection")
    }

    fn network() -> String {
        format!("memory-test-{}", Uuid::new_v4())
    }

    fn key(s: &str) -> KeyExpr {
        KeyExpr::new(s).expect("key")
    }

    fn attributes(value: &'static [u8]) -> Attachment {
        Attachment::single("attributes", Bytes::from_static(value))
    }

    fn recording_subscriber(connection: &Arc<dyn Connection>, topic: &str) -> (Box<dyn Declaration>, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: SampleHandler = Arc::new(move |sample: Sample| {
            let _ = tx.lock().send(sample);
        });
        let declaration = connection
            .declare_subscriber(&key(topic), handler)
            .expect("declare subscriber");
        (declaration, rx)
    }

    #[test]
    fn publication_reaches_subscriber_on_same_network() {
        let net = network();
        let publisher_side = open(&net);
        let subscriber_side = open(&net);
        let (_subscription, rx) = recording_subscriber(&subscriber_side, "t/1");

        let publisher = publisher_side.declare_publisher(&key("t/1")).expect("publisher");
        publisher.put(Bytes::from_static(b"hello"), &attributes(b"k=v")).expect("put");

        let sample = rx.recv_timeout(Duration::from_secs(1)).expect("sample delivered");
        assert_eq!(sample.key_expr.as_str(), "t/1");
        assert_eq!(sample.payload.as_ref(), b"hello");
        assert_eq!(
            sample.attachment.and_then(|a| a.get("attributes").cloned()),
            Some(Bytes::from_static(b"k=v"))
        );
    }

    #[test]
    fn networks_are_isolated() {
        let a = open(&network());
        let b = open(&network());
        let (_subscription, rx) = recording_subscriber(&b, "t/1");
        let publisher = a.declare_publisher(&key("t/1")).expect("publisher");
        publisher.put(Bytes::from_static(b"x"), &Attachment::new()).expect("put");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn wildcard_subscriber_matches_and_empty_attachment_is_absent() {
        let connection = open(&network());
        let (_subscription, rx) = recording_subscriber(&connection, "sensors/**");
        let publisher = connection.declare_publisher(&key("sensors/room/temp")).expect("publisher");
        publisher.put(Bytes::from_static(b"21"), &Attachment::new()).expect("put");
        let sample = rx.try_recv().expect("delivered synchronously");
        assert_eq!(sample.key_expr.as_str(), "sensors/room/temp");
        assert!(sample.attachment.is_none());
    }

    #[test]
    fn wildcard_publisher_is_refused() {
        let connection = open(&network());
        let err = connection.declare_publisher(&key("t/*")).err().expect("refused");
        assert!(matches!(err, SubstrateError::Refused { .. }));
    }

    #[test]
    fn undeclared_subscriber_stops_receiving() {
        let connection = open(&network());
        let (subscription, rx) = recording_subscriber(&connection, "t/1");
        subscription.undeclare().expect("undeclare");
        let publisher = connection.declare_publisher(&key("t/1")).expect("publisher");
        publisher.put(Bytes::from_static(b"x"), &Attachment::new()).expect("put");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn query_without_queryable_times_out() {
        let connection = open(&network());
        let started = Instant::now();
        let replies = connection
            .query(&key("svc/none"), Bytes::new(), attributes(b""), Duration::from_millis(100))
            .expect("query issued");
        assert_eq!(replies.recv(), Some(Err(ReplyError::Timeout)));
        assert_eq!(replies.recv(), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn unbounded_timeout_waits_for_the_reply() {
        let connection = open(&network());
        let handler: QueryHandler = Arc::new(|query: Query| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let reply = Sample::new(query.key_expr.clone(), query.payload.clone(), query.attachment.clone());
                query.responder.reply(reply).expect("reply accepted");
            });
        });
        let _queryable = connection.declare_queryable(&key("svc/slow"), handler).expect("queryable");

        let replies = connection
            .query(&key("svc/slow"), Bytes::from_static(b"ping"), attributes(b""), Duration::MAX)
            .expect("query issued");
        let sample = replies.recv().expect("reply").expect("not a timeout");
        assert_eq!(sample.payload.as_ref(), b"ping");
        assert_eq!(replies.recv(), None);
    }

    #[test]
    fn unbounded_timeout_fails_once_every_queryable_releases() {
        let connection = open(&network());
        let handler: QueryHandler = Arc::new(|query: Query| query.responder.release());
        let _queryable = connection.declare_queryable(&key("svc/mute"), handler).expect("queryable");

        let replies = connection
            .query(&key("svc/mute"), Bytes::new(), attributes(b""), Duration::MAX)
            .expect("query issued");
        assert!(matches!(replies.recv(), Some(Err(ReplyError::Failed(_)))));
        assert_eq!(replies.recv(), None);
    }

    #[test]
    fn answered_query_closes_before_deadline() {
        let connection = open(&network());
        let handler: QueryHandler = Arc::new(|query: Query| {
            let reply = Sample::new(query.key_expr.clone(), query.payload.clone(), query.attachment.clone());
            query.responder.reply(reply).expect("reply accepted");
        });
        let _queryable = connection.declare_queryable(&key("svc/echo"), handler).expect("queryable");

        let started = Instant::now();
        let replies = connection
            .query(&key("svc/echo"), Bytes::from_static(b"ping"), attributes(b"a"), Duration::from_secs(10))
            .expect("query issued");
        let reply = replies.recv().expect("reply").expect("ok");
        assert_eq!(reply.payload.as_ref(), b"ping");
        assert_eq!(replies.recv(), None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn released_query_without_reply_times_out() {
        let connection = open(&network());
        let handler: QueryHandler = Arc::new(|query: Query| query.responder.release());
        let _queryable = connection.declare_queryable(&key("svc/silent"), handler).expect("queryable");
        let replies = connection
            .query(&key("svc/silent"), Bytes::new(), Attachment::new(), Duration::from_millis(50))
            .expect("query issued");
        assert_eq!(replies.recv(), Some(Err(ReplyError::Timeout)));
    }

    #[test]
    fn reply_after_receiver_dropped_is_rejected() {
        let connection = open(&network());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: QueryHandler = Arc::new(move |query: Query| {
            let _ = tx.lock().send(query);
        });
        let _queryable = connection.declare_queryable(&key("svc/late"), handler).expect("queryable");
        let replies = connection
            .query(&key("svc/late"), Bytes::new(), Attachment::new(), Duration::from_secs(5))
            .expect("query issued");
        let query = rx.try_recv().expect("query captured");
        drop(replies);
        let reply = Sample::new(key("svc/late"), Bytes::new(), None);
        let err = query.responder.reply(reply).expect_err("late reply");
        assert!(matches!(err, SubstrateError::Rejected { .. }));
    }

    #[test]
    fn closing_connection_removes_routes_and_fails_operations() {
        let net = network();
        let owner = open(&net);
        let other = open(&net);
        let (_subscription, rx) = recording_subscriber(&owner, "t/1");
        owner.close().expect("close");
        owner.close().expect("close is idempotent");
        assert!(owner.is_closed());

        let publisher = other.declare_publisher(&key("t/1")).expect("publisher");
        publisher.put(Bytes::from_static(b"x"), &Attachment::new()).expect("put");
        assert!(rx.try_recv().is_err());

        let err = owner.declare_publisher(&key("t/1")).err().expect("closed");
        assert!(matches!(err, SubstrateError::Closed(_)));
    }

    #[test]
    fn zero_reply_capacity_is_refused() {
        let config = SessionConfig {
            reply_capacity: 0,
            ..SessionConfig::default()
        };
        assert!(InMemorySubstrate.open(&config).is_err());
    }
}
