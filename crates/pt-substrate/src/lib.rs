//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Substrate boundary traits, error type and backend registry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The pub/sub/query network the transport adapter binds to.
//!
//! A [`Substrate`] opens [`Connection`]s. A connection declares publishers,
//! subscribers and queryables, and issues queries. Handlers registered here
//! run on substrate-owned threads and must return quickly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pt_common::SessionConfig;

pub mod keyexpr;
pub mod memory;
pub mod registry;
pub mod reply;
pub mod sample;

pub use keyexpr::KeyExpr;
pub use memory::InMemorySubstrate;
pub use reply::{reply_channel, ReplyError, ReplyItem, ReplyReceiver, ReplySender};
pub use sample::{Attachment, Query, QueryHandler, ReplySink, Responder, Sample, SampleHandler};

/// Shared result type for substrate operations.
pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Failures reported by a substrate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubstrateError {
    #[error("invalid key expression '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("declaration on '{key}' refused: {reason}")]
    Refused { key: String, reason: String },
    #[error("connection {0} is closed")]
    Closed(String),
    #[error("write on '{key}' rejected: {reason}")]
    Rejected { key: String, reason: String },
    #[error("no substrate registered under '{0}'")]
    UnknownBackend(String),
    #[error("invalid start document: {0}")]
    StartDoc(String),
}

/// A pub/sub/query network that can open connections.
pub trait Substrate: Send + Sync {
    /// Name the backend is registered under.
    fn name(&self) -> &str;

    /// Establish a connection described by `config`.
    fn open(&self, config: &SessionConfig) -> Result<Arc<dyn Connection>>;
}

/// One live connection to a substrate.
///
/// Declarations return handles that revoke themselves when dropped.
pub trait Connection: Send + Sync {
    /// Stable identifier used in logs.
    fn id(&self) -> &str;

    fn declare_publisher(&self, key_expr: &KeyExpr) -> Result<Box<dyn PublisherHandle>>;

    fn declare_subscriber(
        &self,
        key_expr: &KeyExpr,
        handler: SampleHandler,
    ) -> Result<Box<dyn Declaration>>;

    fn declare_queryable(
        &self,
        key_expr: &KeyExpr,
        handler: QueryHandler,
    ) -> Result<Box<dyn Declaration>>;

    /// Issue a query. Replies, or a terminal [`ReplyError`], arrive on the
    /// returned receiver; the channel closes once the query is finished.
    fn query(
        &self,
        key_expr: &KeyExpr,
        payload: Bytes,
        attachment: Attachment,
        timeout: Duration,
    ) -> Result<ReplyReceiver>;

    /// Undeclare everything owned by this connection. Later operations fail
    /// with [`SubstrateError::Closed`]. Idempotent.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// A declared subscriber or queryable.
pub trait Declaration: Send + Sync {
    fn key_expr(&self) -> &KeyExpr;

    /// Revoke the declaration now rather than on drop.
    fn undeclare(self: Box<Self>) -> Result<()>;
}

/// A declared publisher.
pub trait PublisherHandle: Send + Sync {
    fn key_expr(&self) -> &KeyExpr;

    /// Publish one sample under the declared key.
    fn put(&self, payload: Bytes, attachment: &Attachment) -> Result<()>;
}
