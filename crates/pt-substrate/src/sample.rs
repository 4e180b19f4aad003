//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Samples, queries and the one-shot reply capability."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use indexmap::IndexMap;

use crate::keyexpr::KeyExpr;
use crate::SubstrateError;

/// Ordered map of named byte entries carried beside a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    entries: IndexMap<String, Bytes>,
}

impl Attachment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attachment holding a single entry.
    pub fn single(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        let mut attachment = Self::new();
        attachment.insert(name, value);
        attachment
    }

    /// Insert or replace an entry, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Option<Bytes> {
        self.entries.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// A value published under a key, or a reply to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub key_expr: KeyExpr,
    pub payload: Bytes,
    pub attachment: Option<Attachment>,
}

impl Sample {
    pub fn new(key_expr: KeyExpr, payload: impl Into<Bytes>, attachment: Option<Attachment>) -> Self {
        Self {
            key_expr,
            payload: payload.into(),
            attachment,
        }
    }
}

/// Substrate-side sink behind a [`Responder`].
///
/// `send` consumes the sink. Dropping a sink, sent or not, tells the
/// substrate this responder is finished with the query.
pub trait ReplySink: Send {
    fn send(self: Box<Self>, sample: Sample) -> Result<(), SubstrateError>;
}

/// One-shot capability to answer a single query.
///
/// Not `Clone`. [`Responder::reply`] takes it by value so a second reply
/// cannot be expressed; dropping it unanswered releases the query.
pub struct Responder {
    query_key: KeyExpr,
    sink: Box<dyn ReplySink>,
}

impl Responder {
    pub fn new(query_key: KeyExpr, sink: Box<dyn ReplySink>) -> Self {
        Self { query_key, sink }
    }

    /// Key expression of the query this responder answers.
    pub fn query_key(&self) -> &KeyExpr {
        &self.query_key
    }

    /// Send the one reply. The reply key must intersect the query's key
    /// expression.
    pub fn reply(self, sample: Sample) -> Result<(), SubstrateError> {
        if !sample.key_expr.intersects(&self.query_key) {
            return Err(SubstrateError::Rejected {
                key: sample.key_expr.to_string(),
                reason: format!("reply key does not match query '{}'", self.query_key),
            });
        }
        self.sink.send(sample)
    }

    /// Release the query without answering.
    pub fn release(self) {}
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("query_key", &self.query_key)
            .finish_non_exhaustive()
    }
}

/// An inbound query, handed to a queryable handler by value.
#[derive(Debug)]
pub struct Query {
    pub key_expr: KeyExpr,
    pub payload: Bytes,
    pub attachment: Option<Attachment>,
    pub responder: Responder,
}

/// Called by the substrate for each matching sample. Must not block.
pub type SampleHandler = Arc<dyn Fn(Sample) + Send + Sync>;

/// Called by the substrate for each matching query. Must not block.
pub type QueryHandler = Arc<dyn Fn(Query) + Send + Sync>;
