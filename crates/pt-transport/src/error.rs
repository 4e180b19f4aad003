//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy surfaced by the transport primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use pt_msg::PoolError;
use pt_substrate::SubstrateError;

/// Errors returned by sessions, publishers, subscribers and RPC endpoints.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The session could not be opened.
    #[error("connection error: {0}")]
    Connection(#[source] SubstrateError),
    /// The topic key is invalid or the substrate refused the declaration.
    #[error("declaration on '{topic}' failed: {source}")]
    Declaration {
        topic: String,
        #[source]
        source: SubstrateError,
    },
    /// A single publish attempt failed; the caller may retry.
    #[error("send on '{topic}' failed: {source}")]
    Send {
        topic: String,
        #[source]
        source: SubstrateError,
    },
    /// An RPC call failed for a reason other than a timeout.
    #[error("query on '{topic}' failed: {reason}")]
    Query { topic: String, reason: String },
    /// No reply arrived before the query deadline.
    #[error("query on '{topic}' timed out after {timeout:?}")]
    Timeout { topic: String, timeout: Duration },
    /// An inbound reply lacked the attributes side-channel.
    #[error("reply on '{topic}' carried no attributes attachment")]
    MissingAttachment { topic: String },
    /// Subscribers and RPC servers need at least one worker.
    #[error("'{topic}' needs at least one worker thread, got {count}")]
    InvalidThreadCount { topic: String, count: usize },
    /// The worker pool could not be started.
    #[error("failed to start workers for '{topic}': {source}")]
    Workers {
        topic: String,
        #[source]
        source: PoolError,
    },
}

impl TransportError {
    /// True for per-call failures a caller can simply retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Send { .. } | TransportError::Query { .. } | TransportError::Timeout { .. }
        )
    }

    pub(crate) fn declaration(topic: &str, source: SubstrateError) -> Self {
        TransportError::Declaration {
            topic: topic.to_owned(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_missing_attachment_are_distinct() {
        let timeout = TransportError::Timeout {
            topic: "svc/none".into(),
            timeout: Duration::from_secs(1),
        };
        let malformed = TransportError::MissingAttachment {
            topic: "svc/none".into(),
        };
        assert!(timeout.is_recoverable());
        assert!(!malformed.is_recoverable());
        assert_ne!(timeout.to_string(), malformed.to_string());
    }

    #[test]
    fn declaration_error_names_topic() {
        let err = TransportError::declaration(
            "t/#",
            SubstrateError::InvalidKey {
                key: "t/#".into(),
                reason: "reserved character '#'".into(),
            },
        );
        assert!(err.to_string().contains("t/#"));
        assert!(!err.is_recoverable());
    }
}
