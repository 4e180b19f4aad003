//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Transport adapter: publish, subscribe, RPC client and RPC server."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Messaging primitives over a pluggable pub/sub/query substrate.
//!
//! Substrate handlers never run user code. Subscribers and RPC servers push
//! each inbound item onto a queue that a fixed worker pool drains, so a slow
//! callback never stalls network delivery.

pub mod error;
pub mod factory;
pub mod publisher;
pub mod rpc_client;
pub mod rpc_server;
pub mod session;
pub mod subscriber;

mod attributes;
mod service;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

pub use attributes::ATTRIBUTES_KEY;
pub use error::TransportError;
pub use factory::{
    create_publisher, create_rpc_client, create_rpc_server, create_session, create_subscriber,
    Factories, FACTORIES,
};
pub use publisher::Publisher;
pub use pt_msg::Message;
pub use rpc_client::{RpcClient, RpcReply};
pub use rpc_server::{RpcServer, RpcServerCallback, RpcServerStats};
pub use service::ComponentState;
pub use session::Session;
pub use subscriber::{Subscriber, SubscriberCallback, SubscriberStats};
