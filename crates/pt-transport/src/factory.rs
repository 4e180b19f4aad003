//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Constructor table handed to host loaders."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Hosts that load the adapter dynamically look up [`FACTORIES`] instead of
//! naming each constructor.

use std::time::Duration;

use pt_msg::Message;

use crate::publisher::Publisher;
use crate::rpc_client::{RpcClient, RpcReply};
use crate::rpc_server::{RpcServer, RpcServerCallback};
use crate::session::Session;
use crate::subscriber::{Subscriber, SubscriberCallback};
use crate::Result;

pub type SessionFactory = fn(&str) -> Result<Session>;
pub type PublisherFactory = fn(&Session, &str) -> Result<Publisher>;
pub type SubscriberFactory = fn(&Session, &str, SubscriberCallback, usize) -> Result<Subscriber>;
pub type RpcClientFactory = fn(&Session, &str, &Message, Duration) -> Result<RpcReply>;
pub type RpcServerFactory = fn(&Session, &str, RpcServerCallback, usize) -> Result<RpcServer>;

/// One constructor per primitive.
#[derive(Clone, Copy)]
pub struct Factories {
    pub session: SessionFactory,
    pub publisher: PublisherFactory,
    pub subscriber: SubscriberFactory,
    pub rpc_client: RpcClientFactory,
    pub rpc_server: RpcServerFactory,
}

/// Constructors for the primitives of this crate.
pub static FACTORIES: Factories = Factories {
    session: create_session,
    publisher: create_publisher,
    subscriber: create_subscriber,
    rpc_client: create_rpc_client,
    rpc_server: create_rpc_server,
};

pub fn create_session(start_doc: &str) -> Result<Session> {
    Session::open(start_doc)
}

pub fn create_publisher(session: &Session, topic: &str) -> Result<Publisher> {
    Publisher::declare(session, topic)
}

pub fn create_subscriber(
    session: &Session,
    topic: &str,
    callback: SubscriberCallback,
    thread_count: usize,
) -> Result<Subscriber> {
    Subscriber::new(session, topic, callback, thread_count)
}

/// Synchronous: performs the call and returns its result.
pub fn create_rpc_client(
    session: &Session,
    topic: &str,
    message: &Message,
    timeout: Duration,
) -> Result<RpcReply> {
    RpcClient::call_once(session, topic, message, timeout)
}

pub fn create_rpc_server(
    session: &Session,
    topic: &str,
    callback: RpcServerCallback,
    thread_count: usize,
) -> Result<RpcServer> {
    RpcServer::new(session, topic, callback, thread_count)
}

impl std::fmt::Debug for Factories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factories").finish_non_exhaustive()
    }
}
