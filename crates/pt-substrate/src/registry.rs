//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Process-wide registry of substrate backends."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use pt_common::SessionConfig;
use tracing::{debug, info};

use crate::memory::{InMemorySubstrate, IN_MEMORY_BACKEND};
use crate::{Connection, Result, Substrate, SubstrateError};

/// Builds a substrate instance.
pub type SubstrateCtor = fn() -> Arc<dyn Substrate>;

static BACKENDS: Lazy<RwLock<IndexMap<String, SubstrateCtor>>> = Lazy::new(|| {
    let mut backends: IndexMap<String, SubstrateCtor> = IndexMap::new();
    backends.insert(IN_MEMORY_BACKEND.to_owned(), in_memory);
    RwLock::new(backends)
});

fn in_memory() -> Arc<dyn Substrate> {
    Arc::new(InMemorySubstrate)
}

/// Register (or replace) a backend. Returns the constructor it replaced.
pub fn register(name: impl Into<String>, ctor: SubstrateCtor) -> Option<SubstrateCtor> {
    let name = name.into();
    info!(backend = %name, "substrate backend registered");
    BACKENDS.write().insert(name, ctor)
}

/// Names of every registered backend, in registration order.
pub fn backends() -> Vec<String> {
    BACKENDS.read().keys().cloned().collect()
}

/// Instantiate the backend registered under `name`.
pub fn lookup(name: &str) -> Result<Arc<dyn Substrate>> {
    let ctor = BACKENDS
        .read()
        .get(name)
        .copied()
        .ok_or_else(|| SubstrateError::UnknownBackend(name.to_owned()))?;
    Ok(ctor())
}

/// Parse a start document and open a connection on the backend it names.
pub fn open(start_doc: &str) -> Result<Arc<dyn Connection>> {
    let config = SessionConfig::from_start_doc(start_doc)
        .map_err(|err| SubstrateError::StartDoc(format!("{err:#}")))?;
    let substrate = lookup(&config.backend)?;
    debug!(backend = %config.backend, network = %config.network, "opening substrate connection");
    substrate.open(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_is_registered_by_default() {
        assert!(backends().iter().any(|name| name == IN_MEMORY_BACKEND));
        let substrate = lookup(IN_MEMORY_BACKEND).expect("in-memory backend");
        assert_eq!(substrate.name(), IN_MEMORY_BACKEND);
    }

    #[test]
    fn unknown_backend_is_reported() {
        let err = lookup("carrier-pigeon").err().expect("unknown backend");
        assert_eq!(err, SubstrateError::UnknownBackend("carrier-pigeon".into()));
    }

    #[test]
    fn registered_backend_is_resolvable() {
        register("alias-of-memory", in_memory);
        let connection = open("backend = \"alias-of-memory\"\nnetwork = \"registry-test\"")
            .expect("connection");
        assert!(!connection.is_closed());
        connection.close().expect("close");
    }

    #[test]
    fn malformed_start_doc_is_reported() {
        let err = open("backend = [").err().expect("malformed doc");
        assert!(matches!(err, SubstrateError::StartDoc(_)));
    }
}
