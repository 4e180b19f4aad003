//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Core shared primitives for the transport adapter workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the library crates and the `ptctl` binary.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, OverflowPolicy, RpcConfig,
    SessionConfig, WorkerConfig,
};
pub use logging::{init_tracing, LogFormat};
