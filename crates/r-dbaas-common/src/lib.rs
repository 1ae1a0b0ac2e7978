//! ---
//! dbaas_section: "01-shared-primitives"
//! dbaas_subsection: "module"
//! dbaas_type: "source"
//! dbaas_scope: "code"
//! dbaas_description: "Shared primitives and utilities for the control plane and guest agent."
//! dbaas_version: "v0.0.0-prealpha"
//! dbaas_owner: "tbd"
//! ---
//! Core shared primitives for the R-DBaaS workspace.
//! This crate exposes configuration loading, logging, and protocol/build
//! version metadata consumed by both the control plane and the guest agent.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    AgentConfig, AppConfig, DatastoreKind, InstanceConfig, LoggingConfig, MetricsConfig,
    ProxyConfig, TimeoutConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use version::{ParseVersionError, ProtocolVersion, VersionInfo, PROTOCOL_VERSION};
