//! ---
//! kless_section: "01-core-functionality"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Shared primitives and utilities for wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
//! Shared configuration loading and logging setup for the Kless messaging
//! workspace.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, LoadedAppConfig, LoggingConfig, MessagingConfig, PermissionSeed, PermissionsConfig,
    TransportKind,
};
pub use logging::{init_tracing, LogFormat};
