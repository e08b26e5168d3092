//! ---
//! smi_section: "01-core-functionality"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Shared primitives and utilities for SMI services."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! Core shared primitives for the SMI services workspace.
//! This crate exposes configuration loading, tracing setup and the time
//! helpers used by the message envelope.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ConsumerOptions, LoadedAppConfig, LoggingConfig, ProducerOptions, RabbitOptions,
};
pub use logging::{init_tracing, LogFormat, LogTarget};
