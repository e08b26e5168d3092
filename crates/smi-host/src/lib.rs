//! ---
//! smi_section: "03-service-host"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Microservice host wiring broker, control channel and fatal reporting."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! Composition root shared by every SMI service.
//!
//! A service implements [`Microservice`], the [`MicroserviceHost`] owns the
//! broker connection and turns fatal events and control `stop` requests into
//! one orderly shutdown.

pub mod fatal;
pub mod host;

pub use fatal::FatalErrorMessage;
pub use host::{Microservice, MicroserviceHost};
