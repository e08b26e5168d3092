//! ---
//! smi_section: "03-service-host"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Payload published to the fatal logging exchange."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Report sent when a host stops because of a fatal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FatalErrorMessage {
    /// Description of what failed, as logged by the host.
    pub message: String,
    /// Rendered error chain, when the fatal carried one.
    pub exception: Option<String>,
    /// When the host handled the fatal.
    pub raised_at: DateTime<Utc>,
}

impl FatalErrorMessage {
    /// Build a report stamped with the current time.
    pub fn new(message: impl Into<String>, error: Option<&anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            exception: error.map(|err| format!("{err:#}")),
            raised_at: Utc::now(),
        }
    }
}
