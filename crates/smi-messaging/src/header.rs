//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Message envelope and causal lineage."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! The message envelope travels in the broker's property table, never in the
//! body, so payloads stay plain domain JSON.
use std::fmt;

use serde::{Deserialize, Serialize};
use smi_common::time::unix_time_now;
use tracing::Level;
use uuid::Uuid;

use crate::transport::{HeaderTable, HeaderValue};

const KEY_MESSAGE_GUID: &str = "MessageGuid";
const KEY_PRODUCER_PROCESS_ID: &str = "ProducerProcessID";
const KEY_PRODUCER_EXECUTABLE_NAME: &str = "ProducerExecutableName";
const KEY_ORIGINAL_PUBLISH_TIMESTAMP: &str = "OriginalPublishTimestamp";
const KEY_PARENTS: &str = "Parents";

/// Separator used when flattening the parent list into a single header value.
pub const PARENTS_SPLITTER: &str = "->";

/// Reasons a header table cannot be turned into a [`MessageHeader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// The delivery carried no application headers at all.
    #[error("message has no header table")]
    MissingTable,
    /// A required field is absent.
    #[error("header field {0} is missing")]
    MissingField(&'static str),
    /// A text field is not valid UTF-8.
    #[error("header field {0} is not valid UTF-8")]
    InvalidText(&'static str),
    /// A numeric field could not be read.
    #[error("header field {0} is not a valid integer")]
    InvalidNumber(&'static str),
    /// A GUID field could not be parsed.
    #[error("header field {field} contains an invalid guid '{value}'")]
    InvalidGuid {
        /// Field holding the bad value.
        field: &'static str,
        /// Offending text.
        value: String,
    },
    /// The lineage lists the message as its own ancestor.
    #[error("message {0} lists itself among its parents")]
    SelfParent(Uuid),
}

/// Identity of the process emitting messages.
///
/// Passed explicitly to everything that mints headers instead of living in
/// process-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    executable_name: String,
    process_id: u32,
}

impl ProcessIdentity {
    /// Identity with an explicit process id.
    pub fn new(executable_name: impl Into<String>, process_id: u32) -> Self {
        Self {
            executable_name: executable_name.into(),
            process_id,
        }
    }

    /// Identity of the running process under the given executable name.
    pub fn current(executable_name: impl Into<String>) -> Self {
        Self::new(executable_name, std::process::id())
    }

    /// Executable name as reported in headers.
    pub fn executable_name(&self) -> &str {
        &self.executable_name
    }

    /// Operating system process id.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }
}

/// Envelope describing one logical message and its causal ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageHeader {
    message_guid: Uuid,
    #[serde(rename = "ProducerProcessID")]
    producer_process_id: u32,
    producer_executable_name: String,
    original_publish_timestamp: i64,
    parents: Vec<Uuid>,
}

impl MessageHeader {
    /// Mint a header for a message that is not a response to anything.
    pub fn new(identity: &ProcessIdentity) -> Self {
        Self {
            message_guid: Uuid::new_v4(),
            producer_process_id: identity.process_id(),
            producer_executable_name: identity.executable_name().to_owned(),
            original_publish_timestamp: unix_time_now(),
            parents: Vec::new(),
        }
    }

    /// Mint a header for a message emitted while processing `parent`.
    ///
    /// The lineage grows by the parent's guid and the original publish time is
    /// carried forward so end-to-end latency is measured from the first hop.
    pub fn in_response_to(parent: &MessageHeader, identity: &ProcessIdentity) -> Self {
        let mut parents = Vec::with_capacity(parent.parents.len() + 1);
        parents.extend_from_slice(&parent.parents);
        parents.push(parent.message_guid);
        Self {
            message_guid: Uuid::new_v4(),
            producer_process_id: identity.process_id(),
            producer_executable_name: identity.executable_name().to_owned(),
            original_publish_timestamp: parent.original_publish_timestamp,
            parents,
        }
    }

    /// Globally unique identifier of this message.
    pub fn message_guid(&self) -> Uuid {
        self.message_guid
    }

    /// Process id of the producer.
    pub fn producer_process_id(&self) -> u32 {
        self.producer_process_id
    }

    /// Executable name of the producer.
    pub fn producer_executable_name(&self) -> &str {
        &self.producer_executable_name
    }

    /// Unix seconds of the first publish in this causal chain.
    pub fn original_publish_timestamp(&self) -> i64 {
        self.original_publish_timestamp
    }

    /// Ancestor guids, oldest first.
    pub fn parents(&self) -> &[Uuid] {
        &self.parents
    }

    /// Whether `other` appears in this message's lineage.
    pub fn is_descendant_of(&self, other: &MessageHeader) -> bool {
        self.parents.contains(&other.message_guid)
    }

    /// Parent guids joined with [`PARENTS_SPLITTER`].
    pub fn parents_display(&self) -> String {
        self.parents
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>()
            .join(PARENTS_SPLITTER)
    }

    /// Write the header fields into a broker property table.
    pub fn populate(&self, table: &mut HeaderTable) {
        table.insert(
            KEY_MESSAGE_GUID.to_owned(),
            HeaderValue::from(self.message_guid.to_string()),
        );
        table.insert(
            KEY_PRODUCER_PROCESS_ID.to_owned(),
            HeaderValue::Long(i64::from(self.producer_process_id)),
        );
        table.insert(
            KEY_PRODUCER_EXECUTABLE_NAME.to_owned(),
            HeaderValue::from(self.producer_executable_name.as_str()),
        );
        table.insert(
            KEY_ORIGINAL_PUBLISH_TIMESTAMP.to_owned(),
            HeaderValue::Long(self.original_publish_timestamp),
        );
        table.insert(
            KEY_PARENTS.to_owned(),
            HeaderValue::from(self.parents_display()),
        );
    }

    /// Header fields as a fresh property table.
    pub fn to_table(&self) -> HeaderTable {
        let mut table = HeaderTable::new();
        self.populate(&mut table);
        table
    }

    /// Rebuild a header from a broker property table.
    pub fn from_table(table: &HeaderTable) -> Result<Self, HeaderError> {
        let message_guid = parse_guid(KEY_MESSAGE_GUID, text_field(table, KEY_MESSAGE_GUID)?)?;
        let producer_process_id = u32::try_from(number_field(table, KEY_PRODUCER_PROCESS_ID)?)
            .map_err(|_| HeaderError::InvalidNumber(KEY_PRODUCER_PROCESS_ID))?;
        let producer_executable_name =
            text_field(table, KEY_PRODUCER_EXECUTABLE_NAME)?.to_owned();
        let original_publish_timestamp = number_field(table, KEY_ORIGINAL_PUBLISH_TIMESTAMP)?;
        let parents = text_field(table, KEY_PARENTS)?
            .split(PARENTS_SPLITTER)
            .filter(|s| !s.is_empty())
            .map(|s| parse_guid(KEY_PARENTS, s))
            .collect::<Result<Vec<_>, _>>()?;

        if parents.contains(&message_guid) {
            return Err(HeaderError::SelfParent(message_guid));
        }

        Ok(Self {
            message_guid,
            producer_process_id,
            producer_executable_name,
            original_publish_timestamp,
            parents,
        })
    }

    /// Emit the header as structured fields at the requested level.
    pub fn log(&self, level: Level, message: &str) {
        let parents = self.parents_display();
        macro_rules! emit {
            ($lvl:expr) => {
                tracing::event!(
                    $lvl,
                    message_guid = %self.message_guid,
                    producer_process_id = self.producer_process_id,
                    producer_executable_name = %self.producer_executable_name,
                    original_publish_timestamp = self.original_publish_timestamp,
                    parents = %parents,
                    "{}",
                    message
                )
            };
        }
        match level {
            Level::ERROR => emit!(Level::ERROR),
            Level::WARN => emit!(Level::WARN),
            Level::INFO => emit!(Level::INFO),
            Level::DEBUG => emit!(Level::DEBUG),
            _ => emit!(Level::TRACE),
        }
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MessageGuid: {}, ProducerProcessID: {}, ProducerExecutableName: {}, OriginalPublishTimestamp: {}, Parents: [{}]",
            self.message_guid,
            self.producer_process_id,
            self.producer_executable_name,
            self.original_publish_timestamp,
            self.parents_display()
        )
    }
}

fn text_field<'a>(table: &'a HeaderTable, key: &'static str) -> Result<&'a str, HeaderError> {
    table
        .get(key)
        .ok_or(HeaderError::MissingField(key))?
        .as_utf8()
        .ok_or(HeaderError::InvalidText(key))
}

fn number_field(table: &HeaderTable, key: &'static str) -> Result<i64, HeaderError> {
    table
        .get(key)
        .ok_or(HeaderError::MissingField(key))?
        .as_i64()
        .ok_or(HeaderError::InvalidNumber(key))
}

fn parse_guid(field: &'static str, value: &str) -> Result<Uuid, HeaderError> {
    Uuid::parse_str(value.trim()).map_err(|_| HeaderError::InvalidGuid {
        field,
        value: value.to_owned(),
    })
}
