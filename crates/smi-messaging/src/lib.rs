//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Reliable messaging runtime shared by SMI microservices."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! Reliable messaging runtime for the SMI microservices.
//!
//! Services consume typed payloads through [`Consumer`] and emit output with
//! correct lineage through a [`ProducerModel`]. The [`MessageBroker`] owns the
//! broker connection, validates topology before anything flows and performs a
//! bounded shutdown of every subscription it started.
#![warn(missing_docs)]

use std::time::Duration;

pub mod acker;
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod backoff;
pub mod broker;
pub mod consumer;
pub mod control;
pub mod events;
pub mod header;
pub mod memory;
pub mod metrics;
pub mod producer;
pub mod transport;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by the messaging runtime.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// A producer was set up against an exchange the broker does not know.
    #[error("Expected exchange \"{0}\" to exist")]
    ExchangeNotFound(String),
    /// A consumer was started against a queue the broker does not know.
    #[error("Expected queue \"{0}\" to exist")]
    QueueNotFound(String),
    /// Consumer or producer options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    /// The configured backoff provider name is not recognised.
    #[error("Could not parse '{0}' to a valid BackoffProviderType")]
    InvalidBackoffProvider(String),
    /// Shutdown or stop was requested with an unusable drain window.
    #[error("invalid timeout value {0:?}; a non-zero drain window is required")]
    InvalidTimeout(Duration),
    /// The broker manager has been shut down and accepts no further work.
    #[error("message broker has been shut down")]
    BrokerShutdown,
    /// No subscription with the given identifier is registered.
    #[error("subscription {0} was not found in the consumer registry")]
    UnknownSubscription(uuid::Uuid),
    /// The consumer was stopped or hit a fatal error and cannot be subscribed again.
    #[error("consumer {0} is exiting and cannot be started")]
    ConsumerExiting(String),
    /// A solo subscription was requested on a queue that already has a consumer.
    #[error("already a consumer on queue {0} and solo consumer was specified")]
    QueueAlreadyConsumed(String),
    /// Consumers did not drain within the allotted window.
    #[error("{pending} consumer(s) failed to stop within {timeout:?}")]
    ShutdownTimeout {
        /// Drain window that was exceeded.
        timeout: Duration,
        /// Number of workers still running when the window closed.
        pending: usize,
    },
    /// The broker negatively acknowledged a publish.
    #[error("broker nacked a message published to exchange {0}")]
    PublishNacked(String),
    /// A mandatory publish could not be routed to any queue.
    #[error("message published to exchange {0} was returned as unroutable")]
    PublishReturned(String),
    /// Every configured confirm attempt timed out.
    #[error("could not confirm message published to exchange {exchange} after {attempts} attempt(s)")]
    PublishExhausted {
        /// Target exchange.
        exchange: String,
        /// Number of confirm waits that timed out.
        attempts: u32,
    },
    /// The producer already raised a fatal error and refuses to publish.
    #[error("producer for exchange {0} has faulted and no longer publishes")]
    ProducerFaulted(String),
    /// Ack or nack for a delivery tag that is not outstanding.
    #[error("delivery tag {0} is not pending (already acknowledged, rejected or never delivered)")]
    DeliveryNotPending(u64),
    /// The channel was used after it closed.
    #[error("channel {0} is closed")]
    ChannelClosed(u16),
    /// The connection was used after it closed.
    #[error("broker connection is closed")]
    ConnectionClosed,
    /// The broker is older than the runtime supports.
    #[error("connected to broker version {found}, but minimum required is {minimum}")]
    UnsupportedServerVersion {
        /// Version reported by the server.
        found: String,
        /// Minimum supported version.
        minimum: String,
    },
    /// Message header could not be decoded.
    #[error(transparent)]
    Header(#[from] header::HeaderError),
    /// Payload (de)serialisation failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Failure reported by the underlying broker client.
    #[error("transport error: {0}")]
    Transport(String),
}

pub use acker::Acker;
pub use backoff::{
    BackoffProvider, BackoffProviderKind, ExponentialBackoffProvider, StaticBackoffProvider,
};
pub use broker::{BrokerState, MessageBroker, SubscriptionId, DEFAULT_OPERATION_TIMEOUT};
pub use consumer::{
    AckHandle, Consumer, ConsumerBinding, DeliveryConsumer, HandlerError, MessageHandler,
};
pub use control::{ControlAction, ControlHandler, ControlMessageConsumer};
pub use events::{FatalErrorEvent, FatalHandler, FatalOrigin};
pub use header::{HeaderError, MessageHeader, ProcessIdentity};
pub use memory::{ConfirmBehaviour, ExchangeKind, InMemoryBroker};
pub use metrics::MessagingMetrics;
pub use producer::{BatchProducerModel, ProducerModel, ProducerModelExt, SyncProducerModel};
pub use transport::{
    Channel, ConfirmOutcome, Connection, Delivery, DeliveryTag, HeaderTable, HeaderValue,
    MessageProperties, QueueDeclareOptions, Subscription,
};
