//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Broker connection and channel abstraction."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// Broker-assigned, channel-scoped identifier of one in-flight delivery.
pub type DeliveryTag = u64;

/// String-keyed property table carried alongside every message.
pub type HeaderTable = BTreeMap<String, HeaderValue>;

/// Value stored in a [`HeaderTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Byte string, UTF-8 encoded when it carries text.
    Bytes(Vec<u8>),
    /// Signed integer.
    Long(i64),
}

impl HeaderValue {
    /// Text view of a byte value, `None` for integers or invalid UTF-8.
    pub fn as_utf8(&self) -> Option<&str> {
        match self {
            HeaderValue::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            HeaderValue::Long(_) => None,
        }
    }

    /// Integer view, parsing decimal text when the broker delivered a string.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Long(value) => Some(*value),
            HeaderValue::Bytes(_) => self.as_utf8().and_then(|s| s.trim().parse().ok()),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Bytes(value.into_bytes())
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Long(value)
    }
}

/// Basic properties attached to a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME type of the body.
    pub content_type: Option<String>,
    /// Character encoding of the body.
    pub content_encoding: Option<String>,
    /// Ask the broker to persist the message.
    pub persistent: bool,
    /// Publish time in unix seconds.
    pub timestamp: Option<i64>,
    /// Application headers.
    pub headers: Option<HeaderTable>,
}

impl MessageProperties {
    /// Properties used for every JSON payload the runtime publishes.
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_owned()),
            content_encoding: Some("UTF-8".to_owned()),
            persistent: true,
            timestamp: None,
            headers: None,
        }
    }
}

/// A message handed to a consumer by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to acknowledge or reject this delivery on its channel.
    pub delivery_tag: DeliveryTag,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used at publish time.
    pub routing_key: String,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    /// Message properties, including the application header table.
    pub properties: MessageProperties,
    /// Raw body.
    pub body: Vec<u8>,
}

/// Result of waiting for publisher confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Every outstanding publish was acknowledged.
    Confirmed,
    /// The broker rejected at least one outstanding publish.
    Nacked,
    /// The wait window elapsed with publishes still unconfirmed.
    TimedOut,
    /// At least one mandatory publish was returned because nothing was bound
    /// to receive it.
    Returned,
}

/// Flags used when declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeclareOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Restrict the queue to the declaring connection.
    pub exclusive: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
}

/// Active `basic.consume` registration.
#[derive(Debug)]
pub struct Subscription {
    /// Broker-assigned consumer tag, used to cancel the subscription.
    pub consumer_tag: String,
    /// Stream of deliveries; closes when the subscription ends.
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// A connection to the broker; the only source of channels.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;
    /// Version string reported by the server, when available.
    fn server_version(&self) -> Option<String>;
    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;
    /// Close the connection and every channel opened on it.
    async fn close(&self) -> Result<()>;
}

/// AMQP 0-9-1 channel primitives used by the runtime.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel number.
    fn id(&self) -> u16;
    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;
    /// Passive exchange declaration; `false` when the exchange does not exist.
    async fn exchange_exists(&self, exchange: &str) -> Result<bool>;
    /// Passive queue declaration; `false` when the queue does not exist.
    async fn queue_exists(&self, queue: &str) -> Result<bool>;
    /// Declare (create if missing) a queue.
    async fn queue_declare(&self, queue: &str, options: QueueDeclareOptions) -> Result<()>;
    /// Bind a queue to an exchange.
    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;
    /// Delete a queue.
    async fn queue_delete(&self, queue: &str) -> Result<()>;
    /// Number of ready messages in a queue.
    async fn message_count(&self, queue: &str) -> Result<u32>;
    /// Number of consumers subscribed to a queue.
    async fn consumer_count(&self, queue: &str) -> Result<u32>;
    /// Limit unacknowledged deliveries on this channel; zero means unlimited.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;
    /// Put the channel into publisher-confirm mode.
    async fn confirm_select(&self) -> Result<()>;
    /// Publish a message.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()>;
    /// Wait up to `timeout` for all outstanding publishes to be confirmed.
    async fn wait_for_confirms(&self, timeout: Duration) -> Result<ConfirmOutcome>;
    /// Subscribe to a queue.
    async fn basic_consume(&self, queue: &str, auto_ack: bool) -> Result<Subscription>;
    /// Cancel a subscription.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;
    /// Acknowledge one delivery, or every delivery up to `tag` when `multiple`.
    async fn basic_ack(&self, tag: DeliveryTag, multiple: bool) -> Result<()>;
    /// Reject one delivery, or every delivery up to `tag` when `multiple`.
    async fn basic_nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()>;
    /// Close the channel; unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<()>;
}
