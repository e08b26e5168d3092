//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "In-process AMQP broker used by tests and local runs."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! An in-process broker speaking the [`Connection`]/[`Channel`] seam.
//!
//! It models the parts of AMQP 0-9-1 the runtime depends on: direct, topic
//! and fanout exchanges, per-channel delivery tags, prefetch limits, requeue
//! with the redelivered flag, requeue of unacknowledged deliveries when a
//! channel closes, auto-delete queues and publisher confirms whose outcome can
//! be scripted.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{
    Channel, ConfirmOutcome, Connection, Delivery, DeliveryTag, MessageProperties,
    QueueDeclareOptions, Subscription,
};
use crate::{MessagingError, Result};

/// Default version reported by [`InMemoryBroker`] connections.
pub const DEFAULT_SERVER_VERSION: &str = "3.12.0";

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dotted pattern match with `*` and `#` wildcards.
    Topic,
    /// Every bound queue receives every message.
    Fanout,
}

/// How the broker answers publisher confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehaviour {
    /// Confirm every publish immediately.
    #[default]
    Ack,
    /// Reject every publish.
    Nack,
    /// Never confirm; every wait times out.
    Withhold,
    /// Let the next `n` waits time out, then confirm.
    WithholdFor(u32),
}

/// A message recorded at publish time, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange.
    pub exchange: String,
    /// Routing key.
    pub routing_key: String,
    /// Properties sent with the message.
    pub properties: MessageProperties,
    /// Body bytes.
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

struct QueueConsumer {
    tag: String,
    channel: u16,
    auto_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct Queue {
    options: QueueDeclareOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<QueueConsumer>,
    cursor: usize,
    had_consumer: bool,
}

impl Queue {
    fn new(options: QueueDeclareOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumer: false,
        }
    }
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Unacked>,
    confirm_mode: bool,
    unconfirmed: u64,
    returned: bool,
}

#[derive(Default)]
struct BrokerCore {
    exchanges: HashMap<String, Exchange>,
    queues: IndexMap<String, Queue>,
    channels: HashMap<u16, ChannelState>,
    next_channel: u16,
    next_consumer: u64,
    confirm_behaviour: ConfirmBehaviour,
    published: Vec<PublishedMessage>,
}

impl BrokerCore {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                Vec::new()
            });
        }
        let exchange_state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| MessagingError::ExchangeNotFound(exchange.to_owned()))?;
        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &exchange_state.bindings {
            let matched = match exchange_state.kind {
                ExchangeKind::Direct => key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, routing_key),
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    /// Route and store a publish; returns the number of queues it reached.
    fn enqueue(&mut self, exchange: &str, routing_key: &str, properties: &MessageProperties, body: &[u8]) -> Result<usize> {
        self.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            body: body.to_vec(),
        });
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            tracing::debug!(exchange, routing_key, "message was unroutable");
        }
        let routed = targets.len();
        for queue in targets {
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    properties: properties.clone(),
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
        }
        self.pump();
        Ok(routed)
    }

    /// Hand ready messages to consumers until no consumer can take more.
    fn pump(&mut self) {
        let BrokerCore { queues, channels, .. } = self;
        for (queue_name, queue) in queues.iter_mut() {
            loop {
                if queue.ready.is_empty() || queue.consumers.is_empty() {
                    break;
                }
                let count = queue.consumers.len();
                let mut chosen = None;
                for offset in 0..count {
                    let index = (queue.cursor + offset) % count;
                    let consumer = &queue.consumers[index];
                    let Some(channel) = channels.get(&consumer.channel) else {
                        continue;
                    };
                    let has_room = consumer.auto_ack
                        || channel.prefetch == 0
                        || channel.unacked.len() < usize::from(channel.prefetch);
                    if channel.open && has_room && !consumer.sender.is_closed() {
                        chosen = Some(index);
                        break;
                    }
                }
                let Some(index) = chosen else {
                    break;
                };
                queue.cursor = (index + 1) % count;
                let Some(message) = queue.ready.pop_front() else {
                    break;
                };
                let consumer = &queue.consumers[index];
                let Some(channel) = channels.get_mut(&consumer.channel) else {
                    queue.ready.push_front(message);
                    break;
                };
                channel.next_tag += 1;
                let tag = channel.next_tag;
                let delivery = Delivery {
                    delivery_tag: tag,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                };
                if !consumer.auto_ack {
                    channel.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue_name.clone(),
                            message,
                        },
                    );
                }
                if consumer.sender.send(delivery).is_err() {
                    if let Some(returned) = channel.unacked.remove(&tag) {
                        queue.ready.push_front(returned.message);
                    }
                }
            }
        }
    }

    fn requeue(&mut self, entries: Vec<Unacked>) {
        for entry in entries {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_back(message);
            }
        }
    }

    fn take_unacked(&mut self, channel: u16, tag: DeliveryTag, multiple: bool) -> Result<Vec<Unacked>> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(MessagingError::ChannelClosed(channel))?;
        if multiple {
            let keys: Vec<_> = state
                .unacked
                .keys()
                .copied()
                .filter(|k| tag == 0 || *k <= tag)
                .collect();
            return Ok(keys
                .into_iter()
                .filter_map(|k| state.unacked.remove(&k))
                .collect());
        }
        match state.unacked.remove(&tag) {
            Some(entry) => Ok(vec![entry]),
            None => Err(MessagingError::Transport(format!(
                "PRECONDITION_FAILED - unknown delivery tag {tag}"
            ))),
        }
    }

    fn remove_consumer(&mut self, tag: &str) -> bool {
        let mut removed = false;
        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.tag != tag);
            if queue.consumers.len() != before {
                removed = true;
                queue.cursor = 0;
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    emptied.push(name.clone());
                }
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
        removed
    }

    fn delete_queue(&mut self, name: &str) {
        if let Some(queue) = self.queues.shift_remove(name) {
            drop(queue.consumers);
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }

    fn close_channel(&mut self, channel: u16) {
        let Some(state) = self.channels.get_mut(&channel) else {
            return;
        };
        if !state.open {
            return;
        }
        state.open = false;
        let unacked: Vec<Unacked> = std::mem::take(&mut state.unacked).into_values().collect();
        let tags: Vec<String> = self
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .filter(|c| c.channel == channel)
            .map(|c| c.tag.clone())
            .collect();
        for tag in tags {
            self.remove_consumer(&tag);
        }
        self.requeue(unacked);
        self.pump();
    }

    fn ensure_open(&self, channel: u16) -> Result<()> {
        match self.channels.get(&channel) {
            Some(state) if state.open => Ok(()),
            _ => Err(MessagingError::ChannelClosed(channel)),
        }
    }
}

/// `*` matches one dotted word, `#` matches zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() { Vec::new() } else { key.split('.').collect() };
    matches(&pattern, &key)
}

struct Shared {
    core: Mutex<BrokerCore>,
    server_version: Mutex<Option<String>>,
    next_connection: AtomicU64,
}

/// In-process broker. Clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("InMemoryBroker")
            .field("exchanges", &core.exchanges.len())
            .field("queues", &core.queues.len())
            .field("channels", &core.channels.len())
            .finish()
    }
}

impl InMemoryBroker {
    /// Empty broker with only the default exchange.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(BrokerCore::default()),
                server_version: Mutex::new(Some(DEFAULT_SERVER_VERSION.to_owned())),
                next_connection: AtomicU64::new(0),
            }),
        }
    }

    /// Open a new connection to this broker.
    pub fn connection(&self) -> Arc<InMemoryConnection> {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
            open: AtomicBool::new(true),
        })
    }

    /// Create an exchange; existing exchanges keep their bindings.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.shared
            .core
            .lock()
            .exchanges
            .entry(name.to_owned())
            .or_insert_with(|| Exchange {
                kind,
                bindings: Vec::new(),
            });
    }

    /// Create a durable queue.
    pub fn declare_queue(&self, name: &str) {
        self.shared
            .core
            .lock()
            .queues
            .entry(name.to_owned())
            .or_insert_with(|| {
                Queue::new(QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                })
            });
    }

    /// Bind `queue` to `exchange` with `routing_key`.
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        bind_locked(&mut self.shared.core.lock(), queue, exchange, routing_key)
    }

    /// Publish outside of any channel, as an external producer would.
    pub fn publish(&self, exchange: &str, routing_key: &str, properties: MessageProperties, body: impl Into<Vec<u8>>) -> Result<()> {
        let body = body.into();
        self.shared
            .core
            .lock()
            .enqueue(exchange, routing_key, &properties, &body)
            .map(|_| ())
    }

    /// Ready (undelivered) messages in a queue; `None` when it does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.shared.core.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Whether a queue exists.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.core.lock().queues.contains_key(queue)
    }

    /// Number of consumers on a queue.
    pub fn consumers_on(&self, queue: &str) -> usize {
        self.shared
            .core
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Deliveries handed out and not yet settled, across every channel.
    pub fn unacked_total(&self) -> usize {
        self.shared
            .core
            .lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Every message published to `exchange`, oldest first.
    pub fn published_to(&self, exchange: &str) -> Vec<PublishedMessage> {
        self.shared
            .core
            .lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Script how publisher confirms are answered.
    pub fn set_confirm_behaviour(&self, behaviour: ConfirmBehaviour) {
        self.shared.core.lock().confirm_behaviour = behaviour;
    }

    /// Version reported to new connections; `None` hides it.
    pub fn set_server_version(&self, version: Option<&str>) {
        *self.shared.server_version.lock() = version.map(str::to_owned);
    }
}

fn bind_locked(core: &mut BrokerCore, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
    if !core.queues.contains_key(queue) {
        return Err(MessagingError::QueueNotFound(queue.to_owned()));
    }
    let exchange_state = core
        .exchanges
        .get_mut(exchange)
        .ok_or_else(|| MessagingError::ExchangeNotFound(exchange.to_owned()))?;
    let binding = (queue.to_owned(), routing_key.to_owned());
    if !exchange_state.bindings.contains(&binding) {
        exchange_state.bindings.push(binding);
    }
    Ok(())
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    open: AtomicBool,
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(MessagingError::ConnectionClosed);
        }
        let mut core = self.broker.shared.core.lock();
        core.next_channel = core.next_channel.wrapping_add(1).max(1);
        let id = core.next_channel;
        core.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                confirm_mode: false,
                unconfirmed: 0,
                returned: false,
            },
        );
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn server_version(&self) -> Option<String> {
        self.broker.shared.server_version.lock().clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut core = self.broker.shared.core.lock();
        let owned: Vec<u16> = core
            .channels
            .iter()
            .filter(|(_, c)| c.connection == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel in owned {
            core.close_channel(channel);
        }
        Ok(())
    }
}

/// A channel on an [`InMemoryConnection`].
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u16,
}

impl InMemoryChannel {
    fn core(&self) -> parking_lot::MutexGuard<'_, BrokerCore> {
        self.broker.shared.core.lock()
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.core().channels.get(&self.id).is_some_and(|c| c.open)
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool> {
        let core = self.core();
        core.ensure_open(self.id)?;
        Ok(exchange.is_empty() || core.exchanges.contains_key(exchange))
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        let core = self.core();
        core.ensure_open(self.id)?;
        Ok(core.queues.contains_key(queue))
    }

    async fn queue_declare(&self, queue: &str, options: QueueDeclareOptions) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        core.queues
            .entry(queue.to_owned())
            .or_insert_with(|| Queue::new(options));
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        bind_locked(&mut core, queue, exchange, routing_key)
    }

    async fn queue_delete(&self, queue: &str) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        core.delete_queue(queue);
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u32> {
        let core = self.core();
        core.ensure_open(self.id)?;
        let queue_state = core
            .queues
            .get(queue)
            .ok_or_else(|| MessagingError::QueueNotFound(queue.to_owned()))?;
        Ok(u32::try_from(queue_state.ready.len()).unwrap_or(u32::MAX))
    }

    async fn consumer_count(&self, queue: &str) -> Result<u32> {
        let core = self.core();
        core.ensure_open(self.id)?;
        let queue_state = core
            .queues
            .get(queue)
            .ok_or_else(|| MessagingError::QueueNotFound(queue.to_owned()))?;
        Ok(u32::try_from(queue_state.consumers.len()).unwrap_or(u32::MAX))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        if let Some(state) = core.channels.get_mut(&self.id) {
            state.prefetch = prefetch_count;
        }
        core.pump();
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        if let Some(state) = core.channels.get_mut(&self.id) {
            state.confirm_mode = true;
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        let routed = match core.enqueue(exchange, routing_key, properties, body) {
            Ok(routed) => routed,
            Err(err) => {
                // Publishing to a missing exchange closes the channel.
                core.close_channel(self.id);
                return Err(err);
            }
        };
        if let Some(state) = core.channels.get_mut(&self.id) {
            if state.confirm_mode {
                state.unconfirmed += 1;
            }
            if mandatory && routed == 0 {
                state.returned = true;
            }
        }
        Ok(())
    }

    async fn wait_for_confirms(&self, timeout: Duration) -> Result<ConfirmOutcome> {
        let outcome = {
            let mut core = self.core();
            core.ensure_open(self.id)?;
            let behaviour = core.confirm_behaviour;
            let state = core
                .channels
                .get_mut(&self.id)
                .ok_or(MessagingError::ChannelClosed(self.id))?;
            if !state.confirm_mode {
                return Err(MessagingError::Transport(
                    "channel is not in confirm mode".to_owned(),
                ));
            }
            if state.unconfirmed == 0 {
                return Ok(ConfirmOutcome::Confirmed);
            }
            if std::mem::take(&mut state.returned) {
                state.unconfirmed = 0;
                return Ok(ConfirmOutcome::Returned);
            }
            match behaviour {
                ConfirmBehaviour::Ack => {
                    state.unconfirmed = 0;
                    ConfirmOutcome::Confirmed
                }
                ConfirmBehaviour::Nack => {
                    state.unconfirmed = 0;
                    ConfirmOutcome::Nacked
                }
                ConfirmBehaviour::Withhold => ConfirmOutcome::TimedOut,
                ConfirmBehaviour::WithholdFor(remaining) => {
                    if remaining == 0 {
                        state.unconfirmed = 0;
                        core.confirm_behaviour = ConfirmBehaviour::Ack;
                        ConfirmOutcome::Confirmed
                    } else {
                        core.confirm_behaviour = ConfirmBehaviour::WithholdFor(remaining - 1);
                        ConfirmOutcome::TimedOut
                    }
                }
            }
        };
        if outcome == ConfirmOutcome::TimedOut {
            tokio::time::sleep(timeout).await;
        }
        Ok(outcome)
    }

    async fn basic_consume(&self, queue: &str, auto_ack: bool) -> Result<Subscription> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        core.next_consumer += 1;
        let consumer_tag = format!("amq.ctag-{}", core.next_consumer);
        let (sender, deliveries) = mpsc::unbounded_channel();
        let queue_state = core
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::QueueNotFound(queue.to_owned()))?;
        queue_state.had_consumer = true;
        queue_state.consumers.push(QueueConsumer {
            tag: consumer_tag.clone(),
            channel: self.id,
            auto_ack,
            sender,
        });
        core.pump();
        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        core.remove_consumer(consumer_tag);
        core.pump();
        Ok(())
    }

    async fn basic_ack(&self, tag: DeliveryTag, multiple: bool) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        match core.take_unacked(self.id, tag, multiple) {
            Ok(_) => {
                core.pump();
                Ok(())
            }
            Err(err) => {
                core.close_channel(self.id);
                Err(err)
            }
        }
    }

    async fn basic_nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        let mut core = self.core();
        core.ensure_open(self.id)?;
        match core.take_unacked(self.id, tag, multiple) {
            Ok(entries) => {
                if requeue {
                    core.requeue(entries);
                }
                core.pump();
                Ok(())
            }
            Err(err) => {
                core.close_channel(self.id);
                Err(err)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.core().close_channel(self.id);
        Ok(())
    }
}
