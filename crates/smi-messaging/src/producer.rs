//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Confirmed publishing with lineage headers, sync and batched."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use smi_common::time::unix_time_now;
use smi_common::ProducerOptions;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backoff::{backoff_from_options, BackoffProvider};
use crate::events::{FatalErrorEvent, FatalHandler, FatalOrigin, FatalSignal};
use crate::header::{MessageHeader, ProcessIdentity};
use crate::metrics::MessagingMetrics;
use crate::transport::{Channel, ConfirmOutcome, MessageProperties};
use crate::{MessagingError, Result};

/// How long a single confirm wait lasts.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes between two probe-queue depth checks.
pub const PROBE_COUNTER_LIMIT: u32 = 1000;

/// Publishing side of a service.
#[async_trait]
pub trait ProducerModel: Send + Sync {
    /// Publish an already serialised JSON body.
    ///
    /// The header is fresh, or derived from `in_response_to` when given, and
    /// is returned so callers can link further output to it.
    async fn send_payload(
        &self,
        body: Vec<u8>,
        in_response_to: Option<&MessageHeader>,
        routing_key: Option<&str>,
    ) -> Result<MessageHeader>;

    /// Block until every outstanding publish is confirmed. A no-op when
    /// nothing is outstanding.
    async fn wait_for_confirms(&self) -> Result<()>;

    /// Exchange this producer publishes to.
    fn exchange_name(&self) -> &str;

    /// Subscribe to the producer's fatal error.
    fn on_fatal(&self, handler: FatalHandler);

    /// Publishes not yet confirmed by the broker.
    fn unconfirmed(&self) -> u64;
}

/// Typed convenience over [`ProducerModel`].
#[async_trait]
pub trait ProducerModelExt: ProducerModel {
    /// Serialise `message` as JSON and publish it.
    async fn send_message<M>(
        &self,
        message: &M,
        in_response_to: Option<&MessageHeader>,
        routing_key: Option<&str>,
    ) -> Result<MessageHeader>
    where
        M: Serialize + Sync + ?Sized,
    {
        let body = serde_json::to_vec(message)?;
        self.send_payload(body, in_response_to, routing_key).await
    }
}

impl<P: ProducerModel + ?Sized> ProducerModelExt for P {}

struct Probe {
    queue: String,
    limit: u32,
    timeout: Duration,
}

struct SendState {
    backoff: Option<Box<dyn BackoffProvider>>,
    probe_counter: u32,
}

/// Publish routine shared by both producer variants.
struct PublishCore {
    exchange: String,
    channel: Arc<dyn Channel>,
    identity: ProcessIdentity,
    max_confirm_attempts: u32,
    confirm_timeout: Duration,
    probe: Option<Probe>,
    metrics: Option<MessagingMetrics>,
    send_lock: Mutex<SendState>,
    unconfirmed: AtomicU64,
    faulted: AtomicBool,
    fatal: FatalSignal,
}

impl PublishCore {
    fn new(channel: Arc<dyn Channel>, identity: ProcessIdentity, options: &ProducerOptions) -> Result<Self> {
        if !options.verify_populated() {
            return Err(MessagingError::InvalidOptions(format!(
                "producer options for exchange '{}' are incomplete",
                options.exchange_name
            )));
        }
        let backoff = backoff_from_options(options.backoff_provider_type.as_deref())?;
        let probe = options
            .probe_queue_name
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty() && options.probe_queue_limit > 0)
            .map(|queue| Probe {
                queue: queue.to_owned(),
                limit: options.probe_queue_limit,
                timeout: options.probe_timeout,
            });
        Ok(Self {
            exchange: options.exchange_name.clone(),
            channel,
            identity,
            max_confirm_attempts: options.max_confirm_attempts.max(1),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            probe,
            metrics: None,
            send_lock: Mutex::new(SendState {
                backoff,
                probe_counter: PROBE_COUNTER_LIMIT,
            }),
            unconfirmed: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            fatal: FatalSignal::new(),
        })
    }

    async fn publish(
        &self,
        state: &mut SendState,
        body: Vec<u8>,
        in_response_to: Option<&MessageHeader>,
        routing_key: Option<&str>,
    ) -> Result<MessageHeader> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(MessagingError::ProducerFaulted(self.exchange.clone()));
        }
        self.throttle(state).await?;

        let header = match in_response_to {
            Some(parent) => MessageHeader::in_response_to(parent, &self.identity),
            None => MessageHeader::new(&self.identity),
        };
        let mut properties = MessageProperties::json();
        properties.timestamp = Some(unix_time_now());
        properties.headers = Some(header.to_table());

        self.channel
            .basic_publish(&self.exchange, routing_key.unwrap_or(""), true, &properties, &body)
            .await?;
        self.unconfirmed.fetch_add(1, Ordering::AcqRel);
        if let Some(metrics) = &self.metrics {
            metrics.observe_published(&self.exchange);
        }
        debug!(exchange = %self.exchange, message_guid = %header.message_guid(), "published");
        Ok(header)
    }

    async fn throttle(&self, state: &mut SendState) -> Result<()> {
        let Some(probe) = &self.probe else {
            return Ok(());
        };
        if state.probe_counter < PROBE_COUNTER_LIMIT {
            state.probe_counter += 1;
            return Ok(());
        }
        state.probe_counter = 1;
        loop {
            let depth = self.channel.message_count(&probe.queue).await?;
            if depth < probe.limit {
                return Ok(());
            }
            warn!(
                exchange = %self.exchange,
                probe_queue = %probe.queue,
                depth,
                limit = probe.limit,
                "probe queue over limit; pausing publishes for {:?}",
                probe.timeout
            );
            tokio::time::sleep(probe.timeout).await;
        }
    }

    async fn confirm(&self, state: &mut SendState) -> Result<()> {
        let outstanding = self.unconfirmed.load(Ordering::Acquire);
        if outstanding == 0 {
            return Ok(());
        }
        for attempt in 1..=self.max_confirm_attempts {
            match self.channel.wait_for_confirms(self.confirm_timeout).await? {
                ConfirmOutcome::Confirmed => {
                    self.unconfirmed.fetch_sub(outstanding, Ordering::AcqRel);
                    if let Some(backoff) = state.backoff.as_mut() {
                        backoff.reset();
                    }
                    return Ok(());
                }
                ConfirmOutcome::Nacked => {
                    self.unconfirmed.fetch_sub(outstanding, Ordering::AcqRel);
                    return Err(MessagingError::PublishNacked(self.exchange.clone()));
                }
                ConfirmOutcome::Returned => {
                    self.unconfirmed.fetch_sub(outstanding, Ordering::AcqRel);
                    let err = MessagingError::PublishReturned(self.exchange.clone());
                    self.fault("Message was returned by the broker as unroutable", &err);
                    return Err(err);
                }
                ConfirmOutcome::TimedOut => {
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_confirm_timeout(&self.exchange);
                    }
                    warn!(
                        exchange = %self.exchange,
                        attempt,
                        max_attempts = self.max_confirm_attempts,
                        outstanding,
                        "timed out waiting for publisher confirms"
                    );
                    if attempt < self.max_confirm_attempts {
                        if let Some(backoff) = state.backoff.as_mut() {
                            let delay = backoff.next_backoff();
                            debug!(exchange = %self.exchange, ?delay, "backing off before next confirm attempt");
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        let err = MessagingError::PublishExhausted {
            exchange: self.exchange.clone(),
            attempts: self.max_confirm_attempts,
        };
        self.fault("Could not confirm message published after timeout", &err);
        Err(err)
    }

    /// Stop publishing and raise the producer's fatal event.
    fn fault(&self, message: &str, err: &MessagingError) {
        self.faulted.store(true, Ordering::Release);
        let origin = FatalOrigin::Producer {
            exchange: self.exchange.clone(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_fatal(origin.label());
        }
        self.fatal.raise(FatalErrorEvent::new(
            origin,
            message,
            Some(anyhow::anyhow!(err.to_string())),
        ));
    }
}

macro_rules! producer_common {
    ($ty:ty) => {
        impl $ty {
            /// Producer for `options.exchange_name` on `channel`.
            ///
            /// The channel must already be in confirm mode.
            pub fn new(channel: Arc<dyn Channel>, identity: ProcessIdentity, options: &ProducerOptions) -> Result<Self> {
                Ok(Self {
                    core: PublishCore::new(channel, identity, options)?,
                })
            }

            /// Override the per-attempt confirm wait.
            pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
                self.core.confirm_timeout = timeout;
                self
            }

            /// Feed publish and confirm counters into `metrics`.
            pub fn with_metrics(mut self, metrics: MessagingMetrics) -> Self {
                self.core.metrics = Some(metrics);
                self
            }

            /// Whether confirm attempts ran out and the producer stopped publishing.
            pub fn is_faulted(&self) -> bool {
                self.core.faulted.load(Ordering::Acquire)
            }
        }

        impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("exchange", &self.core.exchange)
                    .field("unconfirmed", &self.core.unconfirmed.load(Ordering::Relaxed))
                    .finish()
            }
        }
    };
}

/// Producer that waits for the broker's confirm after every publish.
pub struct SyncProducerModel {
    core: PublishCore,
}

producer_common!(SyncProducerModel);

#[async_trait]
impl ProducerModel for SyncProducerModel {
    async fn send_payload(
        &self,
        body: Vec<u8>,
        in_response_to: Option<&MessageHeader>,
        routing_key: Option<&str>,
    ) -> Result<MessageHeader> {
        let mut state = self.core.send_lock.lock().await;
        let header = self
            .core
            .publish(&mut state, body, in_response_to, routing_key)
            .await?;
        self.core.confirm(&mut state).await?;
        Ok(header)
    }

    async fn wait_for_confirms(&self) -> Result<()> {
        let mut state = self.core.send_lock.lock().await;
        self.core.confirm(&mut state).await
    }

    fn exchange_name(&self) -> &str {
        &self.core.exchange
    }

    fn on_fatal(&self, handler: FatalHandler) {
        self.core.fatal.subscribe(handler);
    }

    fn unconfirmed(&self) -> u64 {
        self.core.unconfirmed.load(Ordering::Acquire)
    }
}

/// Producer that leaves confirmation to an explicit [`ProducerModel::wait_for_confirms`].
pub struct BatchProducerModel {
    core: PublishCore,
}

producer_common!(BatchProducerModel);

#[async_trait]
impl ProducerModel for BatchProducerModel {
    async fn send_payload(
        &self,
        body: Vec<u8>,
        in_response_to: Option<&MessageHeader>,
        routing_key: Option<&str>,
    ) -> Result<MessageHeader> {
        let mut state = self.core.send_lock.lock().await;
        self.core
            .publish(&mut state, body, in_response_to, routing_key)
            .await
    }

    async fn wait_for_confirms(&self) -> Result<()> {
        let mut state = self.core.send_lock.lock().await;
        self.core.confirm(&mut state).await
    }

    fn exchange_name(&self) -> &str {
        &self.core.exchange
    }

    fn on_fatal(&self, handler: FatalHandler) {
        self.core.fatal.subscribe(handler);
    }

    fn unconfirmed(&self) -> u64 {
        self.core.unconfirmed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConfirmBehaviour, ExchangeKind, InMemoryBroker};
    use crate::transport::Connection;
    use serde::Serialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Serialize)]
    struct Note<'a> {
        text: &'a str,
    }

    const EXCHANGE: &str = "TEST.NoteExchange";

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn Channel> {
        let connection = broker.connection();
        let channel = connection.create_channel().await.expect("channel");
        channel.confirm_select().await.expect("confirm mode");
        channel
    }

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_exchange(EXCHANGE, ExchangeKind::Direct);
        broker.declare_queue("TEST.NoteQueue");
        broker.bind("TEST.NoteQueue", EXCHANGE, "").expect("bind");
        broker
    }

    fn identity() -> ProcessIdentity {
        ProcessIdentity::new("ProducerTests", 7)
    }

    #[tokio::test]
    async fn sync_send_attaches_header_and_json_properties() {
        let broker = broker();
        let producer = SyncProducerModel::new(channel(&broker).await, identity(), &ProducerOptions::new(EXCHANGE))
            .expect("producer");
        let header = producer
            .send_message(&Note { text: "hello" }, None, None)
            .await
            .expect("send");
        assert_eq!(producer.unconfirmed(), 0);

        let published = broker.published_to(EXCHANGE);
        assert_eq!(published.len(), 1);
        let props = &published[0].properties;
        assert!(props.persistent);
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        let sent = MessageHeader::from_table(props.headers.as_ref().expect("headers")).expect("header");
        assert_eq!(sent, header);
        assert_eq!(published[0].body, br#"{"text":"hello"}"#);
    }

    #[tokio::test]
    async fn response_header_extends_lineage() {
        let broker = broker();
        let producer = SyncProducerModel::new(channel(&broker).await, identity(), &ProducerOptions::new(EXCHANGE))
            .expect("producer");
        let parent = MessageHeader::new(&identity());
        let header = producer
            .send_message(&Note { text: "child" }, Some(&parent), None)
            .await
            .expect("send");
        assert_eq!(header.parents(), &[parent.message_guid()]);
    }

    #[tokio::test]
    async fn batch_confirms_only_on_request() {
        let broker = broker();
        let producer = BatchProducerModel::new(channel(&broker).await, identity(), &ProducerOptions::new(EXCHANGE))
            .expect("producer");
        for text in ["a", "b", "c"] {
            producer.send_message(&Note { text }, None, None).await.expect("send");
        }
        assert_eq!(producer.unconfirmed(), 3);
        producer.wait_for_confirms().await.expect("confirm");
        assert_eq!(producer.unconfirmed(), 0);
        producer.wait_for_confirms().await.expect("idempotent confirm");
    }

    #[tokio::test]
    async fn nack_is_reported() {
        let broker = broker();
        broker.set_confirm_behaviour(ConfirmBehaviour::Nack);
        let producer = SyncProducerModel::new(channel(&broker).await, identity(), &ProducerOptions::new(EXCHANGE))
            .expect("producer");
        let err = producer
            .send_message(&Note { text: "x" }, None, None)
            .await
            .expect_err("nacked");
        assert!(matches!(err, MessagingError::PublishNacked(_)));
        assert!(!producer.is_faulted());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_confirms_raise_fatal_once_and_fault() {
        let broker = broker();
        broker.set_confirm_behaviour(ConfirmBehaviour::Withhold);
        let options = ProducerOptions::new(EXCHANGE)
            .with_max_confirm_attempts(3)
            .with_backoff("Static");
        let producer = SyncProducerModel::new(channel(&broker).await, identity(), &options)
            .expect("producer")
            .with_confirm_timeout(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        producer.on_fatal(Arc::new(move |_: FatalErrorEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let err = producer
            .send_message(&Note { text: "x" }, None, None)
            .await
            .expect_err("exhausted");
        assert!(matches!(err, MessagingError::PublishExhausted { attempts: 3, .. }));
        assert!(producer.is_faulted());
        assert!(matches!(
            producer.send_message(&Note { text: "y" }, None, None).await,
            Err(MessagingError::ProducerFaulted(_))
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unroutable_send_faults_the_producer() {
        let broker = broker();
        let producer = SyncProducerModel::new(channel(&broker).await, identity(), &ProducerOptions::new(EXCHANGE))
            .expect("producer");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        producer.on_fatal(Arc::new(move |event: FatalErrorEvent| {
            assert!(event.message.contains("unroutable"));
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let err = producer
            .send_message(&Note { text: "lost" }, None, Some("nowhere"))
            .await
            .expect_err("returned");
        assert!(matches!(err, MessagingError::PublishReturned(exchange) if exchange == EXCHANGE));
        assert!(producer.is_faulted());
        assert_eq!(producer.unconfirmed(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(broker.queue_depth("TEST.NoteQueue"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_succeeds_on_later_attempt() {
        let broker = broker();
        broker.set_confirm_behaviour(ConfirmBehaviour::WithholdFor(1));
        let options = ProducerOptions::new(EXCHANGE).with_max_confirm_attempts(2);
        let producer = SyncProducerModel::new(channel(&broker).await, identity(), &options)
            .expect("producer")
            .with_confirm_timeout(Duration::from_millis(10));
        producer
            .send_message(&Note { text: "x" }, None, None)
            .await
            .expect("second attempt confirms");
        assert!(!producer.is_faulted());
    }

    #[tokio::test]
    async fn unknown_backoff_is_rejected() {
        let broker = broker();
        let options = ProducerOptions::new(EXCHANGE).with_backoff("Foo");
        let err = SyncProducerModel::new(channel(&broker).await, identity(), &options).expect_err("bad backoff");
        assert!(matches!(err, MessagingError::InvalidBackoffProvider(name) if name == "Foo"));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_queue_pauses_publishing() {
        let broker = broker();
        broker.declare_queue("TEST.Probe");
        broker.declare_exchange("TEST.ProbeExchange", ExchangeKind::Fanout);
        broker.bind("TEST.Probe", "TEST.ProbeExchange", "").expect("bind");
        for _ in 0..2 {
            broker
                .publish("TEST.ProbeExchange", "", MessageProperties::json(), "{}")
                .expect("fill probe");
        }
        let options = ProducerOptions::new(EXCHANGE).with_probe_queue("TEST.Probe", 2, Duration::from_secs(30));
        let producer = Arc::new(
            BatchProducerModel::new(channel(&broker).await, identity(), &options).expect("producer"),
        );

        let sender = producer.clone();
        let task = tokio::spawn(async move { sender.send_message(&Note { text: "x" }, None, None).await });
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(broker.published_to(EXCHANGE).is_empty());

        // Drain the probe queue below its limit.
        let drain = channel(&broker).await;
        let mut sub = drain.basic_consume("TEST.Probe", true).await.expect("consume");
        sub.deliveries.recv().await.expect("drained");
        tokio::time::sleep(Duration::from_secs(31)).await;
        task.await.expect("join").expect("send");
        assert_eq!(broker.published_to(EXCHANGE).len(), 1);
    }
}
