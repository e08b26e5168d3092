//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Broker lifecycle: topology checks, subscriptions, bounded shutdown."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! The [`MessageBroker`] is the only component that opens or closes channels.
//!
//! Lifecycle is `Created -> Ready -> ShuttingDown -> Shutdown`. Every
//! subscription gets its own dispatch worker; stopping one cancels the
//! broker-side subscription, tells the consumer to stop taking deliveries and
//! waits a bounded time for the worker to finish the delivery in hand.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use smi_common::{ConsumerOptions, ProducerOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acker::Acker;
use crate::backoff::backoff_from_options;
use crate::consumer::{ConsumerBinding, DeliveryConsumer};
use crate::control::ControlMessageConsumer;
use crate::events::{FatalErrorEvent, FatalHandler, FatalOrigin, FatalSignal};
use crate::header::ProcessIdentity;
use crate::metrics::MessagingMetrics;
use crate::producer::{BatchProducerModel, ProducerModel, SyncProducerModel};
use crate::transport::{Channel, Connection, Delivery};
use crate::{MessagingError, Result};

/// Drain window used by hosts when stopping the broker.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Oldest broker version the runtime talks to.
pub const MINIMUM_SERVER_VERSION: (u32, u32, u32) = (3, 7, 0);

/// Identifier returned when a subscription starts.
pub type SubscriptionId = Uuid;

/// Lifecycle of a [`MessageBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, connection not yet validated.
    Created,
    /// Accepting producers and consumers.
    Ready,
    /// Draining subscriptions.
    ShuttingDown,
    /// Terminal.
    Shutdown,
}

struct Worker {
    queue: String,
    channel: Arc<dyn Channel>,
    consumer_tag: String,
    consumer: Arc<dyn DeliveryConsumer>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the broker connection and every channel opened on it.
pub struct MessageBroker {
    connection: Arc<dyn Connection>,
    identity: ProcessIdentity,
    fatal_handler: FatalHandler,
    fatal: Arc<FatalSignal>,
    metrics: Option<MessagingMetrics>,
    state: Mutex<BrokerState>,
    workers: Arc<Mutex<HashMap<SubscriptionId, Worker>>>,
    producer_channels: Mutex<Vec<Arc<dyn Channel>>>,
    stopped: CancellationToken,
}

impl fmt::Debug for MessageBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBroker")
            .field("identity", &self.identity)
            .field("state", &*self.state.lock())
            .field("consumers", &self.workers.lock().len())
            .finish()
    }
}

impl MessageBroker {
    /// Validate `connection` and return a ready broker.
    ///
    /// Fatal events from every consumer and producer this broker creates are
    /// forwarded to `fatal_handler`.
    pub async fn connect(
        connection: Arc<dyn Connection>,
        identity: ProcessIdentity,
        fatal_handler: FatalHandler,
    ) -> Result<Self> {
        let broker = Self {
            connection,
            identity,
            fatal: Arc::new(FatalSignal::new()),
            fatal_handler,
            metrics: None,
            state: Mutex::new(BrokerState::Created),
            workers: Arc::new(Mutex::new(HashMap::new())),
            producer_channels: Mutex::new(Vec::new()),
            stopped: CancellationToken::new(),
        };
        if !broker.connection.is_open() {
            return Err(MessagingError::ConnectionClosed);
        }
        check_server_version(broker.connection.server_version().as_deref())?;
        broker.fatal.subscribe(broker.fatal_handler.clone());
        *broker.state.lock() = BrokerState::Ready;
        info!(
            process = broker.identity.executable_name(),
            pid = broker.identity.process_id(),
            "message broker ready"
        );
        Ok(broker)
    }

    /// Feed counters of every consumer and producer created from now on into `metrics`.
    pub fn with_metrics(mut self, metrics: MessagingMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Identity stamped on published headers.
    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BrokerState {
        *self.state.lock()
    }

    /// Whether [`Self::shutdown`] has completed.
    pub fn is_shutdown(&self) -> bool {
        self.state() == BrokerState::Shutdown
    }

    /// Whether any subscription is registered.
    pub fn has_consumers(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Resolve once the broker has shut down.
    pub async fn wait(&self) {
        self.stopped.cancelled().await;
    }

    /// Open a confirm-mode channel on an existing exchange and wrap it in a producer.
    pub async fn setup_producer(&self, options: &ProducerOptions, is_batch: bool) -> Result<Arc<dyn ProducerModel>> {
        self.ensure_ready()?;
        if !options.verify_populated() {
            return Err(MessagingError::InvalidOptions(format!(
                "producer options for exchange '{}' must name an exchange and allow at least one confirm attempt",
                options.exchange_name
            )));
        }
        backoff_from_options(options.backoff_provider_type.as_deref())?;

        let channel = self.connection.create_channel().await?;
        channel.confirm_select().await?;
        if !channel.exchange_exists(&options.exchange_name).await? {
            close_quietly(&channel).await;
            return Err(MessagingError::ExchangeNotFound(options.exchange_name.clone()));
        }

        let producer: Arc<dyn ProducerModel> = if is_batch {
            let mut model = BatchProducerModel::new(channel.clone(), self.identity.clone(), options)?;
            if let Some(metrics) = &self.metrics {
                model = model.with_metrics(metrics.clone());
            }
            Arc::new(model)
        } else {
            let mut model = SyncProducerModel::new(channel.clone(), self.identity.clone(), options)?;
            if let Some(metrics) = &self.metrics {
                model = model.with_metrics(metrics.clone());
            }
            Arc::new(model)
        };
        producer.on_fatal(self.fatal_handler.clone());
        self.producer_channels.lock().push(channel);
        info!(exchange = %options.exchange_name, is_batch, "producer ready");
        Ok(producer)
    }

    /// Subscribe `consumer` to an existing queue.
    ///
    /// With `is_solo` the subscription is refused when the queue already has
    /// a consumer.
    pub async fn start_consumer(
        &self,
        options: &ConsumerOptions,
        consumer: Arc<dyn DeliveryConsumer>,
        is_solo: bool,
    ) -> Result<SubscriptionId> {
        self.ensure_ready()?;
        if consumer.is_exiting() {
            return Err(MessagingError::ConsumerExiting(consumer.name().to_owned()));
        }
        if !options.verify_populated() {
            return Err(MessagingError::InvalidOptions(format!(
                "consumer options for queue '{}' must name a queue",
                options.queue_name
            )));
        }

        let channel = self.connection.create_channel().await?;
        if let Err(err) = self.check_queue(&channel, &options.queue_name, is_solo).await {
            close_quietly(&channel).await;
            return Err(err);
        }
        channel.basic_qos(options.qos_prefetch_count).await?;

        consumer.attach(ConsumerBinding {
            acker: Acker::new(channel.clone(), options.auto_ack),
            prefetch_count: options.qos_prefetch_count,
            hold_unprocessable_messages: options.hold_unprocessable_messages,
            metrics: self.metrics.clone(),
        });
        consumer.on_fatal(self.fatal_handler.clone());
        self.subscribe(channel, &options.queue_name, options.auto_ack, consumer)
            .await
    }

    /// Declare, bind and subscribe the process's control queue.
    pub async fn start_control_consumer(&self, consumer: Arc<ControlMessageConsumer>) -> Result<SubscriptionId> {
        self.ensure_ready()?;
        if consumer.is_exiting() {
            return Err(MessagingError::ConsumerExiting(consumer.name().to_owned()));
        }
        let channel = self.connection.create_channel().await?;
        if !channel.exchange_exists(consumer.exchange_name()).await? {
            close_quietly(&channel).await;
            return Err(MessagingError::ExchangeNotFound(consumer.exchange_name().to_owned()));
        }
        channel
            .queue_declare(consumer.queue_name(), ControlMessageConsumer::queue_options())
            .await?;
        for key in consumer.binding_keys() {
            debug!(queue = consumer.queue_name(), exchange = consumer.exchange_name(), key = %key, "binding control queue");
            channel
                .queue_bind(consumer.queue_name(), consumer.exchange_name(), &key)
                .await?;
        }
        channel.basic_qos(1).await?;

        consumer.bind_channel(channel.clone());
        consumer.attach(ConsumerBinding {
            acker: Acker::new(channel.clone(), true),
            prefetch_count: 1,
            hold_unprocessable_messages: false,
            metrics: self.metrics.clone(),
        });
        consumer.on_fatal(self.fatal_handler.clone());
        let queue = consumer.queue_name().to_owned();
        self.subscribe(channel, &queue, true, consumer).await
    }

    /// Stop one subscription, waiting up to `timeout` for its worker.
    pub async fn stop_consumer(&self, id: SubscriptionId, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(MessagingError::InvalidTimeout(timeout));
        }
        if self.is_shutdown() {
            return Err(MessagingError::BrokerShutdown);
        }
        let worker = self
            .workers
            .lock()
            .remove(&id)
            .ok_or(MessagingError::UnknownSubscription(id))?;

        let queue = worker.queue.clone();
        signal_stop(&worker).await;
        let Some(worker) = wait_for(worker, Instant::now() + timeout).await else {
            return Err(MessagingError::ShutdownTimeout { timeout, pending: 1 });
        };
        close_quietly(&worker.channel).await;
        info!(subscription = %id, queue = %queue, "consumer stopped");
        Ok(())
    }

    /// Stop every subscription within `timeout`, then close all channels and
    /// the connection. Calling it again after it completed is a no-op.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(MessagingError::InvalidTimeout(timeout));
        }
        {
            let mut state = self.state.lock();
            match *state {
                BrokerState::ShuttingDown | BrokerState::Shutdown => {
                    debug!(state = ?*state, "shutdown already requested");
                    return Ok(());
                }
                BrokerState::Created | BrokerState::Ready => *state = BrokerState::ShuttingDown,
            }
        }
        info!(?timeout, "message broker shutting down");

        let deadline = Instant::now() + timeout;
        let workers: Vec<Worker> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            signal_stop(worker).await;
        }
        let outcomes = join_all(workers.into_iter().map(|w| wait_for(w, deadline))).await;
        let pending = outcomes.iter().filter(|o| o.is_none()).count();
        for worker in outcomes.into_iter().flatten() {
            close_quietly(&worker.channel).await;
        }

        let producers: Vec<_> = self.producer_channels.lock().drain(..).collect();
        for channel in producers {
            close_quietly(&channel).await;
        }
        if let Err(err) = self.connection.close().await {
            warn!(error = %err, "error closing broker connection");
        }

        *self.state.lock() = BrokerState::Shutdown;
        self.stopped.cancel();

        if pending > 0 {
            warn!(pending, ?timeout, "consumers did not stop within the shutdown window");
            return Err(MessagingError::ShutdownTimeout { timeout, pending });
        }
        info!("message broker shut down");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            BrokerState::Ready => Ok(()),
            _ => Err(MessagingError::BrokerShutdown),
        }
    }

    async fn check_queue(&self, channel: &Arc<dyn Channel>, queue: &str, is_solo: bool) -> Result<()> {
        if !channel.queue_exists(queue).await? {
            return Err(MessagingError::QueueNotFound(queue.to_owned()));
        }
        if is_solo && channel.consumer_count(queue).await? > 0 {
            return Err(MessagingError::QueueAlreadyConsumed(queue.to_owned()));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: Arc<dyn Channel>,
        queue: &str,
        auto_ack: bool,
        consumer: Arc<dyn DeliveryConsumer>,
    ) -> Result<SubscriptionId> {
        let subscription = match channel.basic_consume(queue, auto_ack).await {
            Ok(subscription) => subscription,
            Err(err) => {
                close_quietly(&channel).await;
                return Err(err);
            }
        };
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        // Registered before the loop can run so it always finds its own entry.
        let mut workers = self.workers.lock();
        let handle = tokio::spawn(dispatch_loop(
            DispatchContext {
                id,
                queue: queue.to_owned(),
                consumer: consumer.clone(),
                cancel: cancel.clone(),
                fatal: self.fatal.clone(),
                registry: Arc::downgrade(&self.workers),
            },
            subscription.deliveries,
        ));
        workers.insert(
            id,
            Worker {
                queue: queue.to_owned(),
                channel,
                consumer_tag: subscription.consumer_tag,
                consumer: consumer.clone(),
                cancel,
                handle,
            },
        );
        drop(workers);
        info!(subscription = %id, queue, consumer = consumer.name(), "consumer started");
        Ok(id)
    }
}

struct DispatchContext {
    id: SubscriptionId,
    queue: String,
    consumer: Arc<dyn DeliveryConsumer>,
    cancel: CancellationToken,
    fatal: Arc<FatalSignal>,
    registry: Weak<Mutex<HashMap<SubscriptionId, Worker>>>,
}

async fn dispatch_loop(context: DispatchContext, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    let DispatchContext {
        id,
        queue,
        consumer,
        cancel,
        fatal,
        registry,
    } = context;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = deliveries.recv() => next,
        };
        let Some(delivery) = next else {
            if !cancel.is_cancelled() && !consumer.is_exiting() {
                fatal.raise(FatalErrorEvent::new(
                    FatalOrigin::Broker,
                    format!("subscription to queue {queue} ended unexpectedly"),
                    None,
                ));
            }
            break;
        };
        consumer.process_delivery(delivery).await;
        if consumer.is_exiting() {
            break;
        }
    }
    debug!(queue = %queue, consumer = consumer.name(), "dispatch loop finished");

    // Stop and shutdown take the worker out of the registry before they
    // cancel it. A loop that ended on its own deregisters itself, and closing
    // its channel hands any unacknowledged deliveries back to the queue.
    if cancel.is_cancelled() {
        return;
    }
    let Some(workers) = registry.upgrade() else {
        return;
    };
    let worker = workers.lock().remove(&id);
    if let Some(worker) = worker {
        close_quietly(&worker.channel).await;
        info!(subscription = %id, queue = %queue, consumer = consumer.name(), "consumer deregistered after it stopped");
    }
}

async fn signal_stop(worker: &Worker) {
    worker.consumer.begin_shutdown();
    worker.cancel.cancel();
    if worker.channel.is_open() {
        if let Err(err) = worker.channel.basic_cancel(&worker.consumer_tag).await {
            warn!(queue = %worker.queue, error = %err, "could not cancel subscription");
        }
    }
}

/// Wait for the worker until `deadline`; abort it and return `None` on timeout.
async fn wait_for(mut worker: Worker, deadline: Instant) -> Option<Worker> {
    match tokio::time::timeout_at(deadline, &mut worker.handle).await {
        Ok(Ok(())) => Some(worker),
        Ok(Err(err)) => {
            warn!(queue = %worker.queue, error = %err, "dispatch worker ended abnormally");
            Some(worker)
        }
        Err(_) => {
            worker.handle.abort();
            close_quietly(&worker.channel).await;
            None
        }
    }
}

async fn close_quietly(channel: &Arc<dyn Channel>) {
    if let Err(err) = channel.close().await {
        debug!(channel = channel.id(), error = %err, "error closing channel");
    }
}

/// Reject brokers older than [`MINIMUM_SERVER_VERSION`].
///
/// Unknown or unparsable versions are accepted with a warning.
pub fn check_server_version(version: Option<&str>) -> Result<()> {
    let Some(version) = version else {
        warn!("broker did not report a server version");
        return Ok(());
    };
    let mut parts = version.split('.').map(|part| {
        part.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse::<u32>()
            .ok()
    });
    let parsed = (
        parts.next().flatten(),
        parts.next().flatten().unwrap_or(0),
        parts.next().flatten().unwrap_or(0),
    );
    let (Some(major), minor, patch) = parsed else {
        warn!(version, "could not parse broker server version");
        return Ok(());
    };
    if (major, minor, patch) < MINIMUM_SERVER_VERSION {
        let (a, b, c) = MINIMUM_SERVER_VERSION;
        return Err(MessagingError::UnsupportedServerVersion {
            found: version.to_owned(),
            minimum: format!("{a}.{b}.{c}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ExchangeKind, InMemoryBroker};

    #[test]
    fn server_version_gate() {
        assert!(check_server_version(Some("3.7.0")).is_ok());
        assert!(check_server_version(Some("3.12.1")).is_ok());
        assert!(check_server_version(Some("4.0.0-rc.1")).is_ok());
        assert!(check_server_version(None).is_ok());
        assert!(check_server_version(Some("garbage")).is_ok());
        assert!(matches!(
            check_server_version(Some("3.6.15")),
            Err(MessagingError::UnsupportedServerVersion { .. })
        ));
    }

    fn no_fatal() -> FatalHandler {
        Arc::new(|event: FatalErrorEvent| panic!("unexpected fatal: {event}"))
    }

    async fn ready(memory: &InMemoryBroker) -> MessageBroker {
        MessageBroker::connect(memory.connection(), ProcessIdentity::new("BrokerTests", 3), no_fatal())
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn old_server_is_refused() {
        let memory = InMemoryBroker::new();
        memory.set_server_version(Some("3.6.0"));
        let err = MessageBroker::connect(memory.connection(), ProcessIdentity::new("BrokerTests", 3), no_fatal())
            .await
            .expect_err("old broker");
        assert!(matches!(err, MessagingError::UnsupportedServerVersion { .. }));
    }

    #[tokio::test]
    async fn missing_exchange_is_named() {
        let memory = InMemoryBroker::new();
        let broker = ready(&memory).await;
        let err = broker
            .setup_producer(&ProducerOptions::new("TEST.DoesNotExist"), false)
            .await
            .err()
            .expect("missing exchange");
        assert_eq!(err.to_string(), "Expected exchange \"TEST.DoesNotExist\" to exist");
    }

    #[tokio::test]
    async fn shutdown_without_consumers_is_immediate_and_final() {
        let memory = InMemoryBroker::new();
        memory.declare_exchange("TEST.Exchange", ExchangeKind::Direct);
        let broker = ready(&memory).await;
        assert!(matches!(
            broker.shutdown(Duration::ZERO).await,
            Err(MessagingError::InvalidTimeout(_))
        ));
        assert_eq!(broker.state(), BrokerState::Ready);

        broker.shutdown(DEFAULT_OPERATION_TIMEOUT).await.expect("shutdown");
        assert!(broker.is_shutdown());
        broker.wait().await;
        broker.shutdown(DEFAULT_OPERATION_TIMEOUT).await.expect("second shutdown is a no-op");
        assert!(matches!(
            broker.setup_producer(&ProducerOptions::new("TEST.Exchange"), false).await,
            Err(MessagingError::BrokerShutdown)
        ));
    }

    #[tokio::test]
    async fn blank_options_are_rejected_before_touching_the_broker() {
        let memory = InMemoryBroker::new();
        let broker = ready(&memory).await;
        assert!(matches!(
            broker.setup_producer(&ProducerOptions::new("  "), false).await,
            Err(MessagingError::InvalidOptions(_))
        ));
        assert!(matches!(
            broker
                .setup_producer(&ProducerOptions::new("TEST.Exchange").with_backoff("Foo"), false)
                .await,
            Err(MessagingError::InvalidBackoffProvider(_))
        ));
    }
}
