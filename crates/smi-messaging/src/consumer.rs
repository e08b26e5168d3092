//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Typed consumer dispatch: header, payload, handler, settlement."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! Generic consumer pipeline.
//!
//! Each delivery walks header parse, payload decode, handler call and
//! settlement. Per-message failures end in an ack or nack; only an
//! unexpected handler failure escalates to the consumer's fatal signal,
//! after which the consumer accepts no further deliveries.
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::error::Category;
use smi_common::time::unix_time_now;
use tracing::{debug, error, warn, Level};

use crate::acker::Acker;
use crate::events::{FatalErrorEvent, FatalHandler, FatalOrigin, FatalSignal};
use crate::header::{HeaderError, MessageHeader, ProcessIdentity};
use crate::metrics::MessagingMetrics;
use crate::transport::{Delivery, DeliveryTag};
use crate::Result;

/// How many retried delivery tags a consumer remembers.
const RETRY_MEMORY: usize = 1024;

/// Tag handed to handlers by [`Consumer::test_message`].
pub const TEST_DELIVERY_TAG: DeliveryTag = 0;

/// Outcome of a failed handler call.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The message cannot be processed; it is rejected and the consumer keeps running.
    #[error("{reason}")]
    Application {
        /// Why the message was rejected.
        reason: String,
    },
    /// Anything the handler did not anticipate; escalates to the fatal path.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Application`].
    pub fn application(reason: impl Into<String>) -> Self {
        HandlerError::Application {
            reason: reason.into(),
        }
    }
}

/// Business logic for one payload type.
#[async_trait]
pub trait MessageHandler<T: Send + 'static>: Send + Sync + 'static {
    /// Process one message. The handler settles `tag` through `acks` exactly
    /// once before returning `Ok`, or returns an error and lets the consumer
    /// settle it.
    async fn process_message(
        &self,
        header: &MessageHeader,
        message: T,
        tag: DeliveryTag,
        acks: &AckHandle,
    ) -> std::result::Result<(), HandlerError>;
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    nacked: AtomicU64,
}

/// Settlement operations available to a handler for its current delivery.
#[derive(Clone)]
pub struct AckHandle {
    consumer: Arc<str>,
    acker: Acker,
    counters: Arc<Counters>,
    metrics: Option<MessagingMetrics>,
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("consumer", &self.consumer)
            .field("acker", &self.acker)
            .finish()
    }
}

impl AckHandle {
    /// Acknowledge one delivery.
    pub async fn ack(&self, header: &MessageHeader, tag: DeliveryTag) -> Result<()> {
        self.acker.ack(tag, false).await?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_acked(&self.consumer, 1);
            metrics.observe_lineage_age(unix_time_now() - header.original_publish_timestamp());
        }
        debug!(consumer = %self.consumer, delivery_tag = tag, message_guid = %header.message_guid(), "acknowledged");
        Ok(())
    }

    /// Acknowledge every outstanding delivery up to and including `tag`.
    ///
    /// Returns the number of deliveries settled.
    pub async fn ack_multiple(&self, tag: DeliveryTag) -> Result<usize> {
        let settled = self.acker.ack(tag, true).await?;
        self.counters
            .acked
            .fetch_add(settled as u64, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_acked(&self.consumer, settled as u64);
        }
        debug!(consumer = %self.consumer, up_to = tag, settled, "batch acknowledged");
        Ok(settled)
    }

    /// Log `reason` against the header and reject the delivery without requeue.
    pub async fn error_and_nack(
        &self,
        header: &MessageHeader,
        tag: DeliveryTag,
        reason: impl std::fmt::Display + Send,
    ) -> Result<()> {
        header.log(
            Level::ERROR,
            &format!("{}: rejecting delivery {tag}: {reason}", self.consumer),
        );
        self.nack(tag, false).await
    }

    /// Reject the delivery and ask the broker to deliver it again.
    pub async fn requeue(&self, tag: DeliveryTag) -> Result<()> {
        self.nack(tag, true).await
    }

    /// Reject the delivery permanently.
    pub async fn discard(&self, tag: DeliveryTag) -> Result<()> {
        self.nack(tag, false).await
    }

    /// Whether `tag` is still awaiting settlement.
    pub fn is_pending(&self, tag: DeliveryTag) -> bool {
        self.acker.is_pending(tag)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.acker.nack(tag, false, requeue).await?;
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_nacked(&self.consumer);
        }
        Ok(())
    }
}

/// Channel-side settings a consumer receives when the broker subscribes it.
#[derive(Clone, Debug)]
pub struct ConsumerBinding {
    /// Acker for the subscription's channel.
    pub acker: Acker,
    /// Channel prefetch window; zero means unlimited.
    pub prefetch_count: u16,
    /// Leave deliveries unsettled instead of escalating unexpected failures.
    pub hold_unprocessable_messages: bool,
    /// Optional metric handles.
    pub metrics: Option<MessagingMetrics>,
}

impl Default for ConsumerBinding {
    fn default() -> Self {
        Self {
            acker: Acker::detached(),
            prefetch_count: 1,
            hold_unprocessable_messages: false,
            metrics: None,
        }
    }
}

/// Object-safe face of a consumer, used by the broker's dispatch loop.
#[async_trait]
pub trait DeliveryConsumer: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;
    /// Bind the consumer to the subscription's channel.
    fn attach(&self, binding: ConsumerBinding);
    /// Subscribe to fatal errors raised by this consumer.
    fn on_fatal(&self, handler: FatalHandler);
    /// Process one delivery to completion.
    async fn process_delivery(&self, delivery: Delivery);
    /// Whether the consumer stopped accepting deliveries.
    fn is_exiting(&self) -> bool;
    /// Stop accepting deliveries; in-flight ones finish normally.
    fn begin_shutdown(&self);
}

/// Typed consumer driving a [`MessageHandler`].
pub struct Consumer<T, H> {
    name: Arc<str>,
    handler: H,
    counters: Arc<Counters>,
    exiting: AtomicBool,
    fatal: FatalSignal,
    binding: RwLock<ConsumerBinding>,
    retried: Mutex<IndexSet<DeliveryTag>>,
    held: AtomicU64,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> std::fmt::Debug for Consumer<T, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("acked", &self.counters.acked.load(Ordering::Relaxed))
            .field("nacked", &self.counters.nacked.load(Ordering::Relaxed))
            .field("exiting", &self.exiting.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T, H> Consumer<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    /// Consumer named `name` delegating to `handler`.
    pub fn new(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: Arc::from(name.into()),
            handler,
            counters: Arc::default(),
            exiting: AtomicBool::new(false),
            fatal: FatalSignal::new(),
            binding: RwLock::new(ConsumerBinding::default()),
            retried: Mutex::new(IndexSet::new()),
            held: AtomicU64::new(0),
            _payload: PhantomData,
        }
    }

    /// The wrapped handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Deliveries acknowledged so far.
    pub fn ack_count(&self) -> u64 {
        self.counters.acked.load(Ordering::Relaxed)
    }

    /// Deliveries rejected so far, requeued or not.
    pub fn nack_count(&self) -> u64 {
        self.counters.nacked.load(Ordering::Relaxed)
    }

    /// Deliveries left unsettled after unexpected failures.
    pub fn held_messages(&self) -> u64 {
        self.held.load(Ordering::Relaxed)
    }

    /// Run the handler on `message` without a broker.
    ///
    /// The handler sees a fresh header and tag [`TEST_DELIVERY_TAG`];
    /// failures take the same route as live deliveries, fatal included.
    pub async fn test_message(&self, message: T) {
        let header = MessageHeader::new(&ProcessIdentity::current(self.name.as_ref()));
        let metrics = self.binding.read().metrics.clone();
        let handle = AckHandle {
            consumer: self.name.clone(),
            acker: Acker::detached(),
            counters: self.counters.clone(),
            metrics,
        };
        handle.acker.track(TEST_DELIVERY_TAG);
        debug!(consumer = %self.name, "dispatching test message");
        self.dispatch(&handle, header, message, TEST_DELIVERY_TAG)
            .await;
    }

    fn ack_handle(&self) -> AckHandle {
        let binding = self.binding.read();
        AckHandle {
            consumer: self.name.clone(),
            acker: binding.acker.clone(),
            counters: self.counters.clone(),
            metrics: binding.metrics.clone(),
        }
    }

    async fn dispatch(&self, handle: &AckHandle, header: MessageHeader, message: T, tag: DeliveryTag) {
        let outcome = AssertUnwindSafe(self.handler.process_message(&header, message, tag, handle))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                if handle.is_pending(tag) {
                    header.log(
                        Level::WARN,
                        &format!("{}: handler returned without settling delivery {tag}", self.name),
                    );
                }
            }
            Ok(Err(HandlerError::Application { reason })) => {
                if handle.is_pending(tag) {
                    if let Err(err) = handle.error_and_nack(&header, tag, &reason).await {
                        error!(consumer = %self.name, delivery_tag = tag, error = %err, "could not reject delivery");
                    }
                } else {
                    header.log(
                        Level::ERROR,
                        &format!("{}: handler failed after settling delivery {tag}: {reason}", self.name),
                    );
                }
            }
            Ok(Err(HandlerError::Unexpected(err))) => {
                let message = format!("unhandled exception processing message {}", header.message_guid());
                self.unhandled(&header, tag, message, Some(err));
            }
            Err(panic) => {
                let message = format!(
                    "handler panicked processing message {}: {}",
                    header.message_guid(),
                    panic_message(panic.as_ref())
                );
                self.unhandled(&header, tag, message, None);
            }
        }
    }

    fn unhandled(&self, header: &MessageHeader, tag: DeliveryTag, message: String, error: Option<anyhow::Error>) {
        let binding = self.binding.read();
        if binding.hold_unprocessable_messages {
            let held = self.held.fetch_add(1, Ordering::Relaxed) + 1;
            header.log(
                Level::ERROR,
                &format!("{}: {message}; holding delivery {tag} unacknowledged", self.name),
            );
            if binding.prefetch_count > 0 && held >= u64::from(binding.prefetch_count) {
                warn!(
                    consumer = %self.name,
                    held,
                    prefetch = binding.prefetch_count,
                    "held messages fill the prefetch window; no further deliveries will arrive"
                );
            }
            return;
        }
        let metrics = binding.metrics.clone();
        drop(binding);

        // Every failure is logged; only the first one raises the fatal.
        match &error {
            Some(err) => header.log(Level::ERROR, &format!("{}: {message}: {err:#}", self.name)),
            None => header.log(Level::ERROR, &format!("{}: {message}", self.name)),
        }
        if self
            .exiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(consumer = %self.name, "consumer already exiting; fatal not raised again");
            return;
        }
        if let Some(metrics) = metrics {
            metrics.observe_fatal("consumer");
        }
        self.fatal.raise(FatalErrorEvent::new(
            FatalOrigin::Consumer {
                name: self.name.to_string(),
            },
            message,
            error,
        ));
    }

    async fn payload_failure(&self, handle: &AckHandle, header: &MessageHeader, delivery: &Delivery, err: serde_json::Error) {
        let tag = delivery.delivery_tag;
        let outcome = match err.classify() {
            Category::Data => {
                handle
                    .error_and_nack(header, tag, format!("payload does not match the expected type: {err}"))
                    .await
            }
            Category::Syntax | Category::Eof | Category::Io => {
                let seen_before = {
                    let mut retried = self.retried.lock();
                    let seen = retried.shift_remove(&tag) || delivery.redelivered;
                    if !seen {
                        if retried.len() >= RETRY_MEMORY {
                            retried.shift_remove_index(0);
                        }
                        retried.insert(tag);
                    }
                    seen
                };
                if seen_before {
                    handle
                        .error_and_nack(header, tag, format!("payload still unreadable after retry: {err}"))
                        .await
                } else {
                    header.log(
                        Level::WARN,
                        &format!("{}: unreadable payload on delivery {tag}, requeueing once: {err}", self.name),
                    );
                    handle.requeue(tag).await
                }
            }
        };
        if let Err(settle) = outcome {
            error!(consumer = %self.name, delivery_tag = tag, error = %settle, "could not reject delivery");
        }
    }
}

#[async_trait]
impl<T, H> DeliveryConsumer for Consumer<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, binding: ConsumerBinding) {
        *self.binding.write() = binding;
    }

    fn on_fatal(&self, handler: FatalHandler) {
        self.fatal.subscribe(handler);
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        if self.is_exiting() {
            debug!(consumer = %self.name, delivery_tag = tag, "consumer exiting; leaving delivery unsettled");
            return;
        }
        let handle = self.ack_handle();
        handle.acker.track(tag);

        let header = match delivery
            .properties
            .headers
            .as_ref()
            .ok_or(HeaderError::MissingTable)
            .and_then(MessageHeader::from_table)
        {
            Ok(header) => header,
            Err(err) => {
                error!(consumer = %self.name, delivery_tag = tag, error = %err, "message header unreadable; discarding");
                if let Err(settle) = handle.discard(tag).await {
                    error!(consumer = %self.name, delivery_tag = tag, error = %settle, "could not discard delivery");
                }
                return;
            }
        };

        match serde_json::from_slice::<T>(&delivery.body) {
            Ok(message) => self.dispatch(&handle, header, message, tag).await,
            Err(err) => self.payload_failure(&handle, &header, &delivery, err).await,
        }
    }

    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        if !self.exiting.swap(true, Ordering::AcqRel) {
            debug!(consumer = %self.name, "consumer stopping");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
