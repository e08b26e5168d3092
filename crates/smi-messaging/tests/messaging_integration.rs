//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "test"
//! smi_scope: "code"
//! smi_description: "Broker, consumer and producer behaviour against the in-memory broker."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smi_common::{ConsumerOptions, ProducerOptions};
use smi_messaging::{
    AckHandle, BrokerState, Consumer, ControlMessageConsumer, DeliveryTag, ExchangeKind, FatalErrorEvent,
    FatalHandler, HandlerError, InMemoryBroker, MessageBroker, MessageHandler, MessageHeader,
    MessageProperties, MessagingError, ProcessIdentity, ProducerModelExt,
};

const EXCHANGE: &str = "TEST.SeriesExchange";
const QUEUE: &str = "TEST.SeriesQueue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SeriesMessage {
    series_uid: String,
    image_count: u32,
}

fn series(n: u32) -> SeriesMessage {
    SeriesMessage {
        series_uid: format!("1.2.840.{n}"),
        image_count: n,
    }
}

#[derive(Default)]
struct Recording {
    seen: Mutex<Vec<(MessageHeader, SeriesMessage)>>,
}

#[async_trait]
impl MessageHandler<SeriesMessage> for Recording {
    async fn process_message(
        &self,
        header: &MessageHeader,
        message: SeriesMessage,
        tag: DeliveryTag,
        acks: &AckHandle,
    ) -> Result<(), HandlerError> {
        self.seen.lock().push((header.clone(), message));
        acks.ack(header, tag).await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}

struct Exploding;

#[async_trait]
impl MessageHandler<SeriesMessage> for Exploding {
    async fn process_message(
        &self,
        _header: &MessageHeader,
        _message: SeriesMessage,
        _tag: DeliveryTag,
        _acks: &AckHandle,
    ) -> Result<(), HandlerError> {
        Err(anyhow::anyhow!("database unavailable").into())
    }
}

struct Slow {
    started: Arc<AtomicBool>,
}

#[async_trait]
impl MessageHandler<SeriesMessage> for Slow {
    async fn process_message(
        &self,
        header: &MessageHeader,
        _message: SeriesMessage,
        tag: DeliveryTag,
        acks: &AckHandle,
    ) -> Result<(), HandlerError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        acks.ack(header, tag).await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}

fn topology() -> InMemoryBroker {
    let memory = InMemoryBroker::new();
    memory.declare_exchange(EXCHANGE, ExchangeKind::Direct);
    memory.declare_queue(QUEUE);
    memory.bind(QUEUE, EXCHANGE, "").expect("bind");
    memory
}

fn counting_fatal() -> (FatalHandler, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let handler: FatalHandler = Arc::new(move |_: FatalErrorEvent| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, count)
}

async fn connect(memory: &InMemoryBroker, fatal: FatalHandler) -> MessageBroker {
    MessageBroker::connect(memory.connection(), ProcessIdentity::new("IntegrationTests", 42), fatal)
        .await
        .expect("connect")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not reached in time");
}

fn raw_properties() -> MessageProperties {
    let mut properties = MessageProperties::json();
    properties.headers = Some(MessageHeader::new(&ProcessIdentity::new("Upstream", 7)).to_table());
    properties
}

#[tokio::test]
async fn missing_topology_is_reported_by_name() {
    let memory = InMemoryBroker::new();
    let (fatal, _) = counting_fatal();
    let broker = connect(&memory, fatal).await;

    let consumer = Arc::new(Consumer::new("Series", Recording::default()));
    let err = broker
        .start_consumer(&ConsumerOptions::new("TEST.Missing"), consumer, false)
        .await
        .expect_err("queue is missing");
    assert_eq!(err.to_string(), "Expected queue \"TEST.Missing\" to exist");

    let err = broker
        .setup_producer(&ProducerOptions::new("TEST.Missing"), true)
        .await
        .err()
        .expect("exchange is missing");
    assert!(matches!(err, MessagingError::ExchangeNotFound(name) if name == "TEST.Missing"));
    assert!(!broker.has_consumers());
}

#[tokio::test]
async fn published_messages_reach_the_handler_with_their_header() {
    let memory = topology();
    let (fatal, fatal_count) = counting_fatal();
    let broker = connect(&memory, fatal).await;

    let consumer = Arc::new(Consumer::new("Series", Recording::default()));
    broker
        .start_consumer(&ConsumerOptions::new(QUEUE).with_prefetch(5), consumer.clone(), false)
        .await
        .expect("consumer");
    let producer = broker
        .setup_producer(&ProducerOptions::new(EXCHANGE), false)
        .await
        .expect("producer");

    let first = producer.send_message(&series(1), None, None).await.expect("send");
    let second = producer
        .send_message(&series(2), Some(&first), None)
        .await
        .expect("send");

    eventually(|| consumer.ack_count() == 2).await;
    let seen = consumer.handler().seen.lock().clone();
    assert_eq!(seen[0].0, first);
    assert_eq!(seen[1].1, series(2));
    assert!(seen[1].0.is_descendant_of(&first));
    assert_eq!(seen[1].0, second);
    assert_eq!(memory.unacked_total(), 0);

    broker.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unreadable_payload_is_delivered_at_most_twice() {
    let memory = topology();
    let (fatal, fatal_count) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let consumer = Arc::new(Consumer::new("Series", Recording::default()));
    broker
        .start_consumer(&ConsumerOptions::new(QUEUE), consumer.clone(), false)
        .await
        .expect("consumer");

    memory
        .publish(EXCHANGE, "", raw_properties(), b"{\"series_uid\": ".to_vec())
        .expect("publish");

    eventually(|| consumer.nack_count() == 2).await;
    eventually(|| memory.unacked_total() == 0).await;
    assert_eq!(memory.queue_depth(QUEUE), Some(0));
    assert!(consumer.handler().seen.lock().is_empty());
    assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn payload_of_the_wrong_shape_is_rejected_without_retry() {
    let memory = topology();
    let (fatal, _) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let consumer = Arc::new(Consumer::new("Series", Recording::default()));
    broker
        .start_consumer(&ConsumerOptions::new(QUEUE), consumer.clone(), false)
        .await
        .expect("consumer");

    memory
        .publish(EXCHANGE, "", raw_properties(), br#"{"unexpected": true}"#.to_vec())
        .expect("publish");

    eventually(|| consumer.nack_count() == 1).await;
    eventually(|| memory.unacked_total() == 0).await;
    assert_eq!(memory.queue_depth(QUEUE), Some(0));
}

#[tokio::test]
async fn unexpected_handler_failure_raises_one_fatal_and_keeps_messages() {
    let memory = topology();
    let (fatal, fatal_count) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let consumer = Arc::new(Consumer::new("Series", Exploding));
    let options = ConsumerOptions::new(QUEUE).with_prefetch(1);
    broker
        .start_consumer(&options, consumer.clone(), false)
        .await
        .expect("consumer");

    let producer = broker
        .setup_producer(&ProducerOptions::new(EXCHANGE), false)
        .await
        .expect("producer");
    for n in 0..3 {
        producer.send_message(&series(n), None, None).await.expect("send");
    }

    eventually(|| fatal_count.load(Ordering::SeqCst) == 1).await;
    eventually(|| !broker.has_consumers()).await;
    eventually(|| memory.unacked_total() == 0).await;
    assert_eq!(memory.consumers_on(QUEUE), 0);
    assert!(matches!(
        broker.start_consumer(&options, consumer, false).await,
        Err(MessagingError::ConsumerExiting(name)) if name == "Series"
    ));

    broker.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    assert_eq!(fatal_count.load(Ordering::SeqCst), 1);
    assert_eq!(memory.queue_depth(QUEUE), Some(3));
}

#[tokio::test]
async fn stopped_consumer_cannot_be_started_again() {
    let memory = topology();
    let (fatal, fatal_count) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let consumer = Arc::new(Consumer::new("Series", Recording::default()));
    let options = ConsumerOptions::new(QUEUE);
    let id = broker
        .start_consumer(&options, consumer.clone(), false)
        .await
        .expect("consumer");
    broker.stop_consumer(id, Duration::from_secs(1)).await.expect("stop");

    let err = broker
        .start_consumer(&options, consumer.clone(), false)
        .await
        .expect_err("exiting consumer");
    assert!(matches!(err, MessagingError::ConsumerExiting(name) if name == "Series"));
    assert!(!broker.has_consumers());
    assert_eq!(memory.consumers_on(QUEUE), 0);

    memory
        .publish(EXCHANGE, "", raw_properties(), serde_json::to_vec(&series(1)).expect("json"))
        .expect("publish");
    assert_eq!(memory.queue_depth(QUEUE), Some(1));
    assert_eq!(memory.unacked_total(), 0);
    assert_eq!(consumer.nack_count(), 0);
    assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn solo_consumer_is_refused_on_a_busy_queue() {
    let memory = topology();
    let (fatal, _) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let options = ConsumerOptions::new(QUEUE);

    broker
        .start_consumer(&options, Arc::new(Consumer::new("First", Recording::default())), true)
        .await
        .expect("first solo consumer");
    let err = broker
        .start_consumer(&options, Arc::new(Consumer::new("Second", Recording::default())), true)
        .await
        .expect_err("queue already consumed");
    assert!(matches!(err, MessagingError::QueueAlreadyConsumed(_)));
    assert_eq!(memory.consumers_on(QUEUE), 1);
}

#[tokio::test]
async fn stopping_a_consumer_twice_is_an_error() {
    let memory = topology();
    let (fatal, _) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let id = broker
        .start_consumer(&ConsumerOptions::new(QUEUE), Arc::new(Consumer::new("Series", Recording::default())), false)
        .await
        .expect("consumer");

    broker.stop_consumer(id, Duration::from_secs(1)).await.expect("first stop");
    assert_eq!(memory.consumers_on(QUEUE), 0);
    assert!(matches!(
        broker.stop_consumer(id, Duration::from_secs(1)).await,
        Err(MessagingError::UnknownSubscription(found)) if found == id
    ));

    broker.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    assert!(matches!(
        broker.stop_consumer(id, Duration::from_secs(1)).await,
        Err(MessagingError::BrokerShutdown)
    ));
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_on_a_stuck_handler_after_the_timeout() {
    let memory = topology();
    let (fatal, fatal_count) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let started = Arc::new(AtomicBool::new(false));
    broker
        .start_consumer(
            &ConsumerOptions::new(QUEUE),
            Arc::new(Consumer::new("Slow", Slow { started: started.clone() })),
            false,
        )
        .await
        .expect("consumer");
    memory
        .publish(EXCHANGE, "", raw_properties(), serde_json::to_vec(&series(1)).expect("json"))
        .expect("publish");
    eventually(|| started.load(Ordering::SeqCst)).await;

    let err = broker
        .shutdown(Duration::from_millis(100))
        .await
        .expect_err("handler outlives the window");
    assert!(matches!(err, MessagingError::ShutdownTimeout { pending: 1, .. }));
    assert_eq!(broker.state(), BrokerState::Shutdown);
    assert_eq!(memory.queue_depth(QUEUE), Some(1));
    assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unroutable_publish_raises_a_producer_fatal() {
    let memory = topology();
    memory.declare_exchange("TEST.UnboundExchange", ExchangeKind::Direct);
    let (fatal, fatal_count) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let producer = broker
        .setup_producer(&ProducerOptions::new("TEST.UnboundExchange"), false)
        .await
        .expect("producer");

    let err = producer
        .send_message(&series(1), None, Some("nowhere"))
        .await
        .expect_err("nothing bound");
    assert!(matches!(err, MessagingError::PublishReturned(exchange) if exchange == "TEST.UnboundExchange"));
    assert_eq!(fatal_count.load(Ordering::SeqCst), 1);
    assert!(matches!(
        producer.send_message(&series(2), None, Some("nowhere")).await,
        Err(MessagingError::ProducerFaulted(_))
    ));
    assert_eq!(fatal_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_producer_confirms_once_for_many_sends() {
    let memory = topology();
    let (fatal, _) = counting_fatal();
    let broker = connect(&memory, fatal).await;
    let producer = broker
        .setup_producer(&ProducerOptions::new(EXCHANGE), true)
        .await
        .expect("producer");

    for n in 0..3 {
        producer.send_message(&series(n), None, Some("")).await.expect("send");
    }
    assert_eq!(producer.unconfirmed(), 3);
    producer.wait_for_confirms().await.expect("confirm");
    assert_eq!(producer.unconfirmed(), 0);
    assert_eq!(memory.published_to(EXCHANGE).len(), 3);
    assert_eq!(memory.queue_depth(QUEUE), Some(3));
}

#[tokio::test]
async fn control_stop_reaches_the_stop_callback() {
    let memory = InMemoryBroker::new();
    memory.declare_exchange("TEST.ControlExchange", ExchangeKind::Topic);
    let (fatal, _) = counting_fatal();
    let broker = connect(&memory, fatal).await;

    let identity = ProcessIdentity::new("IntegrationTests", 42);
    let control = Arc::new(ControlMessageConsumer::new(&identity, "TEST.ControlExchange", "smi.control"));
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    control.on_stop(Arc::new(move |reason: String| sink.lock().push(reason)));
    broker
        .start_control_consumer(control.clone())
        .await
        .expect("control consumer");
    assert!(memory.has_queue("control.integrationtests42"));

    memory
        .publish("TEST.ControlExchange", "smi.control.someoneelse.stop", MessageProperties::default(), Vec::new())
        .expect("publish");
    memory
        .publish("TEST.ControlExchange", "smi.control.all.stop", MessageProperties::default(), Vec::new())
        .expect("publish");

    eventually(|| !reasons.lock().is_empty()).await;
    assert_eq!(reasons.lock().as_slice(), ["Control message stop".to_owned()]);

    control.shutdown().await;
    broker.shutdown(Duration::from_secs(1)).await.expect("shutdown");
    assert!(!memory.has_queue("control.integrationtests42"));
}
