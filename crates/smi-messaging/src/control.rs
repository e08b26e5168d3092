//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Out-of-band control signals delivered to running services."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
//! Control messages arrive on a per-process, auto-deleted queue bound to the
//! shared control exchange. The routing key carries the target and action
//! (`<namespace>.<actor>.<action>`), the body an optional free-text argument.
//! Anything this process does not understand is ignored.
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::consumer::{ConsumerBinding, DeliveryConsumer};
use crate::events::{FatalErrorEvent, FatalHandler, FatalOrigin, FatalSignal};
use crate::header::ProcessIdentity;
use crate::transport::{Channel, Delivery, QueueDeclareOptions};

/// Default routing-key namespace for control messages.
pub const DEFAULT_CONTROL_NAMESPACE: &str = "smi.control";

/// Receiver of control actions addressed to this process.
pub trait ControlHandler: Send + Sync {
    /// Handle `action` with its optional argument. Must not block.
    fn handle(&self, action: &str, argument: Option<&str>);
}

impl<F> ControlHandler for F
where
    F: Fn(&str, Option<&str>) + Send + Sync,
{
    fn handle(&self, action: &str, argument: Option<&str>) {
        self(action, argument)
    }
}

/// Callback run when a stop request arrives; receives the reason.
pub type StopHandler = Arc<dyn Fn(String) + Send + Sync>;

/// What a routing key asks this process to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Not for us, malformed, or an unhandled broadcast.
    Ignore,
    /// Stop the host.
    Stop,
    /// Liveness check; answered in the log.
    Ping,
    /// Pass the action (digits removed) to registered handlers.
    Forward {
        /// Action name.
        action: String,
    },
}

/// Consumer for the control exchange.
pub struct ControlMessageConsumer {
    process_name: String,
    process_id: String,
    namespace: String,
    exchange: String,
    queue_name: String,
    handlers: RwLock<Vec<Arc<dyn ControlHandler>>>,
    stop: RwLock<Option<StopHandler>>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    exiting: AtomicBool,
    fatal: FatalSignal,
}

impl std::fmt::Debug for ControlMessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlMessageConsumer")
            .field("queue", &self.queue_name)
            .field("exchange", &self.exchange)
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl ControlMessageConsumer {
    /// Control consumer for `identity` on `exchange`, matching keys under `namespace`.
    pub fn new(identity: &ProcessIdentity, exchange: impl Into<String>, namespace: impl Into<String>) -> Self {
        let process_name = identity.executable_name().to_lowercase();
        let process_id = identity.process_id().to_string();
        let namespace = namespace.into().trim_matches('.').to_lowercase();
        Self {
            queue_name: format!("control.{process_name}{process_id}"),
            process_name,
            process_id,
            namespace,
            exchange: exchange.into(),
            handlers: RwLock::new(Vec::new()),
            stop: RwLock::new(None),
            channel: RwLock::new(None),
            exiting: AtomicBool::new(false),
            fatal: FatalSignal::new(),
        }
    }

    /// Ephemeral queue owned by this process.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Control exchange the queue is bound to.
    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    /// Broadcast and process-specific binding keys.
    pub fn binding_keys(&self) -> [String; 2] {
        [
            format!("{}.all.*", self.namespace),
            format!("{}.{}.*", self.namespace, self.process_name),
        ]
    }

    /// Declaration flags for the control queue.
    pub fn queue_options() -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: false,
            exclusive: false,
            auto_delete: true,
        }
    }

    /// Register a handler for forwarded actions.
    pub fn add_handler(&self, handler: Arc<dyn ControlHandler>) {
        self.handlers.write().push(handler);
    }

    /// Set the callback run on a stop request.
    pub fn on_stop(&self, handler: StopHandler) {
        *self.stop.write() = Some(handler);
    }

    /// Remember the channel the queue lives on, for [`Self::shutdown`].
    pub fn bind_channel(&self, channel: Arc<dyn Channel>) {
        *self.channel.write() = Some(channel);
    }

    /// Decide what a routing key asks of this process.
    pub fn route(&self, routing_key: &str) -> ControlAction {
        let key = routing_key.to_lowercase();
        let Some(rest) = key
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            return ControlAction::Ignore;
        };
        let segments: Vec<&str> = rest.split('.').collect();
        let Some((action, actor)) = segments.split_last() else {
            return ControlAction::Ignore;
        };
        let actor = actor.join(".");
        if actor.is_empty() || action.is_empty() {
            return ControlAction::Ignore;
        }
        if action.chars().any(|c| c.is_ascii_digit()) && !action.ends_with(&self.process_id) {
            return ControlAction::Ignore;
        }
        if actor != "all" && actor != self.process_name {
            return ControlAction::Ignore;
        }
        if action.starts_with("stop") {
            return ControlAction::Stop;
        }
        if action.starts_with("ping") {
            return ControlAction::Ping;
        }
        if actor == "all" {
            return ControlAction::Ignore;
        }
        ControlAction::Forward {
            action: action.chars().filter(|c| !c.is_ascii_digit()).collect(),
        }
    }

    /// Delete the control queue. Failures are logged; the queue is
    /// auto-deleted on disconnect anyway.
    pub async fn shutdown(&self) {
        self.exiting.store(true, Ordering::Release);
        let channel = self.channel.read().clone();
        let Some(channel) = channel else {
            debug!(queue = %self.queue_name, "control consumer was never bound; nothing to delete");
            return;
        };
        debug!(queue = %self.queue_name, "deleting control queue");
        if let Err(err) = channel.queue_delete(&self.queue_name).await {
            warn!(queue = %self.queue_name, error = %err, "could not delete control queue");
        }
    }

    fn forward(&self, action: &str, argument: Option<&str>) {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            warn!(action, "unhandled control action; no handlers registered");
            return;
        }
        for handler in handlers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(action, argument)));
            if outcome.is_err() {
                self.exiting.store(true, Ordering::Release);
                self.fatal.raise(FatalErrorEvent::new(
                    FatalOrigin::Consumer {
                        name: self.queue_name.clone(),
                    },
                    format!("control handler panicked on action '{action}'"),
                    None,
                ));
                return;
            }
        }
    }
}

#[async_trait]
impl DeliveryConsumer for ControlMessageConsumer {
    fn name(&self) -> &str {
        &self.queue_name
    }

    fn attach(&self, binding: ConsumerBinding) {
        if !binding.acker.auto_ack() {
            warn!(queue = %self.queue_name, "control consumer attached without auto-ack; deliveries stay unsettled");
        }
    }

    fn on_fatal(&self, handler: FatalHandler) {
        self.fatal.subscribe(handler);
    }

    async fn process_delivery(&self, delivery: Delivery) {
        if self.is_exiting() {
            return;
        }
        info!(routing_key = %delivery.routing_key, "control message received");
        // The body is forwarded as sent; only an empty body means no argument.
        let body = String::from_utf8_lossy(&delivery.body);
        let argument = (!delivery.body.is_empty()).then_some(&*body);

        match self.route(&delivery.routing_key) {
            ControlAction::Ignore => {
                debug!(routing_key = %delivery.routing_key, "control message not for this process");
            }
            ControlAction::Stop => {
                info!("stop request received");
                let stop = self.stop.read().clone();
                match stop {
                    Some(stop) => stop("Control message stop".to_owned()),
                    None => warn!("stop request received but no stop handler is registered"),
                }
            }
            ControlAction::Ping => info!(process = %self.process_name, pid = %self.process_id, "Pong!"),
            ControlAction::Forward { action } => self.forward(&action, argument),
        }
    }

    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        self.exiting.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MessageProperties;
    use parking_lot::Mutex;

    fn consumer() -> ControlMessageConsumer {
        ControlMessageConsumer::new(
            &ProcessIdentity::new("CohortExtractor", 1234),
            "TEST.ControlExchange",
            DEFAULT_CONTROL_NAMESPACE,
        )
    }

    fn delivery(routing_key: &str, body: &str) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "TEST.ControlExchange".into(),
            routing_key: routing_key.into(),
            redelivered: false,
            properties: MessageProperties::default(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn names_follow_process_identity() {
        let consumer = consumer();
        assert_eq!(consumer.queue_name(), "control.cohortextractor1234");
        assert_eq!(
            consumer.binding_keys(),
            [
                "smi.control.all.*".to_owned(),
                "smi.control.cohortextractor.*".to_owned()
            ]
        );
    }

    #[test]
    fn routing_rules() {
        let consumer = consumer();
        assert_eq!(consumer.route("smi.control.all.stop"), ControlAction::Stop);
        assert_eq!(consumer.route("SMI.Control.CohortExtractor.Ping"), ControlAction::Ping);
        assert_eq!(consumer.route("smi.control.all.refresh"), ControlAction::Ignore);
        assert_eq!(consumer.route("smi.control.other.refresh"), ControlAction::Ignore);
        assert_eq!(consumer.route("smi.control.stop"), ControlAction::Ignore);
        assert_eq!(consumer.route("other.control.all.stop"), ControlAction::Ignore);
        assert_eq!(
            consumer.route("smi.control.cohortextractor.refresh"),
            ControlAction::Forward {
                action: "refresh".into()
            }
        );
        assert_eq!(
            consumer.route("smi.control.cohortextractor.refresh1234"),
            ControlAction::Forward {
                action: "refresh".into()
            }
        );
        assert_eq!(consumer.route("smi.control.cohortextractor.refresh999"), ControlAction::Ignore);
        assert_eq!(consumer.route("smi.control.all.stop1234"), ControlAction::Stop);
    }

    #[test]
    fn actor_may_contain_dots() {
        let consumer = ControlMessageConsumer::new(
            &ProcessIdentity::new("Dicom.Relational", 5),
            "TEST.ControlExchange",
            "smi.control",
        );
        assert_eq!(
            consumer.route("smi.control.dicom.relational.flush"),
            ControlAction::Forward {
                action: "flush".into()
            }
        );
    }

    #[tokio::test]
    async fn forwards_argument_to_handlers() {
        let consumer = consumer();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer.add_handler(Arc::new(move |action: &str, argument: Option<&str>| {
            sink.lock().push((action.to_owned(), argument.map(str::to_owned)));
        }));
        consumer
            .process_delivery(delivery("smi.control.cohortextractor.reprocess", "job-42"))
            .await;
        consumer
            .process_delivery(delivery("smi.control.all.reprocess", "ignored"))
            .await;
        consumer
            .process_delivery(delivery("smi.control.cohortextractor.reprocess", "  series 1.2.3\n"))
            .await;
        consumer
            .process_delivery(delivery("smi.control.cohortextractor.reprocess", " "))
            .await;
        consumer
            .process_delivery(delivery("smi.control.cohortextractor.reprocess", ""))
            .await;
        assert_eq!(
            *seen.lock(),
            vec![
                ("reprocess".to_owned(), Some("job-42".to_owned())),
                ("reprocess".to_owned(), Some("  series 1.2.3\n".to_owned())),
                ("reprocess".to_owned(), Some(" ".to_owned())),
                ("reprocess".to_owned(), None),
            ]
        );
    }

    #[tokio::test]
    async fn stop_invokes_callback() {
        let consumer = consumer();
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = reasons.clone();
        consumer.on_stop(Arc::new(move |reason: String| sink.lock().push(reason)));
        consumer.process_delivery(delivery("smi.control.all.stop", "")).await;
        assert_eq!(*reasons.lock(), vec!["Control message stop".to_owned()]);
    }

    #[tokio::test]
    async fn panicking_handler_raises_fatal() {
        let consumer = consumer();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        consumer.on_fatal(Arc::new(move |_: FatalErrorEvent| flag.store(true, Ordering::SeqCst)));
        consumer.add_handler(Arc::new(|_: &str, _: Option<&str>| panic!("bad handler")));
        consumer
            .process_delivery(delivery("smi.control.cohortextractor.refresh", ""))
            .await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(consumer.is_exiting());
    }
}
