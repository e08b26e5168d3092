//! ---
//! smi_section: "03-service-host"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "MicroserviceHost lifecycle: aux connections, fatal handling, stop."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use smi_common::{init_tracing, AppConfig, ProducerOptions, RabbitOptions};
use smi_messaging::{
    Connection, ControlHandler, ControlMessageConsumer, FatalErrorEvent, FatalHandler, MessageBroker,
    MessagingMetrics, ProcessIdentity, ProducerModel, ProducerModelExt, DEFAULT_OPERATION_TIMEOUT,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fatal::FatalErrorMessage;

/// Business logic run inside a [`MicroserviceHost`].
#[async_trait]
pub trait Microservice: Send + Sync {
    /// Start consumers and producers through [`MicroserviceHost::broker`].
    async fn start(&self, host: &MicroserviceHost) -> Result<()>;
}

enum HostEvent {
    Fatal(FatalErrorEvent),
    Stop(String),
}

/// Owner of the broker manager, the control consumer and the fatal producer.
pub struct MicroserviceHost {
    identity: ProcessIdentity,
    broker: MessageBroker,
    control: Arc<ControlMessageConsumer>,
    fatal_options: Option<ProducerOptions>,
    fatal_producer: Mutex<Option<Arc<dyn ProducerModel>>>,
    aux_started: tokio::sync::Mutex<bool>,
    stop_called: AtomicBool,
    fatal_occurred: AtomicBool,
    stopped: CancellationToken,
}

impl std::fmt::Debug for MicroserviceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroserviceHost")
            .field("identity", &self.identity)
            .field("broker", &self.broker)
            .field("stop_called", &self.stop_called.load(Ordering::Relaxed))
            .finish()
    }
}

impl MicroserviceHost {
    /// Connect the host to the broker behind `connection`.
    ///
    /// Fatal events from the broker and every consumer or producer it
    /// creates, and `stop` control messages, are handled on a background task.
    pub async fn connect(
        rabbit: &RabbitOptions,
        connection: Arc<dyn Connection>,
        identity: ProcessIdentity,
        metrics: Option<MessagingMetrics>,
    ) -> Result<Arc<Self>> {
        let control_exchange = rabbit
            .control_exchange_name
            .clone()
            .ok_or_else(|| anyhow!("rabbit.control_exchange_name must be configured"))?;
        info!(
            process = identity.executable_name(),
            pid = identity.process_id(),
            "starting microservice host"
        );

        let (events, receiver) = mpsc::unbounded_channel();
        let fatal_events = events.clone();
        let fatal_handler: FatalHandler = Arc::new(move |event: FatalErrorEvent| {
            if fatal_events.send(HostEvent::Fatal(event)).is_err() {
                debug!("host event loop gone; fatal event dropped");
            }
        });

        let mut broker = MessageBroker::connect(connection, identity.clone(), fatal_handler)
            .await
            .context("could not connect to the message broker")?;
        if let Some(metrics) = metrics {
            broker = broker.with_metrics(metrics);
        }

        let control = Arc::new(ControlMessageConsumer::new(
            &identity,
            control_exchange,
            rabbit.control_namespace.clone(),
        ));
        control.on_stop(Arc::new(move |reason: String| {
            if events.send(HostEvent::Stop(reason)).is_err() {
                debug!("host event loop gone; stop request dropped");
            }
        }));

        let host = Arc::new(Self {
            identity,
            broker,
            control,
            fatal_options: rabbit.fatal_logging_exchange.clone().map(ProducerOptions::new),
            fatal_producer: Mutex::new(None),
            aux_started: tokio::sync::Mutex::new(false),
            stop_called: AtomicBool::new(false),
            fatal_occurred: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        });
        tokio::spawn(event_loop(Arc::downgrade(&host), receiver));
        Ok(host)
    }

    /// Process entry point for a service described by `config`.
    ///
    /// Installs tracing from `[logging]`, names the process after
    /// `host_process_name` or `default_name`, then connects and runs
    /// `service` until it stops. Returns the process exit code.
    pub async fn run_configured<S: Microservice + ?Sized>(
        config: &AppConfig,
        default_name: &str,
        connection: Arc<dyn Connection>,
        service: &S,
    ) -> Result<i32> {
        config.validate()?;
        let identity = ProcessIdentity::current(config.host_process_name.as_deref().unwrap_or(default_name));
        let target = init_tracing(identity.executable_name(), identity.process_id(), &config.logging)
            .context("could not initialise logging")?;
        debug!(log_dir = %target.directory.display(), "logging initialised");
        let host = Self::connect(&config.rabbit, connection, identity, None).await?;
        Ok(host.run(service).await)
    }

    /// Identity stamped on everything this host publishes.
    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Broker manager used to start consumers and producers.
    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    /// Route forwarded control actions to `handler`.
    pub fn add_control_handler(&self, handler: Arc<dyn ControlHandler>) {
        self.control.add_handler(handler);
    }

    /// Set up the fatal logging producer and subscribe the control queue.
    ///
    /// Runs once; later calls return immediately. Refused when a consumer
    /// was started before it.
    pub async fn start_aux_connections(&self) -> Result<()> {
        let mut started = self.aux_started.lock().await;
        if *started {
            return Ok(());
        }
        *started = true;

        if self.broker.has_consumers() {
            bail!("message broker has consumers before aux connections were created");
        }
        if let Some(options) = &self.fatal_options {
            let producer = self
                .broker
                .setup_producer(options, false)
                .await
                .with_context(|| format!("could not set up fatal logging producer for {}", options.exchange_name))?;
            *self.fatal_producer.lock() = Some(producer);
        } else {
            warn!("no fatal logging exchange configured; fatal errors are only logged");
        }
        self.broker
            .start_control_consumer(self.control.clone())
            .await
            .context("could not start the control consumer")?;
        info!(queue = self.control.queue_name(), "aux connections started");
        Ok(())
    }

    /// Start aux connections, then `service`, and run until stopped or interrupted.
    ///
    /// Returns the process exit code.
    pub async fn run<S: Microservice + ?Sized>(&self, service: &S) -> i32 {
        if let Err(err) = self.start_aux_connections().await {
            self.fatal("could not start aux connections", Some(&err)).await;
            return self.exit_code();
        }
        if let Err(err) = service.start(self).await {
            self.fatal("service failed to start", Some(&err)).await;
            return self.exit_code();
        }
        tokio::select! {
            _ = self.wait() => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => self.stop("interrupt received").await,
                Err(err) => warn!(error = %err, "could not listen for interrupts"),
            },
        }
        self.wait().await;
        self.exit_code()
    }

    /// Log `message`, report it on the fatal logging exchange, then stop.
    pub async fn fatal(&self, message: &str, error: Option<&anyhow::Error>) {
        match error {
            Some(err) => error!(error = %format!("{err:#}"), "{message}"),
            None => error!("{message}"),
        }
        self.fatal_occurred.store(true, Ordering::Release);
        if self.stop_called.load(Ordering::Acquire) {
            return;
        }

        let producer = self.fatal_producer.lock().clone();
        if let Some(producer) = producer {
            let report = FatalErrorMessage::new(message, error);
            if let Err(err) = producer.send_message(&report, None, None).await {
                error!(error = %err, "failed to log fatal error");
            }
        }
        self.stop(&format!("Fatal error in MicroserviceHost ({message})"))
            .await;
    }

    /// Shut down the control queue and the broker. Later calls only warn.
    pub async fn stop(&self, reason: &str) {
        info!(reason, "host stop called");
        if self.stop_called.swap(true, Ordering::AcqRel) {
            warn!("host stop called twice");
            return;
        }

        debug!("shutting down broker connections");
        self.control.shutdown().await;
        if let Err(err) = self.broker.shutdown(DEFAULT_OPERATION_TIMEOUT).await {
            error!(error = %err, "message broker did not shut down cleanly");
        }
        self.stopped.cancel();
        info!("host stop completed");
    }

    /// Resolve once [`Self::stop`] has completed.
    pub async fn wait(&self) {
        self.stopped.cancelled().await;
    }

    /// Whether [`Self::stop`] has completed.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// `1` once a fatal error occurred, `0` otherwise.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.fatal_occurred.load(Ordering::Acquire))
    }
}

async fn event_loop(host: Weak<MicroserviceHost>, mut events: mpsc::UnboundedReceiver<HostEvent>) {
    while let Some(event) = events.recv().await {
        let Some(host) = host.upgrade() else {
            break;
        };
        match event {
            HostEvent::Fatal(event) => {
                let message = event.to_string();
                host.fatal(&message, event.error.as_deref()).await;
            }
            HostEvent::Stop(reason) => host.stop(&reason).await,
        }
    }
    debug!("host event loop finished");
}
