//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Fatal error events raised by consumers and producers."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Component that raised a fatal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalOrigin {
    /// A consumer's message handler failed unexpectedly.
    Consumer {
        /// Consumer name.
        name: String,
    },
    /// A producer could not get its publishes confirmed.
    Producer {
        /// Target exchange.
        exchange: String,
    },
    /// The broker lifecycle manager itself.
    Broker,
}

impl FatalOrigin {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FatalOrigin::Consumer { .. } => "consumer",
            FatalOrigin::Producer { .. } => "producer",
            FatalOrigin::Broker => "broker",
        }
    }
}

impl fmt::Display for FatalOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalOrigin::Consumer { name } => write!(f, "consumer {name}"),
            FatalOrigin::Producer { exchange } => write!(f, "producer for {exchange}"),
            FatalOrigin::Broker => f.write_str("message broker"),
        }
    }
}

/// Notification that a component cannot continue.
#[derive(Debug, Clone)]
pub struct FatalErrorEvent {
    /// Human readable description.
    pub message: String,
    /// Underlying cause when one is available.
    pub error: Option<Arc<anyhow::Error>>,
    /// Component that raised the event.
    pub origin: FatalOrigin,
}

impl FatalErrorEvent {
    /// Build an event.
    pub fn new(origin: FatalOrigin, message: impl Into<String>, error: Option<anyhow::Error>) -> Self {
        Self {
            message: message.into(),
            error: error.map(Arc::new),
            origin,
        }
    }
}

impl fmt::Display for FatalErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.message)?;
        if let Some(err) = &self.error {
            write!(f, " ({err:#})")?;
        }
        Ok(())
    }
}

/// Callback invoked when a fatal event is raised. Must not block.
pub type FatalHandler = Arc<dyn Fn(FatalErrorEvent) + Send + Sync>;

/// One-shot fatal notification shared by a component.
///
/// The first [`FatalSignal::raise`] wins; later calls are ignored so
/// subscribers observe at most one event per component.
#[derive(Default)]
pub struct FatalSignal {
    raised: AtomicBool,
    handlers: Mutex<Vec<FatalHandler>>,
}

impl FatalSignal {
    /// Fresh, un-raised signal with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber.
    pub fn subscribe(&self, handler: FatalHandler) {
        self.handlers.lock().push(handler);
    }

    /// Whether the signal has fired.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Fire the signal; returns `false` when it had already fired.
    pub fn raise(&self, event: FatalErrorEvent) -> bool {
        if self
            .raised
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(origin = %event.origin, "fatal already raised; ignoring repeat");
            return false;
        }
        tracing::error!(origin = %event.origin, error = %event, "fatal error raised");
        let handlers = self.handlers.lock().clone();
        if handlers.is_empty() {
            tracing::warn!(origin = %event.origin, "fatal error raised with no subscribers");
        }
        for handler in handlers {
            handler(event.clone());
        }
        true
    }
}

impl fmt::Debug for FatalSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalSignal")
            .field("raised", &self.is_raised())
            .field("subscribers", &self.handlers.lock().len())
            .finish()
    }
}
