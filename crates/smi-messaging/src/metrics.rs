//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Prometheus counters for consumer and producer activity."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

/// Prometheus metric handles for messaging activity.
///
/// Handles are cheap to clone; every clone feeds the same collectors.
#[derive(Clone)]
pub struct MessagingMetrics {
    acked: IntCounterVec,
    nacked: IntCounterVec,
    published: IntCounterVec,
    confirm_timeouts: IntCounterVec,
    fatal_events: IntCounterVec,
    lineage_latency: Histogram,
}

impl MessagingMetrics {
    /// Build metric handles without registering them anywhere.
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            acked: IntCounterVec::new(
                Opts::new("smi_messages_acked_total", "Deliveries acknowledged by consumers"),
                &["consumer"],
            )?,
            nacked: IntCounterVec::new(
                Opts::new("smi_messages_nacked_total", "Deliveries rejected by consumers"),
                &["consumer"],
            )?,
            published: IntCounterVec::new(
                Opts::new("smi_messages_published_total", "Messages handed to the broker"),
                &["exchange"],
            )?,
            confirm_timeouts: IntCounterVec::new(
                Opts::new(
                    "smi_publish_confirm_timeouts_total",
                    "Publisher confirm waits that timed out",
                ),
                &["exchange"],
            )?,
            fatal_events: IntCounterVec::new(
                Opts::new("smi_fatal_events_total", "Fatal errors raised by the runtime"),
                &["origin"],
            )?,
            lineage_latency: Histogram::with_opts(
                HistogramOpts::new(
                    "smi_lineage_age_seconds",
                    "Age of acknowledged messages relative to their original publish time",
                )
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 3600.0]),
            )?,
        })
    }

    /// Build metric handles and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::new()?;
        registry.register(Box::new(metrics.acked.clone()))?;
        registry.register(Box::new(metrics.nacked.clone()))?;
        registry.register(Box::new(metrics.published.clone()))?;
        registry.register(Box::new(metrics.confirm_timeouts.clone()))?;
        registry.register(Box::new(metrics.fatal_events.clone()))?;
        registry.register(Box::new(metrics.lineage_latency.clone()))?;
        Ok(metrics)
    }

    /// Record acknowledged deliveries.
    pub fn observe_acked(&self, consumer: &str, count: u64) {
        self.acked.with_label_values(&[consumer]).inc_by(count);
    }

    /// Record rejected deliveries.
    pub fn observe_nacked(&self, consumer: &str) {
        self.nacked.with_label_values(&[consumer]).inc();
    }

    /// Record a publish.
    pub fn observe_published(&self, exchange: &str) {
        self.published.with_label_values(&[exchange]).inc();
    }

    /// Record a confirm wait that timed out.
    pub fn observe_confirm_timeout(&self, exchange: &str) {
        self.confirm_timeouts.with_label_values(&[exchange]).inc();
    }

    /// Record a fatal error.
    pub fn observe_fatal(&self, origin: &str) {
        self.fatal_events.with_label_values(&[origin]).inc();
    }

    /// Record how long ago the causal chain of an acknowledged message began.
    pub fn observe_lineage_age(&self, seconds: i64) {
        if seconds >= 0 {
            self.lineage_latency.observe(seconds as f64);
        }
    }
}

impl std::fmt::Debug for MessagingMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_gathered() {
        let registry = Registry::new();
        let metrics = MessagingMetrics::register(&registry).expect("register metrics");
        metrics.observe_acked("IdentifierMapper", 3);
        metrics.observe_nacked("IdentifierMapper");
        metrics.observe_published("TEST.IdentifiableImageExchange");
        metrics.observe_lineage_age(2);

        let families = registry.gather();
        let acked = families
            .iter()
            .find(|f| f.get_name() == "smi_messages_acked_total")
            .expect("acked family");
        assert_eq!(acked.get_metric()[0].get_counter().get_value(), 3.0);
        assert!(families
            .iter()
            .any(|f| f.get_name() == "smi_messages_published_total"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        MessagingMetrics::register(&registry).expect("first registration");
        assert!(MessagingMetrics::register(&registry).is_err());
    }
}
