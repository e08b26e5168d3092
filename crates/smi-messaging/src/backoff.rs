//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Backoff policies applied between publisher confirm attempts."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::MessagingError;

/// Source of delays between successive confirm attempts.
pub trait BackoffProvider: Send + Sync + fmt::Debug {
    /// Delay to apply before the next attempt.
    fn next_backoff(&mut self) -> Duration;
    /// Forget previous failures.
    fn reset(&mut self);
}

/// Same delay every time.
#[derive(Debug, Clone)]
pub struct StaticBackoffProvider {
    delay: Duration,
}

impl StaticBackoffProvider {
    /// Provider returning `delay` for every attempt.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for StaticBackoffProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl BackoffProvider for StaticBackoffProvider {
    fn next_backoff(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}

/// Doubling delay, capped.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffProvider {
    initial: Duration,
    maximum: Duration,
    failures: u32,
}

impl ExponentialBackoffProvider {
    /// Provider starting at `initial` and never exceeding `maximum`.
    pub fn new(initial: Duration, maximum: Duration) -> Self {
        Self {
            initial,
            maximum,
            failures: 0,
        }
    }
}

impl Default for ExponentialBackoffProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(60 * 60))
    }
}

impl BackoffProvider for ExponentialBackoffProvider {
    fn next_backoff(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.initial.saturating_mul(factor).min(self.maximum)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Names accepted for a producer's backoff provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffProviderKind {
    /// [`StaticBackoffProvider`].
    Static,
    /// [`ExponentialBackoffProvider`].
    Exponential,
}

impl BackoffProviderKind {
    /// Instantiate the provider with its default timings.
    pub fn create(self) -> Box<dyn BackoffProvider> {
        match self {
            BackoffProviderKind::Static => Box::new(StaticBackoffProvider::default()),
            BackoffProviderKind::Exponential => Box::new(ExponentialBackoffProvider::default()),
        }
    }
}

impl FromStr for BackoffProviderKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" | "staticbackoffprovider" => Ok(Self::Static),
            "exponential" | "exponentialbackoffprovider" => Ok(Self::Exponential),
            _ => Err(MessagingError::InvalidBackoffProvider(s.to_owned())),
        }
    }
}

/// Provider named by producer options; `None` when no backoff is configured.
pub fn backoff_from_options(name: Option<&str>) -> Result<Option<Box<dyn BackoffProvider>>, MessagingError> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        None => Ok(None),
        Some(name) => Ok(Some(name.parse::<BackoffProviderKind>()?.create())),
    }
}
