//! ---
//! smi_section: "02-messaging-runtime"
//! smi_subsection: "module"
//! smi_type: "source"
//! smi_scope: "code"
//! smi_description: "Acknowledgement bookkeeping for consumer deliveries."
//! smi_version: "v0.1.0"
//! smi_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{Channel, DeliveryTag};
use crate::{MessagingError, Result};

/// Settles deliveries on the channel that produced them.
///
/// Every tag is settled at most once: a second ack or nack of the same tag is
/// rejected locally instead of reaching the broker, which would close the
/// channel. With auto-ack enabled the broker settles on delivery, so both
/// operations become no-ops. A detached acker (no channel) only tracks tags,
/// which is what unit tests of handlers use.
#[derive(Clone)]
pub struct Acker {
    channel: Option<Arc<dyn Channel>>,
    auto_ack: bool,
    pending: Arc<Mutex<BTreeSet<DeliveryTag>>>,
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acker")
            .field("channel", &self.channel.as_ref().map(|c| c.id()))
            .field("auto_ack", &self.auto_ack)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl Acker {
    /// Acker bound to `channel`.
    pub fn new(channel: Arc<dyn Channel>, auto_ack: bool) -> Self {
        Self {
            channel: Some(channel),
            auto_ack,
            pending: Arc::default(),
        }
    }

    /// Acker with no channel; settlement only updates local bookkeeping.
    pub fn detached() -> Self {
        Self {
            channel: None,
            auto_ack: false,
            pending: Arc::default(),
        }
    }

    /// Whether the broker settles deliveries on its own.
    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Record a tag as outstanding.
    pub fn track(&self, tag: DeliveryTag) {
        if !self.auto_ack {
            self.pending.lock().insert(tag);
        }
    }

    /// Whether `tag` is still awaiting settlement.
    pub fn is_pending(&self, tag: DeliveryTag) -> bool {
        self.pending.lock().contains(&tag)
    }

    /// Number of outstanding tags.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Acknowledge `tag`, or every outstanding tag up to it when `multiple`.
    ///
    /// Returns the number of deliveries settled.
    pub async fn ack(&self, tag: DeliveryTag, multiple: bool) -> Result<usize> {
        if self.auto_ack {
            return Ok(0);
        }
        let settled = self.claim(tag, multiple)?;
        if let Some(channel) = &self.channel {
            channel.basic_ack(tag, multiple).await?;
        }
        Ok(settled)
    }

    /// Reject `tag`, or every outstanding tag up to it when `multiple`.
    ///
    /// Returns the number of deliveries settled.
    pub async fn nack(&self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<usize> {
        if self.auto_ack {
            return Ok(0);
        }
        let settled = self.claim(tag, multiple)?;
        if let Some(channel) = &self.channel {
            channel.basic_nack(tag, multiple, requeue).await?;
        }
        Ok(settled)
    }

    fn claim(&self, tag: DeliveryTag, multiple: bool) -> Result<usize> {
        let mut pending = self.pending.lock();
        if multiple {
            let settled: Vec<_> = pending.range(..=tag).copied().collect();
            if settled.is_empty() {
                return Err(MessagingError::DeliveryNotPending(tag));
            }
            for t in &settled {
                pending.remove(t);
            }
            return Ok(settled.len());
        }
        if pending.remove(&tag) {
            Ok(1)
        } else {
            Err(MessagingError::DeliveryNotPending(tag))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let acker = Acker::detached();
        acker.track(5);
        assert_eq!(acker.ack(5, false).await.expect("first ack"), 1);
        assert!(matches!(
            acker.ack(5, false).await,
            Err(MessagingError::DeliveryNotPending(5))
        ));
        assert!(matches!(
            acker.nack(5, false, false).await,
            Err(MessagingError::DeliveryNotPending(5))
        ));
    }

    #[tokio::test]
    async fn multiple_ack_settles_everything_up_to_tag() {
        let acker = Acker::detached();
        for tag in 1..=4 {
            acker.track(tag);
        }
        assert_eq!(acker.ack(3, true).await.expect("batch ack"), 3);
        assert!(!acker.is_pending(2));
        assert!(acker.is_pending(4));
        assert_eq!(acker.pending_count(), 1);
    }

    #[tokio::test]
    async fn auto_ack_settles_nothing() {
        let acker = Acker {
            channel: None,
            auto_ack: true,
            pending: Arc::default(),
        };
        acker.track(1);
        assert!(!acker.is_pending(1));
        assert_eq!(acker.ack(1, false).await.expect("noop"), 0);
        assert_eq!(acker.nack(1, false, true).await.expect("noop"), 0);
    }
}
