//! Message bus seam.
//!
//! The real bus client library is an external collaborator; the pipeline only
//! depends on the [`BusClient`] capability. [`InMemoryBus`] is the in-process
//! implementation used by tests and the CLI's local mode, with failure
//! injection for exercising the sender's retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::CdcError;

/// One delivered bus message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait BusClient: Send + Sync + 'static {
    /// Publish one message. `BrokerUnavailable` failures are transient and
    /// retried by the sender.
    async fn publish(&self, topic: &str, key: Vec<u8>, payload: Vec<u8>) -> Result<(), CdcError>;

    /// Snapshot of everything delivered on `topic` so far, in publish order.
    async fn subscribe(&self, topic: &str) -> Result<Vec<BusMessage>, CdcError>;
}

#[derive(Default)]
pub struct InMemoryBus {
    topics: RwLock<HashMap<String, Vec<BusMessage>>>,
    fail_next: AtomicU32,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with `BrokerUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .map(|topics| topics.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl BusClient for InMemoryBus {
    async fn publish(&self, topic: &str, key: Vec<u8>, payload: Vec<u8>) -> Result<(), CdcError> {
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0
            && self
                .fail_next
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(CdcError::BrokerUnavailable("injected failure".into()));
        }

        let mut topics = self
            .topics
            .write()
            .map_err(|_| CdcError::BrokerUnavailable("bus lock poisoned".into()))?;
        topics
            .entry(topic.to_string())
            .or_default()
            .push(BusMessage { key, payload });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Vec<BusMessage>, CdcError> {
        let topics = self
            .topics
            .read()
            .map_err(|_| CdcError::BrokerUnavailable("bus lock poisoned".into()))?;
        Ok(topics.get(topic).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_preserves_order() {
        let bus = InMemoryBus::new();
        bus.publish("t", b"k1".to_vec(), b"p1".to_vec()).await.unwrap();
        bus.publish("t", b"k2".to_vec(), b"p2".to_vec()).await.unwrap();

        let messages = bus.subscribe("t").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].key, b"k1");
        assert_eq!(messages[1].key, b"k2");
        assert!(bus.subscribe("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let bus = InMemoryBus::new();
        bus.fail_next(1);
        let err = bus.publish("t", vec![], vec![]).await.unwrap_err();
        assert!(err.is_retryable());
        bus.publish("t", vec![], vec![]).await.unwrap();
        assert_eq!(bus.message_count("t"), 1);
    }
}
