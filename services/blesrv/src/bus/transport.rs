//! Publish/subscribe byte transports
//!
//! `BusTransport` is the raw bus primitive the RPC client is built on:
//! connect, publish bytes, subscribe to a filter and receive bytes.
//! `MemoryBus` is an in-process implementation with MQTT wildcard semantics.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::topic::topic_matches;
use crate::error::{BleSrvError, Result};

/// Per-subscription channel depth
pub const SUBSCRIPTION_BUFFER: usize = 100;

/// One message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Raw publish/subscribe transport
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Messages on topics matching `filter` are delivered to the receiver
    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>>;
}

/// Fan-out of inbound messages to subscription channels
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTable {
    entries: Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>,
}

impl SubscriptionTable {
    pub(crate) fn add(&self, filter: &str) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.entries.lock().push((filter.to_string(), tx));
        rx
    }

    /// Deliver to every matching subscription, pruning closed ones
    pub(crate) fn dispatch(&self, topic: &str, payload: &Bytes) -> usize {
        let mut delivered = 0;
        self.entries.lock().retain(|(filter, tx)| {
            if tx.is_closed() {
                return false;
            }
            if topic_matches(filter, topic) {
                let message = BusMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                match tx.try_send(message) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("[Bus] subscription {} is full, message dropped", filter)
                    },
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
        delivered
    }

    pub(crate) fn filters(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(filter, _)| filter.clone())
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// In-process bus
#[derive(Debug, Default)]
pub struct MemoryBus {
    connected: AtomicBool,
    subscriptions: SubscriptionTable,
    history: Mutex<Vec<BusMessage>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far
    pub fn history(&self) -> Vec<BusMessage> {
        self.history.lock().clone()
    }

    /// Messages published on `topic`
    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.history
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscribed_filters(&self) -> Vec<String> {
        self.subscriptions.filters()
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.subscriptions.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(BleSrvError::not_connected());
        }
        self.history.lock().push(BusMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        let delivered = self.subscriptions.dispatch(topic, &payload);
        debug!("[MemoryBus] {} delivered to {} subscribers", topic, delivered);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>> {
        if !self.is_connected() {
            return Err(BleSrvError::not_connected());
        }
        Ok(self.subscriptions.add(filter))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_bus_wildcard_delivery() {
        let bus = MemoryBus::new();
        bus.connect().await.unwrap();
        let mut all = bus.subscribe("edgex/response/#").await.unwrap();
        let mut one = bus.subscribe("edgex/response/+/a").await.unwrap();

        bus.publish("edgex/response/dev/a", Bytes::from_static(b"1"))
            .await
            .unwrap();
        bus.publish("edgex/response/dev/b", Bytes::from_static(b"2"))
            .await
            .unwrap();

        assert_eq!(all.recv().await.unwrap().payload, Bytes::from_static(b"1"));
        assert_eq!(all.recv().await.unwrap().payload, Bytes::from_static(b"2"));
        assert_eq!(one.recv().await.unwrap().topic, "edgex/response/dev/a");
        assert!(one.try_recv().is_err());
        assert_eq!(bus.history().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_bus_requires_connection() {
        let bus = MemoryBus::new();
        let err = bus.publish("t", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, BleSrvError::BusError(_)));
        assert!(bus.subscribe("t").await.is_err());
    }
}
