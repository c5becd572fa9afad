//! Bus RPC client
//!
//! Request/response on top of a publish/subscribe transport. Each request
//! registers a one-shot waiter under its `requestID`; the response
//! subscription wakes the matching waiter exactly once. Request ids that
//! were already answered are remembered so retransmitted responses are
//! dropped silently.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::envelope::Envelope;
use super::transport::{BusMessage, BusTransport};
use crate::error::{BleSrvError, Result};

/// Default request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(300);
/// How long a timed-out waiter stays registered
pub const REQUEST_GRACE: Duration = Duration::from_millis(50);
/// Number of answered request ids remembered for duplicate suppression
pub const RESOLVED_ID_CAPACITY: usize = 1024;

/// Handler for a general subscription
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, topic: &str, envelope: Envelope) -> Result<()>;
}

/// Bounded set of answered request ids, oldest evicted first
#[derive(Debug)]
struct ResolvedIds {
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
    capacity: usize,
}

impl ResolvedIds {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.inner.lock().0.contains(id)
    }

    fn insert(&self, id: String) {
        let mut guard = self.inner.lock();
        let (set, order) = &mut *guard;
        if !set.insert(id.clone()) {
            return;
        }
        order.push_back(id);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().1.len()
    }

    fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.0.clear();
        guard.1.clear();
    }
}

/// Waiter table plus duplicate suppression
#[derive(Debug)]
struct Correlator {
    waiters: DashMap<String, oneshot::Sender<Envelope>>,
    resolved: ResolvedIds,
}

impl Correlator {
    fn deliver(&self, envelope: Envelope) {
        let id = envelope.request_id.clone();
        if self.resolved.contains(&id) {
            debug!("[Bus] duplicate response {} dropped", id);
            return;
        }
        match self.waiters.remove(&id) {
            Some((_, waiter)) => {
                self.resolved.insert(id.clone());
                if waiter.send(envelope).is_err() {
                    debug!("[Bus] waiter for {} already gave up", id);
                }
            },
            None => warn!("[Bus] unmatched response {} discarded", id),
        }
    }
}

/// Request/response client over a `BusTransport`
pub struct BusClient {
    transport: Arc<dyn BusTransport>,
    correlator: Arc<Correlator>,
    response_topics: DashSet<String>,
    timeout_ms: AtomicU64,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_requests())
            .field("timeout", &self.timeout())
            .finish()
    }
}

impl BusClient {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self::with_capacity(transport, RESOLVED_ID_CAPACITY)
    }

    /// Client remembering up to `resolved_capacity` answered request ids
    pub fn with_capacity(transport: Arc<dyn BusTransport>, resolved_capacity: usize) -> Self {
        Self {
            transport,
            correlator: Arc::new(Correlator {
                waiters: DashMap::new(),
                resolved: ResolvedIds::new(resolved_capacity),
            }),
            response_topics: DashSet::new(),
            timeout_ms: AtomicU64::new(DEFAULT_REQUEST_TIMEOUT.as_millis() as u64),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await?;
        info!("[Bus] connected");
        Ok(())
    }

    /// Stop subscriptions, fail every waiting request and disconnect
    pub async fn disconnect(&self) -> Result<()> {
        let cancel = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        cancel.cancel();

        // dropping the senders wakes every waiter with a closed error
        let pending = self.correlator.waiters.len();
        self.correlator.waiters.clear();
        self.correlator.resolved.clear();
        self.response_topics.clear();

        self.transport.disconnect().await?;
        info!("[Bus] disconnected ({} pending requests cancelled)", pending);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Default timeout for subsequent requests
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.waiters.len()
    }

    pub fn resolved_ids(&self) -> usize {
        self.correlator.resolved.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BleSrvError::not_connected())
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Publish `payload` in a fresh envelope; fire-and-forget
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<()> {
        self.publish_envelope(topic, &Envelope::new(payload)).await
    }

    pub async fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_connected()?;
        let bytes = envelope.to_bytes()?;
        self.transport.publish(topic, Bytes::from(bytes)).await?;
        debug!("[Bus] published {} to {}", envelope.request_id, topic);
        Ok(())
    }

    /// Request with the default timeout
    pub async fn request(&self, topic: &str, payload: Value) -> Result<Envelope> {
        self.request_with_timeout(topic, payload, self.timeout())
            .await
    }

    /// Publish a request and wait for the response carrying its `requestID`
    pub async fn request_with_timeout(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Envelope> {
        self.ensure_connected()?;

        let envelope = Envelope::new(payload);
        let id = envelope.request_id.clone();
        let (waiter, response) = oneshot::channel();
        self.correlator.waiters.insert(id.clone(), waiter);

        if let Err(e) = self.publish_envelope(topic, &envelope).await {
            self.correlator.waiters.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(BleSrvError::closed(format!(
                "bus client disconnected while waiting for {id}"
            ))),
            Err(_) => {
                // keep the slot briefly for a response already in flight
                let correlator = Arc::clone(&self.correlator);
                let expired = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(REQUEST_GRACE).await;
                    correlator.waiters.remove(&expired);
                });
                warn!("[Bus] request {} on {} timed out after {:?}", id, topic, timeout);
                Err(BleSrvError::timeout(format!(
                    "request {id} on {topic} timed out after {timeout:?}"
                )))
            },
        }
    }

    /// Route responses on `topic` to waiting requests. Idempotent per topic.
    pub async fn subscribe_response(&self, topic: &str) -> Result<()> {
        self.ensure_connected()?;
        if !self.response_topics.insert(topic.to_string()) {
            debug!("[Bus] already subscribed to responses on {}", topic);
            return Ok(());
        }

        let rx = match self.transport.subscribe(topic).await {
            Ok(rx) => rx,
            Err(e) => {
                self.response_topics.remove(topic);
                return Err(e);
            },
        };

        let correlator = Arc::clone(&self.correlator);
        spawn_subscription(topic, rx, self.token(), move |envelope| {
            let correlator = Arc::clone(&correlator);
            async move {
                correlator.deliver(envelope);
                Ok(())
            }
        });
        info!("[Bus] response subscription on {}", topic);
        Ok(())
    }

    /// General subscription; handler errors are logged
    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn EnvelopeHandler>) -> Result<()> {
        self.ensure_connected()?;
        let rx = self.transport.subscribe(topic).await?;
        spawn_subscription(topic, rx, self.token(), move |envelope: Envelope| {
            let handler = Arc::clone(&handler);
            async move {
                let received = envelope.received_topic.clone();
                handler.handle(&received, envelope).await
            }
        });
        info!("[Bus] subscribed to {}", topic);
        Ok(())
    }
}

fn spawn_subscription<F, Fut>(
    filter: &str,
    mut rx: mpsc::Receiver<BusMessage>,
    cancel: CancellationToken,
    on_envelope: F,
) where
    F: Fn(Envelope) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let filter = filter.to_string();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let envelope = match Envelope::from_bytes(&message.topic, &message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("[Bus] {}", e);
                    continue;
                },
            };
            if let Err(e) = on_envelope(envelope).await {
                error!("[Bus] handler for {} failed: {}", message.topic, e);
            }
        }
        debug!("[Bus] subscription {} stopped", filter);
    });
}
