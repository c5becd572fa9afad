//! Test Common Utilities
//!
//! Shared harness for blesrv integration tests: recording sinks and links,
//! an in-memory bus with a scripted responder, and logging setup.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use blesrv::bus::{BusClient, BusTransport, Envelope, MemoryBus};
use blesrv::core::config::MuxSettings;
use blesrv::core::link::PeripheralLink;
use blesrv::core::multiplexer::{LineSink, NullSink, SerialMultiplexer};
use blesrv::core::transport::mock::MockPeripheral;
use blesrv::{BleSrvError, Result};

static LOGGER_INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn setup_test_env() {
    LOGGER_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

pub const WAIT: Duration = Duration::from_secs(2);

/// Line sink that records everything it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Wait until at least `count` lines arrived or `limit` elapses
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<String> {
        let _ = tokio::time::timeout(limit, async {
            loop {
                let notified = self.notify.notified();
                if self.lines.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.lines()
    }
}

#[async_trait]
impl LineSink for RecordingSink {
    async fn handle_line(&self, line: String) {
        self.lines.lock().push(line);
        self.notify.notify_waiters();
    }
}

/// Peripheral link that records sent documents, optionally failing
#[derive(Debug, Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<Value>>,
    notify: Notify,
    fail: bool,
}

impl RecordingLink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<Value> {
        let _ = tokio::time::timeout(limit, async {
            loop {
                let notified = self.notify.notified();
                if self.sent.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;
        self.sent()
    }
}

#[async_trait]
impl PeripheralLink for RecordingLink {
    async fn send_value(&self, value: &Value) -> Result<()> {
        if self.fail {
            return Err(BleSrvError::write("link down"));
        }
        self.sent.lock().push(value.clone());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Connected in-memory bus and a client on top of it
pub async fn memory_bus() -> (Arc<MemoryBus>, Arc<BusClient>) {
    let bus = Arc::new(MemoryBus::new());
    let transport: Arc<dyn BusTransport> = bus.clone();
    let client = Arc::new(BusClient::new(transport));
    client.connect().await.unwrap();
    (bus, client)
}

/// Answer every request on `filter` with `respond(request)`, published on
/// `edgex/response/<service>/<requestID>`. Returning `None` stays silent.
pub async fn spawn_responder<F>(bus: Arc<MemoryBus>, filter: &str, respond: F)
where
    F: Fn(&Envelope) -> Option<Value> + Send + 'static,
{
    let mut rx = bus.subscribe(filter).await.unwrap();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(request) = Envelope::from_bytes(&message.topic, &message.payload) else {
                continue;
            };
            let Some(payload) = respond(&request) else {
                continue;
            };
            let response = Envelope::response_to(request.request_id.clone(), payload);
            let topic = format!("edgex/response/core-command/{}", request.request_id);
            let bytes = Bytes::from(response.to_bytes().unwrap());
            let _ = bus.publish(&topic, bytes).await;
        }
    });
}

/// Multiplexer on a fresh mock peripheral with the given sinks
pub fn mux_with_sinks(
    command: Arc<dyn LineSink>,
    raw: Arc<dyn LineSink>,
) -> (Arc<SerialMultiplexer>, MockPeripheral) {
    let (host, device) = MockPeripheral::spawn();
    let mux = Arc::new(SerialMultiplexer::new(
        host,
        &MuxSettings::default(),
        command,
        raw,
    ));
    (mux, device)
}

/// Multiplexer that discards reports and raw data
pub fn quiet_mux() -> (Arc<SerialMultiplexer>, MockPeripheral) {
    mux_with_sinks(Arc::new(NullSink), Arc::new(NullSink))
}
