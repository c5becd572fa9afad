//! MQTT bus transport on rumqttc

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{BusMessage, BusTransport, SubscriptionTable};
use crate::core::config::MqttConfig;
use crate::error::{BleSrvError, ErrorExt, Result};

/// How long `connect` waits for the broker's CONNACK
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between event loop errors before polling again
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

pub struct MqttBusTransport {
    config: MqttConfig,
    client: Mutex<Option<AsyncClient>>,
    subscriptions: Arc<SubscriptionTable>,
    connected: Arc<watch::Sender<bool>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for MqttBusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBusTransport")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MqttBusTransport {
    pub fn new(config: MqttConfig) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            config,
            client: Mutex::new(None),
            subscriptions: Arc::new(SubscriptionTable::default()),
            connected: Arc::new(connected),
            cancel: Mutex::new(None),
        }
    }

    fn qos(&self) -> QoS {
        qos_from_level(self.config.qos)
    }

    fn options(&self) -> Result<MqttOptions> {
        if !self.config.protocol.eq_ignore_ascii_case("tcp") {
            return Err(BleSrvError::config(format!(
                "unsupported MQTT protocol '{}'",
                self.config.protocol
            )));
        }
        let mut options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        if let Some(username) = &self.config.username {
            let password = self.config.password.clone().unwrap_or_default();
            options.set_credentials(username, password);
        }
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(true);
        Ok(options)
    }

    fn client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .clone()
            .ok_or_else(BleSrvError::not_connected)
    }
}

/// Wait until the event loop reports a session, at most `limit`
async fn wait_connected(connected: &watch::Sender<bool>, limit: Duration) -> bool {
    let mut state = connected.subscribe();
    let established = tokio::time::timeout(limit, state.wait_for(|up| *up))
        .await
        .is_ok_and(|waited| waited.is_ok());
    established
}

pub(crate) fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[async_trait]
impl BusTransport for MqttBusTransport {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let options = self.options()?;
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let loop_client = client.clone();
        let loop_cancel = cancel.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        let connected = Arc::clone(&self.connected);
        let qos = self.qos();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("[MQTT] connected to broker");
                        connected.send_replace(true);
                        for filter in subscriptions.filters() {
                            if let Err(e) = loop_client.try_subscribe(filter.as_str(), qos) {
                                warn!("[MQTT] resubscribe {} failed: {}", filter, e);
                            }
                        }
                    },
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let delivered = subscriptions.dispatch(&publish.topic, &publish.payload);
                        debug!(
                            "[MQTT] {} ({} bytes) -> {} subscribers",
                            publish.topic,
                            publish.payload.len(),
                            delivered
                        );
                    },
                    Ok(_) => {},
                    Err(e) => {
                        error!("[MQTT] connection error: {}", e);
                        connected.send_replace(false);
                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                        }
                    },
                }
            }
            connected.send_replace(false);
            debug!("[MQTT] event loop stopped");
        });

        *self.client.lock() = Some(client);
        if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        if wait_connected(&self.connected, CONNECT_TIMEOUT).await {
            info!(
                "[MQTT] session established with {}:{}",
                self.config.host, self.config.port
            );
            Ok(())
        } else {
            cancel.cancel();
            self.client.lock().take();
            Err(BleSrvError::bus(format!(
                "no CONNACK from {}:{} within {:?}",
                self.config.host, self.config.port, CONNECT_TIMEOUT
            )))
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                warn!("[MQTT] disconnect failed: {}", e);
            }
        }
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.subscriptions.clear();
        self.connected.send_replace(false);
        info!("[MQTT] disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(BleSrvError::not_connected());
        }
        self.client()?
            .publish(topic, self.qos(), false, payload.to_vec())
            .await
            .bus_error(&format!("publish to {topic} failed"))
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>> {
        if !self.is_connected() {
            return Err(BleSrvError::not_connected());
        }
        let client = self.client()?;
        let rx = self.subscriptions.add(filter);
        client
            .subscribe(filter, self.qos())
            .await
            .bus_error(&format!("subscribe to {filter} failed"))?;
        info!("[MQTT] subscribed to {}", filter);
        Ok(rx)
    }
}
