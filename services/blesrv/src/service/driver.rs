//! BLE driver
//!
//! Wires the multiplexer, controller, link and bus services together and
//! exposes the read/write resources of the bridge.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voltage_ble::command;

use super::agent::{AgentDownHandler, AgentService};
use super::command::CommandService;
use crate::bus::BusClient;
use crate::core::config::AppConfig;
use crate::core::controller::BleController;
use crate::core::link::{JsonLinkSender, PeripheralLink};
use crate::core::multiplexer::{ChannelSink, LineSink, SerialMultiplexer};
use crate::core::transport::ByteStream;
use crate::error::{BleSrvError, Result};

pub const RESOURCE_VERSION: &str = "Version";
pub const RESOURCE_ADDRESS: &str = "Address";
pub const RESOURCE_STATE: &str = "State";
pub const RESOURCE_PERIPHERAL_INIT: &str = "Setting&&PeripheralInit";
pub const RESOURCE_TX_POWER: &str = "SetTxPower";
pub const RESOURCE_BAUD: &str = "SetBaud";
pub const RESOURCE_SEND_STRING: &str = "SendString";

pub struct BleDriver {
    config: AppConfig,
    mux: Arc<SerialMultiplexer>,
    controller: BleController,
    link: Arc<JsonLinkSender>,
    bus: Arc<BusClient>,
    commands: Arc<CommandService>,
    agent: Arc<AgentService>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleDriver")
            .field("device_name", &self.config.ble.device_name)
            .field("mux", &self.mux)
            .field("bus", &self.bus)
            .finish()
    }
}

impl BleDriver {
    /// Build every component on top of `stream`. Must be called inside a
    /// tokio runtime.
    pub fn initialize<S: ByteStream>(
        config: AppConfig,
        stream: S,
        bus: Arc<BusClient>,
    ) -> Result<Self> {
        config.validate()?;

        // the services need the link, the link needs the multiplexer and
        // the multiplexer needs the sinks, so lines go through channels
        let (command_sink, command_rx) = ChannelSink::new();
        let (raw_sink, raw_rx) = ChannelSink::new();
        let mux = Arc::new(SerialMultiplexer::new(
            stream,
            &config.mux,
            Arc::new(command_sink),
            Arc::new(raw_sink),
        ));

        let controller = BleController::new(Arc::clone(&mux), config.ble.clone());
        let link = Arc::new(JsonLinkSender::new(Arc::clone(&mux), &config.link)?);
        let peripheral: Arc<dyn PeripheralLink> = link.clone();

        let commands = Arc::new(CommandService::new(
            Arc::clone(&bus),
            peripheral,
            config.topics.clone(),
        ));
        let agent = Arc::new(AgentService::new(Arc::clone(&bus), config.topics.up.clone()));

        let pumps = vec![
            spawn_pump("command", command_rx, commands.clone()),
            spawn_pump("raw", raw_rx, agent.clone()),
        ];

        info!(
            "[Driver] initialized for '{}' on {}",
            config.ble.device_name, config.serial.port_name
        );
        Ok(Self {
            config,
            mux,
            controller,
            link,
            bus,
            commands,
            agent,
            pumps: Mutex::new(pumps),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> &BleController {
        &self.controller
    }

    pub fn link(&self) -> &Arc<JsonLinkSender> {
        &self.link
    }

    pub fn bus(&self) -> &Arc<BusClient> {
        &self.bus
    }

    pub fn commands(&self) -> &Arc<CommandService> {
        &self.commands
    }

    pub fn agent(&self) -> &Arc<AgentService> {
        &self.agent
    }

    /// Run the peripheral init sequence and subscribe the down topic
    pub async fn start(&self) -> Result<()> {
        self.controller.initialize_as_peripheral().await?;

        let peripheral: Arc<dyn PeripheralLink> = self.link.clone();
        self.bus
            .subscribe(
                &self.config.topics.down,
                Arc::new(AgentDownHandler::new(peripheral)),
            )
            .await?;
        info!("[Driver] started");
        Ok(())
    }

    /// Stop the line pumps and close the multiplexer
    pub async fn stop(&self) {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
        self.mux.close().await;
        info!("[Driver] stopped");
    }

    pub async fn handle_read(&self, resource: &str) -> Result<Value> {
        let value = match resource {
            RESOURCE_VERSION => Value::String(self.controller.version().await?),
            RESOURCE_ADDRESS => Value::String(self.controller.address().await?),
            RESOURCE_STATE => {
                Value::String(self.controller.query_state().await?.as_str().to_string())
            },
            other => {
                return Err(BleSrvError::validation(format!(
                    "unknown read resource '{other}'"
                )))
            },
        };
        debug!("[Driver] read {} = {}", resource, value);
        Ok(value)
    }

    pub async fn handle_write(&self, resource: &str, value: &Value) -> Result<()> {
        match resource {
            RESOURCE_PERIPHERAL_INIT => {
                let name = value
                    .get("BleName")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BleSrvError::validation("BleName must be a string"))?;
                let settings = self.controller.settings();
                let commands = command::peripheral_init_commands(
                    name,
                    &settings.service_uuid,
                    &settings.characteristic_uuid,
                )?;
                self.controller.custom_initialize(&commands).await?;
                info!("[Driver] peripheral re-initialized as '{}'", name);
            },
            RESOURCE_TX_POWER => {
                let dbm = i8::try_from(int_value(resource, value)?).map_err(|_| {
                    BleSrvError::validation(format!("{resource} value {value} out of range"))
                })?;
                self.controller
                    .send_single(&command::set_tx_power(dbm)?)
                    .await?;
            },
            RESOURCE_BAUD => {
                let baud = int_value(resource, value)?;
                self.controller
                    .send_single(&command::set_baud(baud)?)
                    .await?;
            },
            RESOURCE_SEND_STRING => {
                let text = value
                    .as_str()
                    .ok_or_else(|| BleSrvError::validation("SendString value must be a string"))?;
                let cmd = command::send_notify(&self.config.link.notify_handle, text)?;
                self.controller.send_single(&cmd).await?;
            },
            other => {
                warn!("[Driver] write to unknown resource '{}'", other);
                return Err(BleSrvError::validation(format!(
                    "unknown write resource '{other}'"
                )));
            },
        }
        Ok(())
    }
}

/// Integer from a JSON number or a numeric string
fn int_value(resource: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| BleSrvError::validation(format!("{resource} expects an integer, got {value}")))
}

fn spawn_pump(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<String>,
    sink: Arc<dyn LineSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            sink.handle_line(line).await;
        }
        debug!("[Driver] {} pump stopped", name);
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int_value() {
        assert_eq!(int_value("SetBaud", &json!(115200)).unwrap(), 115200);
        assert_eq!(int_value("SetBaud", &json!(" 9600 ")).unwrap(), 9600);
        assert!(int_value("SetBaud", &json!(1.5)).is_err());
        assert!(int_value("SetBaud", &json!(true)).is_err());
    }
}
