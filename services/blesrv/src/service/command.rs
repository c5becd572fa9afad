//! Peripheral command handling
//!
//! `+COMMAND:` reports from the peripheral are turned into bus requests and
//! the answers are sent back over the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::dataparse::{extract_profile_and_resources, parse_reading};
use crate::bus::BusClient;
use crate::core::config::TopicConfig;
use crate::core::link::PeripheralLink;
use crate::core::multiplexer::LineSink;
use crate::error::{BleSrvError, Result};

pub const ALL_STATUS_TIMEOUT: Duration = Duration::from_millis(300);
pub const READING_TIMEOUT: Duration = Duration::from_millis(100);

/// Reply sent for commands the bridge does not know
pub const UNSUPPORTED_COMMAND: &str = "unsupported command";

/// A command reported by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCommand {
    /// Summary of every device and its resources
    AllStatus,
    /// Latest reading of one resource
    Monitor { device: String, resource: String },
    Unsupported(String),
}

impl PeripheralCommand {
    /// Classify a report segment. A `monitor` command without both device
    /// and resource is rejected.
    pub fn parse(cmd: &str) -> Result<Self> {
        let cmd = cmd.trim();
        if cmd.contains("allstatus") {
            return Ok(Self::AllStatus);
        }
        if cmd.contains("monitor") {
            let parts: Vec<&str> = cmd.split(',').map(str::trim).collect();
            return match parts.as_slice() {
                [_, device, resource, ..] if !device.is_empty() && !resource.is_empty() => {
                    Ok(Self::Monitor {
                        device: device.to_string(),
                        resource: resource.to_string(),
                    })
                },
                _ => Err(BleSrvError::validation(format!(
                    "malformed monitor command '{cmd}', expected monitor,<device>,<resource>"
                ))),
            };
        }
        Ok(Self::Unsupported(cmd.to_string()))
    }
}

/// Answers peripheral commands through the bus
pub struct CommandService {
    bus: Arc<BusClient>,
    link: Arc<dyn PeripheralLink>,
    topics: TopicConfig,
    response_subscribed: AtomicBool,
}

impl std::fmt::Debug for CommandService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandService")
            .field("topics", &self.topics)
            .field(
                "response_subscribed",
                &self.response_subscribed.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl CommandService {
    pub fn new(bus: Arc<BusClient>, link: Arc<dyn PeripheralLink>, topics: TopicConfig) -> Self {
        Self {
            bus,
            link,
            topics,
            response_subscribed: AtomicBool::new(false),
        }
    }

    /// Subscribe the response topic on first use. A failed attempt is
    /// retried by the next command.
    async fn ensure_response_subscription(&self) -> Result<()> {
        if self.response_subscribed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.bus.subscribe_response(&self.topics.response).await?;
        self.response_subscribed.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn handle_command(&self, cmd: &str) -> Result<()> {
        let command = PeripheralCommand::parse(cmd)?;
        debug!("[Command] {:?}", command);

        match command {
            PeripheralCommand::AllStatus => {
                self.ensure_response_subscription().await?;
                let response = self
                    .bus
                    .request_with_timeout(
                        &self.topics.all_status_request,
                        Value::String(String::new()),
                        ALL_STATUS_TIMEOUT,
                    )
                    .await?;
                let infos = extract_profile_and_resources(&response)?;
                info!("[Command] allstatus: {} devices", infos.len());
                self.link.send_value(&serde_json::to_value(&infos)?).await
            },
            PeripheralCommand::Monitor { device, resource } => {
                self.ensure_response_subscription().await?;
                let topic = format!("{}/{}/{}/get", self.topics.reading_request, device, resource);
                let response = self
                    .bus
                    .request_with_timeout(&topic, Value::String(String::new()), READING_TIMEOUT)
                    .await?;
                let reading = parse_reading(&response)?;
                info!(
                    "[Command] monitor {}/{} = {}",
                    device, resource, reading.value
                );
                self.link.send_value(&serde_json::to_value(&reading)?).await
            },
            PeripheralCommand::Unsupported(other) => {
                warn!("[Command] unsupported command '{}'", other);
                self.link
                    .send_value(&Value::String(UNSUPPORTED_COMMAND.to_string()))
                    .await
            },
        }
    }
}

#[async_trait]
impl LineSink for CommandService {
    async fn handle_line(&self, line: String) {
        if let Err(e) = self.handle_command(&line).await {
            error!("[Command] '{}' failed: {}", line, e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use tracing_test::traced_test;

    struct DiscardLink;

    #[async_trait]
    impl PeripheralLink for DiscardLink {
        async fn send_value(&self, _value: &Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            PeripheralCommand::parse("allstatus").unwrap(),
            PeripheralCommand::AllStatus
        );
        assert_eq!(
            PeripheralCommand::parse("monitor,Random-Integer-Device,Int8").unwrap(),
            PeripheralCommand::Monitor {
                device: "Random-Integer-Device".to_string(),
                resource: "Int8".to_string(),
            }
        );
        assert_eq!(
            PeripheralCommand::parse(" reboot ").unwrap(),
            PeripheralCommand::Unsupported("reboot".to_string())
        );
    }

    #[test]
    fn test_parse_malformed_monitor() {
        assert!(PeripheralCommand::parse("monitor").is_err());
        assert!(PeripheralCommand::parse("monitor,dev").is_err());
        assert!(PeripheralCommand::parse("monitor,,res").is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_command_is_logged() {
        let bus = Arc::new(BusClient::new(Arc::new(MemoryBus::new())));
        let service = CommandService::new(bus, Arc::new(DiscardLink), TopicConfig::default());
        service.handle_line("monitor,dev".to_string()).await;
        assert!(logs_contain("malformed monitor command"));
    }
}
