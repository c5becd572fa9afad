//! Raw data bridge between the peripheral and the bus

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::bus::{BusClient, Envelope, EnvelopeHandler};
use crate::core::link::PeripheralLink;
use crate::core::multiplexer::LineSink;
use crate::error::Result;

/// Payload published for each raw line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentPayload {
    /// Unix time in nanoseconds
    pub timestamp: i64,
    pub data: String,
}

impl AgentPayload {
    pub fn now(data: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            data: data.into(),
        }
    }
}

/// Publishes raw peripheral lines on the up topic
#[derive(Debug)]
pub struct AgentService {
    bus: Arc<BusClient>,
    up_topic: String,
}

impl AgentService {
    pub fn new(bus: Arc<BusClient>, up_topic: impl Into<String>) -> Self {
        Self {
            bus,
            up_topic: up_topic.into(),
        }
    }

    pub async fn handle_agent_data(&self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_value(AgentPayload::now(line))?;
        self.bus.publish(&self.up_topic, payload).await?;
        debug!("[Agent] {} bytes published to {}", line.len(), self.up_topic);
        Ok(())
    }
}

#[async_trait]
impl LineSink for AgentService {
    async fn handle_line(&self, line: String) {
        if let Err(e) = self.handle_agent_data(&line).await {
            error!("[Agent] publish to {} failed: {}", self.up_topic, e);
        }
    }
}

/// Forwards envelopes from the down topic to the peripheral
pub struct AgentDownHandler {
    link: Arc<dyn PeripheralLink>,
}

impl AgentDownHandler {
    pub fn new(link: Arc<dyn PeripheralLink>) -> Self {
        Self { link }
    }
}

#[async_trait]
impl EnvelopeHandler for AgentDownHandler {
    async fn handle(&self, topic: &str, envelope: Envelope) -> Result<()> {
        debug!("[Agent] downlink {} on {}", envelope.request_id, topic);
        let value = serde_json::to_value(&envelope)?;
        self.link.send_value(&value).await
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_agent_payload_field_names() {
        let payload = AgentPayload {
            timestamp: 1_700_000_000_000_000_000,
            data: "temp=21".to_string(),
        };
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["Timestamp"], 1_700_000_000_000_000_000_i64);
        assert_eq!(wire["Data"], "temp=21");
    }

    #[test]
    fn test_agent_payload_now_has_timestamp() {
        assert!(AgentPayload::now("x").timestamp > 0);
    }
}
