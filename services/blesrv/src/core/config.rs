//! Service configuration
//!
//! Layered with figment: struct defaults, then the YAML file, then
//! `BLESRV_` environment variables (`__` separates nested keys), then the
//! legacy `MQTT_HOST` / `MQTT_USERNAME` / `SERIAL_PORT` overrides.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use voltage_ble::command;
use voltage_ble::packet::{FrameFormat, DEFAULT_MTU, DEFAULT_NOTIFY_HANDLE};
use voltage_ble::response::COMMAND_REPORT_MARKER;

use crate::error::{BleSrvError, Result};

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/blesrv.yaml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BLESRV_";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub mux: MuxSettings,

    #[serde(default)]
    pub link: LinkSettings,

    #[serde(default)]
    pub ble: BleSettings,

    #[serde(default)]
    pub topics: TopicConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    #[serde(default = "default_port_name")]
    pub port_name: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Data bits (5, 6, 7, 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Stop bits (1, 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Parity ("none", "even", "odd")
    #[serde(default = "default_none")]
    pub parity: String,

    /// Flow control ("none", "software", "hardware")
    #[serde(default = "default_none")]
    pub flow_control: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: default_port_name(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_none(),
            flow_control: default_none(),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_mqtt_protocol")]
    pub protocol: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub qos: u8,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Default RPC request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            protocol: default_mqtt_protocol(),
            client_id: default_client_id(),
            qos: 0,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Serial multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxSettings {
    /// Capacity of the bounded request queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Lines starting with any of these are dropped before classification
    #[serde(default = "default_ignore_prefixes")]
    pub ignore_prefixes: Vec<String>,

    #[serde(default = "default_command_report_marker")]
    pub command_report_marker: String,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            ignore_prefixes: default_ignore_prefixes(),
            command_report_marker: default_command_report_marker(),
        }
    }
}

/// Fragmented JSON link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// GATT handle used in the notify prefix
    #[serde(default = "default_notify_handle")]
    pub notify_handle: String,

    /// Per-packet response timeout
    #[serde(default = "default_packet_timeout_ms")]
    pub packet_timeout_ms: u64,

    #[serde(default = "default_read_delay_ms")]
    pub read_delay_ms: u64,

    #[serde(default = "default_queue_wait_ms")]
    pub queue_wait_ms: u64,

    /// Partial messages older than this are evicted
    #[serde(default = "default_reassembly_max_age_ms")]
    pub reassembly_max_age_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            notify_handle: default_notify_handle(),
            packet_timeout_ms: default_packet_timeout_ms(),
            read_delay_ms: default_read_delay_ms(),
            queue_wait_ms: default_queue_wait_ms(),
            reassembly_max_age_ms: default_reassembly_max_age_ms(),
        }
    }
}

impl LinkSettings {
    /// Notify frame format derived from MTU and handle
    pub fn frame_format(&self) -> Result<FrameFormat> {
        Ok(FrameFormat::notify(self.mtu, &self.notify_handle)?)
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    pub fn read_delay(&self) -> Duration {
        Duration::from_millis(self.read_delay_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    /// `None` disables eviction
    pub fn reassembly_max_age(&self) -> Option<Duration> {
        (self.reassembly_max_age_ms > 0).then(|| Duration::from_millis(self.reassembly_max_age_ms))
    }
}

/// Init sequence failure policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    /// Run every command, report the last failure
    BestEffort,
    /// Stop at the first failure
    #[default]
    AllOrNothing,
}

/// BLE peripheral configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,

    #[serde(default = "default_characteristic_uuid")]
    pub characteristic_uuid: String,

    #[serde(default)]
    pub init_policy: InitPolicy,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_uuid: default_service_uuid(),
            characteristic_uuid: default_characteristic_uuid(),
            init_policy: InitPolicy::default(),
        }
    }
}

/// Bus topics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Raw peripheral data is published here
    #[serde(default = "default_up_topic")]
    pub up: String,

    /// Envelopes received here are forwarded to the peripheral
    #[serde(default = "default_down_topic")]
    pub down: String,

    #[serde(default = "default_all_status_topic")]
    pub all_status_request: String,

    /// Wildcard topic carrying RPC responses
    #[serde(default = "default_response_topic")]
    pub response: String,

    /// Reading requests go to `<reading_request>/<device>/<resource>/get`
    #[serde(default = "default_reading_topic")]
    pub reading_request: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            up: default_up_topic(),
            down: default_down_topic(),
            all_status_request: default_all_status_topic(),
            response: default_response_topic(),
            reading_request: default_reading_topic(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log directory for the rolling file output
    #[serde(default = "default_log_dir")]
    pub dir: String,

    /// Write a daily log file besides the console
    #[serde(default)]
    pub enable_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            enable_file: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, file and environment.
    ///
    /// A missing file is not an error; the remaining layers still apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        match path {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                figment = figment.merge(Yaml::file(path));
            },
            Some(path) => {
                info!(
                    "Configuration file {} not found, using defaults",
                    path.display()
                );
            },
            None => {},
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment
            .extract()
            .map_err(|e| BleSrvError::config(format!("Failed to extract configuration: {e}")))?;

        config.apply_legacy_env(|key| std::env::var(key).ok());
        config.validate()?;

        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment layers
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::string(yaml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the unprefixed overrides used by older deployments
    pub fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST").filter(|v| !v.is_empty()) {
            self.mqtt.host = host;
        }
        if let Some(user) = lookup("MQTT_USERNAME").filter(|v| !v.is_empty()) {
            self.mqtt.username = Some(user);
        }
        if let Some(port) = lookup("SERIAL_PORT").filter(|v| !v.is_empty()) {
            self.serial.port_name = port;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.serial.port_name.trim().is_empty() {
            return Err(BleSrvError::config("serial.port_name cannot be empty"));
        }
        if self.serial.baud_rate == 0 {
            return Err(BleSrvError::config(
                "serial.baud_rate must be greater than zero",
            ));
        }
        if ![5, 6, 7, 8].contains(&self.serial.data_bits) {
            return Err(BleSrvError::config("serial.data_bits must be 5, 6, 7, or 8"));
        }
        if ![1, 2].contains(&self.serial.stop_bits) {
            return Err(BleSrvError::config("serial.stop_bits must be 1 or 2"));
        }
        if !["none", "even", "odd"].contains(&self.serial.parity.to_lowercase().as_str()) {
            return Err(BleSrvError::config(
                "serial.parity must be none, even, or odd",
            ));
        }
        if !["none", "software", "hardware"]
            .contains(&self.serial.flow_control.to_lowercase().as_str())
        {
            return Err(BleSrvError::config(
                "serial.flow_control must be none, software, or hardware",
            ));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(BleSrvError::config("mqtt.host cannot be empty"));
        }
        if self.mqtt.qos > 2 {
            return Err(BleSrvError::config(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        if self.mux.queue_capacity == 0 {
            return Err(BleSrvError::config("mux.queue_capacity must be at least 1"));
        }
        // MaxPayload must be at least one byte for the configured MTU/handle
        self.link
            .frame_format()
            .map_err(|e| BleSrvError::config(format!("link: {e}")))?;
        if self.ble.device_name.len() > command::MAX_DEVICE_NAME_LEN {
            return Err(BleSrvError::config(format!(
                "ble.device_name exceeds {} bytes",
                command::MAX_DEVICE_NAME_LEN
            )));
        }
        Ok(())
    }
}

fn default_port_name() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    100
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_none() -> String {
    "none".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_protocol() -> String {
    "tcp".to_string()
}

fn default_client_id() -> String {
    "device-ble".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    300
}

fn default_queue_capacity() -> usize {
    10
}

fn default_ignore_prefixes() -> Vec<String> {
    vec!["freqchip".to_string()]
}

fn default_command_report_marker() -> String {
    COMMAND_REPORT_MARKER.to_string()
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_notify_handle() -> String {
    DEFAULT_NOTIFY_HANDLE.to_string()
}

fn default_packet_timeout_ms() -> u64 {
    300
}

fn default_read_delay_ms() -> u64 {
    1
}

fn default_queue_wait_ms() -> u64 {
    100
}

fn default_reassembly_max_age_ms() -> u64 {
    5_000
}

fn default_device_name() -> String {
    "QuecHCM111Z".to_string()
}

fn default_service_uuid() -> String {
    "fff1".to_string()
}

fn default_characteristic_uuid() -> String {
    "fff2".to_string()
}

fn default_up_topic() -> String {
    "edgex/service/data/device_ble/up".to_string()
}

fn default_down_topic() -> String {
    "edgex/service/data/device_ble/dwon".to_string()
}

fn default_all_status_topic() -> String {
    "edgex/core/commandquery/request/all".to_string()
}

fn default_response_topic() -> String {
    "edgex/response/#".to_string()
}

fn default_reading_topic() -> String {
    "edgex/core/command/request".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mux.queue_capacity, 10);
        assert_eq!(config.link.mtu, 247);
        assert_eq!(config.link.frame_format().unwrap().max_payload(), 217);
        assert_eq!(config.ble.init_policy, InitPolicy::AllOrNothing);
        assert_eq!(config.topics.down, "edgex/service/data/device_ble/dwon");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let yaml = r#"
serial:
  port_name: /dev/ttyS3
  baud_rate: 9600
mqtt:
  host: broker.local
  qos: 1
ble:
  device_name: Gateway01
  init_policy: best_effort
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.serial.port_name, "/dev/ttyS3");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.data_bits, 8);
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.ble.init_policy, InitPolicy::BestEffort);
        assert_eq!(config.ble.service_uuid, "fff1");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.mqtt.qos = 3;
        assert!(matches!(config.validate(), Err(BleSrvError::ConfigError(_))));

        let mut config = AppConfig::default();
        config.mux.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.link.mtu = 30;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.serial.port_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_legacy_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_legacy_env(|key| match key {
            "MQTT_HOST" => Some("10.0.0.5".to_string()),
            "SERIAL_PORT" => Some("/dev/ttyAMA0".to_string()),
            "MQTT_USERNAME" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.mqtt.host, "10.0.0.5");
        assert_eq!(config.serial.port_name, "/dev/ttyAMA0");
        assert_eq!(config.mqtt.username, None);
    }

    #[test]
    fn test_eviction_can_be_disabled() {
        let mut link = LinkSettings::default();
        assert_eq!(link.reassembly_max_age(), Some(Duration::from_secs(5)));
        link.reassembly_max_age_ms = 0;
        assert_eq!(link.reassembly_max_age(), None);
    }
}
