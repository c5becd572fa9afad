//! Error handling for the BLE bridge service
//!
//! Error kinds follow the bridge failure taxonomy: validation, write, timeout,
//! queue-full, protocol, reassembly, bus and shutdown.

use thiserror::Error;
use voltage_ble::BleError;

/// BLE Bridge Service Error Type
#[derive(Error, Debug, Clone)]
pub enum BleSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Bad input rejected before any I/O
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The serial transport refused a write
    #[error("Write error: {0}")]
    WriteError(String),

    /// No terminal line / no response within the deadline
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Multiplexer admission failed after all retries
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// The module answered `ERROR` or `+CME ERROR:`
    #[error("Protocol error: {0}")]
    ProtocolError(BleError),

    /// Fragment reassembly failed
    #[error("Reassembly error: {0}")]
    ReassemblyError(String),

    /// Message bus errors (not connected, publish/subscribe failures)
    #[error("Bus error: {0}")]
    BusError(String),

    /// Component already shut down
    #[error("Closed: {0}")]
    Closed(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type for the bridge service
pub type Result<T> = std::result::Result<T, BleSrvError>;

impl BleSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::WriteError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::TimeoutError(msg.into())
    }

    pub fn queue_full(msg: impl Into<String>) -> Self {
        Self::QueueFull(msg.into())
    }

    pub fn reassembly(msg: impl Into<String>) -> Self {
        Self::ReassemblyError(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        Self::BusError(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    pub fn not_connected() -> Self {
        Self::BusError("message bus not connected".to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError(_))
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// `+CME ERROR:` reply, as opposed to a plain `ERROR`
    pub fn is_module_error(&self) -> bool {
        matches!(self, Self::ProtocolError(BleError::ModuleError { .. }))
    }

    pub fn is_command_failed(&self) -> bool {
        matches!(self, Self::ProtocolError(BleError::CommandFailed { .. }))
    }
}

impl From<BleError> for BleSrvError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::InvalidParameter(msg) => BleSrvError::ValidationError(msg),
            BleError::FrameConfig(msg) => BleSrvError::ConfigError(msg),
            BleError::Io(msg) => BleSrvError::IoError(msg),
            e @ BleError::TooManyPackets(_) => BleSrvError::ValidationError(e.to_string()),
            e if e.is_reassembly() => BleSrvError::ReassemblyError(e.to_string()),
            e => BleSrvError::ProtocolError(e),
        }
    }
}

impl From<std::io::Error> for BleSrvError {
    fn from(err: std::io::Error) -> Self {
        BleSrvError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for BleSrvError {
    fn from(err: serde_json::Error) -> Self {
        BleSrvError::SerializationError(format!("JSON: {err}"))
    }
}

impl From<figment::Error> for BleSrvError {
    fn from(err: figment::Error) -> Self {
        BleSrvError::ConfigError(err.to_string())
    }
}

impl From<tokio_serial::Error> for BleSrvError {
    fn from(err: tokio_serial::Error) -> Self {
        BleSrvError::IoError(format!("serial port: {err}"))
    }
}

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn bus_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BleSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn bus_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| BleSrvError::BusError(format!("{msg}: {e}")))
    }
}
