//! BLE Protocol Error Types
//!
//! Core error types for AT command building, response classification and
//! packet fragmentation.

use thiserror::Error;

/// Result type for voltage-ble operations
pub type Result<T> = std::result::Result<T, BleError>;

/// BLE protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BleError {
    /// Builder input rejected before any I/O
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Peripheral answered with a plain `ERROR`
    #[error("Command failed: {response}")]
    CommandFailed { response: String },

    /// Peripheral answered with `+CME ERROR:<code>`
    #[error("Module error {code}: {response}")]
    ModuleError { code: String, response: String },

    /// Response carried no success token
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Wire frame too short or otherwise malformed
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Reassembly completed with a gap
    #[error("Missing packet {index}/{total}")]
    MissingPacket { index: u16, total: u16 },

    /// Reassembled bytes are not valid JSON
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Frame layout leaves no room for payload
    #[error("Frame configuration error: {0}")]
    FrameConfig(String),

    /// IO errors surfaced through the frame codec
    #[error("IO error: {0}")]
    Io(String),

    /// Payload needs more packets than the 16-bit header can count
    #[error("Payload too large: {0} packets exceed the u16 packet counter")]
    TooManyPackets(usize),
}

impl BleError {
    /// Create an invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create an invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Create a frame configuration error
    pub fn frame_config(msg: impl Into<String>) -> Self {
        Self::FrameConfig(msg.into())
    }

    /// True for failures reported by the peripheral itself
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. } | Self::ModuleError { .. } | Self::UnexpectedResponse(_)
        )
    }

    /// True for errors raised while rebuilding a fragmented payload
    pub fn is_reassembly(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrame(_) | Self::MissingPacket { .. } | Self::InvalidPayload(_)
        )
    }
}

impl From<std::io::Error> for BleError {
    fn from(err: std::io::Error) -> Self {
        BleError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BleError {
    fn from(err: serde_json::Error) -> Self {
        BleError::InvalidPayload(format!("JSON error: {}", err))
    }
}
