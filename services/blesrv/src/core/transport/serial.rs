//! Serial port opening
//!
//! Maps the textual serial settings onto `tokio-serial` and opens the port.

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, error, info};

use crate::core::config::SerialConfig;
use crate::error::{BleSrvError, Result};

/// Open the configured serial port as an async stream
pub fn open_serial(config: &SerialConfig) -> Result<SerialStream> {
    debug!(
        "[Serial] Opening {} @ {} baud ({}{}{})",
        config.port_name,
        config.baud_rate,
        config.data_bits,
        config.parity.chars().next().unwrap_or('n').to_ascii_uppercase(),
        config.stop_bits
    );

    let result = tokio_serial::new(&config.port_name, config.baud_rate)
        .data_bits(parse_data_bits(config.data_bits))
        .parity(parse_parity(&config.parity))
        .stop_bits(parse_stop_bits(config.stop_bits))
        .flow_control(parse_flow_control(&config.flow_control))
        .timeout(config.read_timeout())
        .open_native_async();

    match result {
        Ok(mut port) => {
            #[cfg(unix)]
            port.set_exclusive(false).map_err(|e| {
                BleSrvError::IoError(format!("Failed to set exclusive mode: {e}"))
            })?;

            info!("[Serial] Opened serial port {}", config.port_name);
            Ok(port)
        },
        Err(e) => {
            error!("[Serial] Failed to open {}: {}", config.port_name, e);
            Err(BleSrvError::IoError(format!(
                "Failed to open serial port {}: {e}",
                config.port_name
            )))
        },
    }
}

pub(crate) fn parse_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

pub(crate) fn parse_parity(parity: &str) -> Parity {
    match parity.to_lowercase().as_str() {
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => Parity::None,
    }
}

pub(crate) fn parse_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

pub(crate) fn parse_flow_control(flow: &str) -> FlowControl {
    match flow.to_lowercase().as_str() {
        "software" => FlowControl::Software,
        "hardware" => FlowControl::Hardware,
        _ => FlowControl::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_mapping() {
        assert_eq!(parse_data_bits(7), DataBits::Seven);
        assert_eq!(parse_data_bits(9), DataBits::Eight);
        assert_eq!(parse_parity("Even"), Parity::Even);
        assert_eq!(parse_parity("none"), Parity::None);
        assert_eq!(parse_stop_bits(2), StopBits::Two);
        assert_eq!(parse_flow_control("HARDWARE"), FlowControl::Hardware);
        assert_eq!(parse_flow_control("bogus"), FlowControl::None);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let config = SerialConfig {
            port_name: "/dev/blesrv-does-not-exist".to_string(),
            ..SerialConfig::default()
        };
        assert!(matches!(open_serial(&config), Err(BleSrvError::IoError(_))));
    }
}
