//! AT command builders
//!
//! Every builder is pure: it validates its input and returns the complete
//! command line including the `\r\n` terminator. Nothing here touches a port.

use crate::error::{BleError, Result};

/// Command line terminator
pub const TERMINATOR: &str = "\r\n";

/// Restart the module
pub const RESET: &str = "AT+QRST\r\n";
/// Query firmware version
pub const VERSION: &str = "AT+QVERSION\r\n";
/// Query local BLE MAC address
pub const ADDRESS: &str = "AT+QBLEADDR?\r\n";
/// Query BLE state
pub const STATE: &str = "AT+QBLESTAT\r\n";
/// Finish GATT server configuration
pub const FINISH_GATT_SERVER: &str = "AT+QBLEGATTSSRVDONE\r\n";
/// Start advertising
pub const START_ADVERTISING: &str = "AT+QBLEADVSTART\r\n";

/// Default advertising interval (units of 0.625 ms)
pub const DEFAULT_ADV_INTERVAL: u16 = 150;
/// Longest accepted device name in bytes
pub const MAX_DEVICE_NAME_LEN: usize = 29;
/// Longest text accepted by a single notify
pub const MAX_NOTIFY_LEN: usize = 223;
/// Accepted TX power range in dBm
pub const TX_POWER_RANGE: std::ops::RangeInclusive<i8> = -20..=10;
/// Accepted advertising interval range
pub const ADV_INTERVAL_RANGE: std::ops::RangeInclusive<u16> = 32..=16384;
/// Baud rates the module can switch to
pub const SUPPORTED_BAUD_RATES: [u32; 8] =
    [9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600];

/// BLE role passed to `AT+QBLEINIT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleRole {
    Central,
    Peripheral,
    MultiConnection,
}

impl BleRole {
    /// Numeric code used on the wire
    pub fn code(self) -> u8 {
        match self {
            BleRole::Central => 1,
            BleRole::Peripheral => 2,
            BleRole::MultiConnection => 4,
        }
    }
}

impl TryFrom<u8> for BleRole {
    type Error = BleError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(BleRole::Central),
            2 => Ok(BleRole::Peripheral),
            4 => Ok(BleRole::MultiConnection),
            other => Err(BleError::invalid_parameter(format!(
                "BLE role must be 1, 2 or 4, got {}",
                other
            ))),
        }
    }
}

fn line(body: impl AsRef<str>) -> String {
    format!("{}{}", body.as_ref(), TERMINATOR)
}

fn validate_uuid(kind: &str, uuid: &str) -> Result<()> {
    if uuid.is_empty() {
        return Err(BleError::invalid_parameter(format!("{} UUID is empty", kind)));
    }
    if !(uuid.len() == 4 || uuid.len() == 32) {
        return Err(BleError::invalid_parameter(format!(
            "{} UUID must have 4 or 32 hex digits, got '{}'",
            kind, uuid
        )));
    }
    if !uuid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BleError::invalid_parameter(format!(
            "{} UUID contains non-hex characters: '{}'",
            kind, uuid
        )));
    }
    Ok(())
}

/// `AT+QRST`
pub fn restart() -> String {
    RESET.to_string()
}

/// `AT+QBLEINIT=<role>`
pub fn init(role: u8) -> Result<String> {
    let role = BleRole::try_from(role)?;
    Ok(line(format!("AT+QBLEINIT={}", role.code())))
}

/// `AT+QBLENAME=<name>`
pub fn set_device_name(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(BleError::invalid_parameter("device name is empty"));
    }
    if name.len() > MAX_DEVICE_NAME_LEN {
        return Err(BleError::invalid_parameter(format!(
            "device name is {} bytes, limit is {}",
            name.len(),
            MAX_DEVICE_NAME_LEN
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| (!c.is_ascii_graphic() && *c != ' ') || *c == ',' || *c == '"')
    {
        return Err(BleError::invalid_parameter(format!(
            "device name contains unsupported character {:?}",
            bad
        )));
    }
    Ok(line(format!("AT+QBLENAME={}", name)))
}

/// `AT+QBLEADVPARAM=<min>,<max>`
pub fn set_advertising_params(min_interval: u16, max_interval: u16) -> Result<String> {
    for value in [min_interval, max_interval] {
        if !ADV_INTERVAL_RANGE.contains(&value) {
            return Err(BleError::invalid_parameter(format!(
                "advertising interval {} outside {:?}",
                value, ADV_INTERVAL_RANGE
            )));
        }
    }
    if min_interval > max_interval {
        return Err(BleError::invalid_parameter(format!(
            "advertising interval min {} is greater than max {}",
            min_interval, max_interval
        )));
    }
    Ok(line(format!(
        "AT+QBLEADVPARAM={},{}",
        min_interval, max_interval
    )))
}

/// `AT+QBLEGATTSSRV=<uuid>`
pub fn add_service(uuid: &str) -> Result<String> {
    validate_uuid("service", uuid)?;
    Ok(line(format!("AT+QBLEGATTSSRV={}", uuid)))
}

/// `AT+QBLEGATTSCHAR=<uuid>`
pub fn add_characteristic(uuid: &str) -> Result<String> {
    validate_uuid("characteristic", uuid)?;
    Ok(line(format!("AT+QBLEGATTSCHAR={}", uuid)))
}

/// `AT+QBLEGATTSSRVDONE`
pub fn finish_gatt_server() -> String {
    FINISH_GATT_SERVER.to_string()
}

/// `AT+QBLEADVSTART`
pub fn start_advertising() -> String {
    START_ADVERTISING.to_string()
}

/// `AT+QBLETXPWR=<dbm>`
pub fn set_tx_power(dbm: i8) -> Result<String> {
    if !TX_POWER_RANGE.contains(&dbm) {
        return Err(BleError::invalid_parameter(format!(
            "TX power {} dBm outside {:?}",
            dbm, TX_POWER_RANGE
        )));
    }
    Ok(line(format!("AT+QBLETXPWR={}", dbm)))
}

/// `AT+IPR=<baud>`
pub fn set_baud(baud: i64) -> Result<String> {
    let supported = u32::try_from(baud)
        .ok()
        .filter(|b| SUPPORTED_BAUD_RATES.contains(b));
    match supported {
        Some(rate) => Ok(line(format!("AT+IPR={}", rate))),
        None => Err(BleError::invalid_parameter(format!(
            "unsupported baud rate {} (supported: {:?})",
            baud, SUPPORTED_BAUD_RATES
        ))),
    }
}

/// Prefix shared by every notify on `handle`: `AT+QBLEGATTSNTFY=0,<handle>,`
pub fn notify_prefix(handle: &str) -> Result<String> {
    validate_uuid("notify handle", handle)?;
    Ok(format!("AT+QBLEGATTSNTFY=0,{},", handle))
}

/// `AT+QBLEGATTSNTFY=0,<handle>,<text>`
pub fn send_notify(handle: &str, text: &str) -> Result<String> {
    if text.is_empty() {
        return Err(BleError::invalid_parameter("notify text is empty"));
    }
    if text.len() > MAX_NOTIFY_LEN {
        return Err(BleError::invalid_parameter(format!(
            "notify text is {} bytes, limit is {}",
            text.len(),
            MAX_NOTIFY_LEN
        )));
    }
    if text.contains(['\r', '\n']) {
        return Err(BleError::invalid_parameter(
            "notify text must not contain line breaks",
        ));
    }
    Ok(line(format!("{}{}", notify_prefix(handle)?, text)))
}

/// Init list for a peripheral:
/// reset, init, adv params, service, characteristic, finish, name, advertise.
pub fn peripheral_init_commands(
    device_name: &str,
    service_uuid: &str,
    characteristic_uuid: &str,
) -> Result<Vec<String>> {
    Ok(vec![
        restart(),
        init(BleRole::Peripheral.code())?,
        set_advertising_params(DEFAULT_ADV_INTERVAL, DEFAULT_ADV_INTERVAL)?,
        add_service(service_uuid)?,
        add_characteristic(characteristic_uuid)?,
        finish_gatt_server(),
        set_device_name(device_name)?,
        start_advertising(),
    ])
}
