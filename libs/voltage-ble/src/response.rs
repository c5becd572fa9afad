//! Line and response classification
//!
//! A line read from the module is exactly one of: a command report (carries
//! the report marker), a terminal response (`OK`, `ERROR`, `+CME ERROR:`) or
//! raw data. A complete response is the newline-joined text accumulated up to
//! and including its terminal line.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BleError, Result};

/// Token marking a successful command
pub const SUCCESS_TOKEN: &str = "OK";
/// Token marking a failed command
pub const FAILURE_TOKEN: &str = "ERROR";
/// Prefix of a module error line
pub const MODULE_ERROR_PREFIX: &str = "+CME ERROR:";
/// Marker of an unsolicited command report
pub const COMMAND_REPORT_MARKER: &str = "+COMMAND:";

/// Outcome signalled by a terminal line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Success,
    Failure,
    ModuleError,
}

impl TerminalStatus {
    pub fn is_success(self) -> bool {
        self == TerminalStatus::Success
    }
}

/// Classification of a single inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind<'a> {
    /// Unsolicited report, already split into its non-empty segments
    CommandReport(Vec<&'a str>),
    /// End of a command reply
    Terminal(TerminalStatus),
    /// Anything else
    RawData,
}

/// Terminal status of `line`, if it ends a reply
pub fn terminal_status(line: &str) -> Option<TerminalStatus> {
    if line.starts_with(MODULE_ERROR_PREFIX) {
        Some(TerminalStatus::ModuleError)
    } else if line.contains(FAILURE_TOKEN) {
        Some(TerminalStatus::Failure)
    } else if line.contains(SUCCESS_TOKEN) {
        Some(TerminalStatus::Success)
    } else {
        None
    }
}

/// Split a report line on `marker`, keeping the non-empty trimmed segments
pub fn split_command_report<'a>(line: &'a str, marker: &str) -> Vec<&'a str> {
    line.split(marker)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Classify a trimmed line using `marker` as the command report marker
pub fn classify_line<'a>(line: &'a str, marker: &str) -> LineKind<'a> {
    if !marker.is_empty() && line.contains(marker) {
        return LineKind::CommandReport(split_command_report(line, marker));
    }
    match terminal_status(line) {
        Some(status) => LineKind::Terminal(status),
        None => LineKind::RawData,
    }
}

/// Code carried by the first `+CME ERROR:` line of `response`
pub fn module_error_code(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix(MODULE_ERROR_PREFIX))
        .map(|code| code.trim().to_string())
}

/// Check a complete response.
///
/// Success iff the text contains the success token and neither the failure
/// token nor the module error prefix. The failure reason is preserved.
pub fn check_response(response: &str) -> Result<()> {
    if let Some(code) = module_error_code(response) {
        return Err(BleError::ModuleError {
            code,
            response: response.to_string(),
        });
    }
    if response.contains(FAILURE_TOKEN) {
        return Err(BleError::CommandFailed {
            response: response.to_string(),
        });
    }
    if response.contains(SUCCESS_TOKEN) {
        Ok(())
    } else {
        Err(BleError::UnexpectedResponse(response.to_string()))
    }
}

/// Value of the `+<tag>:` line in `response`, or the first non-terminal line
pub fn info_field(response: &str, tag: &str) -> Option<String> {
    let prefix = format!("+{}:", tag);
    let lines: Vec<&str> = response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    lines
        .iter()
        .find_map(|l| l.strip_prefix(prefix.as_str()))
        .or_else(|| {
            lines
                .iter()
                .copied()
                .find(|l| terminal_status(l).is_none() && !l.starts_with("AT+"))
        })
        .map(|v| v.trim().to_string())
}

/// BLE state reported by `AT+QBLESTAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BleState {
    #[serde(rename = "NOINIT")]
    Uninitialized,
    #[serde(rename = "INIT")]
    Initialized,
    #[serde(rename = "ADVERTISING")]
    Advertising,
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "DISCONNECTED")]
    Disconnected,
}

impl BleState {
    pub fn as_str(self) -> &'static str {
        match self {
            BleState::Uninitialized => "NOINIT",
            BleState::Initialized => "INIT",
            BleState::Advertising => "ADVERTISING",
            BleState::Connected => "CONNECTED",
            BleState::Disconnected => "DISCONNECTED",
        }
    }

    /// Parse a state response; unknown text maps to `Uninitialized`.
    pub fn parse(response: &str) -> Self {
        // Longer tokens first: NOINIT contains INIT, DISCONNECTED contains CONNECTED
        const ORDER: [BleState; 5] = [
            BleState::Uninitialized,
            BleState::Disconnected,
            BleState::Advertising,
            BleState::Connected,
            BleState::Initialized,
        ];
        ORDER
            .into_iter()
            .find(|state| response.contains(state.as_str()))
            .unwrap_or(BleState::Uninitialized)
    }
}

impl fmt::Display for BleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
