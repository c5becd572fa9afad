//! BLE module controller
//!
//! Drives the module through the multiplexer: the one-time peripheral init
//! sequence, single and batch commands, and the info queries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use voltage_ble::command;
use voltage_ble::response::{check_response, info_field};
use voltage_ble::BleState;

use super::config::{BleSettings, InitPolicy};
use super::multiplexer::SerialMultiplexer;
use crate::error::{BleSrvError, Result};

/// Timing applied to every controller command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTiming {
    pub timeout: Duration,
    pub read_delay: Duration,
    pub queue_wait: Duration,
}

impl Default for CommandTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            read_delay: Duration::from_millis(20),
            queue_wait: Duration::from_millis(100),
        }
    }
}

/// High-level control of the BLE module
#[derive(Debug, Clone)]
pub struct BleController {
    mux: Arc<SerialMultiplexer>,
    settings: BleSettings,
    timing: CommandTiming,
}

impl BleController {
    pub fn new(mux: Arc<SerialMultiplexer>, settings: BleSettings) -> Self {
        Self {
            mux,
            settings,
            timing: CommandTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: CommandTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn multiplexer(&self) -> &Arc<SerialMultiplexer> {
        &self.mux
    }

    pub fn settings(&self) -> &BleSettings {
        &self.settings
    }

    pub fn init_policy(&self) -> InitPolicy {
        self.settings.init_policy
    }

    /// Send one pre-built command and check its response
    pub async fn send_single(&self, cmd: &str) -> Result<String> {
        let response = self
            .mux
            .enqueue(
                cmd.as_bytes().to_vec(),
                self.timing.timeout,
                self.timing.read_delay,
                self.timing.queue_wait,
            )
            .await?;
        check_response(&response)?;
        debug!("[BLE] {} -> {:?}", cmd.trim_end(), response);
        Ok(response)
    }

    /// Send commands one after another; each outcome is independent
    pub async fn send_multi(&self, cmds: &[String]) -> Vec<Result<String>> {
        let mut results = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            results.push(self.send_single(cmd).await);
        }
        results
    }

    /// Reset the module and bring it up as an advertising peripheral
    pub async fn initialize_as_peripheral(&self) -> Result<()> {
        let commands = command::peripheral_init_commands(
            &self.settings.device_name,
            &self.settings.service_uuid,
            &self.settings.characteristic_uuid,
        )?;
        self.custom_initialize(&commands).await?;
        info!(
            "[BLE] initialized as peripheral '{}'",
            self.settings.device_name
        );
        Ok(())
    }

    /// Replay an init list under the configured policy.
    ///
    /// `AllOrNothing` stops at the first failure and returns it.
    /// `BestEffort` runs every command and returns the last failure, if any.
    pub async fn custom_initialize(&self, commands: &[String]) -> Result<()> {
        let policy = self.settings.init_policy;
        let mut last_error: Option<BleSrvError> = None;

        for (step, cmd) in commands.iter().enumerate() {
            match self.send_single(cmd).await {
                Ok(_) => info!(
                    "[BLE] init step {}/{} ok: {}",
                    step + 1,
                    commands.len(),
                    cmd.trim_end()
                ),
                Err(e) => match policy {
                    InitPolicy::AllOrNothing => {
                        error!("[BLE] init aborted at {}: {}", cmd.trim_end(), e);
                        return Err(e);
                    },
                    InitPolicy::BestEffort => {
                        warn!("[BLE] init step {} failed: {}", cmd.trim_end(), e);
                        last_error = Some(e);
                    },
                },
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn query_state(&self) -> Result<BleState> {
        let response = self.send_single(command::STATE).await?;
        Ok(BleState::parse(&response))
    }

    pub async fn version(&self) -> Result<String> {
        let response = self.send_single(command::VERSION).await?;
        info_field(&response, "QVERSION").ok_or_else(|| {
            BleSrvError::ProtocolError(voltage_ble::BleError::UnexpectedResponse(response))
        })
    }

    pub async fn address(&self) -> Result<String> {
        let response = self.send_single(command::ADDRESS).await?;
        info_field(&response, "QBLEADDR").ok_or_else(|| {
            BleSrvError::ProtocolError(voltage_ble::BleError::UnexpectedResponse(response))
        })
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::config::MuxSettings;
    use crate::core::multiplexer::NullSink;
    use crate::core::transport::mock::MockPeripheral;

    fn controller(policy: InitPolicy) -> (BleController, MockPeripheral) {
        let (host, device) = MockPeripheral::spawn();
        let mux = SerialMultiplexer::new(
            host,
            &MuxSettings::default(),
            Arc::new(NullSink),
            Arc::new(NullSink),
        );
        let settings = BleSettings {
            init_policy: policy,
            ..BleSettings::default()
        };
        let timing = CommandTiming {
            timeout: Duration::from_millis(200),
            read_delay: Duration::ZERO,
            queue_wait: Duration::from_millis(50),
        };
        (
            BleController::new(Arc::new(mux), settings).with_timing(timing),
            device,
        )
    }

    #[tokio::test]
    async fn test_initialize_sends_sequence_in_order() {
        let (ctl, device) = controller(InitPolicy::AllOrNothing);
        ctl.initialize_as_peripheral().await.unwrap();
        assert_eq!(
            device.commands(),
            vec![
                "AT+QRST",
                "AT+QBLEINIT=2",
                "AT+QBLEADVPARAM=150,150",
                "AT+QBLEGATTSSRV=fff1",
                "AT+QBLEGATTSCHAR=fff2",
                "AT+QBLEGATTSSRVDONE",
                "AT+QBLENAME=QuecHCM111Z",
                "AT+QBLEADVSTART",
            ]
        );
    }

    #[tokio::test]
    async fn test_all_or_nothing_stops_at_first_failure() {
        let (ctl, device) = controller(InitPolicy::AllOrNothing);
        device.respond("AT+QBLEADVPARAM", &["ERROR"]);
        let err = ctl.initialize_as_peripheral().await.unwrap_err();
        assert!(err.is_command_failed());
        assert_eq!(device.commands().len(), 3);
    }

    #[tokio::test]
    async fn test_best_effort_runs_everything_and_reports_last_error() {
        let (ctl, device) = controller(InitPolicy::BestEffort);
        device.respond("AT+QBLEINIT", &["ERROR"]);
        device.respond("AT+QBLENAME", &["+CME ERROR: 4"]);
        let err = ctl.initialize_as_peripheral().await.unwrap_err();
        assert!(err.is_module_error());
        assert_eq!(device.commands().len(), 8);
    }

    #[tokio::test]
    async fn test_send_multi_is_not_transactional() {
        let (ctl, device) = controller(InitPolicy::AllOrNothing);
        device.respond("AT+B", &["ERROR"]);
        let results = ctl
            .send_multi(&[
                "AT+A\r\n".to_string(),
                "AT+B\r\n".to_string(),
                "AT+C\r\n".to_string(),
            ])
            .await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_info_queries() {
        let (ctl, device) = controller(InitPolicy::AllOrNothing);
        device.respond("AT+QVERSION", &["+QVERSION:HCM111Z_V2.0", "OK"]);
        device.respond("AT+QBLEADDR?", &["+QBLEADDR:AA:BB:CC:DD:EE:FF", "OK"]);
        device.respond("AT+QBLESTAT", &["+QBLESTAT:ADVERTISING", "OK"]);

        assert_eq!(ctl.version().await.unwrap(), "HCM111Z_V2.0");
        assert_eq!(ctl.address().await.unwrap(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(ctl.query_state().await.unwrap(), BleState::Advertising);
    }
}
