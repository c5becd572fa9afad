//! Service Bootstrap and Initialization
//!
//! Command-line arguments, logging setup and configuration loading

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;

use super::config::{AppConfig, DEFAULT_CONFIG_PATH};
use super::logging::{self, LogOptions};
use crate::error::Result;

/// Command-line arguments for blesrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "blesrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "BLE Serial Bridge Service",
    long_about = None
)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to `logging.level`
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    /// Effective log level: `--debug`, then `--log-level`, then `configured`
    pub fn effective_log_level<'a>(&'a self, configured: &'a str) -> &'a str {
        if self.debug {
            "debug"
        } else {
            self.log_level.as_deref().unwrap_or(configured)
        }
    }
}

/// Initialize logging from arguments and the logging section
pub fn initialize_logging(args: &Args, config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let options = LogOptions {
        level: args
            .effective_log_level(&config.logging.level)
            .to_string(),
        ansi: !args.no_color,
        file_dir: config
            .logging
            .enable_file
            .then(|| config.logging.dir.clone()),
    };
    logging::init(&options)
}

/// Load the configuration named by `--config`.
///
/// Runs before logging is initialized, since the logging section lives in
/// the configuration itself.
pub fn load_configuration(args: &Args) -> Result<AppConfig> {
    AppConfig::load(Some(&args.config))
}

/// Log the effective configuration summary
pub fn log_configuration(args: &Args, config: &AppConfig) {
    info!("Configuration: {}", args.config.display());
    info!(
        "  Serial: {} @ {} baud",
        config.serial.port_name, config.serial.baud_rate
    );
    info!(
        "  Broker: {}:{} as '{}'",
        config.mqtt.host, config.mqtt.port, config.mqtt.client_id
    );
    info!(
        "  Peripheral: '{}' service {} characteristic {}",
        config.ble.device_name, config.ble.service_uuid, config.ble.characteristic_uuid
    );
    debug!("  Topics: {:?}", config.topics);
}
