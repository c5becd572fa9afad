//! blesrv - BLE Serial Bridge Service

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use blesrv::bus::{BusClient, MqttBusTransport};
use blesrv::core::bootstrap::{self, Args};
use blesrv::core::transport::open_serial;
use blesrv::service::BleDriver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = bootstrap::load_configuration(&args).context("failed to load configuration")?;
    if args.validate {
        println!("Configuration valid: {}", args.config.display());
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let _log_guard =
        bootstrap::initialize_logging(&args, &config).context("failed to initialize logging")?;
    info!("Starting blesrv v{}", env!("CARGO_PKG_VERSION"));
    bootstrap::log_configuration(&args, &config);

    let serial = open_serial(&config.serial)
        .with_context(|| format!("failed to open serial port {}", config.serial.port_name))?;

    let transport = Arc::new(MqttBusTransport::new(config.mqtt.clone()));
    let bus = Arc::new(BusClient::new(transport));
    bus.set_timeout(config.mqtt.request_timeout());
    bus.connect().await.context("failed to connect to the broker")?;

    let driver = BleDriver::initialize(config, serial, Arc::clone(&bus))?;
    if let Err(e) = driver.start().await {
        error!("Driver start failed: {}", e);
        shutdown(&driver).await;
        return Err(e.into());
    }

    info!("blesrv running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown signal received");

    shutdown(&driver).await;
    info!("blesrv stopped");
    Ok(())
}

async fn shutdown(driver: &BleDriver) {
    if let Err(e) = driver.bus().disconnect().await {
        warn!("Bus disconnect failed: {}", e);
    }
    driver.stop().await;
}
