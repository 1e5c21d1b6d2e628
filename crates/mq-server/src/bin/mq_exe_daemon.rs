//! Rule engine daemon
//!
//! Runs every stored script and restarts them on `app/exe/reload`.

use anyhow::{Context, Result};
use clap::Parser;
use mq_config::{ExeConfig, SystemConfig};
use mq_exe::ExeService;
use mq_server::{connect_bus, init_logging, wait_for_shutdown, CommonArgs};
use mq_store::Store;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "mq-exe-daemon", version, about = "MQ System rule engine")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = &cli.common.config_dir;

    let system = SystemConfig::load(config_dir).context("Failed to load system configuration")?;
    let config = ExeConfig::load(config_dir).context("Failed to load rule engine configuration")?;
    let _guard = init_logging(&system, config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %config_dir.display(),
        "Starting rule engine"
    );

    let store = Store::open_scripts(&config.uri)
        .with_context(|| format!("Failed to open store {}", config.uri.display()))?;

    let (bus, incoming) = connect_bus(&system, "mq_exe_daemon")?;
    let service = ExeService::new(bus.clone(), Arc::new(store))
        .context("Failed to create rule engine")?;

    let handler = Arc::clone(&service);
    let bus_thread = incoming
        .spawn(Box::new(move |topic, payload| {
            handler.handle_message(topic, payload)
        }))
        .context("Failed to start bus thread")?;

    service.start_all().context("Failed to start scripts")?;

    wait_for_shutdown()?;

    service.shutdown();
    if let Err(e) = bus.disconnect() {
        warn!(error = %e, "Failed to disconnect from broker");
    }
    if bus_thread.join().is_err() {
        error!("Bus thread panicked");
    }
    info!("Rule engine stopped");
    Ok(())
}
