//! History writer daemon
//!
//! Subscribes to the configured sensors and down-samples their readings into
//! the measurement database.

use anyhow::{Context, Result};
use clap::Parser;
use mq_bus::Bus;
use mq_config::{HistoryConfig, SystemConfig};
use mq_core::topics::MATCH_ALL;
use mq_recorder::HistoryWriter;
use mq_server::{connect_bus, init_logging, wait_for_shutdown, CommonArgs};
use mq_store::Store;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "mq-db-daemon", version, about = "MQ System history writer")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = &cli.common.config_dir;

    let system = SystemConfig::load(config_dir).context("Failed to load system configuration")?;
    let config = HistoryConfig::load(config_dir).context("Failed to load history configuration")?;
    let _guard = init_logging(&system, config.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %config_dir.display(),
        sensors = config.sensors.len(),
        "Starting history writer"
    );

    let store = Store::open_history(&config.uri)
        .with_context(|| format!("Failed to open store {}", config.uri.display()))?;
    let mut writer = HistoryWriter::new(Arc::new(store), &config.sensors);
    writer.seed().context("Failed to seed writer state")?;
    let topics = writer.topics();

    let (bus, incoming) = connect_bus(&system, "mq_db_daemon")?;
    for topic in &topics {
        bus.subscribe(topic)
            .with_context(|| format!("Failed to subscribe to {topic}"))?;
    }
    info!(topics = topics.len(), "Subscribed to sensor topics");

    let writer = Mutex::new(writer);
    let bus_thread = incoming
        .spawn(Box::new(move |topic, payload| {
            writer.lock().handle_message(topic, payload)
        }))
        .context("Failed to start bus thread")?;

    wait_for_shutdown()?;

    if let Err(e) = bus.unsubscribe(MATCH_ALL) {
        warn!(error = %e, "Failed to drop subscriptions");
    }
    if let Err(e) = bus.disconnect() {
        warn!(error = %e, "Failed to disconnect from broker");
    }
    if bus_thread.join().is_err() {
        error!("Bus thread panicked");
    }
    info!("History writer stopped");
    Ok(())
}
