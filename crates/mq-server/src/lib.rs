//! Shared bootstrap for the MQ System daemons
//!
//! Command line, logging setup, broker connection and signal handling used by
//! `mq-db-daemon`, `mq-exe-daemon` and `mq-script`.

use anyhow::{Context, Result};
use clap::Args;
use mq_bus::{BusOptions, Incoming, MqttBus};
use mq_config::{LogLevel, SystemConfig, DEFAULT_CONFIG_DIR};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Options every binary accepts
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Directory holding system.yaml and the daemon configuration
    #[arg(long, env = "MQ_SYSTEM_CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,
}

/// The configured threshold, the daemon's own level winning over the system one
pub fn effective_level(system: &SystemConfig, daemon: Option<LogLevel>) -> LogLevel {
    daemon.unwrap_or(system.log_level)
}

/// Filter from `RUST_LOG` when set, the configured level otherwise
pub fn log_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Install the global subscriber
///
/// Logs go to `log_file` when configured, stderr otherwise. The returned guard
/// flushes the file writer and must live until exit.
pub fn init_logging(system: &SystemConfig, daemon: Option<LogLevel>) -> Result<Option<WorkerGuard>> {
    let filter = log_filter(effective_level(system, daemon));

    let Some(path) = &system.log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init()
            .context("Failed to install log subscriber")?;
        return Ok(None);
    };

    let (directory, file_name) = split_log_path(path)?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(Some(guard))
}

fn split_log_path(path: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("log_file {} names no file", path.display()))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((directory, file_name))
}

/// Connection options for a client named `client_id`
pub fn bus_options(system: &SystemConfig, client_id: &str) -> BusOptions {
    let connection = &system.mqtt_connection;
    let mut options = BusOptions::new(client_id, connection.host.clone(), connection.port);
    options.keep_alive = Duration::from_secs(connection.keep_alive);
    options
}

/// Connect to the configured broker
pub fn connect_bus(system: &SystemConfig, client_id: &str) -> Result<(Arc<MqttBus>, Incoming)> {
    let options = bus_options(system, client_id);
    MqttBus::connect(&options).with_context(|| {
        format!(
            "Failed to connect to broker {}:{}",
            options.host, options.port
        )
    })
}

/// Block until SIGINT or SIGTERM
///
/// The broker client runs its own blocking event loop, so the daemons stay
/// synchronous and only this wait runs on a tokio runtime.
pub fn wait_for_shutdown() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    runtime.block_on(shutdown_signal())?;
    info!("Shutdown requested");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to wait for SIGINT")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_config_dir_flag() {
        let cli = TestCli::parse_from(["mq", "--config-dir", "/tmp/mq"]);
        assert_eq!(cli.common.config_dir, PathBuf::from("/tmp/mq"));
    }

    #[test]
    fn test_daemon_level_overrides_system_level() {
        let system = SystemConfig::default();
        assert_eq!(effective_level(&system, None), LogLevel::INFO);
        assert_eq!(effective_level(&system, Some(LogLevel::TRACE)), LogLevel::TRACE);
    }

    #[test]
    fn test_bus_options_follow_system_config() {
        let mut system = SystemConfig::default();
        system.mqtt_connection.host = "broker.lan".to_string();
        system.mqtt_connection.keep_alive = 15;

        let options = bus_options(&system, "mq_db_daemon");
        assert_eq!(options.client_id, "mq_db_daemon");
        assert_eq!(options.host, "broker.lan");
        assert_eq!(options.port, 1887);
        assert_eq!(options.keep_alive, Duration::from_secs(15));
        assert_eq!(options.connect_attempts, 10);
    }

    #[test]
    fn test_split_log_path() {
        let (directory, file) = split_log_path(Path::new("/var/log/mq/exe.log")).unwrap();
        assert_eq!(directory, Path::new("/var/log/mq"));
        assert_eq!(file, "exe.log");

        let (directory, _) = split_log_path(Path::new("exe.log")).unwrap();
        assert_eq!(directory, Path::new("."));
        assert!(split_log_path(Path::new("/")).is_err());
    }
}
