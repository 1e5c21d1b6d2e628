//! Daemon wiring against an on-disk configuration directory
//!
//! Follows the same startup path as the binaries with an in-process bus in
//! place of the broker.

use mq_bus::{Bus, MemoryBus};
use mq_config::{ExeConfig, HistoryConfig, LogLevel, SystemConfig};
use mq_exe::{ExeService, ScriptCatalog};
use mq_recorder::HistoryWriter;
use mq_server::{bus_options, effective_level};
use mq_store::Store;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn write(dir: &Path, file: &str, content: &str) {
    fs::write(dir.join(file), content).unwrap();
}

fn config_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("history.db");
    let scripts = dir.path().join("scripts.db");

    write(
        dir.path(),
        "system.yaml",
        r#"
mqtt_connection:
  host: broker.lan
  port: 1883
log_level: 3
"#,
    );
    write(
        dir.path(),
        "mq_db_daemon.yaml",
        &format!(
            r#"
uri: {}
log_level: 1
db: !include sensors.yaml
"#,
            db.display()
        ),
    );
    write(
        dir.path(),
        "sensors.yaml",
        r#"
- name: house/hall
  values:
    - name: Temperature
      interval: 0
      averaging: false
      precision: 0
"#,
    );
    write(
        dir.path(),
        "mq_exe_daemon.yaml",
        &format!("uri: {}\n", scripts.display()),
    );
    dir
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_loads_configuration_directory() {
    let dir = config_dir();
    let system = SystemConfig::load(dir.path()).unwrap();
    let history = HistoryConfig::load(dir.path()).unwrap();
    let exe = ExeConfig::load(dir.path()).unwrap();

    let options = bus_options(&system, "mq_db_daemon");
    assert_eq!((options.host.as_str(), options.port), ("broker.lan", 1883));

    assert_eq!(effective_level(&system, history.log_level), LogLevel::DEBUG);
    assert_eq!(effective_level(&system, exe.log_level), LogLevel::WARN);
    assert_eq!(history.sensors.len(), 1);
    assert_eq!(exe.uri, dir.path().join("scripts.db"));
}

// ============================================================================
// Startup paths
// ============================================================================

#[test]
fn test_history_daemon_path_records_readings() {
    let dir = config_dir();
    let config = HistoryConfig::load(dir.path()).unwrap();
    let store = Arc::new(Store::open_history(&config.uri).unwrap());

    let mut writer = HistoryWriter::new(Arc::clone(&store), &config.sensors);
    writer.seed().unwrap();
    let topics = writer.topics();
    assert_eq!(topics, vec!["status/house/hall"]);

    let bus = MemoryBus::new();
    for topic in &topics {
        bus.subscribe(topic).unwrap();
    }
    let writer = Mutex::new(writer);
    bus.start(Box::new(move |topic, payload| {
        writer.lock().handle_message(topic, payload)
    }))
    .unwrap();

    bus.publish("status/house/hall", r#"{"Temperature":[19.5,"°C"]}"#)
        .unwrap();
    bus.flush().unwrap();
    bus.close();

    // A fresh handle sees what the daemon wrote
    let reopened = Store::open_history(&config.uri).unwrap();
    assert_eq!(
        reopened.latest_real("house/hall", "Temperature").unwrap(),
        Some(19.5)
    );
}

#[test]
fn test_exe_daemon_path_runs_stored_scripts() {
    let dir = config_dir();
    let config = ExeConfig::load(dir.path()).unwrap();
    let store = Arc::new(Store::open_scripts(&config.uri).unwrap());

    let catalog = ScriptCatalog::new(Arc::clone(&store)).unwrap();
    catalog
        .save(
            "echo",
            r#"
local button = register_value("house/hall:Button")
while true do
  wait_or(button)
  report_value("house/hall:Pressed", request_value(button))
end
"#,
        )
        .unwrap();

    let bus = MemoryBus::new();
    let service = ExeService::new(bus.clone(), store).unwrap();
    let handler = Arc::clone(&service);
    bus.start(Box::new(move |topic, payload| {
        handler.handle_message(topic, payload)
    }))
    .unwrap();

    assert_eq!(service.start_all().unwrap(), 1);
    assert!(wait_until(Duration::from_secs(1), || {
        service.broker().value_entries() == 1
    }));

    bus.publish("status/house/hall", r#"{"Button":true}"#).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        bus.published_on("status/house/hall")
            .contains(&r#"{"Pressed":true}"#.to_string())
    }));

    service.shutdown();
    bus.close();
    assert!(service.running().is_empty());
}
