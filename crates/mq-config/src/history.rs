//! History writer configuration (`mq_db_daemon.yaml`)
//!
//! ```yaml
//! uri: /var/db/mq_system.db
//! log_level: 2
//! db:
//!   - name: living_room/thermostat
//!     values:
//!       - name: Temperature
//!         interval: 60        # seconds, integer or float
//!         averaging: true
//!         precision: 0.1
//! ```

use mq_core::{is_value_name, DevicePath};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;
use crate::system::LogLevel;

/// File name of the history writer configuration
pub const HISTORY_CONFIG_FILE: &str = "mq_db_daemon.yaml";

/// Per-value recording settings
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSettings {
    pub name: String,
    /// Minimum spacing between recorded samples; zero records every message
    pub interval: Duration,
    /// Record the time-weighted mean over each interval
    pub averaging: bool,
    /// Minimum change worth recording; zero records every accepted sample
    pub precision: f64,
}

/// A recorded device and its configured values
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSettings {
    pub device: DevicePath,
    pub values: Vec<ValueSettings>,
}

/// Validated history writer configuration
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub uri: PathBuf,
    /// Overrides the system log level when present
    pub log_level: Option<LogLevel>,
    pub sensors: Vec<SensorSettings>,
}

#[derive(Debug, Deserialize)]
struct RawHistoryConfig {
    #[serde(default = "default_uri")]
    uri: PathBuf,
    #[serde(default)]
    log_level: Option<LogLevel>,
    #[serde(default)]
    db: Option<Vec<RawSensor>>,
}

#[derive(Debug, Deserialize)]
struct RawSensor {
    name: String,
    #[serde(default)]
    values: Vec<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    name: String,
    #[serde(default)]
    interval: f64,
    #[serde(default)]
    averaging: bool,
    #[serde(default)]
    precision: f64,
}

fn default_uri() -> PathBuf {
    PathBuf::from("/var/db/mq_system.db")
}

impl HistoryConfig {
    /// Load `mq_db_daemon.yaml` from a config directory
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let yaml = load_yaml(config_dir.as_ref(), HISTORY_CONFIG_FILE)?;
        Self::from_yaml(&yaml)
    }

    /// Parse and validate the history writer configuration
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        let raw: RawHistoryConfig =
            serde_yaml::from_value(yaml.clone()).map_err(|e| ConfigError::InvalidValue {
                key: HISTORY_CONFIG_FILE.to_string(),
                reason: e.to_string(),
            })?;

        let db = raw.db.ok_or_else(|| ConfigError::MissingSetting {
            key: "db".to_string(),
        })?;

        let mut sensors = Vec::with_capacity(db.len());
        let mut seen_devices = HashSet::new();
        for (index, sensor) in db.into_iter().enumerate() {
            let key = format!("db[{index}]");
            let device = DevicePath::new(sensor.name).map_err(|e| ConfigError::InvalidValue {
                key: format!("{key}.name"),
                reason: e.to_string(),
            })?;

            if sensor.values.is_empty() {
                warn!(sensor = %device, "Sensor has no values configured, ignoring it");
                continue;
            }
            if !seen_devices.insert(device.clone()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("{key}.name"),
                    reason: format!("sensor '{device}' is configured twice"),
                });
            }

            let values = validate_values(&key, sensor.values)?;
            sensors.push(SensorSettings { device, values });
        }

        Ok(Self {
            uri: raw.uri,
            log_level: raw.log_level,
            sensors,
        })
    }
}

fn validate_values(sensor_key: &str, raw: Vec<RawValue>) -> ConfigResult<Vec<ValueSettings>> {
    let mut names = HashSet::new();
    let mut values = Vec::with_capacity(raw.len());

    for (index, value) in raw.into_iter().enumerate() {
        let key = format!("{sensor_key}.values[{index}]");
        if !is_value_name(&value.name) {
            return Err(ConfigError::InvalidValue {
                key: format!("{key}.name"),
                reason: format!("'{}' is not a valid value name", value.name),
            });
        }
        if !names.insert(value.name.clone()) {
            return Err(ConfigError::InvalidValue {
                key: format!("{key}.name"),
                reason: format!("value '{}' is configured twice", value.name),
            });
        }

        let interval =
            Duration::try_from_secs_f64(value.interval).map_err(|e| ConfigError::InvalidValue {
                key: format!("{key}.interval"),
                reason: e.to_string(),
            })?;

        if !value.precision.is_finite() || value.precision < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{key}.precision"),
                reason: "precision must be a non-negative number".to_string(),
            });
        }

        values.push(ValueSettings {
            name: value.name,
            interval,
            averaging: value.averaging,
            precision: value.precision,
        });
    }

    Ok(values)
}
