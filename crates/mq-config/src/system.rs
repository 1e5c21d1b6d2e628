//! Process-wide settings shared by every daemon (`system.yaml`)

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_optional_yaml;

/// File name of the shared configuration inside the config directory
pub const SYSTEM_CONFIG_FILE: &str = "system.yaml";

/// Integer log threshold: 0=trace, 1=debug, 2=info, 3=warn, 4=error,
/// 5=critical, 6=off
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LogLevel(u8);

impl LogLevel {
    pub const TRACE: LogLevel = LogLevel(0);
    pub const DEBUG: LogLevel = LogLevel(1);
    pub const INFO: LogLevel = LogLevel(2);
    pub const WARN: LogLevel = LogLevel(3);
    pub const ERROR: LogLevel = LogLevel(4);
    pub const CRITICAL: LogLevel = LogLevel(5);
    pub const OFF: LogLevel = LogLevel(6);

    /// Level name understood by `tracing` filter directives
    ///
    /// There is no critical level in `tracing`; it folds into error.
    pub fn as_directive(&self) -> &'static str {
        match self.0 {
            0 => "trace",
            1 => "debug",
            2 => "info",
            3 => "warn",
            4 | 5 => "error",
            _ => "off",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::INFO
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        if level <= 6 {
            Ok(LogLevel(level))
        } else {
            Err(format!("log_level must be between 0 and 6, got {level}"))
        }
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> u8 {
        level.0
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.as_directive())
    }
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConnection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1887
}

fn default_keep_alive() -> u64 {
    60
}

impl Default for MqttConnection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// Shared system configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub mqtt_connection: MqttConnection,

    /// Log file; stderr when absent
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub log_level: LogLevel,
}

impl SystemConfig {
    /// Load `system.yaml` from a config directory, defaults if it is absent
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        match load_optional_yaml(config_dir.as_ref(), SYSTEM_CONFIG_FILE)? {
            Some(yaml) => Self::from_yaml(&yaml),
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(yaml.clone()).map_err(|e| ConfigError::InvalidValue {
            key: SYSTEM_CONFIG_FILE.to_string(),
            reason: e.to_string(),
        })
    }
}
