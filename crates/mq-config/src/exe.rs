//! Rule engine configuration (`mq_exe_daemon.yaml`)

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_optional_yaml;
use crate::system::LogLevel;

/// File name of the rule engine configuration
pub const EXE_CONFIG_FILE: &str = "mq_exe_daemon.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExeConfig {
    /// Script store
    #[serde(default = "default_uri")]
    pub uri: PathBuf,

    /// Overrides the system log level when present
    #[serde(default)]
    pub log_level: Option<LogLevel>,
}

fn default_uri() -> PathBuf {
    PathBuf::from("/var/db/mq_exe_system.db")
}

impl Default for ExeConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            log_level: None,
        }
    }
}

impl ExeConfig {
    /// Load `mq_exe_daemon.yaml` from a config directory, defaults if absent
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        match load_optional_yaml(config_dir.as_ref(), EXE_CONFIG_FILE)? {
            Some(yaml) => Self::from_yaml(&yaml),
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(yaml.clone()).map_err(|e| ConfigError::InvalidValue {
            key: EXE_CONFIG_FILE.to_string(),
            reason: e.to_string(),
        })
    }
}
