//! YAML configuration loading for the MQ System daemons
//!
//! Every daemon reads `system.yaml` (broker connection, logging) plus its own
//! file from the configuration directory, `/etc/mq_system` by default.
//!
//! The loader understands these custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!env_var VAR` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use mq_config::{HistoryConfig, SystemConfig};
//!
//! let system = SystemConfig::load("/etc/mq_system")?;
//! let history = HistoryConfig::load("/etc/mq_system")?;
//! ```

mod error;
mod exe;
mod history;
mod loader;
mod system;

pub use error::{ConfigError, ConfigResult};
pub use exe::{ExeConfig, EXE_CONFIG_FILE};
pub use history::{HistoryConfig, SensorSettings, ValueSettings, HISTORY_CONFIG_FILE};
pub use loader::{load_optional_yaml, load_yaml, YamlLoader};
pub use system::{LogLevel, MqttConnection, SystemConfig, SYSTEM_CONFIG_FILE};

/// Default configuration directory
pub const DEFAULT_CONFIG_DIR: &str = "/etc/mq_system";

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
