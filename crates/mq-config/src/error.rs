//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `!include` names a file that does not exist, or is not a string
    #[error("{from}: cannot include '{target}'")]
    IncludeNotFound { from: PathBuf, target: String },

    #[error("{path} includes itself")]
    CircularInclude { path: PathBuf },

    #[error("environment variable '{var}' is not set")]
    EnvVarNotFound { var: String },

    #[error("missing required setting '{key}'")]
    MissingSetting { key: String },

    #[error("bad value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}
