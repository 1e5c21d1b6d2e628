//! YAML documents with `!include` and `!env_var` expansion
//!
//! Includes resolve relative to the including file. Environment values are
//! parsed as YAML scalars so `port: !env_var MQ_PORT` stays a number.

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::error::{ConfigError, ConfigResult};

/// Expands one document and everything it includes
pub struct YamlLoader {
    config_dir: PathBuf,
    /// Files being expanded, outermost first
    open: Vec<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            open: Vec::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Read `file` (relative to the config directory) and expand its tags
    pub fn load_file(&mut self, file: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(file);
        if self.open.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }
        debug!(path = %path.display(), "Reading configuration");

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.open.push(path.clone());
        let expanded = self.load_string(&text, &path);
        self.open.pop();
        expanded
    }

    /// Parse `text` as if it had been read from `origin`
    pub fn load_string(&mut self, text: &str, origin: &Path) -> ConfigResult<Value> {
        let document = serde_yaml::from_str(text).map_err(|source| ConfigError::ParseYaml {
            path: origin.to_path_buf(),
            source,
        })?;
        self.expand(document, origin)
    }

    fn expand(&mut self, value: Value, origin: &Path) -> ConfigResult<Value> {
        Ok(match value {
            Value::Tagged(tagged) => self.expand_tag(*tagged, origin)?,
            Value::Mapping(entries) => Value::Mapping(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.expand(v, origin)?)))
                    .collect::<ConfigResult<Mapping>>()?,
            ),
            Value::Sequence(items) => Value::Sequence(
                items
                    .into_iter()
                    .map(|item| self.expand(item, origin))
                    .collect::<ConfigResult<_>>()?,
            ),
            scalar => scalar,
        })
    }

    fn expand_tag(&mut self, tagged: TaggedValue, origin: &Path) -> ConfigResult<Value> {
        let TaggedValue { tag, value } = tagged;
        trace!(%tag, "Expanding tag");

        if tag == "!include" {
            let Value::String(target) = value else {
                return Err(ConfigError::IncludeNotFound {
                    from: origin.to_path_buf(),
                    target: format!("{value:?}"),
                });
            };
            let base = origin.parent().unwrap_or(&self.config_dir);
            let path = base.join(&target);
            if !path.is_file() {
                return Err(ConfigError::IncludeNotFound {
                    from: origin.to_path_buf(),
                    target,
                });
            }
            return self.load_file(path);
        }

        if tag == "!env_var" {
            let Value::String(var) = value else {
                return Err(ConfigError::InvalidValue {
                    key: "!env_var".to_string(),
                    reason: "expected a variable name".to_string(),
                });
            };
            let text = std::env::var(&var).map_err(|_| ConfigError::EnvVarNotFound { var })?;
            return Ok(serde_yaml::from_str::<Value>(&text)
                .ok()
                .filter(|parsed| !matches!(parsed, Value::Mapping(_) | Value::Sequence(_)))
                .unwrap_or(Value::String(text)));
        }

        // Unknown tags are left for serde to interpret
        Ok(Value::Tagged(Box::new(TaggedValue {
            tag,
            value: self.expand(value, origin)?,
        })))
    }
}

/// Load `file` from `config_dir`
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir).load_file(file)
}

/// Like [`load_yaml`], but a missing file is `None`
pub fn load_optional_yaml(
    config_dir: impl Into<PathBuf>,
    file: impl AsRef<Path>,
) -> ConfigResult<Option<Value>> {
    let mut loader = YamlLoader::new(config_dir);
    if !loader.config_dir().join(file.as_ref()).exists() {
        debug!(file = %file.as_ref().display(), "Configuration file absent, using defaults");
        return Ok(None);
    }
    loader.load_file(file).map(Some)
}
