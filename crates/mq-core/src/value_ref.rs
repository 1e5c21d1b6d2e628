//! Device paths and fully-qualified value references
//!
//! A device path names a publisher on the bus (`status/<device-path>`), for
//! example `living_room/thermostat`. A value reference adds the value name:
//! `living_room/thermostat:Temperature`.

use crate::topics::{SET_PREFIX, STATUS_PREFIX};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for invalid device paths and value references
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValueRefError {
    #[error("device path cannot be empty")]
    EmptyDevicePath,

    #[error("device path '{0}' contains invalid characters (allowed: A-Z a-z 0-9 _ /)")]
    InvalidDevicePath(String),

    #[error("device path '{0}' cannot end with '/'")]
    TrailingSlash(String),

    #[error("value reference '{0}' must have the form <device-path>:<value-name>")]
    MissingSeparator(String),

    #[error("value name '{0}' must be a non-empty word (A-Z a-z 0-9 _)")]
    InvalidValueName(String),
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Check a value name against `\w+`
pub fn is_value_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_word_char)
}

/// A validated device path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevicePath(String);

impl DevicePath {
    pub fn new(path: impl Into<String>) -> Result<Self, ValueRefError> {
        let path = path.into();
        if path.is_empty() {
            return Err(ValueRefError::EmptyDevicePath);
        }
        if !path.chars().all(|c| is_word_char(c) || c == '/') {
            return Err(ValueRefError::InvalidDevicePath(path));
        }
        if path.ends_with('/') {
            return Err(ValueRefError::TrailingSlash(path));
        }
        Ok(Self(path))
    }

    /// Extract the device path from a `status/<device-path>` topic
    ///
    /// Returns `None` when the topic is outside the status namespace.
    pub fn from_status_topic(topic: &str) -> Option<Result<Self, ValueRefError>> {
        topic.strip_prefix(STATUS_PREFIX).map(Self::new)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `status/<device-path>`
    pub fn status_topic(&self) -> String {
        format!("{STATUS_PREFIX}{}", self.0)
    }

    /// `set/<device-path>`
    pub fn set_topic(&self) -> String {
        format!("{SET_PREFIX}{}", self.0)
    }
}

impl FromStr for DevicePath {
    type Err = ValueRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DevicePath {
    type Error = ValueRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<DevicePath> for String {
    fn from(path: DevicePath) -> String {
        path.0
    }
}

impl AsRef<str> for DevicePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully-qualified value reference `<device-path>:<value-name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ValueRef {
    device: DevicePath,
    name: String,
}

impl ValueRef {
    pub fn new(device: DevicePath, name: impl Into<String>) -> Result<Self, ValueRefError> {
        let name = name.into();
        if !is_value_name(&name) {
            return Err(ValueRefError::InvalidValueName(name));
        }
        Ok(Self { device, name })
    }

    pub fn device(&self) -> &DevicePath {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topic on which the device reports this value
    pub fn status_topic(&self) -> String {
        self.device.status_topic()
    }

    /// Topic on which commands for this value are sent
    pub fn set_topic(&self) -> String {
        self.device.set_topic()
    }
}

impl FromStr for ValueRef {
    type Err = ValueRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, name) = s
            .split_once(':')
            .ok_or_else(|| ValueRefError::MissingSeparator(s.to_string()))?;
        Self::new(DevicePath::new(device)?, name)
    }
}

impl TryFrom<String> for ValueRef {
    type Error = ValueRefError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ValueRef> for String {
    fn from(value_ref: ValueRef) -> String {
        value_ref.to_string()
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.name)
    }
}
