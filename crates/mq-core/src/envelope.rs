//! JSON value envelope
//!
//! An envelope is a single-line JSON object mapping value names to payloads.
//! A payload is either a bare scalar or a `[scalar, "unit"]` pair:
//!
//! ```text
//! {"Temperature":[21.5,"°C"],"Door":true,"Count":3}
//! ```
//!
//! Scalars keep their type tag through a decode/encode cycle, so an integral
//! payload is written back without a fractional part and a float payload
//! always carries one.

use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors produced while decoding or encoding an envelope
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope root must be a JSON object")]
    BadRoot,

    #[error("payload of '{key}' must be a scalar or a [scalar, unit] pair")]
    BadShape { key: String },

    #[error("value '{key}' is not a finite number")]
    NonFinite { key: String },
}

/// Result type for envelope operations
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// A scalar payload with its original type tag
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Numeric view of the scalar; booleans and strings are not numbers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            Scalar::Bool(_) | Scalar::Str(_) => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "integer",
            Scalar::Float(_) => "float",
            Scalar::Str(_) => "string",
        }
    }

    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Scalar::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Scalar::Int(i)),
                None => n.as_f64().map(Scalar::Float),
            },
            Value::String(s) => Some(Scalar::Str(s)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<i64> for Scalar {
    fn from(i: i64) -> Self {
        Scalar::Int(i)
    }
}

impl From<f64> for Scalar {
    fn from(f: f64) -> Self {
        Scalar::Float(f)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(v) => write!(f, "{v:?}"),
            Scalar::Str(s) => write!(f, "{s}"),
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Bool(b) => serializer.serialize_bool(*b),
            Scalar::Int(i) => serializer.serialize_i64(*i),
            Scalar::Float(f) => serializer.serialize_f64(*f),
            Scalar::Str(s) => serializer.serialize_str(s),
        }
    }
}

/// One value payload: a scalar and its optional unit
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: Scalar,
    pub unit: Option<String>,
}

impl Reading {
    /// A bare scalar without a unit
    pub fn new(value: impl Into<Scalar>) -> Self {
        Self {
            value: value.into(),
            unit: None,
        }
    }

    /// A scalar with a unit, encoded as `[value, "unit"]`
    pub fn with_unit(value: impl Into<Scalar>, unit: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            unit: Some(unit.into()),
        }
    }

    /// The unit string, with bare scalars mapped to the empty unit
    pub fn unit_or_empty(&self) -> &str {
        self.unit.as_deref().unwrap_or("")
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.unit {
            None => self.value.serialize(serializer),
            Some(unit) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&self.value)?;
                seq.serialize_element(unit)?;
                seq.end()
            }
        }
    }
}

/// A decoded envelope: value name to reading, in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    values: IndexMap<String, Reading>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, reading: Reading) -> Self {
        self.insert(name, reading);
        self
    }

    /// Insert or replace a value, returning the previous reading
    pub fn insert(&mut self, name: impl Into<String>, reading: Reading) -> Option<Reading> {
        self.values.insert(name.into(), reading)
    }

    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Reading)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl IntoIterator for Message {
    type Item = (String, Reading);
    type IntoIter = indexmap::map::IntoIter<String, Reading>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, reading) in &self.values {
            map.serialize_entry(name, reading)?;
        }
        map.end()
    }
}

/// Decode an envelope from its text form
pub fn decode(text: &str) -> EnvelopeResult<Message> {
    let root: Value = serde_json::from_str(text)?;
    let Value::Object(map) = root else {
        return Err(EnvelopeError::BadRoot);
    };

    let mut message = Message::new();
    for (key, payload) in map {
        let reading = match payload {
            Value::Array(items) => decode_pair(&key, items)?,
            other => match Scalar::from_json(other) {
                Some(value) => Reading { value, unit: None },
                None => return Err(EnvelopeError::BadShape { key }),
            },
        };
        message.insert(key, reading);
    }
    Ok(message)
}

fn decode_pair(key: &str, items: Vec<Value>) -> EnvelopeResult<Reading> {
    let bad_shape = || EnvelopeError::BadShape {
        key: key.to_string(),
    };

    let [value, unit]: [Value; 2] = items.try_into().map_err(|_| bad_shape())?;
    let value = Scalar::from_json(value).ok_or_else(bad_shape)?;
    match unit {
        Value::String(unit) => Ok(Reading {
            value,
            unit: Some(unit),
        }),
        _ => Err(bad_shape()),
    }
}

/// Encode an envelope as a single-line JSON object
pub fn encode(message: &Message) -> EnvelopeResult<String> {
    for (name, reading) in message.iter() {
        if let Scalar::Float(f) = reading.value {
            if !f.is_finite() {
                return Err(EnvelopeError::NonFinite {
                    key: name.to_string(),
                });
            }
        }
    }
    Ok(serde_json::to_string(message)?)
}
