//! Error types for the rule engine

use mq_core::ValueRefError;
use thiserror::Error;

/// Result type for time expression parsing
pub type TimeExprResult<T> = Result<T, TimeExprError>;

/// A string passed to `wait_and`/`wait_or` that is not a time expression
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeExprError {
    #[error("'{0}' is not a time expression")]
    Syntax(String),

    #[error("NOW needs a positive amount, got {0}")]
    ZeroAmount(u64),

    #[error("{field} {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("'{0}' does not occur in the representable calendar")]
    NoOccurrence(String),
}

/// Raised from a wait when the runtime is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("script aborted by runtime")]
    Aborted,
}

/// A rejected `set_global`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobalError {
    #[error("globals cannot hold a {0}")]
    Unsupported(&'static str),

    #[error("global '{name}' holds a {from}, cannot store a {to}")]
    TypeChange {
        name: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Result type for the static scanner
pub type ScanResult<T> = Result<T, ScanError>;

/// Why a script body was rejected before it started
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("unterminated register_value call at byte {offset}")]
    Unterminated { offset: usize },

    #[error("invalid value reference '{reference}': {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: ValueRefError,
    },
}

/// Result type for engine operations
pub type ExeResult<T> = Result<T, ExeError>;

/// Errors surfaced by the engine lifecycle
#[derive(Debug, Error)]
pub enum ExeError {
    #[error("store error: {0}")]
    Store(#[from] mq_store::StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] mq_bus::BusError),

    #[error("script '{name}' rejected: {source}")]
    Scan {
        name: String,
        #[source]
        source: ScanError,
    },

    #[error("script '{name}' does not compile: {message}")]
    Syntax { name: String, message: String },

    #[error("invalid scanner pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}
