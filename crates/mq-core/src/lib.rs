//! Core types for MQ System
//!
//! This crate provides the types shared by every daemon: the JSON value
//! envelope carried on the bus, device paths and fully-qualified value
//! references, and the topic namespace.

mod envelope;
mod value_ref;

pub use envelope::{decode, encode, EnvelopeError, EnvelopeResult, Message, Reading, Scalar};
pub use value_ref::{is_value_name, DevicePath, ValueRef, ValueRefError};

/// Topic namespace used on the bus
pub mod topics {
    /// Device to world
    pub const STATUS_PREFIX: &str = "status/";

    /// World to device
    pub const SET_PREFIX: &str = "set/";

    /// Control plane
    pub const APP_PREFIX: &str = "app/";

    /// Any payload on this topic reloads the rule engine scripts
    pub const EXE_RELOAD: &str = "app/exe/reload";

    /// Multi-level wildcard; unsubscribing it drops every subscription
    pub const MATCH_ALL: &str = "#";
}
