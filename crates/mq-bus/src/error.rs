//! Error types for the bus client

use thiserror::Error;

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unable to connect to broker {host}:{port} after {attempts} attempts: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        attempts: u32,
        reason: String,
    },

    #[error("broker client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("bus is closed")]
    Closed,

    #[error("failed to spawn bus thread: {0}")]
    Spawn(#[from] std::io::Error),
}
