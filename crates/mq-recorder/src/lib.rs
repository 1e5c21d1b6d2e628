//! History writer for MQ System
//!
//! Subscribes to the configured sensors' status topics and appends
//! down-sampled readings to the SQLite history. See [`HistoryWriter`].

mod sampling;
mod writer;

pub use sampling::{sensor_cadence, time_weighted_mean, Stamp};
pub use writer::HistoryWriter;
