//! Publish/subscribe bus client for MQ System
//!
//! Components talk to the broker through the [`Bus`] trait. [`MqttBus`] is
//! the broker connection; [`MemoryBus`] is an in-process stand-in with the
//! same delivery model.
//!
//! Incoming messages are delivered on a single bus thread through a
//! [`MessageHandler`]. The handler must not block and must not call
//! `subscribe`/`unsubscribe`; it may publish.

mod error;
mod memory;
mod mqtt;
mod topic;

use std::sync::Arc;

pub use error::{BusError, BusResult};
pub use memory::MemoryBus;
pub use mqtt::{BusOptions, Incoming, MqttBus};
pub use topic::{topic_matches, validate_filter, SubscriptionSet};

/// Callback receiving `(topic, payload)` on the bus thread
pub type MessageHandler = Box<dyn Fn(&str, &str) + Send + 'static>;

/// Operations shared by every bus implementation
pub trait Bus: Send + Sync {
    /// Subscribe to a topic filter; subscribing twice is a no-op
    fn subscribe(&self, topic: &str) -> BusResult<()>;

    /// Drop a topic filter; `#` drops every subscription
    fn unsubscribe(&self, topic: &str) -> BusResult<()>;

    /// Publish at quality level 2 without retain; returns on local handoff
    fn publish(&self, topic: &str, payload: &str) -> BusResult<()>;
}

/// Thread-safe handle to a bus
pub type SharedBus = Arc<dyn Bus>;
