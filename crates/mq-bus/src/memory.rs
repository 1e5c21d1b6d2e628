//! In-process broker
//!
//! Routes published messages to its own subscriptions and delivers them on a
//! single dispatch thread, the same way the broker connection does. Used by
//! the tests and by tools that run without a broker.

use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

use crate::error::{BusError, BusResult};
use crate::topic::{validate_filter, SubscriptionSet};
use crate::{Bus, MessageHandler};

enum Delivery {
    Message { topic: String, payload: String },
    Flush(mpsc::Sender<()>),
}

/// An in-process publish/subscribe bus
#[derive(Default)]
pub struct MemoryBus {
    subscriptions: Mutex<SubscriptionSet>,
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
    published: Mutex<Vec<(String, String)>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start the dispatch thread; messages published before this are not routed
    pub fn start(&self, handler: MessageHandler) -> BusResult<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel::<Delivery>();
        *self.sender.lock() = Some(tx);

        let handle = thread::Builder::new()
            .name("mq-memory-bus".to_string())
            .spawn(move || {
                for delivery in rx {
                    match delivery {
                        Delivery::Message { topic, payload } => handler(&topic, &payload),
                        Delivery::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    /// Block until every message routed so far has been handled
    pub fn flush(&self) -> BusResult<()> {
        let (tx, rx) = mpsc::channel();
        self.send(Delivery::Flush(tx))?;
        rx.recv().map_err(|_| BusError::Closed)
    }

    /// Stop the dispatch thread after the queued messages
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Every message published so far, in order
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Messages published on one topic
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Filters currently subscribed
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .iter()
            .map(str::to_string)
            .collect()
    }

    fn send(&self, delivery: Delivery) -> BusResult<()> {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(delivery).map_err(|_| BusError::Closed),
            None => Err(BusError::Closed),
        }
    }
}

impl Bus for MemoryBus {
    fn subscribe(&self, topic: &str) -> BusResult<()> {
        validate_filter(topic)?;
        self.subscriptions.lock().insert(topic);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        self.subscriptions.lock().remove(topic);
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &str) -> BusResult<()> {
        self.published
            .lock()
            .push((topic.to_string(), payload.to_string()));

        if !self.subscriptions.lock().matches(topic) {
            trace!(topic, "No subscriber");
            return Ok(());
        }
        // Without a dispatch thread the message has nowhere to go
        if self.sender.lock().is_none() {
            return Ok(());
        }
        self.send(Delivery::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        })
    }
}
