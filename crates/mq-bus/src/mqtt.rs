//! MQTT broker client built on rumqttc's blocking API

use parking_lot::Mutex;
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::{BusError, BusResult};
use crate::topic::{validate_filter, SubscriptionSet};
use crate::{Bus, MessageHandler};

/// Queue depth between the client handle and the network loop
const REQUEST_CAPACITY: usize = 64;

/// Every message is exchanged at quality level 2
const QOS: QoS = QoS::ExactlyOnce;

/// Connection parameters for [`MqttBus::connect`]
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// Connection attempts before giving up
    pub connect_attempts: u32,
    /// Pause between attempts, and before each reconnect
    pub retry_delay: Duration,
}

impl BusOptions {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(60),
            connect_attempts: 10,
            retry_delay: Duration::from_secs(1),
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }
}

struct Shared {
    client: Mutex<Client>,
    subscriptions: Mutex<SubscriptionSet>,
    closing: AtomicBool,
    retry_delay: Duration,
}

impl Shared {
    /// Restore every held filter after the broker dropped the session
    ///
    /// Runs on the bus thread, so it must not block on the request queue.
    fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock();
        let client = self.client.lock();
        for filter in subscriptions.iter() {
            if let Err(e) = client.try_subscribe(filter, QOS) {
                warn!(topic = filter, error = %e, "Failed to restore subscription");
            }
        }
    }
}

/// Shared handle to the broker connection
///
/// Cloned into every component that publishes. Subscriptions are tracked
/// locally so that subscribing twice is harmless and `#` can release them all.
pub struct MqttBus {
    shared: Arc<Shared>,
}

/// The receiving half, turned into the bus thread by [`Incoming::spawn`]
pub struct Incoming {
    connection: Connection,
    shared: Arc<Shared>,
}

impl MqttBus {
    /// Connect to the broker, retrying until `connect_attempts` is exhausted
    ///
    /// Nothing is delivered until the returned [`Incoming`] is spawned.
    pub fn connect(options: &BusOptions) -> BusResult<(Arc<MqttBus>, Incoming)> {
        let (client, mut connection) = Client::new(options.mqtt_options(), REQUEST_CAPACITY);

        let mut failures = 0;
        loop {
            match connection.iter().next() {
                Some(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Some(Ok(event)) => trace!(?event, "Event before connection acknowledgement"),
                Some(Err(e)) => {
                    failures += 1;
                    if failures >= options.connect_attempts {
                        return Err(BusError::Unreachable {
                            host: options.host.clone(),
                            port: options.port,
                            attempts: failures,
                            reason: e.to_string(),
                        });
                    }
                    debug!(attempt = failures, error = %e, "Broker not reachable yet");
                    thread::sleep(options.retry_delay);
                }
                None => return Err(BusError::Closed),
            }
        }
        info!(
            host = %options.host,
            port = options.port,
            retries = failures,
            "Connected to broker"
        );

        let shared = Arc::new(Shared {
            client: Mutex::new(client),
            subscriptions: Mutex::new(SubscriptionSet::default()),
            closing: AtomicBool::new(false),
            retry_delay: options.retry_delay,
        });
        let bus = Arc::new(MqttBus {
            shared: Arc::clone(&shared),
        });
        Ok((bus, Incoming { connection, shared }))
    }

    /// Close the connection; the bus thread exits once the broker link is down
    pub fn disconnect(&self) -> BusResult<()> {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.client.lock().disconnect()?;
        Ok(())
    }
}

impl Bus for MqttBus {
    fn subscribe(&self, topic: &str) -> BusResult<()> {
        validate_filter(topic)?;
        let mut subscriptions = self.shared.subscriptions.lock();
        if !subscriptions.insert(topic) {
            trace!(topic, "Already subscribed");
            return Ok(());
        }
        debug!(topic, "Subscribing");
        if let Err(e) = self.shared.client.lock().subscribe(topic, QOS) {
            subscriptions.remove(topic);
            return Err(e.into());
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        let released = self.shared.subscriptions.lock().remove(topic);
        let client = self.shared.client.lock();
        for filter in released {
            debug!(topic = %filter, "Unsubscribing");
            client.unsubscribe(filter)?;
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &str) -> BusResult<()> {
        trace!(topic, payload, "Publishing");
        self.shared
            .client
            .lock()
            .publish(topic, QOS, false, payload.as_bytes().to_vec())?;
        Ok(())
    }
}

impl Incoming {
    /// Start the bus thread delivering every incoming message to `handler`
    pub fn spawn(self, handler: MessageHandler) -> BusResult<JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("mq-bus".to_string())
            .spawn(move || self.run(handler))?;
        Ok(handle)
    }

    fn run(mut self, handler: MessageHandler) {
        for notification in self.connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload);
                    trace!(topic = %publish.topic, "Message received");
                    handler(&publish.topic, &payload);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Reconnected to broker");
                    self.shared.resubscribe();
                }
                Ok(_) => {}
                Err(e) => {
                    if self.shared.closing.load(Ordering::SeqCst) {
                        debug!(error = %e, "Broker connection closed");
                        break;
                    }
                    warn!(error = %e, "Broker connection lost, reconnecting");
                    thread::sleep(self.shared.retry_delay);
                }
            }
        }
        debug!("Bus thread finished");
    }
}
