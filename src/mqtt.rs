//! MQTT transport.
//!
//! [`MqttTransport`] drives a `rumqttc` client from two named threads: the
//! event loop, which owns the connection and queues inbound publishes, and a
//! dispatcher, which hands them to the subscription handlers. Handlers never
//! run on the event loop thread, so a handler that subscribes or unsubscribes
//! cannot stall the connection.
//!
//! The client uses clean sessions. Every filter in the handler table is
//! subscribed again after each `CONNACK`, so subscriptions made while the
//! broker was unreachable are applied once it comes back.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use tracing::{debug, info, warn};

use crate::error::{AddressError, TransportError};
use crate::transport::{HandlerTable, MessageHandler, Transport};

/// Port used when the broker address has none.
pub const DEFAULT_PORT: u16 = 1883;

/// Default broker address of the daemon.
pub const DEFAULT_BROKER: &str = "tcp://localhost:1883";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker address in `tcp://host[:port]` form. `mqtt://` and a bare
/// `host[:port]` are accepted too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttAddress {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl FromStr for MqttAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| AddressError {
            address: s.to_string(),
            reason,
        };

        let rest = match s.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some(_) => return Err(invalid("unsupported scheme, expected tcp:// or mqtt://")),
            None => s,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for MqttAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// MQTT client settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker to connect to.
    pub address: MqttAddress,
    /// Client identifier sent in `CONNECT`.
    pub client_id: String,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// Capacity of the client request queue and of the inbound message queue.
    pub queue_capacity: usize,
}

impl MqttConfig {
    /// Settings for `address` with a per-process client id.
    #[must_use]
    pub fn new(address: MqttAddress) -> Self {
        Self {
            address,
            client_id: format!("hookrelay-{}", std::process::id()),
            keep_alive: Duration::from_secs(30),
            queue_capacity: 1024,
        }
    }
}

/// Transport over an MQTT broker connection.
pub struct MqttTransport {
    client: Client,
    table: Arc<HandlerTable>,
    closed: Arc<AtomicBool>,
    address: MqttAddress,
}

impl MqttTransport {
    /// Starts the client threads. The connection is made in the background;
    /// subscriptions are accepted right away and applied once connected.
    ///
    /// # Errors
    ///
    /// [`TransportError::Start`] if a thread cannot be spawned.
    pub fn start(config: &MqttConfig) -> Result<Self, TransportError> {
        let mut options = MqttOptions::new(config.client_id.clone(), config.address.host.clone(), config.address.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);

        let (client, connection) = Client::new(options, config.queue_capacity);
        let table = Arc::new(HandlerTable::default());
        let closed = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = crossbeam_channel::bounded(config.queue_capacity);

        let start_err = |e: std::io::Error| TransportError::Start { message: e.to_string() };

        let dispatch_table = Arc::clone(&table);
        thread::Builder::new()
            .name("hookrelay-mqtt-dispatch".to_string())
            .spawn(move || dispatch_loop(&dispatch_table, &inbound_rx))
            .map_err(start_err)?;

        let loop_client = client.clone();
        let loop_table = Arc::clone(&table);
        let loop_closed = Arc::clone(&closed);
        thread::Builder::new()
            .name("hookrelay-mqtt".to_string())
            .spawn(move || event_loop(connection, &loop_client, &loop_table, &inbound_tx, &loop_closed))
            .map_err(start_err)?;

        info!(broker = %config.address, client_id = %config.client_id, "MQTT client started");
        Ok(Self {
            client,
            table,
            closed,
            address: config.address.clone(),
        })
    }

    /// Currently subscribed filters, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.table.filters()
    }

    /// Disconnects and rejects further subscribe/unsubscribe calls.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.client.disconnect() {
            debug!(error = %err, "MQTT disconnect request failed");
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field("address", &self.address)
            .field("topics", &self.topics())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Transport for MqttTransport {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.ensure_open()?;
        // Kept on failure: the next CONNACK subscribes it again.
        self.table.insert(topic, handler);
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.table.remove(topic);
        self.client.unsubscribe(topic).map_err(|e| TransportError::Unsubscribe {
            topic: topic.to_string(),
            message: e.to_string(),
        })
    }
}

/// Owns the connection: reconnects on error, resubscribes on `CONNACK` and
/// queues inbound publishes for the dispatcher. Returns once the transport
/// is closed or every client handle is gone.
fn event_loop(
    mut connection: Connection,
    client: &Client,
    table: &HandlerTable,
    inbound: &Sender<(String, Vec<u8>)>,
    closed: &AtomicBool,
) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let filters = table.filters();
                info!(subscriptions = filters.len(), "Connected to MQTT broker");
                for filter in filters {
                    if let Err(err) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        warn!(topic = %filter, error = %err, "Failed to resubscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match inbound.try_send((publish.topic, publish.payload.to_vec())) {
                    Ok(()) => {}
                    Err(TrySendError::Full((topic, _))) => {
                        warn!(topic = %topic, "Inbound queue full; dropping message");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if closed.load(Ordering::SeqCst) => break,
            Ok(_) => {}
            Err(err) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %err, "MQTT connection error; retrying");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    info!("MQTT event loop stopped");
}

fn dispatch_loop(table: &HandlerTable, inbound: &Receiver<(String, Vec<u8>)>) {
    for (topic, payload) in inbound {
        table.deliver(&topic, &payload);
    }
    debug!("MQTT dispatcher stopped");
}
