//! Subscription broker.
//!
//! The broker maps each concrete topic to the ordered list of handlers
//! interested in it and keeps the transport's subscriptions in step with
//! that map:
//!
//! - a topic is present in the map iff it has at least one handler;
//! - the transport is subscribed when a handler is added and unsubscribed
//!   exactly once, when the last handler leaves;
//! - inbound messages are resolved against the handler list at dispatch time,
//!   never against a snapshot taken at subscribe time.
//!
//! Several handlers may share one topic (fan-out). Handlers are compared by
//! identity, so the same handler added twice is dispatched twice.
//!
//! Transport calls are made without the handler map locked: a client may
//! deliver messages (and so call back into [`Broker::dispatch`]) before it
//! acknowledges a subscribe. A second mutex keeps transport calls in the
//! order their map changes were made.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use crate::error::{RelayResult, TransportError};
use crate::transport::{MessageHandler, Transport};

/// Receiver of messages dispatched by the [`Broker`].
pub trait Subscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handles one message delivered on `topic`.
    ///
    /// # Errors
    ///
    /// Failures are logged by the broker and do not stop dispatch to the
    /// remaining handlers.
    fn on_message(&self, topic: &str, payload: &[u8]) -> RelayResult<()>;
}

type Handlers = Vec<Arc<dyn Subscriber>>;

fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct BrokerState {
    handlers: Mutex<HashMap<String, Handlers>>,
    /// Taken before `handlers`, never while dispatching.
    transport_calls: Mutex<()>,
    transport: Arc<dyn Transport>,
}

impl BrokerState {
    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Handlers>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transport_calls(&self) -> MutexGuard<'_, ()> {
        self.transport_calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, key: &str, topic: &str, payload: &[u8]) -> usize {
        let current: Handlers = match self.handlers().get(key) {
            Some(list) => list.clone(),
            None => return 0,
        };

        for handler in &current {
            if let Err(e) = handler.on_message(topic, payload) {
                warn!(service = handler.name(), topic, error = %e, "Message handler failed");
            }
        }
        current.len()
    }
}

/// Topic → handlers registry bridged to a [`Transport`].
#[derive(Clone)]
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    /// Creates an empty broker over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                handlers: Mutex::new(HashMap::new()),
                transport_calls: Mutex::new(()),
                transport,
            }),
        }
    }

    /// Transport callback for `key`. It holds the broker weakly and looks up
    /// the handler list on every message.
    fn callback(&self, key: &str) -> MessageHandler {
        let state: Weak<BrokerState> = Arc::downgrade(&self.state);
        let key = key.to_string();
        Arc::new(move |topic: &str, payload: &[u8]| {
            if let Some(state) = state.upgrade() {
                state.dispatch(&key, topic, payload);
            }
        })
    }

    /// Appends `subscriber` to the handlers of `topic` and (re)registers the
    /// dispatch callback with the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport failure. The handler stays registered locally.
    pub fn subscribe(&self, topic: &str, subscriber: Arc<dyn Subscriber>) -> Result<(), TransportError> {
        let _ordered = self.state.transport_calls();
        debug!(service = subscriber.name(), topic, "Subscribe");
        self.state
            .handlers()
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);

        let result = self.state.transport.subscribe(topic, self.callback(topic));
        if let Err(e) = &result {
            warn!(topic, error = %e, "Transport subscribe failed; local handler kept");
        }
        result
    }

    /// Removes one registration of `subscriber` from `topic`. When the list
    /// becomes empty the topic is dropped and the transport unsubscribed.
    ///
    /// Unknown topics and subscribers are ignored.
    ///
    /// # Errors
    ///
    /// Returns the transport failure. The local removal is kept.
    pub fn unsubscribe(&self, topic: &str, subscriber: &Arc<dyn Subscriber>) -> Result<(), TransportError> {
        let _ordered = self.state.transport_calls();
        {
            let mut handlers = self.state.handlers();
            let Some(list) = handlers.get_mut(topic) else {
                return Ok(());
            };
            let Some(pos) = list.iter().position(|h| same_subscriber(h, subscriber)) else {
                return Ok(());
            };

            debug!(service = subscriber.name(), topic, "Unsubscribe");
            list.remove(pos);
            if !list.is_empty() {
                return Ok(());
            }
            handlers.remove(topic);
        }

        debug!(topic, "No handlers for topic: unsubscribing");
        let result = self.state.transport.unsubscribe(topic);
        if let Err(e) = &result {
            warn!(topic, error = %e, "Transport unsubscribe failed; local entry removed");
        }
        result
    }

    /// Delivers a message to every current handler of `topic`, in order.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        self.state.dispatch(topic, topic, payload)
    }

    /// Current handlers of `topic`, in dispatch order.
    #[must_use]
    pub fn handlers(&self, topic: &str) -> Vec<Arc<dyn Subscriber>> {
        self.state.handlers().get(topic).cloned().unwrap_or_default()
    }

    /// Number of registrations of `subscriber` on `topic`.
    #[must_use]
    pub fn registrations(&self, topic: &str, subscriber: &Arc<dyn Subscriber>) -> usize {
        self.state
            .handlers()
            .get(topic)
            .map_or(0, |list| list.iter().filter(|h| same_subscriber(h, subscriber)).count())
    }

    /// Topics with at least one handler, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.handlers().keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("topics", &self.topics()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::{RelayError, TransportError};
    use crate::transport::MemoryTransport;

    struct Recorder {
        name: String,
        fail: bool,
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: false,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: true,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_message(&self, topic: &str, payload: &[u8]) -> RelayResult<()> {
            self.seen.lock().unwrap().push((topic.to_string(), payload.to_vec()));
            if self.fail {
                return Err(RelayError::Transport(TransportError::Closed));
            }
            Ok(())
        }
    }

    /// Transport that counts calls and can be told to fail.
    #[derive(Default)]
    struct CountingTransport {
        inner: MemoryTransport,
        subscribes: Mutex<Vec<String>>,
        unsubscribes: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    impl Transport for CountingTransport {
        fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
            self.subscribes.lock().unwrap().push(topic.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Subscribe {
                    topic: topic.to_string(),
                    message: "refused".to_string(),
                });
            }
            self.inner.subscribe(topic, handler)
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            self.unsubscribes.lock().unwrap().push(topic.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Unsubscribe {
                    topic: topic.to_string(),
                    message: "refused".to_string(),
                });
            }
            self.inner.unsubscribe(topic)
        }
    }

    fn setup() -> (Arc<CountingTransport>, Broker) {
        let transport = Arc::new(CountingTransport::default());
        let broker = Broker::new(transport.clone());
        (transport, broker)
    }

    #[test]
    fn test_fan_out_and_release() {
        let (transport, broker) = setup();
        let s1 = Recorder::new("s1");
        let s2 = Recorder::new("s2");
        let h1: Arc<dyn Subscriber> = s1.clone();
        let h2: Arc<dyn Subscriber> = s2.clone();

        broker.subscribe("t", h1.clone()).unwrap();
        broker.subscribe("t", h2.clone()).unwrap();
        assert_eq!(transport.inner.publish("t", b"p"), 1);
        assert_eq!((s1.count(), s2.count()), (1, 1));

        broker.unsubscribe("t", &h1).unwrap();
        transport.inner.publish("t", b"p");
        assert_eq!((s1.count(), s2.count()), (1, 2));
        assert!(transport.unsubscribes.lock().unwrap().is_empty());

        broker.unsubscribe("t", &h2).unwrap();
        assert_eq!(*transport.unsubscribes.lock().unwrap(), vec!["t".to_string()]);
        assert!(broker.topics().is_empty());
        assert!(!transport.inner.is_subscribed("t"));

        broker.unsubscribe("t", &h2).unwrap();
        assert_eq!(transport.unsubscribes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dispatch_in_subscription_order() {
        let (_transport, broker) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Ordered {
            name: String,
            order: Arc<Mutex<Vec<String>>>,
        }

        impl Subscriber for Ordered {
            fn name(&self) -> &str {
                &self.name
            }

            fn on_message(&self, _topic: &str, _payload: &[u8]) -> RelayResult<()> {
                self.order.lock().unwrap().push(self.name.clone());
                Ok(())
            }
        }

        for name in ["a", "b", "c"] {
            let handler: Arc<dyn Subscriber> = Arc::new(Ordered {
                name: name.to_string(),
                order: Arc::clone(&order),
            });
            broker.subscribe("t", handler).unwrap();
        }

        assert_eq!(broker.dispatch("t", b""), 3);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_dispatch() {
        let (_transport, broker) = setup();
        let bad = Recorder::failing("bad");
        let good = Recorder::new("good");

        broker.subscribe("t", bad.clone()).unwrap();
        broker.subscribe("t", good.clone()).unwrap();

        assert_eq!(broker.dispatch("t", b"x"), 2);
        assert_eq!(bad.count(), 1);
        assert_eq!(good.count(), 1);
    }

    #[test]
    fn test_callback_sees_handlers_added_later() {
        let (transport, broker) = setup();
        let s1 = Recorder::new("s1");
        let s2 = Recorder::new("s2");

        broker.subscribe("t", s1.clone()).unwrap();
        // Register s2 without going through the transport again.
        broker
            .state
            .handlers()
            .get_mut("t")
            .unwrap()
            .push(s2.clone());

        transport.inner.publish("t", b"x");
        assert_eq!((s1.count(), s2.count()), (1, 1));
    }

    #[test]
    fn test_identity_not_name() {
        let (_transport, broker) = setup();
        let twin_a: Arc<dyn Subscriber> = Recorder::new("same");
        let twin_b: Arc<dyn Subscriber> = Recorder::new("same");

        broker.subscribe("t", twin_a.clone()).unwrap();
        broker.subscribe("t", twin_b.clone()).unwrap();
        broker.unsubscribe("t", &twin_b).unwrap();

        let remaining = broker.handlers("t");
        assert_eq!(remaining.len(), 1);
        assert!(same_subscriber(&remaining[0], &twin_a));
    }

    #[test]
    fn test_duplicate_registration_dispatches_twice() {
        let (_transport, broker) = setup();
        let s = Recorder::new("s");
        let h: Arc<dyn Subscriber> = s.clone();

        broker.subscribe("t", h.clone()).unwrap();
        broker.subscribe("t", h.clone()).unwrap();
        assert_eq!(broker.registrations("t", &h), 2);

        broker.dispatch("t", b"");
        assert_eq!(s.count(), 2);

        broker.unsubscribe("t", &h).unwrap();
        assert_eq!(broker.registrations("t", &h), 1);
        assert_eq!(broker.topics(), vec!["t".to_string()]);
    }

    #[test]
    fn test_transport_errors_surface_without_rollback() {
        let (transport, broker) = setup();
        let h: Arc<dyn Subscriber> = Recorder::new("s");
        transport.fail.store(true, Ordering::SeqCst);

        assert!(broker.subscribe("t", h.clone()).is_err());
        assert_eq!(broker.registrations("t", &h), 1);

        assert!(broker.unsubscribe("t", &h).is_err());
        assert!(broker.topics().is_empty());
    }

    #[test]
    fn test_callback_after_broker_dropped_is_noop() {
        let transport = Arc::new(MemoryTransport::new());
        let s = Recorder::new("s");
        {
            let broker = Broker::new(transport.clone());
            broker.subscribe("t", s.clone()).unwrap();
        }
        assert_eq!(transport.publish("t", b"x"), 1);
        assert_eq!(s.count(), 0);
    }

    /// Transport whose subscribe waits for a delivery made on another
    /// thread, the way a network client's event loop keeps running while a
    /// subscribe is in flight.
    #[derive(Default)]
    struct DeliveringTransport {
        inner: MemoryTransport,
        delivered: Mutex<Vec<usize>>,
    }

    impl Transport for DeliveringTransport {
        fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
            let count = std::thread::scope(|scope| {
                scope
                    .spawn(|| self.inner.publish("existing", b"in flight"))
                    .join()
                    .unwrap()
            });
            self.delivered.lock().unwrap().push(count);
            self.inner.subscribe(topic, handler)
        }

        fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
            std::thread::scope(|scope| {
                scope.spawn(|| self.inner.publish("existing", b"in flight"));
            });
            self.inner.unsubscribe(topic)
        }
    }

    #[test]
    fn test_delivery_during_transport_call_does_not_block() {
        let transport = Arc::new(DeliveringTransport::default());
        let broker = Broker::new(transport.clone());
        let existing = Recorder::new("existing");
        let newcomer: Arc<dyn Subscriber> = Recorder::new("newcomer");

        broker.subscribe("existing", existing.clone()).unwrap();
        let before = existing.count();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let worker_broker = broker.clone();
        let worker_sub = Arc::clone(&newcomer);
        std::thread::spawn(move || {
            worker_broker.subscribe("new", Arc::clone(&worker_sub)).unwrap();
            worker_broker.unsubscribe("new", &worker_sub).unwrap();
            tx.send(()).unwrap();
        });

        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("subscribe blocked while the transport delivered a message");
        assert_eq!(existing.count(), before + 2);
        assert_eq!(*transport.delivered.lock().unwrap().last().unwrap(), 1);
        assert_eq!(broker.topics(), vec!["existing".to_string()]);
    }
}
