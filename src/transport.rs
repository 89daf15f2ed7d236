//! Message transport boundary.
//!
//! The broker talks to the pub/sub network through [`Transport`]. A transport
//! delivers each inbound message to the handler most recently registered for
//! the subscription it matched. [`MemoryTransport`] is an in-process
//! implementation with MQTT topic-filter matching, used by the daemon's stdin
//! bridge and by tests. The MQTT client lives in `mqtt`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::TransportError;

/// Callback invoked with `(topic, payload)` for each inbound message.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Subscribe/unsubscribe side of the pub/sub client.
pub trait Transport: Send + Sync {
    /// Subscribes to `topic`, replacing any handler registered for it before.
    ///
    /// # Errors
    ///
    /// Returns the client's failure; the caller decides whether to retry.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError>;

    /// Drops the subscription for `topic`.
    ///
    /// # Errors
    ///
    /// Returns the client's failure.
    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

/// Returns true if `topic` matches the MQTT subscription `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches any remainder
/// (including the parent level itself).
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Subscription filters and their handlers, one handler per filter.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: Mutex<HashMap<String, MessageHandler>>,
}

impl HandlerTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, MessageHandler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, filter: &str, handler: MessageHandler) {
        self.lock().insert(filter.to_string(), handler);
    }

    pub(crate) fn remove(&self, filter: &str) {
        self.lock().remove(filter);
    }

    pub(crate) fn contains(&self, filter: &str) -> bool {
        self.lock().contains_key(filter)
    }

    pub(crate) fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.lock().keys().cloned().collect();
        filters.sort();
        filters
    }

    /// Calls every handler whose filter matches `topic`, with the table
    /// unlocked. Returns the number of handlers called.
    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        let matching: Vec<MessageHandler> = self
            .lock()
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        debug!(topic, subscriptions = matching.len(), "Message received");

        for handler in &matching {
            handler(topic, payload);
        }
        matching.len()
    }
}

/// In-process transport.
#[derive(Default)]
pub struct MemoryTransport {
    table: HandlerTable,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Creates an open transport without subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a message to every subscription whose filter matches
    /// `topic`. Returns the number of handlers invoked.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        self.table.deliver(topic, payload)
    }

    /// Returns true if `topic` is currently subscribed.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.table.contains(topic)
    }

    /// Currently subscribed topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.table.filters()
    }

    /// Rejects further subscribe/unsubscribe calls.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("topics", &self.topics())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transport for MemoryTransport {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.table.insert(topic, handler);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.table.remove(topic);
        Ok(())
    }
}
