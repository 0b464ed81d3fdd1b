//! Inbound message routing.
//!
//! A received publish is classified by topic, decoded, and fanned out to the
//! handlers registered for its record kind. Handlers are registered through
//! `on_*` methods that return a [`HandlerGuard`]; dropping the guard removes
//! the handler.

use crate::client::ClientError;
use mtconnect_core::{Asset, Device, Observation};
use mtconnect_proto::{decode_record, MessageError, PayloadFormat, Record, TopicKind, TopicScheme};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type RecordHandler<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;
type ConnectionHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Transport connection state change.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Broker acknowledged the session
    Connected,
    /// Session closed
    Disconnected,
    /// Connect or session failure
    Error(ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Device,
    Observation,
    Condition,
    Asset,
    Connection,
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    devices: Vec<(u64, RecordHandler<Device>)>,
    observations: Vec<(u64, RecordHandler<Observation>)>,
    conditions: Vec<(u64, RecordHandler<Observation>)>,
    assets: Vec<(u64, RecordHandler<Asset>)>,
    connection: Vec<(u64, ConnectionHandler)>,
}

impl Handlers {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, slot: Slot, id: u64) {
        match slot {
            Slot::Device => self.devices.retain(|(h, _)| *h != id),
            Slot::Observation => self.observations.retain(|(h, _)| *h != id),
            Slot::Condition => self.conditions.retain(|(h, _)| *h != id),
            Slot::Asset => self.assets.retain(|(h, _)| *h != id),
            Slot::Connection => self.connection.retain(|(h, _)| *h != id),
        }
    }

    fn len(&self) -> usize {
        self.devices.len()
            + self.observations.len()
            + self.conditions.len()
            + self.assets.len()
            + self.connection.len()
    }
}

/// Registration handle. Dropping it unregisters the handler.
#[must_use = "dropping the guard unregisters the handler"]
pub struct HandlerGuard {
    handlers: Weak<Mutex<Handlers>>,
    slot: Slot,
    id: u64,
}

impl std::fmt::Debug for HandlerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerGuard")
            .field("slot", &self.slot)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.slot, self.id);
        }
    }
}

/// Diagnostic counters for inbound traffic.
#[derive(Debug, Default)]
pub struct RouterStats {
    received: AtomicU64,
    delivered: AtomicU64,
    unmatched_topics: AtomicU64,
    empty_payloads: AtomicU64,
    decode_failures: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages handed to the router
    pub received: u64,
    /// Records delivered to at least the dispatch stage
    pub delivered: u64,
    /// Messages on topics outside the scheme
    pub unmatched_topics: u64,
    /// Messages with no payload
    pub empty_payloads: u64,
    /// Payloads that failed to decode
    pub decode_failures: u64,
}

impl RouterStats {
    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            unmatched_topics: self.unmatched_topics.load(Ordering::Relaxed),
            empty_payloads: self.empty_payloads.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Why a message was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Topic outside the scheme
    #[error("unmatched topic: {0}")]
    UnmatchedTopic(String),
    /// No payload bytes
    #[error("empty payload on {0}")]
    EmptyPayload(String),
    /// Payload did not decode
    #[error("decode failed: {0}")]
    Decode(#[from] MessageError),
}

/// Classifies, decodes, and fans out inbound messages.
pub struct MessageRouter {
    scheme: TopicScheme,
    format: PayloadFormat,
    handlers: Arc<Mutex<Handlers>>,
    stats: RouterStats,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("scheme", &self.scheme)
            .field("format", &self.format)
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(TopicScheme::default(), PayloadFormat::default())
    }
}

impl MessageRouter {
    /// Create a router for a topic scheme and payload format.
    #[must_use]
    pub fn new(scheme: TopicScheme, format: PayloadFormat) -> Self {
        Self {
            scheme,
            format,
            handlers: Arc::new(Mutex::new(Handlers::default())),
            stats: RouterStats::default(),
        }
    }

    /// Topic scheme used for classification.
    #[must_use]
    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Payload format used for decoding.
    #[must_use]
    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// Inbound counters.
    #[must_use]
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Number of registered handlers of all kinds.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guard(&self, slot: Slot, id: u64) -> HandlerGuard {
        HandlerGuard {
            handlers: Arc::downgrade(&self.handlers),
            slot,
            id,
        }
    }

    /// Register a device definition handler.
    pub fn on_device<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&str, &Device) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = handlers.allocate();
        handlers.devices.push((id, Arc::new(handler)));
        drop(handlers);
        self.guard(Slot::Device, id)
    }

    /// Register a sample / event handler.
    pub fn on_observation<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&str, &Observation) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = handlers.allocate();
        handlers.observations.push((id, Arc::new(handler)));
        drop(handlers);
        self.guard(Slot::Observation, id)
    }

    /// Register a condition handler.
    pub fn on_condition<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&str, &Observation) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = handlers.allocate();
        handlers.conditions.push((id, Arc::new(handler)));
        drop(handlers);
        self.guard(Slot::Condition, id)
    }

    /// Register an asset handler.
    pub fn on_asset<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&str, &Asset) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = handlers.allocate();
        handlers.assets.push((id, Arc::new(handler)));
        drop(handlers);
        self.guard(Slot::Asset, id)
    }

    /// Register a connection event listener.
    pub fn on_connection<F>(&self, handler: F) -> HandlerGuard
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.lock();
        let id = handlers.allocate();
        handlers.connection.push((id, Arc::new(handler)));
        drop(handlers);
        self.guard(Slot::Connection, id)
    }

    /// Deliver a connection event to every listener.
    pub fn notify(&self, event: &ConnectionEvent) {
        let listeners: Vec<ConnectionHandler> =
            self.lock().connection.iter().map(|(_, h)| Arc::clone(h)).collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Route one inbound message.
    ///
    /// Returns the number of records decoded from the payload.
    ///
    /// # Errors
    ///
    /// Returns why the message was dropped. Every drop is counted in
    /// [`RouterStats`].
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<usize, DispatchError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let Some((device_uuid, kind)) = self.scheme.classify(topic) else {
            self.stats.unmatched_topics.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic, "Dropping message on unmatched topic");
            return Err(DispatchError::UnmatchedTopic(topic.to_string()));
        };

        if payload.is_empty() {
            self.stats.empty_payloads.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(topic, "Dropping empty payload");
            return Err(DispatchError::EmptyPayload(topic.to_string()));
        }

        let record = match decode_record(kind, self.format, &device_uuid, payload) {
            Ok(record) => record,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    topic,
                    kind = ?kind,
                    payload_len = payload.len(),
                    error = %e,
                    "Dropping undecodable payload"
                );
                return Err(e.into());
            }
        };

        let delivered = self.deliver(&device_uuid, record);
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        tracing::trace!(topic, kind = ?kind, delivered, "Routed message");
        Ok(delivered)
    }

    fn deliver(&self, device_uuid: &str, record: Record) -> usize {
        fn fan_out<T>(targets: &[RecordHandler<T>], device_uuid: &str, items: &[T]) {
            for item in items {
                for handler in targets {
                    handler(device_uuid, item);
                }
            }
        }

        fn snapshot<T: ?Sized>(slot: &[(u64, Arc<T>)]) -> Vec<Arc<T>> {
            slot.iter().map(|(_, h)| Arc::clone(h)).collect()
        }

        match record {
            Record::Device(device) => {
                let targets = snapshot(&self.lock().devices);
                fan_out(&targets, device_uuid, std::slice::from_ref(&device));
                1
            }
            Record::Observations(observations) => {
                let targets = snapshot(&self.lock().observations);
                fan_out(&targets, device_uuid, &observations);
                observations.len()
            }
            Record::Conditions(conditions) => {
                let targets = snapshot(&self.lock().conditions);
                fan_out(&targets, device_uuid, &conditions);
                conditions.len()
            }
            Record::Asset(asset) => {
                let targets = snapshot(&self.lock().assets);
                fan_out(&targets, device_uuid, std::slice::from_ref(&asset));
                1
            }
        }
    }

    /// Topic kind of a topic under this router's scheme.
    #[must_use]
    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        self.scheme.classify(topic).map(|(_, kind)| kind)
    }
}
