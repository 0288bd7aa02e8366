//! The event bus: a registry of live connections and the dispatch rules
//! between them.
//!
//! Delivery is a non-blocking push into each connection's inbox channel; the
//! connection task drains its inbox sequentially in arrival order. Ordering
//! across different connections is unspecified.

use crate::error::BusError;
use crate::event::{EndpointId, Event, Protocol};
use compact_str::CompactString;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receiving side of a connection's inbox.
pub type EventInbox = mpsc::UnboundedReceiver<Arc<Event>>;

/// Addressing for [`EventBus::dispatch`]. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventTarget {
    pub module: Option<CompactString>,
    pub instance: Option<CompactString>,
}

impl EventTarget {
    pub fn module(module: &str) -> Self {
        Self {
            module: Some(CompactString::new(module)),
            instance: None,
        }
    }

    pub fn instance(module: &str, instance: &str) -> Self {
        Self {
            module: Some(CompactString::new(module)),
            instance: Some(CompactString::new(instance)),
        }
    }
}

/// Counters for bus monitoring.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub events_broadcast: u64,
    pub events_dispatched: u64,
    pub deliveries: u64,
    pub dropped_deliveries: u64,
}

struct RegisteredConnection {
    protocol: Protocol,
    sender: mpsc::UnboundedSender<Arc<Event>>,
}

/// Registry of live connections plus broadcast and addressed dispatch.
///
/// Owned by the application and passed by reference to collaborators; never
/// a process-wide singleton, so tests get isolated instances and teardown is
/// a plain drop.
pub struct EventBus {
    connections: DashMap<EndpointId, RegisteredConnection>,
    events_broadcast: AtomicU64,
    events_dispatched: AtomicU64,
    deliveries: AtomicU64,
    dropped_deliveries: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            events_broadcast: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            dropped_deliveries: AtomicU64::new(0),
        }
    }

    /// Register a connection and hand back its inbox.
    ///
    /// Fails with [`BusError::DuplicateInstance`] if the (module, instance)
    /// pair is already registered.
    pub fn register(
        &self,
        endpoint: EndpointId,
        protocol: Protocol,
    ) -> Result<EventInbox, BusError> {
        if self.connections.contains_key(&endpoint) {
            return Err(BusError::DuplicateInstance(endpoint));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            endpoint.clone(),
            RegisteredConnection {
                protocol,
                sender: tx,
            },
        );
        info!("Registered {} connection {}", protocol, endpoint);
        Ok(rx)
    }

    /// Remove a connection. Idempotent; a missing endpoint is reported, not
    /// fatal.
    pub fn unregister(&self, endpoint: &EndpointId) {
        if self.connections.remove(endpoint).is_some() {
            info!("Unregistered connection {}", endpoint);
        } else {
            debug!("Unregister of unknown connection {} ignored", endpoint);
        }
    }

    /// Deliver to every registered connection except the event's own sender
    /// (same endpoint and same protocol).
    pub fn broadcast(&self, event: Event) {
        self.events_broadcast.fetch_add(1, Ordering::Relaxed);
        self.deliver(&EventTarget::default(), Arc::new(event));
    }

    /// As [`broadcast`](Self::broadcast), further filtered by the target's
    /// module and/or instance name. No match is a silent no-op: the target
    /// may simply be offline.
    pub fn dispatch(&self, target: &EventTarget, event: Event) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.deliver(target, Arc::new(event));
    }

    /// Convenience wrapper building a broadcast event in one call.
    pub fn send_event(
        &self,
        source_module: &str,
        source_instance: &str,
        protocol: Protocol,
        kind: &str,
        payload: Value,
    ) {
        self.broadcast(Event::new(
            kind,
            EndpointId::new(source_module, source_instance),
            protocol,
            payload,
        ));
    }

    /// Convenience wrapper building an addressed event in one call.
    pub fn send_event_target(
        &self,
        target: &EventTarget,
        source_module: &str,
        source_instance: &str,
        protocol: Protocol,
        kind: &str,
        payload: Value,
    ) {
        self.dispatch(
            target,
            Event::new(
                kind,
                EndpointId::new(source_module, source_instance),
                protocol,
                payload,
            ),
        );
    }

    fn deliver(&self, target: &EventTarget, event: Arc<Event>) {
        for entry in self.connections.iter() {
            let endpoint = entry.key();
            let conn = entry.value();

            // Loop suppression: never hand a connection its own event back.
            if *endpoint == event.source && conn.protocol == event.protocol {
                continue;
            }
            if let Some(module) = &target.module {
                if endpoint.module != *module {
                    continue;
                }
            }
            if let Some(instance) = &target.instance {
                if endpoint.instance != *instance {
                    continue;
                }
            }

            debug!("Delivering {} event to {}", event.kind, endpoint);
            if conn.sender.send(event.clone()).is_ok() {
                self.deliveries.fetch_add(1, Ordering::Relaxed);
            } else {
                // Inbox closed: the connection is going away and will
                // unregister itself shortly.
                warn!("Dropped {} event for closed inbox {}", event.kind, endpoint);
                self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Whether any instance of the named module is currently registered.
    pub fn module_registered(&self, module: &str) -> bool {
        self.connections
            .iter()
            .any(|entry| entry.key().module == module)
    }

    /// Instance names currently registered under the given module.
    pub fn instances_of(&self, module: &str) -> Vec<CompactString> {
        self.connections
            .iter()
            .filter(|entry| entry.key().module == module)
            .map(|entry| entry.key().instance.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_broadcast: self.events_broadcast.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
