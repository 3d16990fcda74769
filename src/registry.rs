//! Subscription registry (C6): the set of live `REQ` subscriptions across
//! all connections, keyed by `(connection_id, sub_id)`. The fan-out
//! dispatcher (C7) reads a cheap snapshot of this set per event rather
//! than holding the registry lock for the duration of delivery.
use crate::error::Result;
use crate::event::Event;
use crate::filter::FilterSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Per-connection delivery, abstracted away from the registry so it does
/// not need to know about WebSocket frames or connection state. The
/// connection task (C8) is the concrete implementor.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver `event` as the `EVENT` reply for subscription `sub_id`.
    async fn send_event(&self, sub_id: &str, event: &Event) -> Result<()>;
}

/// One live subscription: the filters it was opened with, and where to
/// send matching events.
#[derive(Clone)]
pub struct Subscription {
    pub connection_id: Uuid,
    pub sub_id: String,
    pub filters: FilterSet,
    pub sink: Arc<dyn EventSink>,
}

#[derive(Default)]
pub struct Registry {
    by_connection: RwLock<HashMap<Uuid, HashMap<String, Subscription>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Open (or, per NIP-01, replace) the subscription `sub_id` on
    /// `connection_id` (§4.6).
    pub fn add(&self, connection_id: Uuid, sub_id: String, filters: FilterSet, sink: Arc<dyn EventSink>) {
        let subscription = Subscription {
            connection_id,
            sub_id: sub_id.clone(),
            filters,
            sink,
        };
        let mut guard = self.by_connection.write().expect("registry lock poisoned");
        guard.entry(connection_id).or_default().insert(sub_id, subscription);
    }

    /// `CLOSE sub_id` (§4.6): remove one subscription from one connection.
    pub fn remove(&self, connection_id: Uuid, sub_id: &str) {
        let mut guard = self.by_connection.write().expect("registry lock poisoned");
        if let Some(subs) = guard.get_mut(&connection_id) {
            subs.remove(sub_id);
            if subs.is_empty() {
                guard.remove(&connection_id);
            }
        }
    }

    /// Connection-close cleanup (§4.6): drop every subscription owned by
    /// `connection_id`.
    pub fn remove_all_for_connection(&self, connection_id: Uuid) {
        let mut guard = self.by_connection.write().expect("registry lock poisoned");
        guard.remove(&connection_id);
    }

    /// A cloned snapshot of every live subscription, for the fan-out
    /// dispatcher to iterate without holding the registry lock across
    /// delivery (§5: dispatch must not block new `REQ`/`CLOSE` handling).
    pub fn snapshot(&self) -> Vec<Subscription> {
        let guard = self.by_connection.read().expect("registry lock poisoned");
        guard.values().flat_map(|subs| subs.values().cloned()).collect()
    }

    pub fn subscription_count(&self) -> usize {
        let guard = self.by_connection.read().expect("registry lock poisoned");
        guard.values().map(HashMap::len).sum()
    }
}
