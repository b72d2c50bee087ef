//! Lifecycle Event Hub
//!
//! Fan-out bus used by the token manager, renewal scheduler, bastion
//! provisioner and tunnel supervisor to broadcast state transitions.
//! Callbacks run synchronously on the publishing task, in registration order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bastion::BastionSession;

/// Events emitted by the lifecycle core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoreEvent {
    /// Security token renewal finished (or the scheduler started)
    TokenRenewal {
        success: bool,
        expiration: DateTime<Local>,
    },
    /// Bastion session provisioned, renewed, or tunnel state changed
    Session {
        /// Lifecycle state of the current session, `INACTIVE` when none
        state: String,
        connected: bool,
        expiration: DateTime<Local>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<BastionSession>,
    },
    /// Forwarding subprocess connected state flipped
    TunnelConnection { tunnel_id: String, connected: bool },
}

/// Handle returned by [`EventHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered subscriber list with handle-based removal
pub struct EventHub<E = CoreEvent> {
    subscribers: RwLock<Vec<(SubscriptionId, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. Duplicate registrations are kept and each fires.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(callback)));
        tracing::debug!(subscription = id.0, "Subscriber added");
        id
    }

    /// Remove a callback. Returns false if the handle was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        before != subs.len()
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Invoke every callback with `event`
    ///
    /// The list is snapshotted first so a callback may subscribe or
    /// unsubscribe without deadlocking the hub.
    pub fn publish(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in snapshot {
            callback(event);
        }
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.len())
            .finish()
    }
}
