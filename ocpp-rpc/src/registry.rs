//! Identity → connection registry
//!
//! Exactly one live connection per identity. A second connection presenting
//! an identity that is already bound is a reconnect race: the newer
//! connection wins and the older one is closed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};
use crate::identity::Identity;

/// Capacity of the lifecycle event channel
const EVENT_CHANNEL: usize = 256;

/// Lifecycle events for observability modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Identity bound to a connection (`replaced` is the superseded one)
    Bound {
        identity: Identity,
        connection: ConnectionId,
        replaced: Option<ConnectionId>,
    },
    /// Identity no longer bound
    Unbound {
        identity: Identity,
        connection: ConnectionId,
    },
}

/// Registry entry for one identity
#[derive(Debug, Clone)]
pub struct Binding {
    pub connection: Arc<Connection>,
    pub bound_at: DateTime<Utc>,
    /// Set when this binding replaced an earlier live connection
    pub rebound_at: Option<DateTime<Utc>>,
}

struct RegistryInner {
    bindings: RwLock<HashMap<Identity, Binding>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Shared map of identity to its single live connection
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL);
        Self {
            inner: Arc::new(RegistryInner {
                bindings: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Bind a connection under its identity.
    ///
    /// Returns the superseded connection, which has already been closed.
    pub fn bind(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let identity = connection.identity().clone();
        let now = Utc::now();

        let previous = {
            let mut bindings = self.inner.bindings.write();
            let previous = bindings
                .get(&identity)
                .filter(|b| b.connection.id() != connection.id())
                .map(|b| b.connection.clone());

            bindings.insert(
                identity.clone(),
                Binding {
                    connection: connection.clone(),
                    bound_at: now,
                    rebound_at: previous.as_ref().map(|_| now),
                },
            );
            previous
        };

        match &previous {
            Some(old) => {
                warn!(
                    "Identity {} reconnected: connection {} supersedes {}",
                    identity,
                    connection.id(),
                    old.id()
                );
                old.close("superseded by a newer connection");
            }
            None => info!("Identity {} bound to connection {}", identity, connection.id()),
        }

        let _ = self.inner.events.send(ConnectionEvent::Bound {
            identity,
            connection: connection.id(),
            replaced: previous.as_ref().map(|c| c.id()),
        });

        previous
    }

    /// Current connection for an identity
    pub fn lookup(&self, identity: &Identity) -> Option<Arc<Connection>> {
        self.inner
            .bindings
            .read()
            .get(identity)
            .map(|b| b.connection.clone())
    }

    /// Registry entry (with timestamps) for an identity
    pub fn binding(&self, identity: &Identity) -> Option<Binding> {
        self.inner.bindings.read().get(identity).cloned()
    }

    /// Remove the binding of a closing connection.
    ///
    /// Only removes the entry if it still points at `connection`; a
    /// connection superseded by a reconnect leaves the newer binding alone.
    pub fn unbind(&self, connection: &Connection) -> bool {
        let identity = connection.identity();

        let removed = {
            let mut bindings = self.inner.bindings.write();
            match bindings.get(identity) {
                Some(b) if b.connection.id() == connection.id() => {
                    bindings.remove(identity);
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!("Identity {} unbound (connection {})", identity, connection.id());
            let _ = self.inner.events.send(ConnectionEvent::Unbound {
                identity: identity.clone(),
                connection: connection.id(),
            });
        } else {
            debug!(
                "Connection {} for {} already superseded, binding kept",
                connection.id(),
                identity
            );
        }

        removed
    }

    pub fn is_bound(&self, identity: &Identity) -> bool {
        self.inner.bindings.read().contains_key(identity)
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.inner.bindings.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bindings.read().is_empty()
    }

    /// Subscribe to bound/unbound events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
