//! Registry of the connections the server maintains towards the outside
//! world, with the status metadata the `CONN-*` messages report.

use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::info;

use crate::connections::{Connection, ConnectionState};
use crate::error::RegistryError;
use crate::model::connection::{ConnectionInfo, ConnectionPurpose};
use crate::signals::{Signal, SignalBinding};

use super::{RegistryBase, RemovalGuard};

/// A registered connection: the connection itself plus the bookkeeping
/// needed for status reporting.
pub struct ConnectionRegistryEntry {
    id: String,
    connection: Arc<dyn Connection>,
    info: Mutex<ConnectionInfo>,
    /// Keeps the state-change subscription alive for the lifetime of the
    /// entry.
    _binding: SignalBinding,
}

impl ConnectionRegistryEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn purpose(&self) -> ConnectionPurpose {
        self.info.lock().unwrap().purpose
    }

    /// JSON status snapshot for `CONN-INF`.
    pub fn status(&self) -> Value {
        let mut info = self.info.lock().unwrap();
        info.update_status_from(self.connection.state());
        serde_json::to_value(&*info).unwrap_or(Value::Null)
    }
}

/// Payload of the re-dispatched per-entry state change signal.
#[derive(Clone)]
pub struct ConnectionStateEvent {
    pub entry: Arc<ConnectionRegistryEntry>,
    pub old: ConnectionState,
    pub new: ConnectionState,
}

/// Registry of connections. Re-emits the `state_changed` signal of every
/// held connection as `connection_state_changed(entry, old, new)`.
pub struct ConnectionRegistry {
    self_ref: Weak<ConnectionRegistry>,
    base: RegistryBase<Arc<ConnectionRegistryEntry>>,
    connection_state_changed: Signal<ConnectionStateEvent>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            base: RegistryBase::new(),
            connection_state_changed: Signal::new(),
        })
    }

    pub fn connection_state_changed(&self) -> &Signal<ConnectionStateEvent> {
        &self.connection_state_changed
    }

    /// Registers a connection under the given id.
    ///
    /// The registrant stays the owner of the connection for lifecycle
    /// purposes; the registry only watches it.
    pub fn add(
        &self,
        id: impl Into<String>,
        connection: Arc<dyn Connection>,
        description: impl Into<String>,
        purpose: ConnectionPurpose,
    ) -> Result<Arc<ConnectionRegistryEntry>, RegistryError> {
        let id = id.into();
        if self.base.contains(&id) {
            return Err(RegistryError::IdTaken(id));
        }

        let mut info = ConnectionInfo::new(id.clone());
        info.purpose = purpose;
        info.description = Some(description.into());
        info.update_status_from(connection.state());

        // The entry needs the binding and the binding needs the entry;
        // tie the knot through a slot filled in right after creation.
        let slot: Arc<Mutex<Option<Arc<ConnectionRegistryEntry>>>> =
            Arc::new(Mutex::new(None));
        let binding = {
            let slot = Arc::clone(&slot);
            let signal = self.connection_state_changed.clone();
            connection.events().state_changed.connect(move |change| {
                if let Some(entry) = slot.lock().unwrap().clone() {
                    signal.emit(&ConnectionStateEvent {
                        entry,
                        old: change.old,
                        new: change.new,
                    });
                }
            })
        };

        let entry = Arc::new(ConnectionRegistryEntry {
            id: id.clone(),
            connection,
            info: Mutex::new(info),
            _binding: binding,
        });
        *slot.lock().unwrap() = Some(Arc::clone(&entry));

        info!(id = %id, "connection registered");
        self.base.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ConnectionRegistryEntry>> {
        let removed = self.base.take(id);
        if removed.is_some() {
            info!(id = %id, "connection deregistered");
        }
        removed
    }

    /// Scoped registration: the connection stays registered while the
    /// returned guard lives.
    pub fn use_connection(
        &self,
        id: impl Into<String>,
        connection: Arc<dyn Connection>,
        description: impl Into<String>,
        purpose: ConnectionPurpose,
    ) -> Result<RemovalGuard, RegistryError> {
        let id = id.into();
        self.add(id.clone(), connection, description, purpose)?;
        let registry = self.self_ref.clone();
        Ok(RemovalGuard::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&id);
            }
        }))
    }
}

impl Deref for ConnectionRegistry {
    type Target = RegistryBase<Arc<ConnectionRegistryEntry>>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
