//! Registry of the clients currently connected to the server.

use std::ops::Deref;
use std::sync::Arc;

use tracing::info;

use crate::model::client::Client;
use crate::signals::Signal;

use super::RegistryBase;

/// Registry of connected clients.
///
/// `add` silently ignores an id that is already present: a client may not
/// connect twice with the same id, and transports prefix their ids so two
/// transports never collide.
#[derive(Default)]
pub struct ClientRegistry {
    base: RegistryBase<Arc<Client>>,
    /// Fired whenever the number of connected clients changes, with the
    /// new count. Extensions use this to spin up on the first client and
    /// down on the last.
    count_changed: Signal<usize>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            base: RegistryBase::new(),
            count_changed: Signal::new(),
        }
    }

    pub fn count_changed(&self) -> &Signal<usize> {
        &self.count_changed
    }

    pub fn add(&self, client: Arc<Client>) {
        if self.base.contains(client.id()) {
            return;
        }
        info!(id = %client.id(), "client connected");
        self.base.insert(client.id().to_owned(), client);
        self.count_changed.emit(&self.base.num_entries());
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Client>> {
        let removed = self.base.take(client_id);
        if removed.is_some() {
            info!(id = %client_id, "client disconnected");
            self.count_changed.emit(&self.base.num_entries());
        }
        removed
    }

    /// Ids of the clients attached through the given channel type.
    pub fn client_ids_for_channel_type(&self, channel_type: &str) -> Vec<String> {
        self.base
            .ids()
            .into_iter()
            .filter(|id| {
                self.base
                    .find_by_id(id)
                    .is_some_and(|client| client.channel_type() == channel_type)
            })
            .collect()
    }

    pub fn has_clients_for_channel_type(&self, channel_type: &str) -> bool {
        !self.client_ids_for_channel_type(channel_type).is_empty()
    }
}

impl Deref for ClientRegistry {
    type Target = RegistryBase<Arc<Client>>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
