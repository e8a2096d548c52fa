//! Observable, keyed in-memory indexes of the entities the server knows
//! about: clients, channel types, connections, model objects, clocks and
//! RTK presets.
//!
//! Every registry emits `added` after the entry became visible through
//! `find_by_id` and `removed` after the entry is gone. Entries are owned
//! by the registry between `add` and `remove`.

pub mod channels;
pub mod clients;
pub mod clocks;
pub mod connections;
pub mod objects;
pub mod rtk;

use dashmap::DashMap;

use crate::error::RegistryError;
use crate::model::message::FlockwaveResponse;
use crate::signals::Signal;

pub use channels::{ChannelTypeDescriptor, ChannelTypeRegistry};
pub use clients::ClientRegistry;
pub use clocks::ClockRegistry;
pub use connections::{ConnectionRegistry, ConnectionRegistryEntry, ConnectionStateEvent};
pub use objects::{ObjectRegistry, ObjectRegistryView};
pub use rtk::{RtkFormat, RtkPreset, RtkPresetRegistry};

/// Shared implementation of the registry contract. Specialised registries
/// embed one and expose it through `Deref`.
pub struct RegistryBase<T: Clone + Send + Sync + 'static> {
    entries: DashMap<String, T>,
    added: Signal<T>,
    removed: Signal<T>,
}

impl<T: Clone + Send + Sync + 'static> Default for RegistryBase<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> RegistryBase<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            added: Signal::new(),
            removed: Signal::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn find_by_id(&self, id: &str) -> Option<T> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn find_or_fail(&self, id: &str) -> Result<T, RegistryError> {
        self.find_by_id(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))
    }

    /// All known ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Fired after an entry became findable.
    pub fn added(&self) -> &Signal<T> {
        &self.added
    }

    /// Fired after an entry was removed.
    pub fn removed(&self) -> &Signal<T> {
        &self.removed
    }

    /// Inserts and fires `added`. Callers enforce their own duplicate-id
    /// policy before calling this.
    pub(crate) fn insert(&self, id: String, entry: T) {
        self.entries.insert(id, entry.clone());
        self.added.emit(&entry);
    }

    pub(crate) fn take(&self, id: &str) -> Option<T> {
        let removed = self.entries.remove(id).map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            self.removed.emit(entry);
        }
        removed
    }
}

/// RAII guard returned by the `use_*` style scoped acquisitions: removes
/// the entry it guards when dropped.
pub struct RemovalGuard {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl RemovalGuard {
    pub(crate) fn new<F: FnOnce() + Send + 'static>(remove: F) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Keeps the entry in the registry forever and consumes the guard.
    pub fn keep(mut self) {
        self.remove = None;
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

/// Finds an entry, recording a failure with the given reason in the
/// response when it is missing. The usual way multi-id request handlers
/// consult a registry.
pub fn find_in_registry<T: Clone + Send + Sync + 'static>(
    registry: &RegistryBase<T>,
    id: &str,
    response: &mut FlockwaveResponse,
    reason: &str,
) -> Option<T> {
    match registry.find_by_id(id) {
        Some(entry) => Some(entry),
        None => {
            response.add_failure(id, Some(reason));
            None
        }
    }
}
