//! Registry of model objects (UAVs, beacons, docks, ...), plus the typed
//! views that expose one kind at a time.

use std::ops::Deref;
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::error::RegistryError;
use crate::model::object::{ModelObject, ObjectKind};

use super::{RegistryBase, RemovalGuard};

/// Registry of every model object the server manages. Kind-specific
/// registries are views over this one.
pub struct ObjectRegistry {
    self_ref: Weak<ObjectRegistry>,
    base: RegistryBase<Arc<dyn ModelObject>>,
}

impl ObjectRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            base: RegistryBase::new(),
        })
    }

    /// Registers an object. Idempotent for the same object; an error when
    /// the id is taken by a different object.
    pub fn add(&self, object: Arc<dyn ModelObject>) -> Result<(), RegistryError> {
        let id = object.id().to_owned();
        if let Some(existing) = self.base.find_by_id(&id) {
            if Arc::ptr_eq(&existing, &object) {
                return Ok(());
            }
            return Err(RegistryError::IdTaken(id));
        }
        debug!(id = %id, kind = ?object.kind(), "object registered");
        self.base.insert(id, object);
        Ok(())
    }

    pub fn remove(&self, object: &Arc<dyn ModelObject>) -> Option<Arc<dyn ModelObject>> {
        self.remove_by_id(object.id())
    }

    pub fn remove_by_id(&self, object_id: &str) -> Option<Arc<dyn ModelObject>> {
        self.base.take(object_id)
    }

    /// Scoped registration: the object stays registered while the guard
    /// lives.
    pub fn use_object(
        &self,
        object: Arc<dyn ModelObject>,
    ) -> Result<RemovalGuard, RegistryError> {
        let id = object.id().to_owned();
        self.add(object)?;
        let registry = self.self_ref.clone();
        Ok(RemovalGuard::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove_by_id(&id);
            }
        }))
    }

    /// A view of this registry restricted to one object kind.
    pub fn view(&self, kind: ObjectKind) -> ObjectRegistryView {
        ObjectRegistryView {
            registry: self
                .self_ref
                .upgrade()
                .expect("the registry outlives its own method calls"),
            kind,
        }
    }
}

impl Deref for ObjectRegistry {
    type Target = RegistryBase<Arc<dyn ModelObject>>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

/// Read-only view of the object registry filtered by kind. UAV, beacon
/// and dock "registries" are instances of this.
#[derive(Clone)]
pub struct ObjectRegistryView {
    registry: Arc<ObjectRegistry>,
    kind: ObjectKind,
}

impl ObjectRegistryView {
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find_by_id(id).is_some()
    }

    pub fn find_by_id(&self, id: &str) -> Option<Arc<dyn ModelObject>> {
        self.registry
            .find_by_id(id)
            .filter(|object| object.kind() == self.kind)
    }

    pub fn ids(&self) -> Vec<String> {
        self.registry
            .ids()
            .into_iter()
            .filter(|id| self.contains(id))
            .collect()
    }

    pub fn num_entries(&self) -> usize {
        self.ids().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::object::VirtualUav;
    use serde_json::json;

    struct Beacon {
        id: String,
    }

    impl ModelObject for Beacon {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> ObjectKind {
            ObjectKind::Beacon
        }

        fn status(&self) -> serde_json::Value {
            json!({ "id": self.id })
        }
    }

    #[test]
    fn add_is_idempotent_for_the_same_object_only() {
        let registry = ObjectRegistry::new();
        let uav: Arc<dyn ModelObject> = Arc::new(VirtualUav::new("01", [0.0, 0.0, 0.0]));

        registry.add(Arc::clone(&uav)).unwrap();
        registry.add(Arc::clone(&uav)).unwrap();
        assert_eq!(registry.num_entries(), 1);

        let impostor: Arc<dyn ModelObject> = Arc::new(VirtualUav::new("01", [1.0, 1.0, 0.0]));
        assert!(registry.add(impostor).is_err());
    }

    #[test]
    fn views_filter_by_kind() {
        let registry = ObjectRegistry::new();
        registry
            .add(Arc::new(VirtualUav::new("01", [0.0, 0.0, 0.0])))
            .unwrap();
        registry
            .add(Arc::new(Beacon {
                id: "BEACON:1".into(),
            }))
            .unwrap();

        let uavs = registry.view(ObjectKind::Uav);
        let beacons = registry.view(ObjectKind::Beacon);

        assert_eq!(uavs.ids(), vec!["01"]);
        assert_eq!(beacons.ids(), vec!["BEACON:1"]);
        assert!(uavs.find_by_id("BEACON:1").is_none());
        assert_eq!(registry.num_entries(), 2);
    }
}
