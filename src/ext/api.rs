//! Typed, lazily bound access to the API another extension exports.

use std::any::Any;
use std::sync::{Arc, Mutex};

use crate::error::ApiError;
use crate::signals::SignalBinding;

pub(crate) type Slot = Arc<Mutex<Option<Arc<dyn Any + Send + Sync>>>>;

/// Proxy to the exported API of an extension.
///
/// The proxy may be created before the target extension is loaded; while
/// it is not, `loaded()` is false and `get` fails with `NotLoaded`. The
/// proxy tracks the manager's `loaded`/`unloaded` signals, so it starts
/// resolving transparently the moment the extension comes up.
#[derive(Clone)]
pub struct ApiProxy {
    name: String,
    slot: Slot,
    _bindings: Arc<[SignalBinding; 2]>,
}

impl ApiProxy {
    pub(crate) fn new(name: String, slot: Slot, bindings: [SignalBinding; 2]) -> Self {
        Self {
            name,
            slot,
            _bindings: Arc::new(bindings),
        }
    }

    /// Name of the extension the proxy resolves to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the target extension is currently loaded and exporting.
    pub fn loaded(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Resolves the exported API as the given type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ApiError> {
        let guard = self.slot.lock().unwrap();
        match guard.as_ref() {
            None => Err(ApiError::NotLoaded(self.name.clone())),
            Some(api) => Arc::clone(api)
                .downcast::<T>()
                .map_err(|_| ApiError::TypeMismatch(self.name.clone())),
        }
    }
}

impl std::fmt::Debug for ApiProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiProxy")
            .field("name", &self.name)
            .field("loaded", &self.loaded())
            .finish()
    }
}
