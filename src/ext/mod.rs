//! Pluggable extensions and the manager that loads, unloads and
//! supervises them.
//!
//! An extension is a struct implementing [`Extension`]. The manager keeps
//! one record per extension with its configuration, its dependents and
//! the cancel handles of its background tasks. Extensions are looked up
//! by name in a factory table; the built-in table lives in
//! [`builtin_extensions`].

pub mod api;
pub mod clocks;
pub mod ext_manager;
pub mod fake_connections;
pub mod manager;
pub mod virtual_uavs;
pub mod ws;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::app::App;
use crate::error::ExtensionError;

pub use api::ApiProxy;
pub use manager::{ExtensionEvent, ExtensionManager};

/// Everything an extension receives from the manager when one of its
/// lifecycle hooks is invoked.
pub struct ExtensionContext {
    pub app: Arc<App>,
    pub config: Value,
    pub name: String,
}

/// A pluggable feature of the server.
///
/// All hooks are optional except that an extension without any is
/// pointless. `load` runs once when the extension is loaded; `run` is a
/// long-lived task cancelled on unload; `worker` is a long-lived task
/// that only exists while the server is spinning (has clients), bracketed
/// by `spinup` and `spindown`.
pub trait Extension: Send + Sync {
    /// Names of the extensions that must be loaded before this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Human-readable description, shown by `EXT-INF`.
    fn description(&self) -> &'static str {
        ""
    }

    fn load(&self, _ctx: &ExtensionContext) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Long-lived background task of the extension, if it has one.
    fn run(&self, _ctx: &ExtensionContext) -> Option<BoxFuture<'static, ()>> {
        None
    }

    /// Long-lived task started when the first client connects and
    /// cancelled when the last one disconnects.
    fn worker(&self, _ctx: &ExtensionContext) -> Option<BoxFuture<'static, ()>> {
        None
    }

    fn spinup(&self) {}

    fn spindown(&self) {}

    fn unload(&self, _app: &Arc<App>) {}

    /// API surface other extensions can reach through `import_api`. The
    /// returned value is downcast to the extension's typed API struct.
    fn exports(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// Constructor of an extension instance.
pub type ExtensionFactory = Arc<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// A name-to-factory table of extensions.
pub type ExtensionTable = HashMap<String, ExtensionFactory>;

fn entry<F>(name: &str, factory: F) -> (String, ExtensionFactory)
where
    F: Fn() -> Arc<dyn Extension> + Send + Sync + 'static,
{
    (name.to_owned(), Arc::new(factory))
}

/// The extensions shipped with the server.
pub fn builtin_extensions() -> ExtensionTable {
    ExtensionTable::from([
        entry("clocks", || Arc::new(clocks::ClocksExtension::new())),
        entry("ext_manager", || {
            Arc::new(ext_manager::ExtManagerExtension::new())
        }),
        entry("fake_connections", || {
            Arc::new(fake_connections::FakeConnectionsExtension::new())
        }),
        entry("virtual_uavs", || {
            Arc::new(virtual_uavs::VirtualUavsExtension::new())
        }),
        entry("ws", || Arc::new(ws::WsExtension::new())),
    ])
}
