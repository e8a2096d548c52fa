//! The extension manager: dependency-ordered loading and unloading,
//! spinning state, supervised background tasks and API brokering.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::error::ExtensionError;
use crate::signals::Signal;

use super::api::ApiProxy;
use super::{Extension, ExtensionContext, ExtensionFactory, ExtensionTable};

/// Names an extension may never have; they would shadow the machinery
/// itself.
const FORBIDDEN_NAMES: [&str; 4] = ["base", "manager", "logger", "__init__"];

/// Capacity of the background task queue.
const TASK_QUEUE_CAPACITY: usize = 1024;

/// Payload of the `loaded` and `unloaded` signals.
#[derive(Clone)]
pub struct ExtensionEvent {
    pub name: String,
    pub instance: Arc<dyn Extension>,
}

struct ExtensionRecord {
    factory: ExtensionFactory,
    /// The extension instance. Replaced by a fresh one from the factory
    /// after an unload, so a reload starts from a clean slate.
    instance: Arc<dyn Extension>,
    configuration: Value,
    dependents: HashSet<String>,
    loaded: bool,
    task: Option<AbortHandle>,
    worker: Option<AbortHandle>,
}

/// Order in which extensions were loaded, so teardown can walk it in
/// reverse.
#[derive(Default)]
struct LoadOrder {
    names: Vec<String>,
}

impl LoadOrder {
    fn notify_loaded(&mut self, name: &str) {
        self.names.retain(|existing| existing != name);
        self.names.push(name.to_owned());
    }

    fn notify_unloaded(&mut self, name: &str) {
        self.names.retain(|existing| existing != name);
    }

    fn items(&self) -> Vec<String> {
        self.names.clone()
    }

    fn reversed(&self) -> Vec<String> {
        self.names.iter().rev().cloned().collect()
    }
}

struct BackgroundTask {
    future: BoxFuture<'static, ()>,
    handle_tx: oneshot::Sender<AbortHandle>,
}

/// Central extension manager of the application.
pub struct ExtensionManager {
    app: Mutex<Weak<App>>,
    known: Mutex<ExtensionTable>,
    records: Mutex<HashMap<String, ExtensionRecord>>,
    load_order: Mutex<LoadOrder>,
    spinning: AtomicBool,
    loaded: Signal<ExtensionEvent>,
    unloaded: Signal<ExtensionEvent>,
    task_tx: Mutex<Option<mpsc::Sender<BackgroundTask>>>,
}

impl ExtensionManager {
    pub fn new(known: ExtensionTable) -> Arc<Self> {
        Arc::new(Self {
            app: Mutex::new(Weak::new()),
            known: Mutex::new(known),
            records: Mutex::new(HashMap::new()),
            load_order: Mutex::new(LoadOrder::default()),
            spinning: AtomicBool::new(false),
            loaded: Signal::new(),
            unloaded: Signal::new(),
            task_tx: Mutex::new(None),
        })
    }

    /// Fired after an extension has been configured and loaded.
    pub fn loaded_signal(&self) -> &Signal<ExtensionEvent> {
        &self.loaded
    }

    /// Fired after an extension has been unloaded.
    pub fn unloaded_signal(&self) -> &Signal<ExtensionEvent> {
        &self.unloaded
    }

    pub fn set_app(&self, app: &Arc<App>) {
        *self.app.lock().unwrap() = Arc::downgrade(app);
    }

    fn app(&self) -> Result<Arc<App>, ExtensionError> {
        self.app.lock().unwrap().upgrade().ok_or_else(|| {
            ExtensionError::LoadFailed {
                name: "<manager>".into(),
                reason: "application context is gone".into(),
            }
        })
    }

    /// Whether an extension with the given name exists at all,
    /// irrespective of whether it is loaded.
    pub fn exists(&self, name: &str) -> bool {
        self.known.lock().unwrap().contains_key(name)
    }

    /// Names of every known extension, sorted.
    pub fn known_extensions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.known.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|record| record.loaded)
    }

    /// Names of the currently loaded extensions, sorted.
    pub fn loaded_extensions(&self) -> Vec<String> {
        let records = self.records.lock().unwrap();
        let mut names: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.loaded)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    // ── Configuration ───────────────────────────────────────

    fn ensure_record(&self, name: &str) -> Result<(), ExtensionError> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(name) {
            return Ok(());
        }
        let factory = self
            .known
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ExtensionError::NoSuchExtension(name.to_owned()))?;
        let instance = factory();
        records.insert(
            name.to_owned(),
            ExtensionRecord {
                factory,
                instance,
                configuration: json!({}),
                dependents: HashSet::new(),
                loaded: false,
                task: None,
                worker: None,
            },
        );
        Ok(())
    }

    /// The configuration slot of an extension.
    pub fn configuration_of(&self, name: &str) -> Result<Value, ExtensionError> {
        self.ensure_record(name)?;
        Ok(self.records.lock().unwrap()[name].configuration.clone())
    }

    /// Replaces the configuration of an extension. Takes effect on the
    /// next load.
    pub fn set_configuration(&self, name: &str, configuration: Value) -> Result<(), ExtensionError> {
        self.ensure_record(name)?;
        self.records
            .lock()
            .unwrap()
            .get_mut(name)
            .expect("record was just ensured")
            .configuration = configuration;
        Ok(())
    }

    /// Introspection snapshot of an extension, as reported by `EXT-INF`.
    pub fn status_of(&self, name: &str) -> Result<Value, ExtensionError> {
        self.ensure_record(name)?;
        let records = self.records.lock().unwrap();
        let record = &records[name];
        Ok(json!({
            "id": name,
            "name": name,
            "description": record.instance.description(),
            "loaded": record.loaded,
            "dependencies": record.instance.dependencies(),
        }))
    }

    /// Configures the manager: stores per-extension configuration slots
    /// and loads every enabled extension. Extensions loaded earlier are
    /// unloaded first, so this may also be used to reconfigure a running
    /// manager.
    pub async fn configure(&self, extensions: &Map<String, Value>, app: &Arc<App>) {
        self.set_app(app);

        let mut to_load: BTreeSet<String> =
            self.loaded_extensions().into_iter().collect();
        self.teardown().await;

        for (name, configuration) in extensions {
            if let Err(error) = self.ensure_record(name) {
                warn!(ext = %name, error = %error, "ignoring configuration for unknown extension");
                continue;
            }
            let _ = self.set_configuration(name, configuration.clone());
            to_load.insert(name.clone());
        }

        for name in to_load {
            let enabled = self
                .configuration_of(&name)
                .ok()
                .and_then(|configuration| {
                    configuration.get("enabled").and_then(Value::as_bool)
                })
                .unwrap_or(true);
            if !enabled {
                debug!(ext = %name, "extension disabled by configuration");
                continue;
            }
            if let Err(error) = self.load(&name).await {
                error!(ext = %name, error = %error, "failed to load extension");
            }
        }
    }

    // ── Background tasks ────────────────────────────────────

    /// Runs a future as a supervised background task of the manager and
    /// returns its cancel handle.
    ///
    /// Tasks go through the manager's task queue into its supervising
    /// task set; when the manager loop is not running (mostly in tests),
    /// the task is spawned directly instead.
    pub async fn run_in_background(
        &self,
        future: BoxFuture<'static, ()>,
    ) -> Result<AbortHandle, ExtensionError> {
        let task_tx = self.task_tx.lock().unwrap().clone();
        match task_tx {
            Some(task_tx) => {
                let (handle_tx, handle_rx) = oneshot::channel();
                task_tx
                    .send(BackgroundTask { future, handle_tx })
                    .await
                    .map_err(|_| ExtensionError::LoadFailed {
                        name: "<manager>".into(),
                        reason: "task queue is closed".into(),
                    })?;
                handle_rx.await.map_err(|_| ExtensionError::LoadFailed {
                    name: "<manager>".into(),
                    reason: "task queue worker is gone".into(),
                })
            }
            None => {
                debug!("manager loop not running, spawning task directly");
                Ok(tokio::spawn(future).abort_handle())
            }
        }
    }

    /// The manager's long-lived task: configures the extensions, then
    /// services the background task queue forever.
    pub async fn run(self: Arc<Self>, extensions: &Map<String, Value>, app: &Arc<App>) {
        let (task_tx, mut task_rx) = mpsc::channel::<BackgroundTask>(TASK_QUEUE_CAPACITY);

        // The queue is serviced only after configuration, so tasks spawned
        // by the initial extension loads take the direct-spawn path; the
        // sender is published once the loop is about to start.
        self.configure(extensions, app).await;
        *self.task_tx.lock().unwrap() = Some(task_tx);

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                request = task_rx.recv() => match request {
                    Some(BackgroundTask { future, handle_tx }) => {
                        let handle = tasks.spawn(future);
                        let _ = handle_tx.send(handle);
                    }
                    None => break,
                },
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(join_error) = result {
                        if !join_error.is_cancelled() {
                            error!(error = %join_error, "extension task crashed");
                        }
                    }
                }
            }
        }

        *self.task_tx.lock().unwrap() = None;
    }

    // ── Loading ─────────────────────────────────────────────

    /// Loads an extension, loading its transitive dependencies first.
    /// Loading an already loaded extension is a no-op.
    pub async fn load(&self, name: &str) -> Result<(), ExtensionError> {
        let mut forbidden = Vec::new();
        self.load_inner(name, &mut forbidden).await
    }

    fn load_inner<'a>(
        &'a self,
        name: &'a str,
        forbidden: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<(), ExtensionError>> {
        Box::pin(async move {
            if forbidden.iter().any(|candidate| candidate == name) {
                let mut cycle = forbidden.clone();
                cycle.push(name.to_owned());
                error!(cycle = %cycle.join(" -> "), "dependency cycle detected");
                return Err(ExtensionError::DependencyCycle(cycle));
            }

            let dependencies = self.dependencies_of(name)?;
            forbidden.push(name.to_owned());
            let mut result = Ok(());
            for dependency in dependencies {
                if let Err(error) = self.load_inner(&dependency, forbidden).await {
                    result = Err(error);
                    break;
                }
            }
            forbidden.pop();
            result?;

            if self.is_loaded(name) {
                return Ok(());
            }
            self.load_single(name).await
        })
    }

    fn dependencies_of(&self, name: &str) -> Result<Vec<String>, ExtensionError> {
        self.ensure_record(name)?;
        Ok(self.records.lock().unwrap()[name]
            .instance
            .dependencies()
            .iter()
            .map(|dependency| (*dependency).to_owned())
            .collect())
    }

    /// Loads one extension whose dependencies are already loaded.
    async fn load_single(&self, name: &str) -> Result<(), ExtensionError> {
        if FORBIDDEN_NAMES.contains(&name) {
            return Err(ExtensionError::InvalidName(name.to_owned()));
        }

        let app = self.app()?;
        self.ensure_record(name)?;
        let (instance, configuration) = {
            let records = self.records.lock().unwrap();
            let record = &records[name];
            (Arc::clone(&record.instance), record.configuration.clone())
        };

        debug!(ext = %name, "loading extension");
        let ctx = ExtensionContext {
            app: Arc::clone(&app),
            config: configuration,
            name: name.to_owned(),
        };

        instance.load(&ctx).map_err(|error| {
            error!(ext = %name, error = %error, "error while loading extension");
            ExtensionError::LoadFailed {
                name: name.to_owned(),
                reason: error.to_string(),
            }
        })?;

        let task = match instance.run(&ctx) {
            Some(future) => Some(self.run_in_background(future).await?),
            None => None,
        };

        {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(name).expect("record was just ensured");
            record.loaded = true;
            record.task = task;
        }
        self.load_order.lock().unwrap().notify_loaded(name);

        for dependency in instance.dependencies() {
            if let Some(record) = self.records.lock().unwrap().get_mut(*dependency) {
                record.dependents.insert(name.to_owned());
            }
        }

        info!(ext = %name, "extension loaded");
        self.loaded.emit(&ExtensionEvent {
            name: name.to_owned(),
            instance: Arc::clone(&instance),
        });

        if self.spinning() {
            self.spinup_extension(name).await;
        }
        Ok(())
    }

    // ── Unloading ───────────────────────────────────────────

    /// Unloads an extension. Refuses when another loaded extension still
    /// depends on it.
    pub async fn unload(&self, name: &str) -> Result<(), ExtensionError> {
        let instance = {
            let records = self.records.lock().unwrap();
            let record = match records.get(name) {
                Some(record) if record.loaded => record,
                _ => {
                    warn!(ext = %name, "tried to unload extension but it is not loaded");
                    return Err(ExtensionError::NotLoaded(name.to_owned()));
                }
            };
            if !record.dependents.is_empty() {
                return Err(ExtensionError::InUse(name.to_owned()));
            }
            Arc::clone(&record.instance)
        };

        if self.spinning() {
            self.spindown_extension(name).await;
        }

        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(name) {
                if let Some(task) = record.task.take() {
                    task.abort();
                }
                if let Some(worker) = record.worker.take() {
                    worker.abort();
                }
            }
        }

        if let Some(app) = self.app.lock().unwrap().upgrade() {
            instance.unload(&app);
        }

        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(name) {
                record.loaded = false;
                // Fresh instance for the next load.
                record.instance = (record.factory)();
            }
        }
        self.load_order.lock().unwrap().notify_unloaded(name);

        for dependency in instance.dependencies() {
            if let Some(record) = self.records.lock().unwrap().get_mut(*dependency) {
                record.dependents.remove(name);
            }
        }

        info!(ext = %name, "extension unloaded");
        self.unloaded.emit(&ExtensionEvent {
            name: name.to_owned(),
            instance,
        });
        Ok(())
    }

    /// Unload followed by load, preserving the configuration.
    pub async fn reload(&self, name: &str) -> Result<(), ExtensionError> {
        self.unload(name).await?;
        self.load(name).await
    }

    /// Unloads every extension in reverse load order.
    pub async fn teardown(&self) {
        let names = self.load_order.lock().unwrap().reversed();
        for name in names {
            if let Err(error) = self.unload(&name).await {
                warn!(ext = %name, error = %error, "error during teardown unload");
            }
        }
    }

    // ── Spinning ────────────────────────────────────────────

    /// Whether the server currently has clients; workers only run while
    /// it does.
    pub fn spinning(&self) -> bool {
        self.spinning.load(Ordering::SeqCst)
    }

    pub async fn set_spinning(&self, value: bool) {
        if self.spinning() == value {
            return;
        }
        if self.spinning() {
            let names = self.load_order.lock().unwrap().reversed();
            for name in names {
                self.spindown_extension(&name).await;
            }
        }
        self.spinning.store(value, Ordering::SeqCst);
        if value {
            let names = self.load_order.lock().unwrap().items();
            for name in names {
                self.spinup_extension(&name).await;
            }
        }
    }

    async fn spinup_extension(&self, name: &str) {
        let Ok(app) = self.app() else { return };
        let (instance, configuration) = {
            let records = self.records.lock().unwrap();
            match records.get(name) {
                Some(record) if record.loaded => {
                    (Arc::clone(&record.instance), record.configuration.clone())
                }
                _ => return,
            }
        };

        instance.spinup();

        let ctx = ExtensionContext {
            app,
            config: configuration,
            name: name.to_owned(),
        };
        if let Some(future) = instance.worker(&ctx) {
            match self.run_in_background(future).await {
                Ok(handle) => {
                    if let Some(record) = self.records.lock().unwrap().get_mut(name) {
                        record.worker = Some(handle);
                    }
                }
                Err(error) => {
                    error!(ext = %name, error = %error, "failed to start worker");
                }
            }
        }
    }

    async fn spindown_extension(&self, name: &str) {
        let instance = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(name) {
                Some(record) if record.loaded => {
                    if let Some(worker) = record.worker.take() {
                        worker.abort();
                    }
                    Arc::clone(&record.instance)
                }
                _ => return,
            }
        };
        instance.spindown();
    }

    // ── API brokering ───────────────────────────────────────

    /// Imports the API exported by an extension, possibly before it is
    /// loaded.
    pub fn import_api(&self, name: &str) -> Result<ApiProxy, ExtensionError> {
        self.ensure_record(name)?;

        let slot: Arc<Mutex<Option<Arc<dyn std::any::Any + Send + Sync>>>> = {
            let records = self.records.lock().unwrap();
            let record = &records[name];
            let current = if record.loaded {
                record.instance.exports()
            } else {
                None
            };
            Arc::new(Mutex::new(current))
        };

        let on_loaded = {
            let slot = Arc::clone(&slot);
            let name = name.to_owned();
            self.loaded.connect(move |event: &ExtensionEvent| {
                if event.name == name {
                    *slot.lock().unwrap() = event.instance.exports();
                }
            })
        };
        let on_unloaded = {
            let slot = Arc::clone(&slot);
            let name = name.to_owned();
            self.unloaded.connect(move |event: &ExtensionEvent| {
                if event.name == name {
                    *slot.lock().unwrap() = None;
                }
            })
        };

        Ok(ApiProxy::new(
            name.to_owned(),
            slot,
            [on_loaded, on_unloaded],
        ))
    }
}
