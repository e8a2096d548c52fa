//! The application object: owns the registries, the message hub, the
//! extension manager and the process lifecycle.

use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::Future;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connections::Connection;
use crate::error::{ExtensionError, ServerError};
use crate::ext::{builtin_extensions, ExtensionManager};
use crate::message_hub::{handler, HandlerOutcome, MessageHub};
use crate::registries::{
    ChannelTypeRegistry, ClientRegistry, ConnectionRegistry, ObjectRegistry,
};
use crate::signals::SignalBinding;

/// How many times a crashed transport server is restarted in quick
/// succession before giving up.
const SERVER_MAX_RETRIES: u32 = 3;
/// A crash older than this resets the retry counter.
const SERVER_RETRY_RESET: Duration = Duration::from_secs(5);

/// The Flockwave server application.
pub struct App {
    self_ref: Weak<App>,
    config: Config,
    client_registry: Arc<ClientRegistry>,
    channel_type_registry: Arc<ChannelTypeRegistry>,
    connection_registry: Arc<ConnectionRegistry>,
    object_registry: Arc<ObjectRegistry>,
    message_hub: Arc<MessageHub>,
    extension_manager: Arc<ExtensionManager>,
    /// Client-count edges, pumped into the manager's spinning flag.
    spin_rx: Mutex<Option<mpsc::UnboundedReceiver<usize>>>,
    service_tasks: Mutex<Vec<JoinHandle<()>>>,
    _bindings: Vec<SignalBinding>,
}

impl App {
    pub fn new(config: Config) -> Arc<Self> {
        let client_registry = Arc::new(ClientRegistry::new());
        let channel_type_registry = Arc::new(ChannelTypeRegistry::new());
        let connection_registry = ConnectionRegistry::new();
        let object_registry = ObjectRegistry::new();

        let message_hub = MessageHub::new();
        message_hub.attach_registries(
            Arc::clone(&client_registry),
            Arc::clone(&channel_type_registry),
        );

        let extension_manager = ExtensionManager::new(builtin_extensions());

        // Client-count changes arrive on a signal (synchronous); spinning
        // toggles are async, so pump them through a channel.
        let (spin_tx, spin_rx) = mpsc::unbounded_channel();
        let binding = client_registry.count_changed().connect(move |count| {
            let _ = spin_tx.send(*count);
        });

        let app = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            client_registry,
            channel_type_registry,
            connection_registry,
            object_registry,
            message_hub,
            extension_manager: Arc::clone(&extension_manager),
            spin_rx: Mutex::new(Some(spin_rx)),
            service_tasks: Mutex::new(Vec::new()),
            _bindings: vec![binding],
        });

        extension_manager.set_app(&app);
        app.register_core_handlers();
        app
    }

    // ── Accessors ───────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client_registry(&self) -> &Arc<ClientRegistry> {
        &self.client_registry
    }

    pub fn channel_type_registry(&self) -> &Arc<ChannelTypeRegistry> {
        &self.channel_type_registry
    }

    pub fn connection_registry(&self) -> &Arc<ConnectionRegistry> {
        &self.connection_registry
    }

    pub fn object_registry(&self) -> &Arc<ObjectRegistry> {
        &self.object_registry
    }

    pub fn message_hub(&self) -> &Arc<MessageHub> {
        &self.message_hub
    }

    pub fn extension_manager(&self) -> &Arc<ExtensionManager> {
        &self.extension_manager
    }

    // ── Core message handlers ───────────────────────────────

    /// `CONN-LIST` and `CONN-INF` are served by the application itself;
    /// everything else comes from extensions.
    fn register_core_handlers(&self) {
        {
            let registry = Arc::clone(&self.connection_registry);
            self.message_hub.register_handler(
                &["CONN-LIST"],
                handler(move |_message, _sender, _hub| {
                    let registry = Arc::clone(&registry);
                    async move {
                        let mut body = Map::new();
                        body.insert("ids".into(), json!(registry.ids()));
                        Ok(HandlerOutcome::Body(body))
                    }
                }),
            );
        }

        {
            let registry = Arc::clone(&self.connection_registry);
            self.message_hub.register_handler(
                &["CONN-INF"],
                handler(move |message, _sender, hub| {
                    let registry = Arc::clone(&registry);
                    async move {
                        let mut statuses = Map::new();
                        let mut body = Map::new();
                        body.insert("type".into(), json!("CONN-INF"));
                        let mut response = hub.create_response_to(&message, body);
                        for connection_id in message.target_ids() {
                            match registry.find_by_id(&connection_id) {
                                Some(entry) => {
                                    statuses.insert(connection_id, entry.status());
                                }
                                None => response
                                    .add_failure(&connection_id, Some("No such connection")),
                            }
                        }
                        response
                            .body_mut()
                            .insert("status".into(), Value::Object(statuses));
                        Ok(HandlerOutcome::Response(response))
                    }
                }),
            );
        }
    }

    // ── Lifecycle ───────────────────────────────────────────

    /// Starts the long-lived services: the message hub dispatcher, the
    /// extension manager (which loads the configured extensions) and the
    /// spinning pump. Returns once the services are spawned.
    pub fn start(&self) {
        let mut tasks = self.service_tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        {
            let hub = Arc::clone(&self.message_hub);
            tasks.push(tokio::spawn(async move {
                if let Err(error) = hub.run().await {
                    error!(error = %error, "message hub dispatcher exited");
                }
            }));
        }

        {
            let manager = Arc::clone(&self.extension_manager);
            let extensions = self.config.extensions.clone();
            let app = self
                .self_ref
                .upgrade()
                .expect("the app outlives its own method calls");
            tasks.push(tokio::spawn(async move {
                manager.run(&extensions, &app).await;
            }));
        }

        {
            let manager = Arc::clone(&self.extension_manager);
            let spin_rx = self.spin_rx.lock().unwrap().take();
            if let Some(mut spin_rx) = spin_rx {
                tasks.push(tokio::spawn(async move {
                    while let Some(count) = spin_rx.recv().await {
                        manager.set_spinning(count > 0).await;
                    }
                }));
            }
        }
    }

    /// Runs the server until interrupted, then tears everything down in
    /// reverse load order.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        info!(server = %self.config.server_name, "flockwaved starting");
        self.start();

        tokio::signal::ctrl_c().await.map_err(ServerError::Io)?;
        info!("interrupt received, shutting down");

        self.shutdown().await;
        Ok(())
    }

    /// Orderly teardown: unloads every extension, then stops the service
    /// tasks.
    pub async fn shutdown(&self) {
        self.extension_manager.teardown().await;
        for task in self.service_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Schedules a future on the extension manager's supervised task set.
    pub async fn run_in_background(
        &self,
        future: BoxFuture<'static, ()>,
    ) -> Result<AbortHandle, ExtensionError> {
        self.extension_manager.run_in_background(future).await
    }

    /// Opens the connection with back-off retries and runs `task` against
    /// it; when the task fails, the connection is reopened and the task
    /// restarted. Returns when the task completes cleanly.
    pub async fn supervise<F, Fut>(
        &self,
        connection: Arc<dyn Connection>,
        task: F,
    ) -> io::Result<()>
    where
        F: Fn(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let mut backoff = Duration::from_millis(500);
        loop {
            match connection.open().await {
                Ok(()) => {
                    backoff = Duration::from_millis(500);
                    let result = task(Arc::clone(&connection)).await;
                    let _ = connection.close().await;
                    match result {
                        Ok(()) => return Ok(()),
                        Err(error) => {
                            warn!(error = %error, "supervised task failed, restarting");
                        }
                    }
                }
                Err(error) => {
                    warn!(error = %error, "failed to open supervised connection");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    /// Runs a transport server, restarting it when it crashes: at most
    /// `SERVER_MAX_RETRIES` times in quick succession, with the counter
    /// reset once the most recent crash is older than `SERVER_RETRY_RESET`.
    pub async fn run_server_with_retries<F>(&self, name: &str, server: F)
    where
        F: Fn() -> BoxFuture<'static, io::Result<()>>,
    {
        let mut retries = 0u32;
        let mut last_crash = tokio::time::Instant::now();
        loop {
            match server().await {
                Ok(()) => {
                    info!(server = name, "transport server exited cleanly");
                    return;
                }
                Err(error) => {
                    let now = tokio::time::Instant::now();
                    if now.duration_since(last_crash) > SERVER_RETRY_RESET {
                        retries = 0;
                    }
                    last_crash = now;
                    retries += 1;
                    if retries > SERVER_MAX_RETRIES {
                        error!(server = name, error = %error,
                            "transport server keeps crashing, giving up");
                        return;
                    }
                    warn!(server = name, error = %error, attempt = retries,
                        "transport server crashed, restarting");
                }
            }
        }
    }
}
