//! End-to-end scenarios: a full application with a stub transport, driven
//! through the public API.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use flockwaved::app::App;
use flockwaved::config::Config;
use flockwaved::connections::{Connection, ConnectionState, DummyConnection, ReconnectionWrapper};
use flockwaved::error::ExtensionError;
use flockwaved::ext::{Extension, ExtensionContext, ExtensionManager, ExtensionTable};
use flockwaved::model::client::{Client, CommunicationChannel};
use flockwaved::model::message::FlockwaveMessage;
use flockwaved::registries::channels::ChannelTypeDescriptor;

/// Transport stub: records everything the server sends to the client.
struct RecordingChannel {
    sent: Mutex<Vec<FlockwaveMessage>>,
}

impl RecordingChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn take(&self) -> Vec<FlockwaveMessage> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

impl CommunicationChannel for RecordingChannel {
    fn send(&self, message: &FlockwaveMessage) -> BoxFuture<'_, io::Result<()>> {
        let message = message.clone();
        async move {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
        .boxed()
    }
}

struct Harness {
    app: Arc<App>,
    client: Arc<Client>,
    channel: Arc<RecordingChannel>,
}

/// Builds a started app with the given extensions enabled and one stub
/// client connected.
async fn harness(extensions: &[(&str, Value)]) -> Harness {
    let mut config = Config::default();
    config.extensions.clear();
    for (name, extension_config) in extensions {
        config
            .extensions
            .insert((*name).to_owned(), extension_config.clone());
    }

    let app = App::new(config);
    app.start();

    // Let the extension manager finish loading.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let loaded = app.extension_manager().loaded_extensions();
        if extensions.iter().all(|(name, _)| loaded.contains(&(*name).to_owned())) {
            break;
        }
    }

    app.channel_type_registry()
        .add(ChannelTypeDescriptor::new("test"));
    let channel = RecordingChannel::new();
    let client = Client::new("test:1", "test", channel.clone());
    app.client_registry().add(Arc::clone(&client));

    Harness {
        app,
        client,
        channel,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Sends one request and returns the responses correlated to it, ignoring
/// any notifications broadcast in between.
async fn roundtrip(harness: &Harness, request: Value) -> Vec<FlockwaveMessage> {
    let request_id = request
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    harness.channel.take();
    harness
        .app
        .message_hub()
        .handle_incoming_message(request, &harness.client)
        .await;
    settle().await;
    harness
        .channel
        .take()
        .into_iter()
        .filter(|message| message.correlation_id.as_deref() == request_id.as_deref())
        .collect()
}

// ── Scenario A ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn clk_list_reports_the_system_clock() {
    let fx = harness(&[("clocks", json!({}))]).await;

    let responses = roundtrip(
        &fx,
        json!({ "$fw.version": "1.0", "id": "1", "body": { "type": "CLK-LIST" } }),
    )
    .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].correlation_id.as_deref(), Some("1"));
    assert_eq!(responses[0].message_type(), "CLK-LIST");
    assert_eq!(responses[0].body["ids"], json!(["system"]));

    fx.app.shutdown().await;
}

// ── Scenario B ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn uav_inf_reports_partial_failures() {
    let fx = harness(&[(
        "virtual_uavs",
        json!({ "count": 1, "id_format": "X" }),
    )])
    .await;

    let responses = roundtrip(
        &fx,
        json!({ "id": "2", "body": { "type": "UAV-INF", "ids": ["X", "Y"] } }),
    )
    .await;

    assert_eq!(responses.len(), 1);
    let body = &responses[0].body;
    assert!(body["status"].as_object().unwrap().contains_key("X"));
    assert_eq!(body["failure"], json!(["Y"]));
    assert_eq!(body["reasons"]["Y"], json!("No such UAV"));

    fx.app.shutdown().await;
}

// ── Scenario C ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn malformed_messages_are_nakked() {
    let fx = harness(&[]).await;

    let responses = roundtrip(&fx, json!({ "id": "3", "body": {} })).await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].message_type(), "ACK-NAK");
    assert_eq!(responses[0].correlation_id.as_deref(), Some("3"));
    assert!(!responses[0].body["reason"].as_str().unwrap().is_empty());

    fx.app.shutdown().await;
}

// ── Scenario D ──────────────────────────────────────────────

struct NamedExtension {
    dependencies: &'static [&'static str],
}

impl Extension for NamedExtension {
    fn dependencies(&self) -> &'static [&'static str] {
        self.dependencies
    }

    fn load(&self, _ctx: &ExtensionContext) -> Result<(), ExtensionError> {
        Ok(())
    }
}

fn chain_table() -> ExtensionTable {
    let mut table = ExtensionTable::new();
    for (name, dependencies) in [
        ("x", &["y"] as &'static [&'static str]),
        ("y", &["z"]),
        ("z", &[]),
    ] {
        table.insert(
            name.to_owned(),
            Arc::new(move || {
                Arc::new(NamedExtension { dependencies }) as Arc<dyn Extension>
            }),
        );
    }
    table
}

#[tokio::test]
async fn dependency_chains_load_and_unload_in_order() {
    let app = App::new(Config::default());
    let manager = ExtensionManager::new(chain_table());
    manager.set_app(&app);

    let loads = Arc::new(Mutex::new(Vec::new()));
    let unloads = Arc::new(Mutex::new(Vec::new()));
    let _on_loaded = {
        let loads = Arc::clone(&loads);
        manager
            .loaded_signal()
            .connect(move |event| loads.lock().unwrap().push(event.name.clone()))
    };
    let _on_unloaded = {
        let unloads = Arc::clone(&unloads);
        manager
            .unloaded_signal()
            .connect(move |event| unloads.lock().unwrap().push(event.name.clone()))
    };

    manager.load("x").await.unwrap();
    assert_eq!(*loads.lock().unwrap(), vec!["z", "y", "x"]);

    manager.unload("x").await.unwrap();
    assert_eq!(*unloads.lock().unwrap(), vec!["x"]);

    // z is still a dependency of the loaded y.
    assert!(matches!(
        manager.unload("z").await,
        Err(ExtensionError::InUse(_))
    ));
}

// ── Scenario E ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn wrapper_connects_after_transient_open_failures() {
    let inner = DummyConnection::new();
    inner.fail_next_opens(3);
    let wrapper = Arc::new(ReconnectionWrapper::new(Arc::clone(&inner)));

    let connects = Arc::new(AtomicUsize::new(0));
    let _binding = {
        let connects = Arc::clone(&connects);
        wrapper.events().connected.connect(move |_| {
            connects.fetch_add(1, Ordering::SeqCst);
        })
    };

    let started = tokio::time::Instant::now();
    wrapper.open().await.unwrap();

    // The first three attempts fail, one second apart; the wrapper keeps
    // reporting CONNECTING throughout.
    while started.elapsed() < Duration::from_millis(2900) {
        assert_eq!(wrapper.state(), ConnectionState::Connecting);
        tokio::time::sleep(Duration::from_millis(450)).await;
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(wrapper.state(), ConnectionState::Connected);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    wrapper.close().await.unwrap();
}

// ── Fake connections under supervision ──────────────────────

#[tokio::test(start_paused = true)]
async fn fake_connections_recover_from_drops() {
    let fx = harness(&[(
        "fake_connections",
        json!({ "count": 2, "drop_interval": 1.0 }),
    )])
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let responses = roundtrip(
        &fx,
        json!({
            "id": "10",
            "body": { "type": "CONN-INF", "ids": ["fake0", "fake1", "nope"] }
        }),
    )
    .await;

    assert_eq!(responses.len(), 1);
    let body = &responses[0].body;
    assert_eq!(body["status"]["fake0"]["status"], json!("connected"));
    assert_eq!(body["failure"], json!(["nope"]));

    // Let the links flap a few times; the supervisors must keep bringing
    // them back up.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let responses = roundtrip(
        &fx,
        json!({ "id": "11", "body": { "type": "CONN-INF", "ids": ["fake1"] } }),
    )
    .await;
    assert_eq!(responses[0].body["status"]["fake1"]["status"], json!("connected"));

    fx.app.shutdown().await;
}

// ── Extension management over the wire ──────────────────────

#[tokio::test(start_paused = true)]
async fn ext_messages_manage_extensions() {
    let fx = harness(&[("ext_manager", json!({})), ("clocks", json!({}))]).await;

    let responses = roundtrip(
        &fx,
        json!({ "id": "20", "body": { "type": "EXT-LIST" } }),
    )
    .await;
    let loaded = responses[0].body["loaded"].as_array().unwrap();
    assert!(loaded.contains(&json!("clocks")));
    assert!(loaded.contains(&json!("ext_manager")));

    // Unloading the manager itself is refused; unloading clocks works.
    let responses = roundtrip(
        &fx,
        json!({
            "id": "21",
            "body": { "type": "EXT-UNLOAD", "ids": ["ext_manager", "clocks"] }
        }),
    )
    .await;
    let body = &responses[0].body;
    assert_eq!(body["failure"], json!(["ext_manager"]));
    assert_eq!(body["reasons"]["ext_manager"], json!("Extension is protected"));
    assert!(body["status"].as_object().unwrap().contains_key("clocks"));
    assert!(!fx.app.extension_manager().is_loaded("clocks"));

    // CLK-LIST is gone now: the hub answers with a NAK.
    let responses = roundtrip(
        &fx,
        json!({ "id": "22", "body": { "type": "CLK-LIST" } }),
    )
    .await;
    assert_eq!(responses[0].message_type(), "ACK-NAK");

    // Load it back over the wire.
    let responses = roundtrip(
        &fx,
        json!({ "id": "23", "body": { "type": "EXT-LOAD", "ids": ["clocks"] } }),
    )
    .await;
    assert!(responses[0].body["status"]
        .as_object()
        .unwrap()
        .contains_key("clocks"));
    let responses = roundtrip(
        &fx,
        json!({ "id": "24", "body": { "type": "CLK-LIST" } }),
    )
    .await;
    assert_eq!(responses[0].body["ids"], json!(["system"]));

    fx.app.shutdown().await;
}

// ── Broadcasts from clock changes ───────────────────────────

#[tokio::test(start_paused = true)]
async fn clock_changes_are_broadcast() {
    let fx = harness(&[("clocks", json!({}))]).await;

    let api = fx
        .app
        .extension_manager()
        .import_api("clocks")
        .unwrap();
    assert!(api.loaded());
    let clocks = api
        .get::<flockwaved::ext::clocks::ClocksApi>()
        .unwrap();

    let system = clocks.registry().find_by_id("system").unwrap();
    system.events().started.emit(&());
    settle().await;

    let sent = fx.channel.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_type(), "CLK-INF");
    assert!(sent[0].correlation_id.is_none());
    assert!(sent[0].body["status"]
        .as_object()
        .unwrap()
        .contains_key("system"));

    fx.app.shutdown().await;
}
