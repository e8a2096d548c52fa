//! WebSocket transport extension.
//!
//! Flow per connection:
//! 1. Accept the WS upgrade on `/ws`
//! 2. Assign a `ws:`-prefixed client id, register the client
//! 3. Reader loop: parse JSON frames, feed them to the message hub
//! 4. Writer task: drain the per-client outbound queue into the socket
//! 5. On disconnect: deregister the client, tear down the writer
//!
//! Also serves `/healthz` as a liveness probe.

use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::App;
use crate::error::ExtensionError;
use crate::model::client::{Client, CommunicationChannel};
use crate::model::message::FlockwaveMessage;
use crate::networking::get_all_ipv4_addresses;
use crate::registries::channels::ChannelTypeDescriptor;

use super::{Extension, ExtensionContext};

/// Id of the channel type this extension registers.
pub const CHANNEL_TYPE_ID: &str = "ws";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5000;

type ChannelMap = Arc<DashMap<String, mpsc::UnboundedSender<FlockwaveMessage>>>;

/// Per-client outbound channel: pushes messages into the queue drained by
/// the client's writer task.
struct WsChannel {
    tx: mpsc::UnboundedSender<FlockwaveMessage>,
}

impl CommunicationChannel for WsChannel {
    fn send(&self, message: &FlockwaveMessage) -> BoxFuture<'_, io::Result<()>> {
        let result = self
            .tx
            .send(message.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client queue closed"));
        async move { result }.boxed()
    }
}

#[derive(Clone)]
struct WsServerState {
    app: Arc<App>,
    channels: ChannelMap,
}

pub struct WsExtension {
    channels: ChannelMap,
    registered: Mutex<bool>,
}

impl Default for WsExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl WsExtension {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            registered: Mutex::new(false),
        }
    }
}

fn host_of(config: &Value) -> String {
    config
        .get("host")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_HOST)
        .to_owned()
}

fn port_of(config: &Value) -> u16 {
    config
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Picks the local address to advertise to the given peer: the configured
/// host when it is concrete, otherwise the local interface closest to the
/// peer (same /24, then any non-loopback one).
fn advertised_address(host: &str, peer: IpAddr) -> Option<String> {
    if host != "0.0.0.0" && host != "::" {
        return Some(host.to_owned());
    }
    let addresses = get_all_ipv4_addresses().ok()?;
    if let IpAddr::V4(peer) = peer {
        let same_subnet = addresses.iter().find(|address| {
            address.octets()[..3] == peer.octets()[..3]
        });
        if let Some(address) = same_subnet {
            return Some(address.to_string());
        }
    }
    addresses
        .iter()
        .find(|address| !address.is_loopback())
        .or(addresses.first())
        .map(|address| address.to_string())
}

impl Extension for WsExtension {
    fn description(&self) -> &'static str {
        "WebSocket transport for Flockwave clients"
    }

    fn load(&self, ctx: &ExtensionContext) -> Result<(), ExtensionError> {
        let host = host_of(&ctx.config);
        let port = port_of(&ctx.config);

        let broadcaster = {
            let channels = Arc::clone(&self.channels);
            Arc::new(move |message: FlockwaveMessage| {
                let channels = Arc::clone(&channels);
                async move {
                    for entry in channels.iter() {
                        let _ = entry.value().send(message.clone());
                    }
                }
                .boxed()
            })
        };

        let factory = {
            let channels = Arc::clone(&self.channels);
            Arc::new(move |client_id: &str| {
                channels.get(client_id).map(|entry| {
                    Arc::new(WsChannel {
                        tx: entry.value().clone(),
                    }) as Arc<dyn CommunicationChannel>
                })
            })
        };

        let ssdp_location = Arc::new(move |peer: IpAddr| {
            advertised_address(&host, peer)
                .map(|address| format!("http://{address}:{port}/ws"))
        });

        ctx.app.channel_type_registry().add(
            ChannelTypeDescriptor::new(CHANNEL_TYPE_ID)
                .with_factory(factory)
                .with_broadcaster(broadcaster)
                .with_ssdp_location(ssdp_location),
        );
        *self.registered.lock().unwrap() = true;
        Ok(())
    }

    fn run(&self, ctx: &ExtensionContext) -> Option<BoxFuture<'static, ()>> {
        let app = Arc::clone(&ctx.app);
        let channels = Arc::clone(&self.channels);
        let listen_addr = format!("{}:{}", host_of(&ctx.config), port_of(&ctx.config));

        Some(
            async move {
                let state = WsServerState {
                    app: Arc::clone(&app),
                    channels,
                };
                let router = Router::new()
                    .route("/ws", get(ws_handler))
                    .route("/healthz", get(healthz))
                    .layer(TraceLayer::new_for_http())
                    .with_state(state);

                app.run_server_with_retries("ws", move || {
                    let router = router.clone();
                    let listen_addr = listen_addr.clone();
                    async move {
                        let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
                        info!(addr = %listen_addr, "WebSocket transport listening");
                        axum::serve(listener, router).await?;
                        Ok(())
                    }
                    .boxed()
                })
                .await;
            }
            .boxed(),
        )
    }

    fn unload(&self, app: &Arc<App>) {
        if std::mem::take(&mut *self.registered.lock().unwrap()) {
            app.channel_type_registry().remove(CHANNEL_TYPE_ID);
        }
        self.channels.clear();
    }
}

/// Liveness probe.
async fn healthz() -> &'static str {
    "ok"
}

/// Axum handler for GET /ws — upgrades to WebSocket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection loop.
async fn handle_socket(socket: WebSocket, state: WsServerState) {
    let client_id = format!("ws:{}", Uuid::new_v4());
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<FlockwaveMessage>();
    state.channels.insert(client_id.clone(), tx.clone());

    let client = Client::new(client_id.clone(), CHANNEL_TYPE_ID, Arc::new(WsChannel { tx }));
    state.app.client_registry().add(Arc::clone(&client));

    // Writer: one task per client so a slow socket only delays itself.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(raw) => {
                    state
                        .app
                        .message_hub()
                        .handle_incoming_message(raw, &client)
                        .await;
                }
                Err(error) => {
                    warn!(id = %client_id, error = %error, "dropping unparseable frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => { /* binary/ping/pong ignored; axum auto-pongs */ }
            Err(error) => {
                warn!(id = %client_id, error = %error, "ws receive error");
                break;
            }
        }
    }

    state.app.client_registry().remove(&client_id);
    state.channels.remove(&client_id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_hosts_are_advertised_as_is() {
        let address = advertised_address("192.168.1.5", "10.0.0.1".parse().unwrap());
        assert_eq!(address.as_deref(), Some("192.168.1.5"));
    }

    #[test]
    fn config_defaults() {
        let config = serde_json::json!({});
        assert_eq!(host_of(&config), DEFAULT_HOST);
        assert_eq!(port_of(&config), DEFAULT_PORT);

        let config = serde_json::json!({ "host": "127.0.0.1", "port": 7777 });
        assert_eq!(host_of(&config), "127.0.0.1");
        assert_eq!(port_of(&config), 7777);
    }
}
