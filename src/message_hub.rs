//! The message hub: validates, routes, batches and broadcasts Flockwave
//! messages between clients, handlers and extensions.
//!
//! Handlers are registered per message type (or as wildcards) and are all
//! given a chance to handle each incoming message; specific handlers run
//! before wildcard ones, in registration order. Outbound messages go
//! through a bounded queue; a dispatcher task spawns one child task per
//! outbound request so a slow client only delays its own messages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::MessageError;
use crate::model::client::Client;
use crate::model::message::{
    validate_envelope, FlockwaveMessage, FlockwaveResponse, MessageBuilder,
};
use crate::registries::channels::Broadcaster;
use crate::registries::{ChannelTypeRegistry, ClientRegistry};
use crate::signals::SignalBinding;

/// Capacity of the outbound message queue.
const QUEUE_CAPACITY: usize = 4096;

/// Message types whose broadcast logging is demoted to debug level; these
/// flow several times a second on a busy server.
const CHATTY_TYPES: [&str; 2] = ["UAV-INF", "DEV-INF"];

const NO_HANDLER_REASON: &str = "No handler managed to parse this message in the server";

/// What a handler decided about a message.
pub enum HandlerOutcome {
    /// Handled; nothing to send.
    Handled,
    /// Not handled; the next handler gets a try.
    NotHandled,
    /// Handled; wrap this body in a response envelope to the sender.
    Body(Map<String, Value>),
    /// Handled; send this already-built response as-is.
    Response(FlockwaveResponse),
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<HandlerOutcome, HandlerError>;

/// A registered message handler.
pub type MessageHandler = Arc<
    dyn Fn(Arc<FlockwaveMessage>, Arc<Client>, Arc<MessageHub>) -> BoxFuture<'static, HandlerResult>
        + Send
        + Sync,
>;

/// Wraps an async closure into a `MessageHandler`.
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Arc<FlockwaveMessage>, Arc<Client>, Arc<MessageHub>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |message, sender, hub| Box::pin(f(message, sender, hub)))
}

/// Token for unregistering a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// Recipient of an outbound message.
#[derive(Clone)]
pub enum Recipient {
    Id(String),
    Client(Arc<Client>),
}

impl From<&Arc<Client>> for Recipient {
    fn from(client: &Arc<Client>) -> Self {
        Recipient::Client(Arc::clone(client))
    }
}

struct OutboundRequest {
    message: FlockwaveMessage,
    /// `None` means broadcast.
    to: Option<Recipient>,
    /// Id of the message this one responds to, for logging.
    in_response_to: Option<String>,
}

#[derive(Default)]
struct HandlerTable {
    by_type: HashMap<Option<String>, Vec<(u64, MessageHandler)>>,
    next_id: u64,
}

enum BroadcastMethod {
    Broadcaster(Broadcaster),
    Direct(String),
}

/// Central router for Flockwave messages.
pub struct MessageHub {
    /// Back-reference handed to handlers; valid as long as the hub lives.
    self_ref: Weak<MessageHub>,
    builder: MessageBuilder,
    handlers: Mutex<HandlerTable>,
    queue_tx: mpsc::Sender<OutboundRequest>,
    queue_rx: Mutex<Option<mpsc::Receiver<OutboundRequest>>>,
    broadcast_methods: Mutex<Option<Arc<Vec<BroadcastMethod>>>>,
    client_registry: OnceLock<Arc<ClientRegistry>>,
    channel_type_registry: OnceLock<Arc<ChannelTypeRegistry>>,
    bindings: Mutex<Vec<SignalBinding>>,
}

impl MessageHub {
    pub fn new() -> Arc<Self> {
        Self::with_builder(MessageBuilder::new())
    }

    pub fn with_builder(builder: MessageBuilder) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            builder,
            handlers: Mutex::new(HandlerTable::default()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            broadcast_methods: Mutex::new(None),
            client_registry: OnceLock::new(),
            channel_type_registry: OnceLock::new(),
            bindings: Mutex::new(Vec::new()),
        })
    }

    fn strong_ref(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("the hub outlives its own method calls")
    }

    /// Attaches the registries the hub needs for broadcasting. The cached
    /// broadcast-method set is invalidated whenever either registry
    /// changes.
    pub fn attach_registries(
        &self,
        clients: Arc<ClientRegistry>,
        channel_types: Arc<ChannelTypeRegistry>,
    ) {
        let mut bindings = self.bindings.lock().unwrap();

        let signals = [
            clients.added().clone(),
            clients.removed().clone(),
        ];
        for signal in signals {
            let hub = self.self_ref.clone();
            bindings.push(signal.connect(move |_| {
                if let Some(hub) = hub.upgrade() {
                    hub.invalidate_broadcast_methods();
                }
            }));
        }
        let signals = [
            channel_types.added().clone(),
            channel_types.removed().clone(),
        ];
        for signal in signals {
            let hub = self.self_ref.clone();
            bindings.push(signal.connect(move |_| {
                if let Some(hub) = hub.upgrade() {
                    hub.invalidate_broadcast_methods();
                }
            }));
        }

        let _ = self.client_registry.set(clients);
        let _ = self.channel_type_registry.set(channel_types);
    }

    pub fn builder(&self) -> &MessageBuilder {
        &self.builder
    }

    // ── Message construction ────────────────────────────────

    /// Builds a positive or negative acknowledgment of the given message.
    pub fn acknowledge(
        &self,
        message: &FlockwaveMessage,
        outcome: bool,
        reason: Option<&str>,
    ) -> FlockwaveResponse {
        let mut body = Map::new();
        body.insert(
            "type".into(),
            Value::String(if outcome { "ACK-ACK" } else { "ACK-NAK" }.into()),
        );
        if !outcome {
            if let Some(reason) = reason {
                body.insert("reason".into(), Value::String(reason.to_owned()));
            }
        }
        self.builder.create_response_to(message, body)
    }

    pub fn create_notification(&self, body: Map<String, Value>) -> FlockwaveMessage {
        self.builder.create_notification(body)
    }

    pub fn create_response_to(
        &self,
        message: &FlockwaveMessage,
        body: Map<String, Value>,
    ) -> FlockwaveResponse {
        self.builder.create_response_to(message, body)
    }

    pub fn create_response_or_notification(
        &self,
        body: Map<String, Value>,
        in_response_to: Option<&FlockwaveMessage>,
    ) -> FlockwaveMessage {
        self.builder.create_response_or_notification(body, in_response_to)
    }

    // ── Handler registration ────────────────────────────────

    /// Registers a handler for the given message types. The same handler
    /// may be registered multiple times, even for the same type.
    pub fn register_handler(&self, message_types: &[&str], handler: MessageHandler) -> HandlerId {
        let mut table = self.handlers.lock().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        for message_type in message_types {
            table
                .by_type
                .entry(Some((*message_type).to_owned()))
                .or_default()
                .push((id, Arc::clone(&handler)));
        }
        HandlerId(id)
    }

    /// Registers a handler that is consulted for every message type,
    /// after the type-specific handlers.
    pub fn register_wildcard_handler(&self, handler: MessageHandler) -> HandlerId {
        let mut table = self.handlers.lock().unwrap();
        let id = table.next_id;
        table.next_id += 1;
        table.by_type.entry(None).or_default().push((id, handler));
        HandlerId(id)
    }

    pub fn unregister_handler(&self, id: HandlerId) {
        let mut table = self.handlers.lock().unwrap();
        for handlers in table.by_type.values_mut() {
            handlers.retain(|(handler_id, _)| *handler_id != id.0);
        }
    }

    // ── Outbound path ───────────────────────────────────────

    /// Sends a message to the given client, waiting for queue capacity.
    pub async fn send_message(
        &self,
        message: FlockwaveMessage,
        to: Recipient,
        in_response_to: Option<&FlockwaveMessage>,
    ) -> Result<(), MessageError> {
        self.queue_tx
            .send(OutboundRequest {
                message,
                to: Some(to),
                in_response_to: in_response_to.map(|message| message.id.clone()),
            })
            .await
            .map_err(|_| MessageError::NotRunning)
    }

    /// Broadcasts a notification to every connected client, waiting for
    /// queue capacity. Only notifications may be broadcast.
    pub async fn broadcast_message(&self, message: FlockwaveMessage) -> Result<(), MessageError> {
        if message.is_response() {
            return Err(MessageError::Validation(
                "only notifications may be broadcast".into(),
            ));
        }
        self.queue_tx
            .send(OutboundRequest {
                message,
                to: None,
                in_response_to: None,
            })
            .await
            .map_err(|_| MessageError::NotRunning)
    }

    /// Non-blocking variant of `send_message`; drops the message with a
    /// log warning when the queue is full.
    pub fn enqueue_message(
        &self,
        message: FlockwaveMessage,
        to: Recipient,
    ) -> Result<(), MessageError> {
        self.try_enqueue(OutboundRequest {
            message,
            to: Some(to),
            in_response_to: None,
        })
    }

    /// Non-blocking variant of `broadcast_message`.
    pub fn enqueue_broadcast_message(
        &self,
        message: FlockwaveMessage,
    ) -> Result<(), MessageError> {
        if message.is_response() {
            return Err(MessageError::Validation(
                "only notifications may be broadcast".into(),
            ));
        }
        self.try_enqueue(OutboundRequest {
            message,
            to: None,
            in_response_to: None,
        })
    }

    fn try_enqueue(&self, request: OutboundRequest) -> Result<(), MessageError> {
        match self.queue_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(
                    r#type = request.message.message_type(),
                    "outbound message queue full, dropping message"
                );
                Err(MessageError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MessageError::NotRunning),
        }
    }

    /// Dispatcher task: reads the outbound queue and spawns one child
    /// task per request. Runs until the hub is dropped.
    pub async fn run(self: Arc<Self>) -> Result<(), MessageError> {
        let mut queue_rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(MessageError::NotRunning)?;

        let mut senders: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                request = queue_rx.recv() => match request {
                    Some(request) => {
                        let hub = Arc::clone(&self);
                        senders.spawn(async move { hub.dispatch_outbound(request).await });
                    }
                    None => break,
                },
                Some(_) = senders.join_next(), if !senders.is_empty() => {}
            }
        }
        Ok(())
    }

    async fn dispatch_outbound(self: Arc<Self>, request: OutboundRequest) {
        match request.to {
            Some(recipient) => {
                self.log_message_sending(&request.message, true, request.in_response_to.as_deref());
                self.send_to_recipient(&request.message, recipient).await;
            }
            None => self.broadcast_now(&request.message).await,
        }
    }

    async fn send_to_recipient(&self, message: &FlockwaveMessage, recipient: Recipient) {
        let client = match recipient {
            Recipient::Client(client) => Some(client),
            Recipient::Id(id) => {
                let found = self
                    .client_registry
                    .get()
                    .and_then(|registry| registry.find_by_id(&id));
                if found.is_none() {
                    warn!(id = %id, "client is gone, not sending message");
                }
                found
            }
        };
        if let Some(client) = client {
            if let Err(error) = client.channel().send(message).await {
                warn!(id = %client.id(), error = %error, "failed to send message to client");
            }
        }
    }

    async fn broadcast_now(&self, message: &FlockwaveMessage) {
        let methods = self.committed_broadcast_methods();
        if methods.is_empty() {
            return;
        }
        self.log_message_sending(message, false, None);
        for method in methods.iter() {
            match method {
                BroadcastMethod::Broadcaster(broadcaster) => broadcaster(message.clone()).await,
                BroadcastMethod::Direct(client_id) => {
                    self.send_to_recipient(message, Recipient::Id(client_id.clone()))
                        .await;
                }
            }
        }
    }

    /// Lazily recomputed set of methods used to broadcast one message:
    /// the broadcaster of every channel type that has one and at least one
    /// connected client, plus one direct send per client of the channel
    /// types without a broadcaster.
    fn committed_broadcast_methods(&self) -> Arc<Vec<BroadcastMethod>> {
        let mut cache = self.broadcast_methods.lock().unwrap();
        if cache.is_none() {
            *cache = Some(Arc::new(self.compute_broadcast_methods()));
        }
        // Shared handle so the lock is not held across the sends.
        Arc::clone(cache.as_ref().unwrap())
    }

    fn compute_broadcast_methods(&self) -> Vec<BroadcastMethod> {
        let (Some(clients), Some(channel_types)) = (
            self.client_registry.get(),
            self.channel_type_registry.get(),
        ) else {
            return Vec::new();
        };

        let mut result = Vec::new();
        for channel_type_id in channel_types.ids() {
            let Some(descriptor) = channel_types.find_by_id(&channel_type_id) else {
                continue;
            };
            match &descriptor.broadcaster {
                Some(broadcaster) => {
                    if clients.has_clients_for_channel_type(&channel_type_id) {
                        result.push(BroadcastMethod::Broadcaster(Arc::clone(broadcaster)));
                    }
                }
                None => {
                    for client_id in clients.client_ids_for_channel_type(&channel_type_id) {
                        result.push(BroadcastMethod::Direct(client_id));
                    }
                }
            }
        }
        result
    }

    fn invalidate_broadcast_methods(&self) {
        *self.broadcast_methods.lock().unwrap() = None;
    }

    fn log_message_sending(
        &self,
        message: &FlockwaveMessage,
        targeted: bool,
        in_response_to: Option<&str>,
    ) {
        let message_type = message.message_type();
        if let Some(request_id) = in_response_to {
            info!(r#type = message_type, id = request_id, "sending response");
        } else if CHATTY_TYPES.contains(&message_type) {
            debug!(r#type = message_type, id = %message.id, "sending notification");
        } else if targeted {
            info!(r#type = message_type, id = %message.id, "sending notification");
        } else {
            info!(r#type = message_type, id = %message.id, "broadcasting notification");
        }
    }

    // ── Incoming path ───────────────────────────────────────

    /// Handles a raw incoming JSON payload from the given client.
    ///
    /// Returns whether the message was handled by at least one handler or
    /// internally by the hub itself.
    pub async fn handle_incoming_message(&self, raw: Value, sender: &Arc<Client>) -> bool {
        let message = match validate_envelope(&raw) {
            Ok(message) => Arc::new(message),
            Err(error) => {
                warn!(error = %error, "rejecting invalid incoming message");
                if let Some(id) = raw.get("id").and_then(Value::as_str) {
                    let nak = self.negative_acknowledgment_of_raw(id, &error.to_string());
                    let _ = self
                        .send_message(nak.message, Recipient::from(sender), None)
                        .await;
                    return true;
                }
                return false;
            }
        };

        if message.body.contains_key("error") {
            warn!(id = %message.id, "error message from client silently dropped");
            return true;
        }

        info!(
            r#type = message.message_type(),
            id = %message.id,
            sender = %sender.id(),
            "received message"
        );

        let handled = self.feed_message_to_handlers(&message, sender).await;
        if !handled {
            warn!(r#type = message.message_type(), id = %message.id, "unhandled message");
            let nak = self.acknowledge(&message, false, Some(NO_HANDLER_REASON));
            let _ = self
                .send_message(nak.message, Recipient::from(sender), Some(message.as_ref()))
                .await;
            return false;
        }
        true
    }

    /// Builds an `ACK-NAK` for a payload that failed validation but still
    /// carried an id to correlate with.
    fn negative_acknowledgment_of_raw(&self, id: &str, reason: &str) -> FlockwaveResponse {
        let stub = FlockwaveMessage {
            version: crate::model::message::PROTOCOL_VERSION.to_owned(),
            id: id.to_owned(),
            correlation_id: None,
            body: Map::new(),
        };
        self.acknowledge(&stub, false, Some(reason))
    }

    async fn feed_message_to_handlers(
        &self,
        message: &Arc<FlockwaveMessage>,
        sender: &Arc<Client>,
    ) -> bool {
        let handlers: Vec<MessageHandler> = {
            let table = self.handlers.lock().unwrap();
            let specific = table
                .by_type
                .get(&Some(message.message_type().to_owned()))
                .into_iter()
                .flatten();
            let wildcard = table.by_type.get(&None).into_iter().flatten();
            specific
                .chain(wildcard)
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let hub = self.strong_ref();
        let mut handled = false;
        for handler in handlers {
            let outcome = handler(Arc::clone(message), Arc::clone(sender), Arc::clone(&hub)).await;

            match outcome {
                Ok(HandlerOutcome::Handled) => handled = true,
                Ok(HandlerOutcome::NotHandled) => {}
                Ok(HandlerOutcome::Body(body)) => {
                    let response = self.builder.create_response_to(message, body);
                    let _ = self
                        .send_message(
                            response.message,
                            Recipient::from(sender),
                            Some(message.as_ref()),
                        )
                        .await;
                    handled = true;
                }
                Ok(HandlerOutcome::Response(response)) => {
                    debug_assert_eq!(
                        response.correlation_id.as_deref(),
                        Some(message.id.as_str())
                    );
                    let _ = self
                        .send_message(
                            response.message,
                            Recipient::from(sender),
                            Some(message.as_ref()),
                        )
                        .await;
                    handled = true;
                }
                Err(handler_error) => {
                    error!(
                        r#type = message.message_type(),
                        id = %message.id,
                        error = %handler_error,
                        "error in message handler, proceeding with next handler"
                    );
                }
            }
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::client::testing::RecordingChannel;
    use crate::registries::channels::ChannelTypeDescriptor;
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn body_value(kind: &str) -> Value {
        json!({ "type": kind })
    }

    fn request(kind: &str, id: &str) -> Value {
        json!({ "$fw.version": "1.0", "id": id, "body": body_value(kind) })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    struct Fixture {
        hub: Arc<MessageHub>,
        clients: Arc<ClientRegistry>,
        channel_types: Arc<ChannelTypeRegistry>,
        channel: Arc<RecordingChannel>,
        client: Arc<Client>,
    }

    fn fixture() -> Fixture {
        let hub = MessageHub::new();
        let clients = Arc::new(ClientRegistry::new());
        let channel_types = Arc::new(ChannelTypeRegistry::new());
        hub.attach_registries(Arc::clone(&clients), Arc::clone(&channel_types));

        channel_types.add(ChannelTypeDescriptor::new("test"));
        let channel = RecordingChannel::new();
        let client = Client::new("test:1", "test", channel.clone());
        clients.add(Arc::clone(&client));

        tokio::spawn(Arc::clone(&hub).run());
        Fixture {
            hub,
            clients,
            channel_types,
            channel,
            client,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handler_body_becomes_a_response() {
        let fx = fixture();
        fx.hub.register_handler(
            &["CLK-LIST"],
            handler(|_message, _sender, _hub| async move {
                let mut body = Map::new();
                body.insert("ids".into(), json!(["system"]));
                Ok(HandlerOutcome::Body(body))
            }),
        );

        assert!(
            fx.hub
                .handle_incoming_message(request("CLK-LIST", "1"), &fx.client)
                .await
        );
        settle().await;

        let sent = fx.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].correlation_id.as_deref(), Some("1"));
        assert_eq!(sent[0].message_type(), "CLK-LIST");
        assert_eq!(sent[0].body["ids"], json!(["system"]));
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_messages_get_a_nak() {
        let fx = fixture();

        assert!(
            !fx.hub
                .handle_incoming_message(request("XYZ-QUERY", "7"), &fx.client)
                .await
        );
        settle().await;

        let sent = fx.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), "ACK-NAK");
        assert_eq!(sent[0].correlation_id.as_deref(), Some("7"));
        assert_eq!(sent[0].body["reason"], json!(NO_HANDLER_REASON));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_message_with_id_gets_a_nak() {
        let fx = fixture();

        assert!(
            fx.hub
                .handle_incoming_message(json!({"id": "3", "body": {}}), &fx.client)
                .await
        );
        settle().await;

        let sent = fx.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), "ACK-NAK");
        assert_eq!(sent[0].correlation_id.as_deref(), Some("3"));
        assert!(!sent[0].body["reason"].as_str().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_message_without_id_is_dropped() {
        let fx = fixture();
        assert!(
            !fx.hub
                .handle_incoming_message(json!({"body": {"type": "CLK-LIST"}}), &fx.client)
                .await
        );
        settle().await;
        assert!(fx.channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_payloads_are_dropped() {
        let fx = fixture();
        let handled = fx
            .hub
            .handle_incoming_message(
                json!({
                    "id": "9",
                    "body": { "type": "ACK-NAK", "error": "bogus" }
                }),
                &fx.client,
            )
            .await;
        assert!(handled);
        settle().await;
        assert!(fx.channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_does_not_stop_the_chain() {
        let fx = fixture();
        fx.hub.register_handler(
            &["SYS-VER"],
            handler(|_message, _sender, _hub| async move {
                Err::<HandlerOutcome, HandlerError>("boom".into())
            }),
        );
        fx.hub
            .register_wildcard_handler(handler(|_message, _sender, _hub| async move {
                Ok(HandlerOutcome::Handled)
            }));

        assert!(
            fx.hub
                .handle_incoming_message(request("SYS-VER", "2"), &fx.client)
                .await
        );
        settle().await;
        assert!(fx.channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn specific_handlers_run_before_wildcards_and_all_run() {
        let fx = fixture();
        let order = Arc::new(Mutex::new(Vec::new()));

        let wildcard_order = Arc::clone(&order);
        fx.hub
            .register_wildcard_handler(handler(move |_message, _sender, _hub| {
                let order = Arc::clone(&wildcard_order);
                async move {
                    order.lock().unwrap().push("wildcard");
                    Ok(HandlerOutcome::Handled)
                }
            }));
        let specific_order = Arc::clone(&order);
        fx.hub.register_handler(
            &["SYS-VER"],
            handler(move |_message, _sender, _hub| {
                let order = Arc::clone(&specific_order);
                async move {
                    order.lock().unwrap().push("specific");
                    Ok(HandlerOutcome::Handled)
                }
            }),
        );

        fx.hub
            .handle_incoming_message(request("SYS-VER", "4"), &fx.client)
            .await;
        assert_eq!(*order.lock().unwrap(), vec!["specific", "wildcard"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_handlers_are_not_called() {
        let fx = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler_calls = Arc::clone(&calls);
        let id = fx.hub.register_handler(
            &["SYS-VER"],
            handler(move |_message, _sender, _hub| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerOutcome::Handled)
                }
            }),
        );

        fx.hub
            .handle_incoming_message(request("SYS-VER", "5"), &fx.client)
            .await;
        fx.hub.unregister_handler(id);
        fx.hub
            .handle_incoming_message(request("SYS-VER", "6"), &fx.client)
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_drops_when_full() {
        // No dispatcher: build a hub but never call run().
        let hub = MessageHub::new();
        let mut delivered = 0usize;
        let mut dropped = 0usize;
        for _ in 0..5000 {
            let notification = hub.create_notification(
                json!({ "type": "SYS-MSG" }).as_object().unwrap().clone(),
            );
            match hub.enqueue_broadcast_message(notification) {
                Ok(()) => delivered += 1,
                Err(MessageError::QueueFull) => dropped += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(delivered, QUEUE_CAPACITY);
        assert_eq!(dropped, 5000 - QUEUE_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_uses_broadcaster_when_clients_exist() {
        let fx = fixture();

        let broadcasts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&broadcasts);
        fx.channel_types.add(
            ChannelTypeDescriptor::new("bulk").with_broadcaster(Arc::new(move |_message| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })),
        );

        // No clients on "bulk" yet: the broadcaster must not be used, and
        // the "test" client is reached directly.
        let note = fx
            .hub
            .create_notification(json!({"type": "SYS-MSG"}).as_object().unwrap().clone());
        fx.hub.broadcast_message(note).await.unwrap();
        settle().await;
        assert_eq!(broadcasts.load(Ordering::SeqCst), 0);
        assert_eq!(fx.channel.sent.lock().unwrap().len(), 1);

        // Connect a client over "bulk": the cache is invalidated and the
        // broadcaster joins the set.
        let bulk_client = Client::new("bulk:1", "bulk", RecordingChannel::new());
        fx.clients.add(bulk_client);
        let note = fx
            .hub
            .create_notification(json!({"type": "SYS-MSG"}).as_object().unwrap().clone());
        fx.hub.broadcast_message(note).await.unwrap();
        settle().await;
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);

        // Removing every client empties the broadcast set again.
        fx.clients.remove("bulk:1");
        fx.clients.remove("test:1");
        let note = fx
            .hub
            .create_notification(json!({"type": "SYS-MSG"}).as_object().unwrap().clone());
        fx.hub.broadcast_message(note).await.unwrap();
        settle().await;
        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
        assert_eq!(fx.channel.sent.lock().unwrap().len(), 2);
    }
}
