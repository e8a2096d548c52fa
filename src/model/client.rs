//! A single client connected to the server and the channel that carries
//! messages back to it.

use std::io;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use super::message::FlockwaveMessage;

/// One direction of a client link: how the server pushes a Flockwave
/// message to that particular client. Implemented by each transport
/// extension (WebSocket, TCP, UDP, ...).
pub trait CommunicationChannel: Send + Sync {
    fn send(&self, message: &FlockwaveMessage) -> BoxFuture<'_, io::Result<()>>;
}

/// A client currently connected to the server.
///
/// Client ids are prefixed with the channel type that produced them
/// (`ws:...`, `tcp:...`), which keeps ids unique across transports.
pub struct Client {
    id: String,
    channel_type: String,
    channel: Arc<dyn CommunicationChannel>,
    user: Mutex<Option<String>>,
}

impl Client {
    pub fn new(
        id: impl Into<String>,
        channel_type: impl Into<String>,
        channel: Arc<dyn CommunicationChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            channel_type: channel_type.into(),
            channel,
            user: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the channel type this client is attached to.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn channel(&self) -> &Arc<dyn CommunicationChannel> {
        &self.channel
    }

    /// The authenticated user of this client, filled in by an auth
    /// extension; `None` until authentication happened.
    pub fn user(&self) -> Option<String> {
        self.user.lock().unwrap().clone()
    }

    pub fn set_user(&self, user: Option<String>) {
        *self.user.lock().unwrap() = user;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .finish()
    }
}
