//! Registry of the communication channel *types* the server can speak:
//! one entry per transport family (WebSocket, TCP, UDP, ...), not per
//! individual client channel.

use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::model::client::CommunicationChannel;
use crate::model::message::FlockwaveMessage;
use crate::signals::Signal;

use super::RegistryBase;

/// One-to-many send function of a channel type, when the transport has a
/// cheaper way to reach all its clients than one send per client.
pub type Broadcaster = Arc<dyn Fn(FlockwaveMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Produces the channel instance of an already connected client, by
/// client id.
pub type ChannelFactory =
    Arc<dyn Fn(&str) -> Option<Arc<dyn CommunicationChannel>> + Send + Sync>;

/// Given the address of a peer, returns the URL under which this channel
/// type is reachable on the interface facing that peer. Consulted by the
/// SSDP discovery extension.
pub type SsdpLocationResolver = Arc<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;

/// Describes how to talk to one class of clients.
#[derive(Clone)]
pub struct ChannelTypeDescriptor {
    pub id: String,
    pub factory: Option<ChannelFactory>,
    pub broadcaster: Option<Broadcaster>,
    pub ssdp_location: Option<SsdpLocationResolver>,
}

impl ChannelTypeDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            factory: None,
            broadcaster: None,
            ssdp_location: None,
        }
    }

    pub fn with_factory(mut self, factory: ChannelFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn with_ssdp_location(mut self, resolver: SsdpLocationResolver) -> Self {
        self.ssdp_location = Some(resolver);
        self
    }
}

/// Registry of channel types.
#[derive(Default)]
pub struct ChannelTypeRegistry {
    base: RegistryBase<Arc<ChannelTypeDescriptor>>,
    count_changed: Signal<usize>,
}

impl ChannelTypeRegistry {
    pub fn new() -> Self {
        Self {
            base: RegistryBase::new(),
            count_changed: Signal::new(),
        }
    }

    pub fn count_changed(&self) -> &Signal<usize> {
        &self.count_changed
    }

    /// Registers a channel type; no-op when the id is already taken.
    pub fn add(&self, descriptor: ChannelTypeDescriptor) {
        if self.base.contains(&descriptor.id) {
            return;
        }
        let id = descriptor.id.clone();
        self.base.insert(id.clone(), Arc::new(descriptor));
        info!(id = %id, "channel type registered");
        self.count_changed.emit(&self.base.num_entries());
    }

    /// Removes a channel type; no-op when it is not registered. The
    /// behaviour of the server is undefined when clients of this type are
    /// still connected.
    pub fn remove(&self, channel_id: &str) -> Option<Arc<ChannelTypeDescriptor>> {
        let removed = self.base.take(channel_id);
        if removed.is_some() {
            info!(id = %channel_id, "channel type deregistered");
            self.count_changed.emit(&self.base.num_entries());
        }
        removed
    }
}

impl Deref for ChannelTypeRegistry {
    type Target = RegistryBase<Arc<ChannelTypeDescriptor>>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
