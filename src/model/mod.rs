//! Model types shared by the server core: the Flockwave message envelope,
//! clients and their communication channels, connection status reporting,
//! model objects (UAVs, beacons, docks), device trees and clocks.

pub mod client;
pub mod clock;
pub mod connection;
pub mod devices;
pub mod message;
pub mod object;

pub use client::{Client, CommunicationChannel};
pub use clock::{Clock, ClockEvents, SystemClock};
pub use connection::{ConnectionInfo, ConnectionPurpose, ConnectionStatus};
pub use devices::{ChannelNode, DeviceTreeNode};
pub use message::{
    validate_envelope, FlockwaveMessage, FlockwaveResponse, MessageBuilder, PROTOCOL_VERSION,
};
pub use object::{ModelObject, ObjectKind, VirtualUav};
