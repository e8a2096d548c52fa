//! flockwaved — command-and-control server kernel for UAV fleets.
//!
//! Heterogeneous drone links are multiplexed behind a single JSON message
//! protocol ("Flockwave") served to many clients over pluggable
//! transports. This crate provides the coordination machinery everything
//! else plugs into: the extension lifecycle, the observable registries,
//! the message hub and the connection state machine with automatic
//! reconnection.

pub mod app;
pub mod config;
pub mod connections;
pub mod error;
pub mod ext;
pub mod message_hub;
pub mod model;
pub mod networking;
pub mod rate_limiters;
pub mod registries;
pub mod signals;

pub use app::App;
pub use config::Config;
pub use error::ServerError;
