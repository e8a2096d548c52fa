//! Error types for flockwaved.

use std::path::PathBuf;

/// Errors raised by registries.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("entry ID already taken: {0}")]
    IdTaken(String),
}

/// Errors raised while validating or constructing Flockwave messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Flockwave message does not match schema: {0}")]
    Validation(String),

    #[error("message queue is full")]
    QueueFull,

    #[error("message hub is not running")]
    NotRunning,
}

/// Errors raised by the extension manager.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    #[error("no such extension: {0}")]
    NoSuchExtension(String),

    #[error("invalid extension name: {0}")]
    InvalidName(String),

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("extension {0} is not loaded")]
    NotLoaded(String),

    #[error("failed to unload extension {0} because it is still in use")]
    InUse(String),

    #[error("error while loading extension {name}: {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("Extension is protected")]
    Protected,
}

/// Errors raised while resolving an extension API through a proxy.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("extension {0} is not loaded")]
    NotLoaded(String),

    #[error("extension {0} exports no API")]
    NoExports(String),

    #[error("API of extension {0} has an unexpected type")]
    TypeMismatch(String),
}

/// Errors raised while loading the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("configuration file {0} must contain a JSON object")]
    NotAnObject(PathBuf),
}

/// Top-level server error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
