//! Server configuration — environment variables plus an optional JSON
//! configuration file.
//!
//! The file is looked up through `FLOCKWAVED_CONFIG` (or passed on the
//! command line) and may override the server name, the log filter and the
//! per-extension configuration map. Everything under `extensions` is
//! passed through to the extensions untouched; an `"enabled": false` key
//! inside an extension's object disables loading it.

use std::env;
use std::path::Path;

use serde_json::{json, Map, Value};

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Label identifying this server in discovery responses.
    pub server_name: String,
    /// Log level filter (`RUST_LOG` syntax).
    pub log_level: String,
    /// Extension name to configuration object.
    pub extensions: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        let mut extensions = Map::new();
        extensions.insert("ext_manager".into(), json!({}));
        extensions.insert("clocks".into(), json!({}));
        extensions.insert("ws".into(), json!({}));
        extensions.insert("virtual_uavs".into(), json!({ "enabled": false, "count": 5 }));
        extensions.insert(
            "fake_connections".into(),
            json!({ "enabled": false, "count": 1 }),
        );

        Self {
            server_name: hostname(),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "flockwaved=info,tower_http=info".into()),
            extensions,
        }
    }
}

impl Config {
    /// Builds the configuration from the environment, merging in the
    /// configuration file named by `FLOCKWAVED_CONFIG` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(name) = env::var("FLOCKWAVED_SERVER_NAME") {
            config.server_name = name;
        }
        if let Ok(path) = env::var("FLOCKWAVED_CONFIG") {
            config.merge_file(Path::new(&path))?;
        }
        Ok(config)
    }

    /// Merges a JSON configuration file into this configuration.
    ///
    /// Top-level keys: `server_name`, `log_level` and `extensions`. Per
    /// extension the file's object replaces the default one wholesale.
    pub fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;
        let object = value
            .as_object()
            .ok_or_else(|| ConfigError::NotAnObject(path.to_owned()))?;

        if let Some(name) = object.get("server_name").and_then(Value::as_str) {
            self.server_name = name.to_owned();
        }
        if let Some(filter) = object.get("log_level").and_then(Value::as_str) {
            self.log_level = filter.to_owned();
        }
        if let Some(extensions) = object.get("extensions").and_then(Value::as_object) {
            for (name, configuration) in extensions {
                self.extensions.insert(name.clone(), configuration.clone());
            }
        }
        Ok(())
    }
}

fn hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "flockwaved".into())
}
