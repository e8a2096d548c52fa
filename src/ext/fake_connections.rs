//! Extension registering dummy connections that go up and down on their
//! own, each kept alive by a reconnection supervisor. Useful for testing
//! `CONN-INF` monitoring without real hardware.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::app::App;
use crate::connections::{Connection, DummyConnection, ReconnectionWrapper};
use crate::error::ExtensionError;
use crate::model::connection::ConnectionPurpose;

use super::{Extension, ExtensionContext};

const DEFAULT_COUNT: usize = 1;
/// Seconds between two simulated link drops.
const DEFAULT_DROP_INTERVAL: f64 = 5.0;

pub struct FakeConnectionsExtension {
    connections: Mutex<Vec<(String, Arc<ReconnectionWrapper<DummyConnection>>)>>,
}

impl Default for FakeConnectionsExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnectionsExtension {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
        }
    }
}

fn count_of(config: &Value) -> usize {
    config
        .get("count")
        .and_then(Value::as_u64)
        .map(|count| count as usize)
        .unwrap_or(DEFAULT_COUNT)
}

fn drop_interval_of(config: &Value) -> Duration {
    let seconds = config
        .get("drop_interval")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_DROP_INTERVAL)
        .max(0.1);
    Duration::from_secs_f64(seconds)
}

impl Extension for FakeConnectionsExtension {
    fn description(&self) -> &'static str {
        "Dummy connections that flap periodically, under supervision"
    }

    fn load(&self, ctx: &ExtensionContext) -> Result<(), ExtensionError> {
        let count = count_of(&ctx.config);
        let mut connections = self.connections.lock().unwrap();

        for index in 0..count {
            let id = format!("fake{index}");
            let wrapper = Arc::new(ReconnectionWrapper::new(DummyConnection::new()));
            ctx.app
                .connection_registry()
                .add(
                    id.clone(),
                    Arc::clone(&wrapper) as Arc<dyn Connection>,
                    format!("Fake connection {index}"),
                    ConnectionPurpose::Debug,
                )
                .map_err(|error| ExtensionError::LoadFailed {
                    name: ctx.name.clone(),
                    reason: error.to_string(),
                })?;
            connections.push((id, wrapper));
        }
        Ok(())
    }

    fn run(&self, ctx: &ExtensionContext) -> Option<BoxFuture<'static, ()>> {
        let connections: Vec<Arc<ReconnectionWrapper<DummyConnection>>> = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|(_, wrapper)| Arc::clone(wrapper))
            .collect();
        let drop_interval = drop_interval_of(&ctx.config);

        Some(
            async move {
                for wrapper in &connections {
                    let _ = wrapper.open().await;
                }

                // Periodically drop every inner link; the supervisors
                // bring them back.
                let mut ticker = tokio::time::interval(drop_interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    for wrapper in &connections {
                        wrapper.inner().drop_link();
                    }
                }
            }
            .boxed(),
        )
    }

    fn unload(&self, app: &Arc<App>) {
        for (id, _wrapper) in self.connections.lock().unwrap().drain(..) {
            app.connection_registry().remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_parsing() {
        assert_eq!(count_of(&json!({})), DEFAULT_COUNT);
        assert_eq!(count_of(&json!({"count": 3})), 3);
        assert_eq!(
            drop_interval_of(&json!({"drop_interval": 2.5})),
            Duration::from_secs_f64(2.5)
        );
        // Zero or negative intervals are clamped to something sane.
        assert_eq!(
            drop_interval_of(&json!({"drop_interval": 0.0})),
            Duration::from_secs_f64(0.1)
        );
    }
}
