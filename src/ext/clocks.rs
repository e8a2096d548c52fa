//! Extension that owns the clock registry and implements the `CLK-*`
//! message family.
//!
//! On load it registers the `system` clock, wires `CLK-LIST` and
//! `CLK-INF` handlers into the hub and broadcasts a `CLK-INF`
//! notification whenever any registered clock starts, stops or is
//! adjusted.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::app::App;
use crate::error::ExtensionError;
use crate::message_hub::{handler, HandlerId, HandlerOutcome};
use crate::model::clock::{Clock, SystemClock};
use crate::registries::{ClockRegistry, RemovalGuard};
use crate::signals::SignalBinding;

use super::{Extension, ExtensionContext};

/// API exported towards other extensions.
pub struct ClocksApi {
    registry: Arc<ClockRegistry>,
}

impl ClocksApi {
    pub fn registry(&self) -> &Arc<ClockRegistry> {
        &self.registry
    }

    pub fn register_clock(&self, clock: Arc<dyn Clock>) -> Result<(), crate::error::RegistryError> {
        self.registry.add(clock)
    }

    pub fn unregister_clock(&self, clock_id: &str) {
        self.registry.remove_by_id(clock_id);
    }
}

struct LoadedState {
    handler_ids: Vec<HandlerId>,
    _bindings: Vec<SignalBinding>,
    /// Keeps the system clock registered; dropping it deregisters.
    _system_clock: RemovalGuard,
}

pub struct ClocksExtension {
    registry: Arc<ClockRegistry>,
    state: Mutex<Option<LoadedState>>,
}

impl Default for ClocksExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl ClocksExtension {
    pub fn new() -> Self {
        Self {
            registry: ClockRegistry::new(),
            state: Mutex::new(None),
        }
    }
}

/// Builds the body of a `CLK-INF` message for the given clock ids.
fn clock_status_body(registry: &ClockRegistry, clock_ids: &[String]) -> (Map<String, Value>, Vec<String>) {
    let now = Utc::now();
    let mut statuses = Map::new();
    let mut missing = Vec::new();
    for clock_id in clock_ids {
        match registry.find_by_id(clock_id) {
            Some(clock) => {
                statuses.insert(clock_id.clone(), clock.status(now));
            }
            None => missing.push(clock_id.clone()),
        }
    }
    let mut body = Map::new();
    body.insert("type".into(), json!("CLK-INF"));
    body.insert("status".into(), Value::Object(statuses));
    (body, missing)
}

impl Extension for ClocksExtension {
    fn description(&self) -> &'static str {
        "Clock registry and CLK-* message handlers"
    }

    fn load(&self, ctx: &ExtensionContext) -> Result<(), ExtensionError> {
        let hub = ctx.app.message_hub();
        let mut handler_ids = Vec::new();

        let system_clock = self
            .registry
            .use_clock(Arc::new(SystemClock::new()))
            .map_err(|error| ExtensionError::LoadFailed {
                name: ctx.name.clone(),
                reason: error.to_string(),
            })?;

        {
            let registry = Arc::clone(&self.registry);
            handler_ids.push(hub.register_handler(
                &["CLK-LIST"],
                handler(move |_message, _sender, _hub| {
                    let registry = Arc::clone(&registry);
                    async move {
                        let mut body = Map::new();
                        body.insert("ids".into(), json!(registry.ids()));
                        Ok(HandlerOutcome::Body(body))
                    }
                }),
            ));
        }

        {
            let registry = Arc::clone(&self.registry);
            handler_ids.push(hub.register_handler(
                &["CLK-INF"],
                handler(move |message, _sender, hub| {
                    let registry = Arc::clone(&registry);
                    async move {
                        let (body, missing) =
                            clock_status_body(&registry, &message.target_ids());
                        let mut response = hub.create_response_to(&message, body);
                        for clock_id in missing {
                            response.add_failure(&clock_id, Some("No such clock"));
                        }
                        Ok(HandlerOutcome::Response(response))
                    }
                }),
            ));
        }

        // Any clock change is pushed to every client as a CLK-INF
        // notification.
        let binding = {
            let registry = Arc::clone(&self.registry);
            let hub = Arc::clone(&hub);
            self.registry.clock_changed().connect(move |clock| {
                let (body, _) = clock_status_body(&registry, &[clock.id().to_owned()]);
                let notification = hub.create_notification(body);
                let _ = hub.enqueue_broadcast_message(notification);
            })
        };

        *self.state.lock().unwrap() = Some(LoadedState {
            handler_ids,
            _bindings: vec![binding],
            _system_clock: system_clock,
        });
        Ok(())
    }

    fn unload(&self, app: &Arc<App>) {
        if let Some(state) = self.state.lock().unwrap().take() {
            for handler_id in &state.handler_ids {
                app.message_hub().unregister_handler(*handler_id);
            }
        }
    }

    fn exports(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        Some(Arc::new(ClocksApi {
            registry: Arc::clone(&self.registry),
        }))
    }
}
