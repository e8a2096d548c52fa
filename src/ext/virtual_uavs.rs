//! Extension providing simulated UAVs.
//!
//! The configured number of virtual UAVs is registered in the object
//! registry. `UAV-INF` requests are answered from the registry with the
//! partial-failure convention; while the server is spinning, a worker
//! steps the simulation and pushes rate-limited `UAV-INF` notifications.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::app::App;
use crate::error::ExtensionError;
use crate::message_hub::{handler, HandlerId, HandlerOutcome, MessageHub};
use crate::model::object::{ModelObject, ObjectKind, VirtualUav};
use crate::rate_limiters::UavMessageRateLimiter;
use crate::registries::{ObjectRegistryView, RemovalGuard};

use super::{Extension, ExtensionContext};

const DEFAULT_COUNT: usize = 5;
/// Simulation step, seconds.
const STEP: f64 = 0.5;
/// Grace window of the UAV-INF notification rate limiter.
const NOTIFICATION_DELAY: Duration = Duration::from_millis(100);

pub struct VirtualUavsExtension {
    uavs: Mutex<Vec<Arc<VirtualUav>>>,
    /// One guard per registered UAV; dropping a guard deregisters it.
    guards: Mutex<Vec<RemovalGuard>>,
    handler_id: Mutex<Option<HandlerId>>,
}

impl Default for VirtualUavsExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualUavsExtension {
    pub fn new() -> Self {
        Self {
            uavs: Mutex::new(Vec::new()),
            guards: Mutex::new(Vec::new()),
            handler_id: Mutex::new(None),
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

fn id_format_of(config: &Value) -> String {
    config
        .get("id_format")
        .and_then(Value::as_str)
        .unwrap_or("VIRT-{}")
        .to_owned()
}

fn origin_of(config: &Value) -> [f64; 3] {
    let origin = config.get("origin").and_then(Value::as_array);
    match origin {
        Some(values) if values.len() >= 2 => {
            let coordinate = |index: usize| values.get(index).and_then(Value::as_f64).unwrap_or(0.0);
            [coordinate(0), coordinate(1), coordinate(2)]
        }
        _ => [47.473703, 19.061739, 215.0],
    }
}

/// Builds the body of a `UAV-INF` message for the given UAV ids; missing
/// ids are returned separately.
fn uav_status_body(
    uavs: &ObjectRegistryView,
    uav_ids: &[String],
) -> (Map<String, Value>, Vec<String>) {
    let mut statuses = Map::new();
    let mut missing = Vec::new();
    for uav_id in uav_ids {
        match uavs.find_by_id(uav_id) {
            Some(uav) => {
                statuses.insert(uav_id.clone(), uav.status());
            }
            None => missing.push(uav_id.clone()),
        }
    }
    let mut body = Map::new();
    body.insert("type".into(), json!("UAV-INF"));
    body.insert("status".into(), Value::Object(statuses));
    (body, missing)
}

async fn notification_loop(
    hub: Arc<MessageHub>,
    uavs: ObjectRegistryView,
    limiter: Arc<UavMessageRateLimiter>,
) {
    limiter
        .run(move |uav_ids| {
            let hub = Arc::clone(&hub);
            let uavs = uavs.clone();
            async move {
                let (body, _) = uav_status_body(&uavs, &uav_ids);
                let notification = hub.create_notification(body);
                let _ = hub.enqueue_broadcast_message(notification);
            }
        })
        .await;
}

impl Extension for VirtualUavsExtension {
    fn description(&self) -> &'static str {
        "Simulated UAVs for testing and demos"
    }

    fn load(&self, ctx: &ExtensionContext) -> Result<(), ExtensionError> {
        let count = count_of(&ctx.config);
        let id_format = id_format_of(&ctx.config);
        let origin = origin_of(&ctx.config);

        let mut uavs = self.uavs.lock().unwrap();
        let mut guards = self.guards.lock().unwrap();
        for index in 0..count {
            let id = id_format.replacen("{}", &index.to_string(), 1);
            // Spread the UAVs a few meters apart at the origin.
            let home = [
                origin[0] + 5e-5 * index as f64,
                origin[1],
                origin[2],
            ];
            let uav = Arc::new(VirtualUav::new(id, home));
            let guard = ctx
                .app
                .object_registry()
                .use_object(Arc::clone(&uav) as Arc<dyn ModelObject>)
                .map_err(|error| ExtensionError::LoadFailed {
                    name: ctx.name.clone(),
                    reason: error.to_string(),
                })?;
            guards.push(guard);
            uavs.push(uav);
        }
        debug!(count, "virtual UAVs registered");

        let view = ctx.app.object_registry().view(ObjectKind::Uav);
        let handler_id = ctx.app.message_hub().register_handler(
            &["UAV-INF"],
            handler(move |message, _sender, hub| {
                let view = view.clone();
                async move {
                    let (body, missing) = uav_status_body(&view, &message.target_ids());
                    let mut response = hub.create_response_to(&message, body);
                    for uav_id in missing {
                        response.add_failure(&uav_id, Some("No such UAV"));
                    }
                    Ok(HandlerOutcome::Response(response))
                }
            }),
        );
        *self.handler_id.lock().unwrap() = Some(handler_id);
        Ok(())
    }

    fn worker(&self, ctx: &ExtensionContext) -> Option<BoxFuture<'static, ()>> {
        let hub = Arc::clone(ctx.app.message_hub());
        let view = ctx.app.object_registry().view(ObjectKind::Uav);
        let uavs = self.uavs.lock().unwrap().clone();
        // One limiter per worker run; the previous one dies with the
        // aborted worker task on spindown.
        let limiter = Arc::new(UavMessageRateLimiter::new("UAV-INF", NOTIFICATION_DELAY));

        Some(
            async move {
                let notifications =
                    notification_loop(Arc::clone(&hub), view, Arc::clone(&limiter));
                let simulation = async move {
                    let mut ticker =
                        tokio::time::interval(Duration::from_secs_f64(STEP));
                    loop {
                        ticker.tick().await;
                        let mut changed = Vec::with_capacity(uavs.len());
                        for uav in &uavs {
                            uav.step(STEP);
                            changed.push(uav.id().to_owned());
                        }
                        if !changed.is_empty() {
                            limiter.add_request(changed);
                        }
                    }
                };
                futures::join!(notifications, simulation);
            }
            .boxed(),
        )
    }

    fn unload(&self, app: &Arc<App>) {
        if let Some(handler_id) = self.handler_id.lock().unwrap().take() {
            app.message_hub().unregister_handler(handler_id);
        }
        self.uavs.lock().unwrap().clear();
        // Dropping the guards deregisters the UAVs.
        self.guards.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parsing() {
        assert_eq!(count_of(&json!({})), DEFAULT_COUNT);
        assert_eq!(count_of(&json!({"count": 2})), 2);
        assert_eq!(id_format_of(&json!({"id_format": "{}"})), "{}");
        assert_eq!(origin_of(&json!({"origin": [1.0, 2.0]})), [1.0, 2.0, 0.0]);
    }

    #[test]
    fn id_format_is_applied() {
        let format = id_format_of(&json!({"id_format": "UAV:{}"}));
        assert_eq!(format.replacen("{}", "3", 1), "UAV:3");
    }
}
