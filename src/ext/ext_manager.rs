//! Extension implementing the `EXT-*` management messages.
//!
//! This extension is a mandatory part of the server protocol: it is
//! loaded even when the configuration does not mention it, and it cannot
//! be unloaded through the protocol ("Extension is protected").

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::app::App;
use crate::error::ExtensionError;
use crate::message_hub::{handler, HandlerId, HandlerOutcome, HandlerResult, MessageHub};
use crate::model::message::FlockwaveMessage;

use super::{Extension, ExtensionContext};

/// Name under which this extension is registered; requests targeting it
/// are refused.
pub const EXT_MANAGER_NAME: &str = "ext_manager";

pub struct ExtManagerExtension {
    handler_ids: Mutex<Vec<HandlerId>>,
}

impl Default for ExtManagerExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtManagerExtension {
    pub fn new() -> Self {
        Self {
            handler_ids: Mutex::new(Vec::new()),
        }
    }
}

/// Ids (and per-id parameters) of a multi-id `EXT-*` request. `EXT-SETCFG`
/// sends a map of id to configuration; the others send a plain id list.
fn ids_and_params(message: &FlockwaveMessage) -> Vec<(String, Option<Value>)> {
    match message.body.get("ids") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|id| (id.to_owned(), None))
            .collect(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(id, param)| (id.clone(), Some(param.clone())))
            .collect(),
        _ => Vec::new(),
    }
}

/// Runs an operation for every id of a multi-id request, assembling the
/// response with the partial-failure convention. The manager's own name
/// is protected.
async fn for_each_id<F, Fut>(
    message: &FlockwaveMessage,
    hub: &Arc<MessageHub>,
    operation: F,
) -> HandlerResult
where
    F: Fn(String, Option<Value>) -> Fut,
    Fut: Future<Output = Result<Value, String>>,
{
    let mut response = hub.create_response_to(message, Map::new());
    let mut statuses = Map::new();

    for (id, param) in ids_and_params(message) {
        if id == EXT_MANAGER_NAME {
            response.add_failure(&id, Some("Extension is protected"));
            continue;
        }
        match operation(id.clone(), param).await {
            Ok(result) => {
                statuses.insert(id, result);
            }
            Err(reason) => response.add_failure(&id, Some(reason.as_str())),
        }
    }

    response
        .body_mut()
        .insert("status".into(), Value::Object(statuses));
    Ok(HandlerOutcome::Response(response))
}

impl Extension for ExtManagerExtension {
    fn description(&self) -> &'static str {
        "EXT-* messages for managing extensions at runtime"
    }

    fn load(&self, ctx: &ExtensionContext) -> Result<(), ExtensionError> {
        let hub = ctx.app.message_hub();
        let manager = ctx.app.extension_manager();
        let mut handler_ids = self.handler_ids.lock().unwrap();

        {
            let manager = Arc::clone(manager);
            handler_ids.push(hub.register_handler(
                &["EXT-LIST"],
                handler(move |_message, _sender, _hub| {
                    let manager = Arc::clone(&manager);
                    async move {
                        let loaded = manager.loaded_extensions();
                        let available: Vec<String> = manager
                            .known_extensions()
                            .into_iter()
                            .filter(|name| !loaded.contains(name))
                            .collect();
                        let mut body = Map::new();
                        body.insert("loaded".into(), json!(loaded));
                        body.insert("available".into(), json!(available));
                        Ok(HandlerOutcome::Body(body))
                    }
                }),
            ));
        }

        {
            let manager = Arc::clone(manager);
            handler_ids.push(hub.register_handler(
                &["EXT-INF"],
                handler(move |message, _sender, hub| {
                    let manager = Arc::clone(&manager);
                    async move {
                        for_each_id(&message, &hub, |id, _param| {
                            let manager = Arc::clone(&manager);
                            async move {
                                manager.status_of(&id).map_err(|error| error.to_string())
                            }
                        })
                        .await
                    }
                }),
            ));
        }

        {
            let manager = Arc::clone(manager);
            handler_ids.push(hub.register_handler(
                &["EXT-CFG"],
                handler(move |message, _sender, hub| {
                    let manager = Arc::clone(&manager);
                    async move {
                        for_each_id(&message, &hub, |id, _param| {
                            let manager = Arc::clone(&manager);
                            async move {
                                manager
                                    .configuration_of(&id)
                                    .map_err(|error| error.to_string())
                            }
                        })
                        .await
                    }
                }),
            ));
        }

        {
            let manager = Arc::clone(manager);
            handler_ids.push(hub.register_handler(
                &["EXT-SETCFG"],
                handler(move |message, _sender, hub| {
                    let manager = Arc::clone(&manager);
                    async move {
                        for_each_id(&message, &hub, |id, param| {
                            let manager = Arc::clone(&manager);
                            async move {
                                let configuration =
                                    param.ok_or_else(|| "missing configuration".to_owned())?;
                                manager
                                    .set_configuration(&id, configuration)
                                    .map(|_| Value::Bool(true))
                                    .map_err(|error| error.to_string())
                            }
                        })
                        .await
                    }
                }),
            ));
        }

        {
            let manager = Arc::clone(manager);
            handler_ids.push(hub.register_handler(
                &["EXT-LOAD"],
                handler(move |message, _sender, hub| {
                    let manager = Arc::clone(&manager);
                    async move {
                        for_each_id(&message, &hub, |id, _param| {
                            let manager = Arc::clone(&manager);
                            async move {
                                manager
                                    .load(&id)
                                    .await
                                    .map(|_| Value::Bool(true))
                                    .map_err(|error| error.to_string())
                            }
                        })
                        .await
                    }
                }),
            ));
        }

        {
            let manager = Arc::clone(manager);
            handler_ids.push(hub.register_handler(
                &["EXT-UNLOAD"],
                handler(move |message, _sender, hub| {
                    let manager = Arc::clone(&manager);
                    async move {
                        for_each_id(&message, &hub, |id, _param| {
                            let manager = Arc::clone(&manager);
                            async move {
                                manager
                                    .unload(&id)
                                    .await
                                    .map(|_| Value::Bool(true))
                                    .map_err(|error| error.to_string())
                            }
                        })
                        .await
                    }
                }),
            ));
        }

        {
            let manager = Arc::clone(manager);
            handler_ids.push(hub.register_handler(
                &["EXT-RELOAD"],
                handler(move |message, _sender, hub| {
                    let manager = Arc::clone(&manager);
                    async move {
                        for_each_id(&message, &hub, |id, _param| {
                            let manager = Arc::clone(&manager);
                            async move {
                                manager
                                    .reload(&id)
                                    .await
                                    .map(|_| Value::Bool(true))
                                    .map_err(|error| error.to_string())
                            }
                        })
                        .await
                    }
                }),
            ));
        }

        Ok(())
    }

    fn unload(&self, app: &Arc<App>) {
        let hub = app.message_hub();
        for handler_id in self.handler_ids.lock().unwrap().drain(..) {
            hub.unregister_handler(handler_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_parsed_from_lists_and_maps() {
        let raw = json!({
            "$fw.version": "1.0",
            "id": "1",
            "body": { "type": "EXT-LOAD", "ids": ["a", "b"] }
        });
        let message = crate::model::message::validate_envelope(&raw).unwrap();
        assert_eq!(
            ids_and_params(&message),
            vec![("a".to_owned(), None), ("b".to_owned(), None)]
        );

        let raw = json!({
            "$fw.version": "1.0",
            "id": "2",
            "body": { "type": "EXT-SETCFG", "ids": { "a": { "speed": 1 } } }
        });
        let message = crate::model::message::validate_envelope(&raw).unwrap();
        let parsed = ids_and_params(&message);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "a");
        assert_eq!(parsed[0].1, Some(json!({ "speed": 1 })));
    }

    #[test]
    fn manager_extension_is_in_the_builtin_table() {
        let table = super::super::builtin_extensions();
        assert!(table.contains_key(EXT_MANAGER_NAME));
    }
}
