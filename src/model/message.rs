//! The Flockwave message envelope and the builder that produces new
//! messages, responses and notifications.
//!
//! Bodies stay generic JSON maps; the envelope is typed and validated at
//! the transport boundary before anything else may touch the message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::MessageError;

/// Version of the Flockwave protocol spoken by this server.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A single Flockwave message.
///
/// A message with a `correlation_id` is a *response* to the message with
/// that id; a message without one is a *request* or a *notification*,
/// depending on the direction it travels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlockwaveMessage {
    #[serde(rename = "$fw.version", default = "default_version")]
    pub version: String,

    pub id: String,

    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,

    pub body: Map<String, Value>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

impl FlockwaveMessage {
    /// The type tag of the message body. Guaranteed to be present on any
    /// message that passed `validate_envelope`.
    pub fn message_type(&self) -> &str {
        self.body
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn is_response(&self) -> bool {
        self.correlation_id.is_some()
    }

    /// The list of target ids of a multi-id request (`ids` key of the
    /// body); empty when the key is missing.
    pub fn target_ids(&self) -> Vec<String> {
        match self.body.get("ids") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A response message under construction.
///
/// Multi-id requests are answered with the partial-failure convention:
/// successfully handled ids land in a `status` map while failing ids are
/// collected into the `failure` array with an optional entry in the
/// `reasons` map. `add_failure` maintains those two keys.
#[derive(Debug, Clone)]
pub struct FlockwaveResponse {
    pub message: FlockwaveMessage,
}

impl FlockwaveResponse {
    pub fn body(&self) -> &Map<String, Value> {
        &self.message.body
    }

    pub fn body_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.message.body
    }

    /// Records in the `status` map that the operation succeeded for the
    /// given id, with the given result.
    pub fn add_result(&mut self, id: &str, result: Value) {
        let status = self
            .message
            .body
            .entry("status")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = status {
            map.insert(id.to_owned(), result);
        }
    }

    /// Adds a failure notification for the given id to the response body.
    ///
    /// The id is appended to the `failure` array (kept free of duplicates)
    /// and, when a reason is given, recorded in the `reasons` map as well.
    pub fn add_failure(&mut self, failed_id: &str, reason: Option<&str>) {
        let failures = self
            .message
            .body
            .entry("failure")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = failures {
            if !items.iter().any(|item| item.as_str() == Some(failed_id)) {
                items.push(Value::String(failed_id.to_owned()));
            }
        }

        if let Some(reason) = reason {
            let reasons = self
                .message
                .body
                .entry("reasons")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = reasons {
                map.entry(failed_id.to_owned())
                    .or_insert_with(|| Value::String(reason.to_owned()));
            }
        }
    }
}

impl std::ops::Deref for FlockwaveResponse {
    type Target = FlockwaveMessage;

    fn deref(&self) -> &FlockwaveMessage {
        &self.message
    }
}

/// Validates a raw JSON payload against the message envelope rules and
/// converts it into a typed message.
///
/// The envelope must be an object carrying a non-empty string `id` and an
/// object `body` whose `type` is an ALL-CAPS dash-separated tag.
pub fn validate_envelope(raw: &Value) -> Result<FlockwaveMessage, MessageError> {
    let object = raw
        .as_object()
        .ok_or_else(|| MessageError::Validation("message must be a JSON object".into()))?;

    match object.get("id") {
        Some(Value::String(id)) if !id.is_empty() => {}
        Some(_) => {
            return Err(MessageError::Validation(
                "message id must be a non-empty string".into(),
            ))
        }
        None => return Err(MessageError::Validation("message has no id".into())),
    }

    let body = object
        .get("body")
        .and_then(Value::as_object)
        .ok_or_else(|| MessageError::Validation("message has no body object".into()))?;

    match body.get("type") {
        Some(Value::String(tag)) if is_valid_type_tag(tag) => {}
        Some(Value::String(tag)) => {
            return Err(MessageError::Validation(format!(
                "invalid message type tag: {tag:?}"
            )))
        }
        _ => {
            return Err(MessageError::Validation(
                "message body has no type".into(),
            ))
        }
    }

    serde_json::from_value(raw.clone())
        .map_err(|err| MessageError::Validation(err.to_string()))
}

/// Type tags look like `UAV-INF`: ALL-CAPS alphanumeric groups separated by
/// single dashes.
fn is_valid_type_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.split('-').all(|group| {
            !group.is_empty()
                && group
                    .chars()
                    .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())
        })
}

type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Builder that produces new Flockwave messages with fresh ids.
pub struct MessageBuilder {
    version: String,
    id_generator: IdGenerator,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuilder {
    /// Creates a builder that generates UUIDv4 message ids.
    pub fn new() -> Self {
        Self::with_id_generator(|| Uuid::new_v4().to_string())
    }

    /// Creates a builder with a custom id generator. Used by tests that
    /// need deterministic ids.
    pub fn with_id_generator<F>(id_generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            version: PROTOCOL_VERSION.to_owned(),
            id_generator: Box::new(id_generator),
        }
    }

    pub fn create_message(&self, body: Map<String, Value>) -> FlockwaveMessage {
        FlockwaveMessage {
            version: self.version.clone(),
            id: (self.id_generator)(),
            correlation_id: None,
            body,
        }
    }

    /// Notifications are plain messages without a correlation id; the
    /// distinction is in how the hub routes them.
    pub fn create_notification(&self, body: Map<String, Value>) -> FlockwaveMessage {
        self.create_message(body)
    }

    /// Creates a response to the given message. When the body carries no
    /// `type`, the type of the request is copied over.
    pub fn create_response_to(
        &self,
        message: &FlockwaveMessage,
        mut body: Map<String, Value>,
    ) -> FlockwaveResponse {
        if !body.contains_key("type") {
            body.insert(
                "type".to_owned(),
                Value::String(message.message_type().to_owned()),
            );
        }

        FlockwaveResponse {
            message: FlockwaveMessage {
                version: self.version.clone(),
                id: (self.id_generator)(),
                correlation_id: Some(message.id.clone()),
                body,
            },
        }
    }

    /// Creates a response when a request is given, a notification
    /// otherwise.
    pub fn create_response_or_notification(
        &self,
        body: Map<String, Value>,
        in_response_to: Option<&FlockwaveMessage>,
    ) -> FlockwaveMessage {
        match in_response_to {
            Some(message) => self.create_response_to(message, body).message,
            None => self.create_notification(body),
        }
    }
}
