//! Connection status reporting types used by the `CONN-*` messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connections::ConnectionState;

/// What a registered connection is used for. Purposes group connections in
/// status output; they do not change behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionPurpose {
    UavRadioLink,
    Dgps,
    Debug,
    Other,
}

impl Default for ConnectionPurpose {
    fn default() -> Self {
        Self::Other
    }
}

/// Externally visible status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Unknown,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => Self::Disconnected,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Disconnecting => Self::Disconnecting,
        }
    }
}

/// Status information about a single registered connection, as reported in
/// `CONN-INF` responses and notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub purpose: ConnectionPurpose,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Time of the last status change.
    pub timestamp: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            purpose: ConnectionPurpose::default(),
            status: ConnectionStatus::Unknown,
            description: None,
            timestamp: Utc::now(),
        }
    }

    /// Updates the status from the given connection state, refreshing the
    /// timestamp when the status changed.
    pub fn update_status_from(&mut self, state: ConnectionState) {
        let status = ConnectionStatus::from(state);
        if self.status != status {
            self.status = status;
            self.timestamp = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_state() {
        let mut info = ConnectionInfo::new("radio");
        assert_eq!(info.status, ConnectionStatus::Unknown);

        info.update_status_from(ConnectionState::Connecting);
        assert_eq!(info.status, ConnectionStatus::Connecting);

        info.update_status_from(ConnectionState::Connected);
        let stamp = info.timestamp;
        info.update_status_from(ConnectionState::Connected);
        assert_eq!(info.timestamp, stamp);
    }

    #[test]
    fn serializes_camel_case() {
        let mut info = ConnectionInfo::new("dgps");
        info.purpose = ConnectionPurpose::UavRadioLink;
        info.update_status_from(ConnectionState::Connected);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["purpose"], "uavRadioLink");
        assert_eq!(value["status"], "connected");
    }
}
