use crate::metrics::ConnectionMetricsSnapshot;
use chrono::{DateTime, Utc};
use ng_connectivity_models::{Connection, ConnectionId, ConnectivityStatus};
use ng_connectivity_sdk::{ConnectivityError, DittoHeaders};
use serde::Serialize;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Lifecycle state of a client actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    Unknown,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Testing,
}

impl ClientState {
    /// States bounded by a timeout.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ClientState::Connecting | ClientState::Disconnecting | ClientState::Testing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Unknown => "UNKNOWN",
            ClientState::Connecting => "CONNECTING",
            ClientState::Connected => "CONNECTED",
            ClientState::Disconnecting => "DISCONNECTING",
            ClientState::Disconnected => "DISCONNECTED",
            ClientState::Testing => "TESTING",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data owned by the client actor. Replaced, never mutated in place.
#[derive(Debug, Clone)]
pub struct BaseClientData {
    pub connection_id: ConnectionId,
    pub connection: Arc<Connection>,
    pub connection_status: ConnectivityStatus,
    pub desired_status: ConnectivityStatus,
    pub status_details: Option<String>,
    pub in_state_since: DateTime<Utc>,
    /// Headers of the command waiting for the current transition
    pub session_headers: Option<DittoHeaders>,
}

impl BaseClientData {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection_id: connection.id.clone(),
            desired_status: connection.connection_status,
            connection,
            connection_status: ConnectivityStatus::Unknown,
            status_details: None,
            in_state_since: Utc::now(),
            session_headers: None,
        }
    }

    pub fn with_connection(&self, connection: Arc<Connection>) -> Self {
        Self {
            connection,
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: ConnectivityStatus, details: Option<String>) -> Self {
        Self {
            connection_status: status,
            status_details: details,
            in_state_since: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_desired_status(&self, desired: ConnectivityStatus) -> Self {
        Self {
            desired_status: desired,
            ..self.clone()
        }
    }

    pub fn with_session(&self, headers: Option<DittoHeaders>) -> Self {
        Self {
            session_headers: headers,
            ..self.clone()
        }
    }
}

/// Failed command, answered with the headers the command came with.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailure {
    pub error: ConnectivityError,
    pub headers: DittoHeaders,
}

impl CommandFailure {
    pub fn new(error: ConnectivityError, headers: DittoHeaders) -> Self {
        Self { error, headers }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

pub type CommandResult = Result<(), CommandFailure>;

/// Status one client actor reports for `RetrieveStatus`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub client_index: usize,
    pub state: ClientState,
    pub status: ConnectivityStatus,
    pub status_details: Option<String>,
    pub in_state_since: DateTime<Utc>,
    pub sources: BTreeMap<String, ConnectivityStatus>,
    pub targets: BTreeMap<String, ConnectivityStatus>,
    pub metrics: ConnectionMetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_connectivity_models::ConnectionType;

    #[test]
    fn data_is_copied_on_write() {
        let connection = Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, "tcp://h:1883")
            .with_status(ConnectivityStatus::Open);
        let data = BaseClientData::new(Arc::new(connection));
        let failed = data.with_status(ConnectivityStatus::Failed, Some("boom".into()));
        assert_eq!(data.connection_status, ConnectivityStatus::Unknown);
        assert_eq!(data.desired_status, ConnectivityStatus::Open);
        assert_eq!(failed.connection_status, ConnectivityStatus::Failed);
        assert_eq!(failed.status_details.as_deref(), Some("boom"));
    }

    #[test]
    fn transitional_states() {
        assert!(ClientState::Connecting.is_transitional());
        assert!(!ClientState::Connected.is_transitional());
        assert_eq!(ClientState::Disconnecting.to_string(), "DISCONNECTING");
    }
}
