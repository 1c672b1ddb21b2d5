use crate::connection::{Connection, ConnectionId, ConnectionLifecycle, ConnectivityStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Journaled change of a connection. Appended before it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionEvent {
    Created {
        connection: Connection,
        timestamp: DateTime<Utc>,
    },
    Modified {
        connection: Connection,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Opened {
        connection_id: ConnectionId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Closed {
        connection_id: ConnectionId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Deleted {
        connection_id: ConnectionId,
        timestamp: DateTime<Utc>,
    },
}

impl ConnectionEvent {
    pub fn created(connection: Connection) -> Self {
        ConnectionEvent::Created {
            connection,
            timestamp: Utc::now(),
        }
    }

    pub fn modified(connection: Connection) -> Self {
        ConnectionEvent::Modified {
            connection,
            timestamp: Utc::now(),
        }
    }

    pub fn opened(connection_id: ConnectionId) -> Self {
        ConnectionEvent::Opened {
            connection_id,
            timestamp: Utc::now(),
        }
    }

    pub fn closed(connection_id: ConnectionId) -> Self {
        ConnectionEvent::Closed {
            connection_id,
            timestamp: Utc::now(),
        }
    }

    pub fn deleted(connection_id: ConnectionId) -> Self {
        ConnectionEvent::Deleted {
            connection_id,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            ConnectionEvent::Created { connection, .. } | ConnectionEvent::Modified { connection, .. } => {
                &connection.id
            }
            ConnectionEvent::Opened { connection_id, .. }
            | ConnectionEvent::Closed { connection_id, .. }
            | ConnectionEvent::Deleted { connection_id, .. } => connection_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ConnectionEvent::Created { timestamp, .. }
            | ConnectionEvent::Modified { timestamp, .. }
            | ConnectionEvent::Opened { timestamp, .. }
            | ConnectionEvent::Closed { timestamp, .. }
            | ConnectionEvent::Deleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Created { .. } => "created",
            ConnectionEvent::Modified { .. } => "modified",
            ConnectionEvent::Opened { .. } => "opened",
            ConnectionEvent::Closed { .. } => "closed",
            ConnectionEvent::Deleted { .. } => "deleted",
        }
    }
}

/// Pure replay step: the connection after `event`.
///
/// Events for a different connection, and status events without a prior
/// `Created`, leave the state untouched. Every applied event bumps the revision.
pub fn apply_event(current: Option<Connection>, event: &ConnectionEvent) -> Option<Connection> {
    if let Some(c) = &current {
        if &c.id != event.connection_id() {
            return current;
        }
    }
    let next_revision = current.as_ref().map_or(1, |c| c.revision + 1);
    let stamp = |mut c: Connection| {
        c.revision = next_revision;
        c.modified = Some(event.timestamp());
        c
    };
    match event {
        ConnectionEvent::Created { connection, .. } => Some(stamp(Connection {
            lifecycle: ConnectionLifecycle::Active,
            ..connection.clone()
        })),
        ConnectionEvent::Modified { connection, .. } => match current {
            Some(c) if c.is_deleted() => Some(c),
            _ => Some(stamp(Connection {
                lifecycle: ConnectionLifecycle::Active,
                ..connection.clone()
            })),
        },
        ConnectionEvent::Opened { .. } => current
            .filter(|c| !c.is_deleted())
            .map(|c| stamp(c.with_status(ConnectivityStatus::Open))),
        ConnectionEvent::Closed { .. } => current
            .filter(|c| !c.is_deleted())
            .map(|c| stamp(c.with_status(ConnectivityStatus::Closed))),
        ConnectionEvent::Deleted { .. } => current.map(|c| {
            stamp(Connection {
                lifecycle: ConnectionLifecycle::Deleted,
                connection_status: ConnectivityStatus::Closed,
                ..c
            })
        }),
    }
}
