use async_trait::async_trait;
use ng_connectivity_error::{NGError, NGResult};
use ng_connectivity_models::{ConnectionEvent, ConnectionId};
use std::{collections::BTreeMap, sync::Mutex};

/// Append-only log of connection lifecycle events.
///
/// Replaying a connection's events through `apply_event` yields its current value.
#[async_trait]
pub trait ConnectionJournal: Send + Sync {
    async fn append(&self, event: ConnectionEvent) -> NGResult<()>;

    /// Events of one connection in append order.
    async fn events(&self, connection_id: &ConnectionId) -> NGResult<Vec<ConnectionEvent>>;

    /// Events of every connection, grouped by connection id.
    async fn all_events(&self) -> NGResult<BTreeMap<ConnectionId, Vec<ConnectionEvent>>>;
}

/// Journal kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryConnectionJournal {
    entries: Mutex<BTreeMap<ConnectionId, Vec<ConnectionEvent>>>,
}

impl InMemoryConnectionJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> NGResult<std::sync::MutexGuard<'_, BTreeMap<ConnectionId, Vec<ConnectionEvent>>>> {
        self.entries
            .lock()
            .map_err(|e| NGError::JournalError(format!("journal lock poisoned: {e}")))
    }
}

#[async_trait]
impl ConnectionJournal for InMemoryConnectionJournal {
    async fn append(&self, event: ConnectionEvent) -> NGResult<()> {
        self.lock()?
            .entry(event.connection_id().clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn events(&self, connection_id: &ConnectionId) -> NGResult<Vec<ConnectionEvent>> {
        Ok(self.lock()?.get(connection_id).cloned().unwrap_or_default())
    }

    async fn all_events(&self) -> NGResult<BTreeMap<ConnectionId, Vec<ConnectionEvent>>> {
        Ok(self.lock()?.clone())
    }
}
