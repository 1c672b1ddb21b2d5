//! Protocol-specific connector contract and the channels a connector talks back through.
//!
//! A connector owns the broker session of one client actor:
//! - `connect`/`disconnect` start an attempt and report its outcome asynchronously
//!   through [`ConnectorEvents`]
//! - consumed messages are handed to the [`InboundSink`]
//! - `publish` sends one mapped message to a target address

use crate::{inbound::InboundJob, pool::WorkerPool};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use dashmap::DashMap;
use ng_connectivity_models::{Connection, ConnectionId, ConnectionType, ConnectivityStatus};
use ng_connectivity_sdk::{AcknowledgementLabel, ConnectivityError, ExternalMessage, PublishError, Signal};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::trace;

/// Outcome of a connect or disconnect attempt, or a broken session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Connected,
    Disconnected,
    Failed(ConnectivityError),
}

/// Event tagged with the epoch of the attempt that produced it.
#[derive(Debug, Clone)]
pub struct EpochEvent {
    pub epoch: Option<u64>,
    pub event: ConnectorEvent,
}

/// Reports connector events to the owning client actor.
///
/// Handles passed to `connect`/`disconnect` carry the epoch of that attempt; the actor
/// ignores their events once a newer attempt started. [`ConnectorEvents::detached`]
/// yields a handle whose events are always current.
#[derive(Debug, Clone)]
pub struct ConnectorEvents {
    epoch: Option<u64>,
    tx: mpsc::UnboundedSender<EpochEvent>,
}

impl ConnectorEvents {
    pub(crate) fn new(epoch: Option<u64>, tx: mpsc::UnboundedSender<EpochEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn connected(&self) {
        self.send(ConnectorEvent::Connected);
    }

    pub fn disconnected(&self) {
        self.send(ConnectorEvent::Disconnected);
    }

    pub fn failed(&self, error: ConnectivityError) {
        self.send(ConnectorEvent::Failed(error));
    }

    /// Handle for failures of an established session, outside any attempt.
    pub fn detached(&self) -> Self {
        Self {
            epoch: None,
            tx: self.tx.clone(),
        }
    }

    fn send(&self, event: ConnectorEvent) {
        if self.tx.send(EpochEvent { epoch: self.epoch, event }).is_err() {
            trace!(epoch = ?self.epoch, "Client actor gone, dropping connector event");
        }
    }
}

/// Entry point for consumed messages.
///
/// Bound to the inbound mapping pool while the client is connected; deliveries at any
/// other time fail with `ConnectionUnavailable`.
#[derive(Clone)]
pub struct InboundSink {
    connection_id: ConnectionId,
    pool: Arc<ArcSwapOption<WorkerPool<InboundJob>>>,
}

impl InboundSink {
    pub(crate) fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            pool: Arc::new(ArcSwapOption::empty()),
        }
    }

    pub(crate) fn bind(&self, pool: Arc<WorkerPool<InboundJob>>) {
        self.pool.store(Some(pool));
    }

    pub(crate) fn unbind(&self) {
        if let Some(pool) = self.pool.swap(None) {
            pool.shutdown();
        }
    }

    pub fn is_bound(&self) -> bool {
        self.pool.load().is_some()
    }

    /// Queues a message consumed from `sources[source_index]` of the connection.
    pub async fn deliver(&self, source_index: usize, message: ExternalMessage) -> Result<(), ConnectivityError> {
        let pool = self.pool.load_full().ok_or_else(|| ConnectivityError::ConnectionUnavailable {
            connection_id: self.connection_id.to_string(),
        })?;
        pool.submit(InboundJob { source_index, message }).await
    }
}

/// Physical connector of one protocol.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    /// Starts a connect attempt. The result is reported through `events`; an `Err`
    /// means the attempt failed before it started.
    async fn connect(
        &self,
        connection: &Connection,
        inbound: InboundSink,
        events: ConnectorEvents,
    ) -> Result<(), ConnectivityError>;

    async fn disconnect(&self, connection: &Connection, events: ConnectorEvents) -> Result<(), ConnectivityError>;

    /// Protocol-level reachability check; no session is kept.
    async fn test_connection(&self, connection: &Connection) -> Result<(), ConnectivityError>;

    /// Publishes one message.
    ///
    /// Resolves to `None` when the target neither issues an acknowledgement nor answers.
    async fn publish(
        &self,
        address: &str,
        message: ExternalMessage,
        issued_ack: Option<&AcknowledgementLabel>,
    ) -> Result<Option<Signal>, PublishError>;

    async fn source_status(&self, _connection: &Connection) -> BTreeMap<String, ConnectivityStatus> {
        BTreeMap::new()
    }

    async fn target_status(&self, _connection: &Connection) -> BTreeMap<String, ConnectivityStatus> {
        BTreeMap::new()
    }

    /// Releases protocol resources. Must tolerate repeated calls.
    async fn cleanup(&self, connection: &Connection);
}

/// Creates connectors for one connection type.
pub trait ConnectorFactory: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    fn create(&self, connection: &Connection) -> Result<Arc<dyn ClientConnector>, ConnectivityError>;
}

/// Connector factories by connection type.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    factories: Arc<DashMap<ConnectionType, Arc<dyn ConnectorFactory>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(factory.connection_type(), factory);
    }

    pub fn contains(&self, connection_type: ConnectionType) -> bool {
        self.factories.contains_key(&connection_type)
    }

    pub fn create(&self, connection: &Connection) -> Result<Arc<dyn ClientConnector>, ConnectivityError> {
        let factory = self
            .factories
            .get(&connection.connection_type)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| ConnectivityError::ConnectionConfigurationInvalid {
                message: format!("no connector registered for {:?}", connection.connection_type),
            })?;
        factory.create(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unbound_sink_rejects_deliveries() {
        let sink = InboundSink::new(ConnectionId::new("c"));
        let err = sink.deliver(0, ExternalMessage::default()).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::ConnectionUnavailable { .. }));
        assert!(!sink.is_bound());
    }

    #[tokio::test]
    async fn events_carry_attempt_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = ConnectorEvents::new(Some(3), tx);
        events.connected();
        events.detached().failed(ConnectivityError::Internal { message: "lost".into() });
        let first = rx.recv().await.unwrap();
        assert_eq!(first.epoch, Some(3));
        assert_eq!(first.event, ConnectorEvent::Connected);
        assert_eq!(rx.recv().await.unwrap().epoch, None);
    }
}
