#![allow(dead_code)]

use async_trait::async_trait;
use ng_connectivity_core::{
    client::{ClientConnector, ClientContext, ConnectorEvents, ConnectorFactory, InboundSink},
    enrichment::SignalEnrichmentFacade,
    forwarder::SignalForwarder,
    mapping::MapperFactoryRegistry,
};
use ng_connectivity_models::{
    settings::{ClientConfig, Connectivity, Inner, SupervisorConfig},
    Connection, ConnectionId, ConnectionType, Settings,
};
use ng_connectivity_sdk::{
    AcknowledgementLabel, ConnectivityError, DittoHeaders, DittoProtocolAdapter, EntityId, ExternalMessage,
    MessageSettlement, PublishError, Signal,
};
use serde_json::Value;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Settings with timeouts short enough for tests.
pub fn test_settings() -> Settings {
    test_settings_with(|_| {})
}

pub fn test_settings_with(adjust: impl FnOnce(&mut Inner)) -> Settings {
    let mut inner = Inner {
        connectivity: Connectivity {
            client: ClientConfig {
                init_timeout_ms: 60_000,
                connecting_timeout_ms: 300,
                disconnecting_timeout_ms: 300,
                testing_timeout_ms: 1_000,
                socket_check_timeout_ms: 500,
            },
            supervisor: SupervisorConfig {
                min_backoff_ms: 10,
                max_backoff_ms: 100,
                random_factor: 0.0,
            },
            ..Default::default()
        },
        ..Default::default()
    };
    adjust(&mut inner);
    Settings::from_inner(inner)
}

/// Keeps a local port open so socket pre-checks succeed.
pub async fn listening_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn mqtt_connection(id: &str, port: u16) -> Connection {
    Connection::new(ConnectionId::new(id), ConnectionType::Mqtt, format!("tcp://127.0.0.1:{port}"))
}

/// Polls `check` until it holds or two seconds passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// === Connector ===

/// How the mock answers a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Connect,
    /// Never reports an outcome; connects and connection tests run into their timeouts.
    Hang,
    /// Connects, but never reports a completed disconnect.
    NoDisconnect,
}

/// Connector recording every call; shared by all clients the factory creates.
pub struct MockConnector {
    pub behavior: ConnectBehavior,
    pub test_result: Result<(), ConnectivityError>,
    pub connects: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub sink: Mutex<Option<InboundSink>>,
    pub events: Mutex<Option<ConnectorEvents>>,
    pub published: Mutex<Vec<(String, ExternalMessage)>>,
}

impl MockConnector {
    pub fn new(behavior: ConnectBehavior) -> Self {
        Self {
            behavior,
            test_result: Ok(()),
            connects: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            sink: Mutex::new(None),
            events: Mutex::new(None),
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn with_test_result(mut self, result: Result<(), ConnectivityError>) -> Self {
        self.test_result = result;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn sink(&self) -> Option<InboundSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, ExternalMessage)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientConnector for MockConnector {
    async fn connect(
        &self,
        _connection: &Connection,
        inbound: InboundSink,
        events: ConnectorEvents,
    ) -> Result<(), ConnectivityError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(inbound);
        if self.behavior != ConnectBehavior::Hang {
            events.connected();
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn disconnect(&self, _connection: &Connection, events: ConnectorEvents) -> Result<(), ConnectivityError> {
        if self.behavior != ConnectBehavior::NoDisconnect {
            events.disconnected();
        }
        Ok(())
    }

    async fn test_connection(&self, _connection: &Connection) -> Result<(), ConnectivityError> {
        if self.behavior == ConnectBehavior::Hang {
            std::future::pending::<()>().await;
        }
        self.test_result.clone()
    }

    async fn publish(
        &self,
        address: &str,
        message: ExternalMessage,
        _issued_ack: Option<&AcknowledgementLabel>,
    ) -> Result<Option<Signal>, PublishError> {
        self.published.lock().unwrap().push((address.to_string(), message));
        Ok(None)
    }

    async fn cleanup(&self, _connection: &Connection) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockConnectorFactory {
    pub connector: Arc<MockConnector>,
}

impl ConnectorFactory for MockConnectorFactory {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Mqtt
    }

    fn create(&self, _connection: &Connection) -> Result<Arc<dyn ClientConnector>, ConnectivityError> {
        Ok(self.connector.clone())
    }
}

// === Forwarder ===

/// Forwarder streaming every forwarded signal into a channel.
pub struct RecordingForwarder {
    tx: mpsc::UnboundedSender<Signal>,
}

impl RecordingForwarder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl SignalForwarder for RecordingForwarder {
    async fn forward(&self, signal: Signal) -> Result<(), ConnectivityError> {
        let _ = self.tx.send(signal);
        Ok(())
    }

    async fn forward_with_responses(
        &self,
        signal: Signal,
        _responses: mpsc::Sender<Signal>,
    ) -> Result<(), ConnectivityError> {
        let _ = self.tx.send(signal);
        Ok(())
    }
}

pub fn context(forwarder: Arc<dyn SignalForwarder>) -> ClientContext {
    ClientContext {
        forwarder,
        enrichment: None,
        mapper_factories: Arc::new(MapperFactoryRegistry::with_builtins()),
        adapter: Arc::new(DittoProtocolAdapter::new()),
        settings: test_settings(),
    }
}

// === Settlement ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Acknowledged,
    Rejected { requeue: bool },
}

#[derive(Default)]
pub struct RecordingSettlement {
    outcomes: Mutex<Vec<Settled>>,
}

impl RecordingSettlement {
    pub fn outcomes(&self) -> Vec<Settled> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl MessageSettlement for RecordingSettlement {
    fn acknowledge(&self) {
        self.outcomes.lock().unwrap().push(Settled::Acknowledged);
    }

    fn reject(&self, requeue: bool) {
        self.outcomes.lock().unwrap().push(Settled::Rejected { requeue });
    }
}

// === Enrichment ===

/// Answers every lookup with the same view and counts the calls.
pub struct StaticEnrichment {
    pub view: Value,
    pub calls: AtomicUsize,
}

impl StaticEnrichment {
    pub fn new(view: Value) -> Self {
        Self {
            view,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SignalEnrichmentFacade for StaticEnrichment {
    async fn retrieve_partial_thing(
        &self,
        _entity_id: &EntityId,
        _field_selector: &str,
        _headers: &DittoHeaders,
        _origin: Option<&Signal>,
    ) -> Result<Value, ConnectivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.view.clone())
    }
}

/// Fails every lookup with the same error.
pub struct FailingEnrichment {
    pub error: ConnectivityError,
    pub calls: AtomicUsize,
}

impl FailingEnrichment {
    pub fn new(error: ConnectivityError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SignalEnrichmentFacade for FailingEnrichment {
    async fn retrieve_partial_thing(
        &self,
        _entity_id: &EntityId,
        _field_selector: &str,
        _headers: &DittoHeaders,
        _origin: Option<&Signal>,
    ) -> Result<Value, ConnectivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}
