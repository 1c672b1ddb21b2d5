//! ClientActor: lifecycle state machine of one client of a connection
//!
//! Each ClientActor owns:
//! - The lifecycle state (UNKNOWN, CONNECTING, CONNECTED, DISCONNECTING, DISCONNECTED, TESTING)
//!   and the copy-on-write [`BaseClientData`]
//! - The physical connector and the epoch of its current connect/disconnect attempt
//! - While connected: the inbound and outbound mapping pools, the aggregator starter,
//!   pending live responses and open search subscriptions
//!
//! Everything that mutates client state runs on the actor's own task, one message at
//! a time. Mapping, publishing and aggregation happen on the pools and helper tasks.

use super::{
    connector::{ClientConnector, ConnectorEvent, ConnectorEvents, EpochEvent, InboundSink},
    reachability::check_socket,
    state::{BaseClientData, ClientState, ClientStatus, CommandFailure, CommandResult},
};
use crate::{
    ack::{
        sending::{expected_ack_label, to_acknowledgement},
        AggregatorStarter,
    },
    enrichment::SignalEnrichmentFacade,
    forwarder::SignalForwarder,
    inbound::{ClientRouted, InboundDispatcher, InboundJob},
    logs::{ConnectionLogger, LogCategory, LogEntry, LogType},
    mapping::{InboundMappingProcessor, MapperFactoryRegistry, MessageMapperRegistry, OutboundMappingProcessor},
    metrics::ConnectionMetrics,
    outbound::{OutboundDispatcher, OutboundJob, PendingResponses},
    pool::WorkerPool,
    supervisor::BackoffReset,
};
use ng_connectivity_models::{settings::Settings, Connection, ConnectionId, ConnectivityStatus, Target};
use ng_connectivity_sdk::{
    Action, ConnectivityError, DittoHeaders, ProtocolAdapter, PublishError, SearchCommand, Signal,
};
use std::{collections::{BTreeMap, HashSet}, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Commands a client actor accepts.
#[derive(Debug)]
pub enum ClientCommand {
    Open {
        headers: DittoHeaders,
        reply: Option<oneshot::Sender<CommandResult>>,
    },
    Close {
        headers: DittoHeaders,
        reply: Option<oneshot::Sender<CommandResult>>,
    },
    Test {
        headers: DittoHeaders,
        reply: oneshot::Sender<CommandResult>,
    },
    RetrieveStatus {
        headers: DittoHeaders,
        reply: oneshot::Sender<Result<ClientStatus, CommandFailure>>,
    },
    /// Outbound signal with the targets it is authorized for
    Publish { signal: Signal, targets: Vec<Target> },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Open { .. } => "openConnection",
            ClientCommand::Close { .. } => "closeConnection",
            ClientCommand::Test { .. } => "testConnection",
            ClientCommand::RetrieveStatus { .. } => "retrieveConnectionStatus",
            ClientCommand::Publish { .. } => "publishSignal",
        }
    }

    pub fn headers(&self) -> &DittoHeaders {
        match self {
            ClientCommand::Open { headers, .. }
            | ClientCommand::Close { headers, .. }
            | ClientCommand::Test { headers, .. }
            | ClientCommand::RetrieveStatus { headers, .. } => headers,
            ClientCommand::Publish { signal, .. } => signal.headers(),
        }
    }

    /// Answers the command with `error` and the command's own headers.
    pub fn fail(self, error: ConnectivityError) {
        let failure = CommandFailure::new(error, self.headers().clone());
        match self {
            ClientCommand::Open { reply, .. } | ClientCommand::Close { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(failure));
                }
            }
            ClientCommand::Test { reply, .. } => {
                let _ = reply.send(Err(failure));
            }
            ClientCommand::RetrieveStatus { reply, .. } => {
                let _ = reply.send(Err(failure));
            }
            ClientCommand::Publish { signal, .. } => {
                debug!(
                    correlation_id = ?signal.correlation_id(),
                    error = %failure.error,
                    "Dropping outbound signal"
                );
            }
        }
    }
}

/// How the actor ended.
#[derive(Debug)]
pub enum ClientExit {
    /// Mailbox closed, shutdown requested, or a test actor finished
    Stopped,
    /// Unexpected end; the supervisor restarts the client
    Failed(ConnectivityError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Standard,
    /// Disposable actor that stops after answering one test
    Test,
}

/// Collaborators shared by every client of the process.
#[derive(Clone)]
pub struct ClientContext {
    pub forwarder: Arc<dyn SignalForwarder>,
    pub enrichment: Option<Arc<dyn SignalEnrichmentFacade>>,
    pub mapper_factories: Arc<MapperFactoryRegistry>,
    pub adapter: Arc<dyn ProtocolAdapter>,
    pub settings: Settings,
}

/// Resources of one CONNECTED episode.
struct ClientResources {
    inbound: Arc<WorkerPool<InboundJob>>,
    outbound: Arc<WorkerPool<OutboundJob>>,
    pending: PendingResponses,
    subscriptions: HashSet<String>,
    token: CancellationToken,
}

/// Full connection test: mapper configuration dry-run, socket pre-check, then the
/// connector's own check. The first failing sub-test is reported.
pub async fn run_connection_test(
    connection: &Connection,
    connector: &dyn ClientConnector,
    factories: &MapperFactoryRegistry,
    socket_budget: Duration,
) -> Result<(), ConnectivityError> {
    MessageMapperRegistry::build(connection, factories)?;
    check_socket(connection, socket_budget).await?;
    connector.test_connection(connection).await
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct ClientActor {
    // === Identity ===
    index: usize,
    mode: ClientMode,
    connection_id: ConnectionId,

    // === Lifecycle ===
    state: ClientState,
    data: BaseClientData,
    epoch: u64,
    deadline: Option<Instant>,
    awaiting_init: bool,
    pending_reply: Option<oneshot::Sender<CommandResult>>,

    // === Collaborators ===
    connector: Arc<dyn ClientConnector>,
    context: ClientContext,
    metrics: Arc<ConnectionMetrics>,
    logger: ConnectionLogger,
    reset: Option<BackoffReset>,

    // === Connected episode ===
    resources: Option<ClientResources>,
    sink: InboundSink,

    // === Self channels ===
    events_tx: mpsc::UnboundedSender<EpochEvent>,
    events_rx: mpsc::UnboundedReceiver<EpochEvent>,
    routed_tx: mpsc::UnboundedSender<ClientRouted>,
    routed_rx: mpsc::UnboundedReceiver<ClientRouted>,
    failures_tx: mpsc::UnboundedSender<ConnectivityError>,
    failures_rx: mpsc::UnboundedReceiver<ConnectivityError>,
    tests_tx: mpsc::UnboundedSender<Result<(), ConnectivityError>>,
    tests_rx: mpsc::UnboundedReceiver<Result<(), ConnectivityError>>,

    shutdown: CancellationToken,
}

impl ClientActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        mode: ClientMode,
        connection: Arc<Connection>,
        connector: Arc<dyn ClientConnector>,
        context: ClientContext,
        metrics: Arc<ConnectionMetrics>,
        logger: ConnectionLogger,
        reset: Option<BackoffReset>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (routed_tx, routed_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (tests_tx, tests_rx) = mpsc::unbounded_channel();
        let connection_id = connection.id.clone();
        let awaiting_init = mode == ClientMode::Standard;
        let deadline = awaiting_init.then(|| Instant::now() + context.settings.connectivity.client.init_timeout());
        Self {
            index,
            mode,
            sink: InboundSink::new(connection_id.clone()),
            connection_id,
            state: ClientState::Unknown,
            data: BaseClientData::new(connection),
            epoch: 0,
            deadline,
            awaiting_init,
            pending_reply: None,
            connector,
            context,
            metrics,
            logger,
            reset,
            resources: None,
            events_tx,
            events_rx,
            routed_tx,
            routed_rx,
            failures_tx,
            failures_rx,
            tests_tx,
            tests_rx,
            shutdown,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Processes messages until the actor stops. Resources are released on every exit.
    pub async fn run(self, mut mailbox: mpsc::Receiver<ClientCommand>) -> ClientExit {
        self.run_with(&mut mailbox).await
    }

    /// Like [`ClientActor::run`], leaving the mailbox to the caller afterwards.
    pub async fn run_with(mut self, mailbox: &mut mpsc::Receiver<ClientCommand>) -> ClientExit {
        debug!(connection_id = %self.connection_id, client = self.index, mode = ?self.mode, "Client actor started");
        let exit = loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break ClientExit::Stopped,
                Some(event) = self.events_rx.recv() => self.on_connector_event(event).await,
                Some(result) = self.tests_rx.recv() => {
                    if let Some(exit) = self.on_test_result(result).await {
                        break exit;
                    }
                }
                Some(error) = self.failures_rx.recv() => {
                    error!(connection_id = %self.connection_id, client = self.index, error = %error, "Connection failure reported, restarting client");
                    self.fail(error.clone()).await;
                    break ClientExit::Failed(error);
                }
                Some(routed) = self.routed_rx.recv() => self.on_routed(routed),
                command = mailbox.recv() => match command {
                    Some(command) => {
                        if let Some(exit) = self.on_command(command).await {
                            break exit;
                        }
                    }
                    None => break ClientExit::Stopped,
                },
                _ = wait_for(deadline) => {
                    if let Some(exit) = self.on_deadline().await {
                        break exit;
                    }
                }
            }
        };
        self.cleanup().await;
        if let Some(reply) = self.pending_reply.take() {
            let error = ConnectivityError::ConnectionUnavailable {
                connection_id: self.connection_id.to_string(),
            };
            let _ = reply.send(Err(CommandFailure::new(error, self.session_headers())));
        }
        debug!(connection_id = %self.connection_id, client = self.index, "Client actor stopped");
        exit
    }

    // === Commands ===

    async fn on_command(&mut self, command: ClientCommand) -> Option<ClientExit> {
        if self.awaiting_init {
            self.awaiting_init = false;
            self.deadline = None;
        }
        match (self.state, command) {
            (_, ClientCommand::RetrieveStatus { reply, .. }) => {
                let _ = reply.send(Ok(self.status().await));
            }
            (ClientState::Unknown | ClientState::Disconnected, ClientCommand::Open { headers, reply }) => {
                self.open(headers, reply).await;
            }
            (ClientState::Connected, ClientCommand::Open { reply, .. }) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            (ClientState::Unknown | ClientState::Connected, ClientCommand::Close { headers, reply }) => {
                self.close(headers, reply).await;
            }
            (ClientState::Disconnected, ClientCommand::Close { reply, .. }) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            (ClientState::Unknown, ClientCommand::Test { headers, reply }) => self.test(headers, reply),
            (ClientState::Connected, ClientCommand::Publish { signal, targets }) => self.publish(signal, targets),
            (state, command) => self.illegal(state, command),
        }
        None
    }

    async fn open(&mut self, headers: DittoHeaders, reply: Option<oneshot::Sender<CommandResult>>) {
        self.data = self.data.with_desired_status(ConnectivityStatus::Open);
        let budget = self.context.settings.connectivity.client.socket_check_timeout();
        if let Err(e) = check_socket(&self.data.connection, budget).await {
            warn!(connection_id = %self.connection_id, error = %e, "Socket pre-check failed");
            self.cleanup().await;
            self.record_failure(&e);
            if let Some(reply) = reply {
                let _ = reply.send(Err(CommandFailure::new(e, headers)));
            }
            return;
        }

        self.epoch += 1;
        let events = ConnectorEvents::new(Some(self.epoch), self.events_tx.clone());
        if let Err(e) = self.connector.connect(&self.data.connection, self.sink.clone(), events).await {
            warn!(connection_id = %self.connection_id, error = %e, "Connect attempt failed to start");
            self.cleanup().await;
            self.record_failure(&e);
            if let Some(reply) = reply {
                let _ = reply.send(Err(CommandFailure::new(e, headers)));
            }
            return;
        }
        self.await_transition(headers, reply, ClientState::Connecting);
    }

    async fn close(&mut self, headers: DittoHeaders, reply: Option<oneshot::Sender<CommandResult>>) {
        self.data = self.data.with_desired_status(ConnectivityStatus::Closed);
        self.epoch += 1;
        let events = ConnectorEvents::new(Some(self.epoch), self.events_tx.clone());
        if let Err(e) = self.connector.disconnect(&self.data.connection, events).await {
            self.pending_reply = reply;
            self.data = self.data.with_session(Some(headers));
            self.fail(e).await;
            return;
        }
        self.await_transition(headers, reply, ClientState::Disconnecting);
    }

    fn test(&mut self, headers: DittoHeaders, reply: oneshot::Sender<CommandResult>) {
        self.await_transition(headers, Some(reply), ClientState::Testing);
        let connection = Arc::clone(&self.data.connection);
        let connector = Arc::clone(&self.connector);
        let factories = Arc::clone(&self.context.mapper_factories);
        let budget = self.context.settings.connectivity.client.socket_check_timeout();
        let results = self.tests_tx.clone();
        tokio::spawn(async move {
            let result = run_connection_test(&connection, connector.as_ref(), &factories, budget).await;
            let _ = results.send(result);
        });
    }

    /// Never waits on the outbound queue; a rejected signal is answered with failed acks.
    fn publish(&mut self, signal: Signal, targets: Vec<Target>) {
        let Some(resources) = &self.resources else {
            return;
        };
        let job = OutboundJob::Dispatch {
            signal: signal.clone(),
            targets: targets.clone(),
        };
        let Err(e) = resources.outbound.try_submit(job) else {
            return;
        };
        warn!(
            connection_id = %self.connection_id,
            correlation_id = ?signal.correlation_id(),
            error = %e,
            "Outbound signal rejected"
        );
        self.metrics.increment_publish_failures();
        for target in &targets {
            let label = expected_ack_label(&signal, target, &self.connection_id);
            let result = Err(PublishError::Connectivity(e.clone()));
            if let Some(ack) = to_acknowledgement(result, &signal, label.as_ref()) {
                self.forward(ack);
            }
        }
    }

    fn illegal(&self, state: ClientState, command: ClientCommand) {
        let connection_id = self.connection_id.to_string();
        let operation = command.name().to_string();
        let error = match state {
            ClientState::Connecting | ClientState::Disconnecting => {
                ConnectivityError::OperationNotAllowedDuringTransition {
                    connection_id,
                    operation,
                    state: state.to_string(),
                }
            }
            _ => ConnectivityError::IllegalForState {
                connection_id,
                operation,
                state: state.to_string(),
            },
        };
        debug!(connection_id = %self.connection_id, %state, command = command.name(), "Command not handled in state");
        command.fail(error);
    }

    // === Connector events ===

    async fn on_connector_event(&mut self, event: EpochEvent) {
        if event.epoch.is_some_and(|epoch| epoch != self.epoch) {
            debug!(
                connection_id = %self.connection_id,
                event_epoch = ?event.epoch,
                current_epoch = self.epoch,
                "Ignoring event of a superseded attempt"
            );
            return;
        }
        match (self.state, event.event) {
            (ClientState::Connecting, ConnectorEvent::Connected) => self.on_connected().await,
            (ClientState::Disconnecting, ConnectorEvent::Disconnected) => self.on_disconnected().await,
            (ClientState::Connecting | ClientState::Disconnecting | ClientState::Connected, ConnectorEvent::Failed(e)) => {
                self.fail(e).await;
            }
            (state, event) => {
                debug!(connection_id = %self.connection_id, %state, ?event, "Ignoring connector event");
            }
        }
    }

    async fn on_connected(&mut self) {
        let resources = match self.start_resources() {
            Ok(resources) => resources,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };
        self.sink.bind(Arc::clone(&resources.inbound));
        self.resources = Some(resources);
        self.data = self.data.with_status(ConnectivityStatus::Open, None);
        self.answer(Ok(()));
        self.goto(ClientState::Connected);
        self.logger.log(LogEntry::success(LogCategory::Connection, LogType::Other, "Connected"));
        info!(connection_id = %self.connection_id, client = self.index, "Client connected");
        if let Some(reset) = &self.reset {
            reset.reset();
        }
    }

    async fn on_disconnected(&mut self) {
        self.cleanup().await;
        self.data = self.data.with_status(ConnectivityStatus::Closed, None);
        self.answer(Ok(()));
        self.goto(ClientState::Disconnected);
        self.logger.log(LogEntry::success(LogCategory::Connection, LogType::Other, "Disconnected"));
        info!(connection_id = %self.connection_id, client = self.index, "Client disconnected");
    }

    /// Failure path of every non-test state: cleanup, answer, UNKNOWN with FAILED.
    async fn fail(&mut self, error: ConnectivityError) {
        warn!(
            connection_id = %self.connection_id,
            client = self.index,
            state = %self.state,
            error = %error,
            "Client failed"
        );
        self.cleanup().await;
        self.record_failure(&error);
        self.answer(Err(error));
        self.goto(ClientState::Unknown);
    }

    // === Timeouts ===

    async fn on_deadline(&mut self) -> Option<ClientExit> {
        self.deadline = None;
        match self.state {
            ClientState::Unknown if self.awaiting_init => {
                self.awaiting_init = false;
                self.on_init_timeout().await;
                None
            }
            ClientState::Connecting | ClientState::Disconnecting => {
                let timeout = if self.state == ClientState::Connecting {
                    self.context.settings.connectivity.client.connecting_timeout()
                } else {
                    self.context.settings.connectivity.client.disconnecting_timeout()
                };
                let error = ConnectivityError::ConnectionFailed {
                    connection_id: self.connection_id.to_string(),
                    message: format!("{} timed out after {}ms", self.state, timeout.as_millis()),
                    description: Some("The broker did not answer in time.".to_string()),
                };
                self.fail(error).await;
                None
            }
            ClientState::Testing => {
                let timeout = self.context.settings.connectivity.client.testing_timeout();
                let error = ConnectivityError::CommandTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.finish_test(Err(error)).await
            }
            _ => None,
        }
    }

    /// No command arrived since start: act on the desired status.
    async fn on_init_timeout(&mut self) {
        match self.data.desired_status {
            ConnectivityStatus::Open => {
                info!(connection_id = %self.connection_id, client = self.index, "No command after start, opening");
                self.open(DittoHeaders::new(), None).await;
            }
            ConnectivityStatus::Closed => {
                self.data = self.data.with_status(ConnectivityStatus::Closed, None);
                self.goto(ClientState::Disconnected);
            }
            status => {
                info!(connection_id = %self.connection_id, %status, "No command after start, staying UNKNOWN");
            }
        }
    }

    // === Tests ===

    async fn on_test_result(&mut self, result: Result<(), ConnectivityError>) -> Option<ClientExit> {
        if self.state != ClientState::Testing {
            debug!(connection_id = %self.connection_id, "Ignoring late test result");
            return None;
        }
        self.finish_test(result).await
    }

    async fn finish_test(&mut self, result: Result<(), ConnectivityError>) -> Option<ClientExit> {
        match &result {
            Ok(()) => info!(connection_id = %self.connection_id, "Connection test succeeded"),
            Err(e) => info!(connection_id = %self.connection_id, error = %e, "Connection test failed"),
        }
        self.answer(result);
        match self.mode {
            ClientMode::Test => Some(ClientExit::Stopped),
            ClientMode::Standard => {
                self.connector.cleanup(&self.data.connection).await;
                self.goto(ClientState::Unknown);
                None
            }
        }
    }

    // === Routed signals ===

    fn on_routed(&mut self, routed: ClientRouted) {
        match routed {
            ClientRouted::LiveResponse(signal) => {
                let unmatched = match &self.resources {
                    Some(resources) => resources.pending.complete(signal).err(),
                    None => Some(signal),
                };
                if let Some(signal) = unmatched {
                    self.forward(signal);
                }
            }
            ClientRouted::Search(signal) => {
                let signal = self.track_search(signal);
                self.forward(signal);
            }
        }
    }

    /// Assigns subscription ids and remembers open subscriptions.
    fn track_search(&mut self, signal: Signal) -> Signal {
        let Signal::Search(mut search) = signal else {
            return signal;
        };
        if search.action == Action::Subscribe && search.subscription_id.is_none() {
            search.subscription_id = Some(format!("{}_{}", self.connection_id, Uuid::new_v4()));
        }
        if let (Some(resources), Some(id)) = (self.resources.as_mut(), search.subscription_id.as_ref()) {
            match search.action {
                Action::Subscribe => {
                    resources.subscriptions.insert(id.clone());
                }
                Action::Cancel | Action::Complete | Action::Failed => {
                    resources.subscriptions.remove(id);
                }
                _ => {}
            }
        }
        Signal::Search(search)
    }

    fn forward(&self, signal: Signal) {
        let forwarder = Arc::clone(&self.context.forwarder);
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.forward(signal).await {
                warn!(%connection_id, error = %e, "Forwarding routed signal failed");
            }
        });
    }

    // === Resources ===

    fn start_resources(&self) -> Result<ClientResources, ConnectivityError> {
        let connection = Arc::clone(&self.data.connection);
        let settings = &self.context.settings.connectivity;
        let registry = Arc::new(MessageMapperRegistry::build(&connection, &self.context.mapper_factories)?);
        let token = self.shutdown.child_token();
        let pending = PendingResponses::default();

        let outbound = Arc::new(OutboundDispatcher::new(
            Arc::clone(&connection),
            OutboundMappingProcessor::new(
                self.connection_id.clone(),
                Arc::clone(&registry),
                Arc::clone(&self.context.adapter),
            ),
            Arc::clone(&self.connector),
            Arc::clone(&self.context.forwarder),
            self.context.enrichment.clone(),
            pending.clone(),
            self.failures_tx.clone(),
            Arc::clone(&self.metrics),
            self.logger.clone(),
            settings.acks,
        ));
        let starter = AggregatorStarter::spawn(
            self.connection_id.clone(),
            Arc::clone(&self.context.forwarder),
            settings.acks,
            &token,
        );
        let inbound = Arc::new(InboundDispatcher::new(
            Arc::clone(&connection),
            InboundMappingProcessor::new(
                self.connection_id.clone(),
                registry,
                Arc::clone(&self.context.adapter),
                settings.mapping.max_header_bytes,
            ),
            Arc::clone(&self.context.forwarder),
            starter,
            Arc::clone(&outbound),
            self.routed_tx.clone(),
            Arc::clone(&self.metrics),
            self.logger.clone(),
            settings.acks,
        ));

        let inbound_pool = WorkerPool::spawn(
            format!("{}-inbound-{}", self.connection_id, self.index),
            settings.mapping.pool_size(connection.processor_pool_size),
            settings.mapping.queue_capacity,
            &token,
            move |job: InboundJob| {
                let dispatcher = Arc::clone(&inbound);
                async move { dispatcher.handle(job).await }
            },
        );
        let outbound_pool = WorkerPool::spawn(
            format!("{}-outbound-{}", self.connection_id, self.index),
            settings.mapping.pool_size(connection.outbound_processor_pool_size),
            settings.mapping.queue_capacity,
            &token,
            move |job: OutboundJob| {
                let dispatcher = Arc::clone(&outbound);
                async move { dispatcher.handle(job).await }
            },
        );

        Ok(ClientResources {
            inbound: Arc::new(inbound_pool),
            outbound: Arc::new(outbound_pool),
            pending,
            subscriptions: HashSet::new(),
            token,
        })
    }

    /// Releases the connected episode's resources. Safe to call repeatedly.
    async fn cleanup(&mut self) {
        self.sink.unbind();
        if let Some(resources) = self.resources.take() {
            for subscription_id in resources.subscriptions {
                debug!(connection_id = %self.connection_id, %subscription_id, "Cancelling search subscription");
                self.forward(Signal::Search(SearchCommand {
                    action: Action::Cancel,
                    subscription_id: Some(subscription_id),
                    filter: None,
                    namespaces: Vec::new(),
                    fields: None,
                    demand: None,
                    headers: DittoHeaders::new(),
                }));
            }
            resources.pending.clear();
            resources.inbound.shutdown();
            resources.outbound.shutdown();
            resources.token.cancel();
        }
        self.connector.cleanup(&self.data.connection).await;
    }

    // === Helpers ===

    fn goto(&mut self, state: ClientState) {
        if self.state != state {
            debug!(connection_id = %self.connection_id, client = self.index, from = %self.state, to = %state, "State transition");
        }
        self.state = state;
        let client = &self.context.settings.connectivity.client;
        self.deadline = match state {
            ClientState::Connecting => Some(Instant::now() + client.connecting_timeout()),
            ClientState::Disconnecting => Some(Instant::now() + client.disconnecting_timeout()),
            ClientState::Testing => Some(Instant::now() + client.testing_timeout()),
            _ => None,
        };
    }

    fn await_transition(&mut self, headers: DittoHeaders, reply: Option<oneshot::Sender<CommandResult>>, state: ClientState) {
        self.pending_reply = reply;
        self.data = self.data.with_session(Some(headers));
        self.goto(state);
    }

    fn session_headers(&self) -> DittoHeaders {
        self.data.session_headers.clone().unwrap_or_default()
    }

    /// Answers the command waiting for the current transition, if any.
    fn answer(&mut self, result: Result<(), ConnectivityError>) {
        let headers = self.session_headers();
        self.data = self.data.with_session(None);
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(result.map_err(|e| CommandFailure::new(e, headers)));
        }
    }

    fn record_failure(&mut self, error: &ConnectivityError) {
        self.data = self.data.with_status(ConnectivityStatus::Failed, Some(error.to_string()));
        self.logger
            .log(LogEntry::failure(LogCategory::Connection, LogType::Other, error.to_string()));
    }

    async fn status(&self) -> ClientStatus {
        let connection = &self.data.connection;
        let (sources, targets) = if self.state == ClientState::Connected {
            tokio::join!(
                self.connector.source_status(connection),
                self.connector.target_status(connection)
            )
        } else {
            (BTreeMap::new(), BTreeMap::new())
        };
        ClientStatus {
            client_index: self.index,
            state: self.state,
            status: self.data.connection_status,
            status_details: self.data.status_details.clone(),
            in_state_since: self.data.in_state_since,
            sources,
            targets,
            metrics: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ng_connectivity_models::ConnectionType;
    use ng_connectivity_sdk::{AcknowledgementLabel, DittoProtocolAdapter, ExternalMessage};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    /// Connector that reports what the test tells it to.
    #[derive(Default)]
    struct ScriptedConnector {
        answer_connect: bool,
        stall_publish: bool,
        cleanups: AtomicUsize,
        events: Mutex<Option<ConnectorEvents>>,
    }

    #[async_trait]
    impl ClientConnector for ScriptedConnector {
        async fn connect(&self, _: &Connection, _: InboundSink, events: ConnectorEvents) -> Result<(), ConnectivityError> {
            if self.answer_connect {
                events.connected();
            }
            *self.events.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn disconnect(&self, _: &Connection, events: ConnectorEvents) -> Result<(), ConnectivityError> {
            events.disconnected();
            Ok(())
        }

        async fn test_connection(&self, _: &Connection) -> Result<(), ConnectivityError> {
            Ok(())
        }

        async fn publish(
            &self,
            _: &str,
            _: ExternalMessage,
            _: Option<&AcknowledgementLabel>,
        ) -> Result<Option<Signal>, PublishError> {
            if self.stall_publish {
                std::future::pending::<()>().await;
            }
            Ok(None)
        }

        async fn cleanup(&self, _: &Connection) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoopForwarder;

    #[async_trait]
    impl SignalForwarder for NoopForwarder {
        async fn forward(&self, _: Signal) -> Result<(), ConnectivityError> {
            Ok(())
        }

        async fn forward_with_responses(&self, _: Signal, _: mpsc::Sender<Signal>) -> Result<(), ConnectivityError> {
            Ok(())
        }
    }

    fn context() -> ClientContext {
        ClientContext {
            forwarder: Arc::new(NoopForwarder),
            enrichment: None,
            mapper_factories: Arc::new(MapperFactoryRegistry::with_builtins()),
            adapter: Arc::new(DittoProtocolAdapter::new()),
            settings: Settings::default(),
        }
    }

    async fn listening_connection() -> (tokio::net::TcpListener, Arc<Connection>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connection = Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, format!("tcp://127.0.0.1:{port}"));
        (listener, Arc::new(connection))
    }

    fn actor(connection: Arc<Connection>, connector: Arc<ScriptedConnector>) -> ClientActor {
        ClientActor::new(
            0,
            ClientMode::Standard,
            connection,
            connector,
            context(),
            Arc::new(ConnectionMetrics::default()),
            ConnectionLogger::new(10),
            None,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn open_then_close_walks_the_happy_path() {
        let (_listener, connection) = listening_connection().await;
        let connector = Arc::new(ScriptedConnector {
            answer_connect: true,
            ..Default::default()
        });
        let mut actor = actor(connection, Arc::clone(&connector));

        let (tx, rx) = oneshot::channel();
        actor.on_command(ClientCommand::Open { headers: DittoHeaders::new(), reply: Some(tx) }).await;
        assert_eq!(actor.state(), ClientState::Connecting);
        let event = actor.events_rx.recv().await.unwrap();
        actor.on_connector_event(event).await;
        assert_eq!(actor.state(), ClientState::Connected);
        assert!(rx.await.unwrap().is_ok());
        assert!(actor.sink.is_bound());

        let (tx, rx) = oneshot::channel();
        actor.on_command(ClientCommand::Close { headers: DittoHeaders::new(), reply: Some(tx) }).await;
        assert_eq!(actor.state(), ClientState::Disconnecting);
        let event = actor.events_rx.recv().await.unwrap();
        actor.on_connector_event(event).await;
        assert_eq!(actor.state(), ClientState::Disconnected);
        assert!(rx.await.unwrap().is_ok());
        assert!(!actor.sink.is_bound());
    }

    #[tokio::test]
    async fn events_of_superseded_attempts_are_ignored() {
        let (_listener, connection) = listening_connection().await;
        let connector = Arc::new(ScriptedConnector::default());
        let mut actor = actor(connection, Arc::clone(&connector));

        actor.on_command(ClientCommand::Open { headers: DittoHeaders::new(), reply: None }).await;
        let stale = connector.events.lock().unwrap().clone().unwrap();
        actor.epoch += 1;
        stale.connected();
        let event = actor.events_rx.recv().await.unwrap();
        actor.on_connector_event(event).await;
        assert_eq!(actor.state(), ClientState::Connecting);

        stale.detached().failed(ConnectivityError::Internal { message: "lost".into() });
        let event = actor.events_rx.recv().await.unwrap();
        actor.on_connector_event(event).await;
        assert_eq!(actor.state(), ClientState::Unknown);
        assert_eq!(actor.data.connection_status, ConnectivityStatus::Failed);
    }

    #[tokio::test]
    async fn commands_during_transition_are_not_allowed() {
        let (_listener, connection) = listening_connection().await;
        let mut actor = actor(connection, Arc::new(ScriptedConnector::default()));
        actor.on_command(ClientCommand::Open { headers: DittoHeaders::new(), reply: None }).await;

        let (tx, rx) = oneshot::channel();
        let headers = DittoHeaders::new().with_correlation_id("close-1");
        actor.on_command(ClientCommand::Close { headers, reply: Some(tx) }).await;
        let failure = rx.await.unwrap().unwrap_err();
        assert!(matches!(failure.error, ConnectivityError::OperationNotAllowedDuringTransition { .. }));
        assert_eq!(failure.headers.correlation_id(), Some("close-1"));

        let mut idle = self::actor(
            Arc::new(Connection::new(ConnectionId::new("d"), ConnectionType::Mqtt, "tcp://127.0.0.1:1")),
            Arc::new(ScriptedConnector::default()),
        );
        let (tx, rx) = oneshot::channel();
        idle.state = ClientState::Connected;
        idle.on_command(ClientCommand::Test { headers: DittoHeaders::new(), reply: tx }).await;
        assert!(matches!(rx.await.unwrap().unwrap_err().error, ConnectivityError::IllegalForState { .. }));
    }

    #[tokio::test]
    async fn saturated_outbound_queue_does_not_block_the_actor() {
        use ng_connectivity_models::{
            settings::{Connectivity, Inner, MappingConfig},
            FilteredTopic, TopicKind,
        };
        use ng_connectivity_sdk::{Channel, EntityId, Event};

        let (_listener, connection) = listening_connection().await;
        let connector = Arc::new(ScriptedConnector {
            answer_connect: true,
            stall_publish: true,
            ..Default::default()
        });
        let mut context = context();
        context.settings = Settings::from_inner(Inner {
            connectivity: Connectivity {
                mapping: MappingConfig {
                    max_pool_size: 1,
                    queue_capacity: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        });
        let metrics = Arc::new(ConnectionMetrics::default());
        let mut actor = ClientActor::new(
            0,
            ClientMode::Standard,
            connection,
            connector,
            context,
            Arc::clone(&metrics),
            ConnectionLogger::new(10),
            None,
            CancellationToken::new(),
        );
        actor.on_command(ClientCommand::Open { headers: DittoHeaders::new(), reply: None }).await;
        let event = actor.events_rx.recv().await.unwrap();
        actor.on_connector_event(event).await;
        assert_eq!(actor.state(), ClientState::Connected);

        let target = Target::new("out", vec![FilteredTopic::new(TopicKind::TwinEvents)]);
        let signal = Signal::Event(Event {
            entity_id: EntityId::thing("org", "lamp"),
            channel: Channel::Twin,
            action: Action::Modified,
            path: "/attributes/on".into(),
            value: None,
            revision: Some(1),
            timestamp: None,
            headers: DittoHeaders::new(),
        });
        let flood = async {
            for _ in 0..8 {
                actor
                    .on_command(ClientCommand::Publish {
                        signal: signal.clone(),
                        targets: vec![target.clone()],
                    })
                    .await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), flood)
            .await
            .expect("publishing never waits on the queue");
        assert!(metrics.snapshot().publish_failures >= 1);

        let (tx, rx) = oneshot::channel();
        actor.on_command(ClientCommand::RetrieveStatus { headers: DittoHeaders::new(), reply: tx }).await;
        assert_eq!(rx.await.unwrap().unwrap().state, ClientState::Connected);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let (_listener, connection) = listening_connection().await;
        let connector = Arc::new(ScriptedConnector {
            answer_connect: true,
            ..Default::default()
        });
        let mut actor = actor(connection, Arc::clone(&connector));
        actor.on_command(ClientCommand::Open { headers: DittoHeaders::new(), reply: None }).await;
        let event = actor.events_rx.recv().await.unwrap();
        actor.on_connector_event(event).await;

        actor.cleanup().await;
        actor.cleanup().await;
        assert!(actor.resources.is_none());
        assert!(!actor.sink.is_bound());
        assert_eq!(connector.cleanups.load(Ordering::SeqCst), 2);
    }
}
