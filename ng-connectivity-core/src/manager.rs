//! ConnectionManager: hosts every connection of the process
//!
//! Responsibilities:
//! - Validate connections and dry-run their mapper configuration before accepting them
//! - Journal each lifecycle change before applying it, and recover by replay
//! - Run `client_count` supervised client actors per started connection
//! - Route commands to the clients and aggregate their answers
//! - Route outbound signals to the connections whose targets may read and subscribe to them

use crate::{
    ack::ResponseCollector,
    client::{
        ClientActor, ClientCommand, ClientContext, ClientMode, ClientStatus, CommandFailure, CommandResult,
        ConnectorRegistry,
    },
    enrichment::CachingSignalEnrichmentFacade,
    journal::ConnectionJournal,
    logs::{ConnectionLogger, LogEntry},
    mapping::MessageMapperRegistry,
    metrics::{ConnectionMetrics, ConnectionMetricsSnapshot},
    supervisor::SupervisedClient,
};
use dashmap::DashMap;
use futures::future::join_all;
use ng_connectivity_models::{apply_event, Connection, ConnectionEvent, ConnectionId, ConnectivityStatus};
use ng_connectivity_sdk::{ConnectivityError, DittoHeaders, Signal};
use serde::Serialize;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub type ManagerResult<T> = Result<T, CommandFailure>;

/// Aggregated status of all clients of one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connection_id: ConnectionId,
    pub desired_status: ConnectivityStatus,
    /// `open` when any client is connected, `failed` when any failed, otherwise `closed`
    pub live_status: ConnectivityStatus,
    pub clients: Vec<ClientStatus>,
    /// Clients that did not answer in time or could not be reached
    pub client_errors: Vec<String>,
    pub metrics: ConnectionMetricsSnapshot,
}

struct ManagedConnection {
    connection: Arc<Connection>,
    clients: Vec<Arc<SupervisedClient>>,
}

pub struct ConnectionManager {
    connections: Arc<DashMap<ConnectionId, ManagedConnection>>,
    journal: Arc<dyn ConnectionJournal>,
    registry: ConnectorRegistry,
    context: ClientContext,
    /// Serializes lifecycle changes
    operations: Mutex<()>,
    shutdown_token: CancellationToken,
}

fn failure(error: ConnectivityError, headers: &DittoHeaders) -> CommandFailure {
    CommandFailure::new(error, headers.clone())
}

fn not_accessible(connection_id: &ConnectionId) -> ConnectivityError {
    ConnectivityError::ConnectionNotAccessible {
        connection_id: connection_id.to_string(),
    }
}

impl ConnectionManager {
    /// A configured enrichment facade is wrapped in one cache shared by all connections.
    pub fn new(
        journal: Arc<dyn ConnectionJournal>,
        registry: ConnectorRegistry,
        mut context: ClientContext,
        shutdown_token: CancellationToken,
    ) -> Self {
        if let Some(delegate) = context.enrichment.take() {
            let caching = CachingSignalEnrichmentFacade::new(delegate, &context.settings.connectivity.enrichment);
            context.enrichment = Some(Arc::new(caching));
        }
        Self {
            connections: Arc::new(DashMap::new()),
            journal,
            registry,
            context,
            operations: Mutex::new(()),
            shutdown_token,
        }
    }

    // === Accessors ===

    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .map(|managed| Arc::clone(&managed.connection))
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Connection log entries of all clients, oldest first.
    pub fn logs(&self, connection_id: &ConnectionId) -> Vec<LogEntry> {
        let Some(clients) = self.clients(connection_id) else {
            return Vec::new();
        };
        let mut entries: Vec<LogEntry> = clients.iter().flat_map(|c| c.logger().entries()).collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    fn clients(&self, connection_id: &ConnectionId) -> Option<Vec<Arc<SupervisedClient>>> {
        self.connections.get(connection_id).map(|managed| managed.clients.clone())
    }

    // === Lifecycle commands ===

    #[instrument(name = "connection-create", skip_all, fields(connection_id = %connection.id))]
    pub async fn create(&self, connection: Connection, headers: DittoHeaders) -> ManagerResult<Arc<Connection>> {
        let _guard = self.operations.lock().await;
        if self.connections.contains_key(&connection.id) {
            return Err(failure(
                ConnectivityError::ConnectionConfigurationInvalid {
                    message: format!("connection '{}' already exists", connection.id),
                },
                &headers,
            ));
        }
        self.check(&connection).map_err(|e| failure(e, &headers))?;
        let connection = self.persist(None, ConnectionEvent::created(connection), &headers).await?;
        let clients = self.start_clients(&connection);
        self.connections.insert(
            connection.id.clone(),
            ManagedConnection {
                connection: Arc::clone(&connection),
                clients: clients.clone(),
            },
        );
        info!(clients = clients.len(), "Connection created");
        if connection.connection_status == ConnectivityStatus::Open {
            broadcast(&clients, &headers, |headers, reply| ClientCommand::Open {
                headers,
                reply: Some(reply),
            })
            .await?;
        }
        Ok(connection)
    }

    #[instrument(name = "connection-modify", skip_all, fields(connection_id = %connection.id))]
    pub async fn modify(&self, connection: Connection, headers: DittoHeaders) -> ManagerResult<Arc<Connection>> {
        let _guard = self.operations.lock().await;
        let current = self
            .get(&connection.id)
            .ok_or_else(|| failure(not_accessible(&connection.id), &headers))?;
        self.check(&connection).map_err(|e| failure(e, &headers))?;
        let connection = self
            .persist(Some(current.as_ref().clone()), ConnectionEvent::modified(connection), &headers)
            .await?;

        if let Some((_, old)) = self.connections.remove(&connection.id) {
            stop_clients(&old.clients, &headers).await;
        }
        let clients = self.start_clients(&connection);
        self.connections.insert(
            connection.id.clone(),
            ManagedConnection {
                connection: Arc::clone(&connection),
                clients: clients.clone(),
            },
        );
        info!(revision = connection.revision, "Connection modified");
        if connection.connection_status == ConnectivityStatus::Open {
            broadcast(&clients, &headers, |headers, reply| ClientCommand::Open {
                headers,
                reply: Some(reply),
            })
            .await?;
        }
        Ok(connection)
    }

    #[instrument(name = "connection-open", skip(self, headers))]
    pub async fn open(&self, connection_id: &ConnectionId, headers: DittoHeaders) -> ManagerResult<()> {
        let _guard = self.operations.lock().await;
        let current = self
            .get(connection_id)
            .ok_or_else(|| failure(not_accessible(connection_id), &headers))?;
        let connection = self
            .persist(
                Some(current.as_ref().clone()),
                ConnectionEvent::opened(connection_id.clone()),
                &headers,
            )
            .await?;
        let clients = self.replace_connection(&connection);
        broadcast(&clients, &headers, |headers, reply| ClientCommand::Open {
            headers,
            reply: Some(reply),
        })
        .await
    }

    #[instrument(name = "connection-close", skip(self, headers))]
    pub async fn close(&self, connection_id: &ConnectionId, headers: DittoHeaders) -> ManagerResult<()> {
        let _guard = self.operations.lock().await;
        let current = self
            .get(connection_id)
            .ok_or_else(|| failure(not_accessible(connection_id), &headers))?;
        let connection = self
            .persist(
                Some(current.as_ref().clone()),
                ConnectionEvent::closed(connection_id.clone()),
                &headers,
            )
            .await?;
        let clients = self.replace_connection(&connection);
        broadcast(&clients, &headers, |headers, reply| ClientCommand::Close {
            headers,
            reply: Some(reply),
        })
        .await
    }

    #[instrument(name = "connection-delete", skip(self, headers))]
    pub async fn delete(&self, connection_id: &ConnectionId, headers: DittoHeaders) -> ManagerResult<()> {
        let _guard = self.operations.lock().await;
        let current = self
            .get(connection_id)
            .ok_or_else(|| failure(not_accessible(connection_id), &headers))?;
        self.persist(
            Some(current.as_ref().clone()),
            ConnectionEvent::deleted(connection_id.clone()),
            &headers,
        )
        .await?;
        if let Some((_, managed)) = self.connections.remove(connection_id) {
            stop_clients(&managed.clients, &headers).await;
        }
        info!("Connection deleted");
        Ok(())
    }

    /// Tests `connection` with a disposable client; nothing is journaled.
    #[instrument(name = "connection-test", skip_all, fields(connection_id = %connection.id))]
    pub async fn test(&self, connection: Connection, headers: DittoHeaders) -> ManagerResult<()> {
        connection.validate().map_err(|e| failure(e, &headers))?;
        let connector = self.registry.create(&connection).map_err(|e| failure(e, &headers))?;
        let actor = ClientActor::new(
            0,
            ClientMode::Test,
            Arc::new(connection),
            connector,
            self.context.clone(),
            Arc::new(ConnectionMetrics::default()),
            ConnectionLogger::new(self.context.settings.connectivity.logs.capacity),
            None,
            self.shutdown_token.child_token(),
        );
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(actor.run(rx));
        let (reply, answer) = oneshot::channel();
        let command = ClientCommand::Test {
            headers: headers.clone(),
            reply,
        };
        if let Err(e) = tx.send(command).await {
            e.0.fail(ConnectivityError::Internal {
                message: "test client stopped before the test started".to_string(),
            });
        }
        answer.await.unwrap_or_else(|_| {
            Err(failure(
                ConnectivityError::Internal {
                    message: "test client stopped without answering".to_string(),
                },
                &headers,
            ))
        })
    }

    /// Asks every client for its status; the expected count is set once all asks are out.
    #[instrument(name = "connection-status", skip(self, headers))]
    pub async fn retrieve_status(
        &self,
        connection_id: &ConnectionId,
        headers: DittoHeaders,
    ) -> ManagerResult<ConnectionStatus> {
        let connection = self
            .get(connection_id)
            .ok_or_else(|| failure(not_accessible(connection_id), &headers))?;
        let clients = self.clients(connection_id).unwrap_or_default();

        let timeout = self.context.settings.connectivity.acks.collector_timeout();
        let (collector, done) = ResponseCollector::<Result<ClientStatus, CommandFailure>>::spawn(timeout);
        for client in &clients {
            let client = Arc::clone(client);
            let collector = collector.clone();
            let headers = headers.clone();
            tokio::spawn(async move {
                let (reply, answer) = oneshot::channel();
                client
                    .send(ClientCommand::RetrieveStatus {
                        headers: headers.clone(),
                        reply,
                    })
                    .await;
                let status = answer.await.unwrap_or_else(|_| {
                    Err(CommandFailure::new(
                        ConnectivityError::Internal {
                            message: format!("client {} dropped the status request", client.index()),
                        },
                        headers,
                    ))
                });
                collector.push(status);
            });
        }
        collector.set_count(clients.len());
        drop(collector);

        let output = done.await.map_err(|_| {
            failure(
                ConnectivityError::Internal {
                    message: "status collector vanished".to_string(),
                },
                &headers,
            )
        })?;
        let mut statuses = Vec::new();
        let mut client_errors = Vec::new();
        for response in output.responses {
            match response {
                Ok(status) => statuses.push(status),
                Err(e) => client_errors.push(e.to_string()),
            }
        }
        if output.timed_out {
            client_errors.push(format!(
                "{} of {} clients did not answer in time",
                clients.len().saturating_sub(statuses.len() + client_errors.len()),
                clients.len()
            ));
        }
        statuses.sort_by_key(|s| s.client_index);
        let metrics = statuses
            .iter()
            .fold(ConnectionMetricsSnapshot::default(), |acc, s| acc.merge(&s.metrics));
        let live_status = if statuses.iter().any(|s| s.status == ConnectivityStatus::Open) {
            ConnectivityStatus::Open
        } else if statuses.iter().any(|s| s.status == ConnectivityStatus::Failed) || !client_errors.is_empty() {
            ConnectivityStatus::Failed
        } else {
            ConnectivityStatus::Closed
        };
        Ok(ConnectionStatus {
            connection_id: connection_id.clone(),
            desired_status: connection.connection_status,
            live_status,
            clients: statuses,
            client_errors,
            metrics,
        })
    }

    // === Outbound ===

    /// Hands `signal` to every connection with a target authorized for and subscribed to it.
    ///
    /// Within a connection the client is picked by entity id, so signals of one entity
    /// keep their order. Returns the number of connections the signal went to.
    pub async fn publish(&self, signal: Signal) -> usize {
        let routes: Vec<(Arc<SupervisedClient>, Vec<_>)> = self
            .connections
            .iter()
            .filter(|entry| !entry.connection.is_deleted() && !entry.clients.is_empty())
            .filter_map(|entry| {
                let targets: Vec<_> = entry
                    .connection
                    .targets
                    .iter()
                    .filter(|t| t.accepts(&signal))
                    .cloned()
                    .collect();
                if targets.is_empty() {
                    return None;
                }
                let index = client_index(&signal, entry.clients.len());
                Some((Arc::clone(&entry.clients[index]), targets))
            })
            .collect();

        let count = routes.len();
        for (client, targets) in routes {
            client
                .send(ClientCommand::Publish {
                    signal: signal.clone(),
                    targets,
                })
                .await;
        }
        debug!(correlation_id = ?signal.correlation_id(), connections = count, "Signal routed to connections");
        count
    }

    // === Recovery ===

    /// Replays the journal and restarts every connection that was not deleted.
    /// Connections whose desired status is OPEN are reopened.
    #[instrument(name = "connection-recover", skip_all)]
    pub async fn recover(&self) -> ManagerResult<usize> {
        let _guard = self.operations.lock().await;
        let headers = DittoHeaders::new();
        let journaled = self.journal.all_events().await.map_err(|e| {
            failure(
                ConnectivityError::Internal {
                    message: format!("reading the journal failed: {e}"),
                },
                &headers,
            )
        })?;

        let mut opened = Vec::new();
        let mut recovered = 0;
        for (connection_id, events) in journaled {
            let Some(connection) = events.iter().fold(None, apply_event) else {
                continue;
            };
            if connection.is_deleted() || self.connections.contains_key(&connection_id) {
                continue;
            }
            let connection = Arc::new(connection);
            let clients = self.start_clients(&connection);
            if connection.connection_status == ConnectivityStatus::Open {
                opened.extend(clients.iter().cloned());
            }
            self.connections
                .insert(connection_id, ManagedConnection { connection, clients });
            recovered += 1;
        }

        let results = join_all(opened.iter().map(|client| async move {
            let (reply, answer) = oneshot::channel();
            client
                .send(ClientCommand::Open {
                    headers: DittoHeaders::new(),
                    reply: Some(reply),
                })
                .await;
            answer.await
        }))
        .await;
        for result in results {
            if let Ok(Err(e)) = result {
                warn!(error = %e, "Reopening recovered connection failed");
            }
        }
        info!(recovered, "Connections recovered from journal");
        Ok(recovered)
    }

    pub async fn shutdown(&self) {
        let ids = self.connection_ids();
        for connection_id in ids {
            if let Some((_, managed)) = self.connections.remove(&connection_id) {
                for client in &managed.clients {
                    client.shutdown();
                }
            }
        }
        self.shutdown_token.cancel();
        info!("Connection manager stopped");
    }

    // === Helpers ===

    /// Static validation, connector availability and a mapper registry dry-run.
    fn check(&self, connection: &Connection) -> Result<(), ConnectivityError> {
        connection.validate()?;
        if !self.registry.contains(connection.connection_type) {
            return Err(ConnectivityError::ConnectionConfigurationInvalid {
                message: format!("no connector registered for {:?}", connection.connection_type),
            });
        }
        MessageMapperRegistry::build(connection, &self.context.mapper_factories)?;
        Ok(())
    }

    /// Journals `event`, then applies it.
    async fn persist(
        &self,
        current: Option<Connection>,
        event: ConnectionEvent,
        headers: &DittoHeaders,
    ) -> ManagerResult<Arc<Connection>> {
        self.journal.append(event.clone()).await.map_err(|e| {
            failure(
                ConnectivityError::Internal {
                    message: format!("journaling {} failed: {e}", event.name()),
                },
                headers,
            )
        })?;
        let connection_id = event.connection_id().clone();
        apply_event(current, &event)
            .map(Arc::new)
            .ok_or_else(|| failure(not_accessible(&connection_id), headers))
    }

    fn start_clients(&self, connection: &Arc<Connection>) -> Vec<Arc<SupervisedClient>> {
        (0..connection.client_count.max(1))
            .map(|index| {
                Arc::new(SupervisedClient::spawn(
                    index,
                    Arc::clone(connection),
                    self.registry.clone(),
                    self.context.clone(),
                    &self.shutdown_token,
                ))
            })
            .collect()
    }

    /// Stores the new connection value, keeping the running clients. Clients restarted
    /// later start from the new value.
    fn replace_connection(&self, connection: &Arc<Connection>) -> Vec<Arc<SupervisedClient>> {
        match self.connections.get_mut(&connection.id) {
            Some(mut managed) => {
                managed.connection = Arc::clone(connection);
                for client in &managed.clients {
                    client.update_connection(Arc::clone(connection));
                }
                managed.clients.clone()
            }
            None => Vec::new(),
        }
    }
}

/// Client responsible for the signal's entity.
fn client_index(signal: &Signal, clients: usize) -> usize {
    if clients <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    match signal.entity_id() {
        Some(entity_id) => entity_id.hash(&mut hasher),
        None => signal.correlation_id().hash(&mut hasher),
    }
    (hasher.finish() % clients as u64) as usize
}

/// Sends one command to every client; the first failure wins.
async fn broadcast<F>(clients: &[Arc<SupervisedClient>], headers: &DittoHeaders, make: F) -> CommandResult
where
    F: Fn(DittoHeaders, oneshot::Sender<CommandResult>) -> ClientCommand,
{
    let answers = join_all(clients.iter().map(|client| {
        let (reply, answer) = oneshot::channel();
        let command = make(headers.clone(), reply);
        async move {
            client.send(command).await;
            answer.await.unwrap_or_else(|_| {
                Err(CommandFailure::new(
                    ConnectivityError::Internal {
                        message: format!("client {} stopped without answering", client.index()),
                    },
                    headers.clone(),
                ))
            })
        }
    }))
    .await;
    answers.into_iter().collect()
}

async fn stop_clients(clients: &[Arc<SupervisedClient>], headers: &DittoHeaders) {
    if let Err(e) = broadcast(clients, headers, |headers, reply| ClientCommand::Close {
        headers,
        reply: Some(reply),
    })
    .await
    {
        debug!(error = %e, "Closing clients before stop failed");
    }
    for client in clients {
        client.shutdown();
    }
}
