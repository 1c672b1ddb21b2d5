mod common;

use common::*;
use ng_connectivity_core::{
    client::{ClientCommand, ClientContext, ClientState, ConnectorRegistry},
    journal::InMemoryConnectionJournal,
    manager::ConnectionManager,
    supervisor::SupervisedClient,
    ClientStatus, CommandFailure,
};
use ng_connectivity_models::{ConnectivityStatus, FilteredTopic, Target, TopicKind};
use ng_connectivity_sdk::{Action, Channel, ConnectivityError, DittoHeaders, EntityId, Event, Signal};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

fn lamp_event() -> Signal {
    Signal::Event(Event {
        entity_id: EntityId::thing("org", "lamp"),
        channel: Channel::Twin,
        action: Action::Modified,
        path: "/attributes/on".into(),
        value: Some(json!(true)),
        revision: Some(1),
        timestamp: None,
        headers: DittoHeaders::new().with_correlation_id("restart-1"),
    })
}

fn enriched_target() -> Target {
    Target::new(
        "rooms",
        vec![FilteredTopic::new(TopicKind::TwinEvents).with_extra_fields(["attributes/room"])],
    )
}

/// Context whose enrichment fails with an internal error, so the first publish restarts the client.
fn restarting_context(init_timeout_ms: u64, min_backoff_ms: u64, max_backoff_ms: u64) -> ClientContext {
    let (forwarder, _rx) = RecordingForwarder::new();
    let mut context = context(forwarder);
    context.enrichment = Some(Arc::new(FailingEnrichment::new(ConnectivityError::Internal {
        message: "things service down".into(),
    })));
    context.settings = test_settings_with(|inner| {
        inner.connectivity.client.init_timeout_ms = init_timeout_ms;
        inner.connectivity.supervisor.min_backoff_ms = min_backoff_ms;
        inner.connectivity.supervisor.max_backoff_ms = max_backoff_ms;
    });
    context
}

fn registry(connector: &Arc<MockConnector>) -> ConnectorRegistry {
    let registry = ConnectorRegistry::new();
    registry.register(Arc::new(MockConnectorFactory {
        connector: connector.clone(),
    }));
    registry
}

async fn client_status(client: &SupervisedClient, headers: DittoHeaders) -> Result<ClientStatus, CommandFailure> {
    let (reply, answer) = oneshot::channel();
    client.send(ClientCommand::RetrieveStatus { headers, reply }).await;
    tokio::time::timeout(Duration::from_secs(1), answer)
        .await
        .expect("status answered")
        .expect("reply kept")
}

#[tokio::test]
async fn open_right_after_create_reaches_the_first_client() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let connector = Arc::new(MockConnector::new(ConnectBehavior::Connect));
    let (forwarder, _rx) = RecordingForwarder::new();
    let manager = ConnectionManager::new(
        Arc::new(InMemoryConnectionJournal::new()),
        registry(&connector),
        context(forwarder),
        CancellationToken::new(),
    );
    let connection = mqtt_connection("eager", port).with_client_count(2);
    let id = connection.id.clone();

    manager.create(connection, DittoHeaders::new()).await.unwrap();
    manager.open(&id, DittoHeaders::new()).await.unwrap();
    assert_eq!(connector.connects(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn restarted_client_reopens_from_the_latest_connection() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let connector = Arc::new(MockConnector::new(ConnectBehavior::Connect));
    let manager = ConnectionManager::new(
        Arc::new(InMemoryConnectionJournal::new()),
        registry(&connector),
        restarting_context(200, 10, 100),
        CancellationToken::new(),
    );
    let connection = mqtt_connection("reopened", port).with_target(enriched_target());
    let id = connection.id.clone();
    manager.create(connection, DittoHeaders::new()).await.unwrap();
    manager.open(&id, DittoHeaders::new()).await.unwrap();
    assert_eq!(connector.connects(), 1);

    assert_eq!(manager.publish(lamp_event()).await, 1);
    assert!(eventually(|| async { connector.connects() == 2 }).await, "restarted client opens again");
    assert!(
        eventually(|| async {
            let status = manager.retrieve_status(&id, DittoHeaders::new()).await.unwrap();
            status.live_status == ConnectivityStatus::Open && status.clients[0].state == ClientState::Connected
        })
        .await
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn failed_client_fails_fast_until_restarted_and_resets_its_backoff() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let connector = Arc::new(MockConnector::new(ConnectBehavior::Connect));
    let connection = mqtt_connection("flaky", port)
        .with_status(ConnectivityStatus::Open)
        .with_target(enriched_target());
    let targets = connection.targets.clone();
    let token = CancellationToken::new();
    let client = SupervisedClient::spawn(
        0,
        Arc::new(connection),
        registry(&connector),
        restarting_context(100, 400, 400),
        &token,
    );

    assert!(eventually(|| async { connector.connects() == 1 }).await, "init timeout opens the client");
    assert!(
        eventually(|| async {
            client_status(&client, DittoHeaders::new())
                .await
                .is_ok_and(|s| s.state == ClientState::Connected)
        })
        .await
    );

    client
        .send(ClientCommand::Publish {
            signal: lamp_event(),
            targets,
        })
        .await;
    assert!(eventually(|| async { !client.is_running() }).await, "enrichment failure ends the actor");
    assert!(eventually(|| async { client.restart_count() == 1 }).await);

    let headers = DittoHeaders::new().with_correlation_id("during-backoff");
    let failure = client_status(&client, headers).await.unwrap_err();
    assert!(matches!(failure.error, ConnectivityError::ConnectionUnavailable { .. }));
    assert_eq!(failure.headers.correlation_id(), Some("during-backoff"));

    assert!(eventually(|| async { connector.connects() == 2 }).await, "restart after the backoff");
    assert!(eventually(|| async { client.restart_count() == 0 }).await, "connect resets the backoff");
    assert!(client_status(&client, DittoHeaders::new())
        .await
        .is_ok_and(|s| s.state == ClientState::Connected));
    token.cancel();
}

#[tokio::test]
async fn shut_down_client_answers_unavailable() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let connector = Arc::new(MockConnector::new(ConnectBehavior::Connect));
    let (forwarder, _rx) = RecordingForwarder::new();
    let token = CancellationToken::new();
    let client = SupervisedClient::spawn(
        0,
        Arc::new(mqtt_connection("stopped", port)),
        registry(&connector),
        context(forwarder),
        &token,
    );
    client.shutdown();
    assert!(eventually(|| async { !client.is_running() }).await);

    let failure = client_status(&client, DittoHeaders::new().with_correlation_id("late"))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ConnectivityError::ConnectionUnavailable { .. }));
    assert_eq!(failure.headers.correlation_id(), Some("late"));
    assert_eq!(connector.connects(), 0);
}
