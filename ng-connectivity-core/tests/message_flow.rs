mod common;

use common::*;
use ng_connectivity_core::{
    client::ConnectorRegistry,
    enrichment::SignalEnrichmentFacade,
    journal::InMemoryConnectionJournal,
    manager::ConnectionManager,
    mapping::{InboundMappingProcessor, MapperFactoryRegistry, MappingOutcome, MessageMapperRegistry},
};
use ng_connectivity_models::{Connection, ConnectionId, ConnectionType, FilteredTopic, Source, Target, TopicKind};
use ng_connectivity_sdk::{
    Action, Adaptable, AuthorizationContext, Channel, Command, ConnectivityError, DittoHeaders, DittoProtocolAdapter,
    Enforcement, EntityId, EntityType, Event, ExternalMessage, MapperFactory, MappingContext, MessageMapper,
    PayloadMapping, ProtocolAdapter, RqlFilter, Signal,
};
use serde_json::json;
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct FailingMapper;

impl MessageMapper for FailingMapper {
    fn id(&self) -> &str {
        "failing"
    }

    fn map_inbound(&self, _: &ExternalMessage) -> Result<Vec<Adaptable>, ConnectivityError> {
        Err(ConnectivityError::MappingFailed {
            message: "unsupported payload".into(),
            description: None,
        })
    }

    fn map_outbound(&self, _: &Adaptable) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        Ok(Vec::new())
    }
}

#[derive(Debug)]
struct SilentMapper;

impl MessageMapper for SilentMapper {
    fn id(&self) -> &str {
        "silent"
    }

    fn map_inbound(&self, _: &ExternalMessage) -> Result<Vec<Adaptable>, ConnectivityError> {
        Ok(Vec::new())
    }

    fn map_outbound(&self, _: &Adaptable) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        Ok(Vec::new())
    }
}

struct TestMappers;

impl MapperFactory for TestMappers {
    fn engine(&self) -> &'static str {
        "Test"
    }

    fn create(&self, id: &str, _: &MappingContext) -> Result<Arc<dyn MessageMapper>, ConnectivityError> {
        match id {
            "failing" => Ok(Arc::new(FailingMapper)),
            _ => Ok(Arc::new(SilentMapper)),
        }
    }
}

fn processor(connection: &Connection) -> InboundMappingProcessor {
    let factories = MapperFactoryRegistry::with_builtins();
    factories.register(Arc::new(TestMappers));
    let registry = Arc::new(MessageMapperRegistry::build(connection, &factories).unwrap());
    InboundMappingProcessor::new(connection.id.clone(), registry, Arc::new(DittoProtocolAdapter::new()), 5000)
}

fn twin_event_payload() -> String {
    json!({
        "topic": "org/lamp/things/twin/events/modified",
        "path": "/attributes/on",
        "value": true,
        "headers": {"correlation-id": "ev-1"}
    })
    .to_string()
}

fn json_message(mapping: &[&str]) -> ExternalMessage {
    ExternalMessage::new([("content-type", "application/json")])
        .with_text(twin_event_payload())
        .with_payload_mapping(PayloadMapping::new(mapping.iter().copied()))
}

#[test]
fn blocklisted_mapper_drops_while_sibling_maps() {
    let connection = Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, "tcp://h:1883")
        .with_mapping_definition("json", MappingContext::new("Ditto"))
        .with_mapping_definition(
            "binary",
            MappingContext::new("Ditto").with_option("content-type-blocklist", json!("application/json")),
        );
    let outcomes = processor(&connection).process(&json_message(&["json", "binary"]));
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(&outcomes[0], MappingOutcome::Mapped { mapper_id, .. } if mapper_id == "json"));
    assert!(matches!(&outcomes[1], MappingOutcome::Dropped { mapper_id } if mapper_id == "binary"));
}

#[test]
fn failing_mapper_leaves_sibling_output_untouched() {
    let connection = Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, "tcp://h:1883")
        .with_mapping_definition("failing", MappingContext::new("Test"))
        .with_mapping_definition("ditto", MappingContext::new("Ditto"));
    let p = processor(&connection);

    let together = p.process(&json_message(&["failing", "ditto"]));
    let alone = p.process(&json_message(&["ditto"]));
    assert_eq!(together.len(), 2);
    assert!(together[0].is_error());
    let (MappingOutcome::Mapped { value: with_sibling, .. }, MappingOutcome::Mapped { value: solo, .. }) =
        (&together[1], &alone[0])
    else {
        panic!("expected mapped outcomes");
    };
    assert_eq!(with_sibling, solo);

    let adapter = DittoProtocolAdapter::new();
    let restored = adapter.from_adaptable(&adapter.to_adaptable(with_sibling).unwrap()).unwrap();
    assert_eq!(restored.entity_id(), Some(&EntityId::thing("org", "lamp")));
    assert_eq!(restored.value(), Some(&json!(true)));
}

#[test]
fn empty_result_drops_and_failure_errors_exactly_once() {
    let connection = Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, "tcp://h:1883")
        .with_mapping_definition("silent", MappingContext::new("Test"))
        .with_mapping_definition("failing", MappingContext::new("Test"));
    let p = processor(&connection);

    let silent = p.process(&json_message(&["silent"]));
    assert_eq!(silent.len(), 1);
    assert!(silent[0].is_dropped());

    let failing = p.process(&json_message(&["failing"]));
    assert_eq!(failing.len(), 1);
    assert!(matches!(
        &failing[0],
        MappingOutcome::Error { error: ConnectivityError::MappingFailed { .. }, .. }
    ));
}

type Forwarded = tokio::sync::mpsc::UnboundedReceiver<Signal>;

async fn open_manager(connection: Connection) -> (ConnectionManager, Arc<MockConnector>, Forwarded) {
    open_manager_with(connection, None).await
}

async fn open_manager_with(
    connection: Connection,
    enrichment: Option<Arc<dyn SignalEnrichmentFacade>>,
) -> (ConnectionManager, Arc<MockConnector>, Forwarded) {
    let connector = Arc::new(MockConnector::new(ConnectBehavior::Connect));
    let registry = ConnectorRegistry::new();
    registry.register(Arc::new(MockConnectorFactory {
        connector: connector.clone(),
    }));
    let (forwarder, rx) = RecordingForwarder::new();
    let mut context = context(forwarder);
    context.enrichment = enrichment;
    let manager = ConnectionManager::new(
        Arc::new(InMemoryConnectionJournal::new()),
        registry,
        context,
        CancellationToken::new(),
    );
    let id = connection.id.clone();
    manager.create(connection, DittoHeaders::new()).await.unwrap();
    manager.open(&id, DittoHeaders::new()).await.unwrap();
    (manager, connector, rx)
}

#[tokio::test]
async fn consumed_message_is_forwarded_and_acknowledged() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let connection = mqtt_connection("inbound", port).with_source(Source::new(["telemetry/#"]));
    let id = connection.id.clone();
    let (manager, connector, mut forwarded) = open_manager(connection).await;

    let settlement = Arc::new(RecordingSettlement::default());
    let sink = connector.sink().expect("sink handed to the connector");
    sink.deliver(
        0,
        ExternalMessage::new([("content-type", "application/json")])
            .with_text(twin_event_payload())
            .with_source_address("telemetry/lamp")
            .with_settlement(settlement.clone()),
    )
    .await
    .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(2), forwarded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(signal.entity_id(), Some(&EntityId::thing("org", "lamp")));
    assert_eq!(signal.correlation_id(), Some("ev-1"));
    assert!(eventually(|| async { settlement.outcomes() == vec![Settled::Acknowledged] }).await);

    let status = manager.retrieve_status(&id, DittoHeaders::new()).await.unwrap();
    assert_eq!(status.metrics.consumed, 1);
    assert_eq!(status.metrics.mapped, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn enforcement_mismatch_rejects_without_forwarding() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let source = Source::new(["devices/+"]).with_enforcement(Enforcement {
        input: "{{ source:address }}".into(),
        filters: vec!["devices/{{ thing:name }}".into()],
    });
    let connection = mqtt_connection("enforced", port).with_source(source);
    let (manager, connector, mut forwarded) = open_manager(connection).await;

    let settlement = Arc::new(RecordingSettlement::default());
    connector
        .sink()
        .unwrap()
        .deliver(
            0,
            ExternalMessage::new([("content-type", "application/json")])
                .with_text(twin_event_payload())
                .with_source_address("devices/heater")
                .with_settlement(settlement.clone()),
        )
        .await
        .unwrap();

    assert!(eventually(|| async { settlement.outcomes() == vec![Settled::Rejected { requeue: false }] }).await);
    assert!(forwarded.try_recv().is_err());
    manager.shutdown().await;
}

#[tokio::test]
async fn published_signals_reach_subscribed_targets_only() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let twin = mqtt_connection("twin-out", port).with_target(Target::new(
        "out/{{ thing:name }}",
        vec![FilteredTopic::new(TopicKind::TwinEvents)],
    ));
    let (manager, connector, _forwarded) = open_manager(twin).await;
    let live = mqtt_connection("live-out", port)
        .with_target(Target::new("live", vec![FilteredTopic::new(TopicKind::LiveEvents)]));
    manager.create(live.clone(), DittoHeaders::new()).await.unwrap();
    manager.open(&live.id, DittoHeaders::new()).await.unwrap();

    let event = Signal::Event(Event {
        entity_id: EntityId::thing("org", "lamp"),
        channel: Channel::Twin,
        action: Action::Modified,
        path: "/attributes/on".into(),
        value: Some(json!(true)),
        revision: Some(3),
        timestamp: None,
        headers: DittoHeaders::new().with_correlation_id("out-1"),
    });
    assert_eq!(manager.publish(event).await, 1);
    assert!(eventually(|| async { connector.published().len() == 1 }).await);
    let (address, message) = connector.published().remove(0);
    assert_eq!(address, "out/lamp");
    assert!(message.text_payload().is_some_and(|p| p.contains("twin/events/modified")));
    manager.shutdown().await;
}

fn lamp_event(revision: i64) -> Signal {
    Signal::Event(Event {
        entity_id: EntityId::thing("org", "lamp"),
        channel: Channel::Twin,
        action: Action::Modified,
        path: "/attributes/on".into(),
        value: Some(json!(true)),
        revision: Some(revision),
        timestamp: None,
        headers: DittoHeaders::new(),
    })
}

#[tokio::test]
async fn extra_fields_are_enriched_through_the_cache() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let topic = FilteredTopic::new(TopicKind::TwinEvents).with_extra_fields(["attributes/room"]);
    let connection = mqtt_connection("enriched", port).with_target(Target::new("rooms", vec![topic]));
    let enrichment = Arc::new(StaticEnrichment::new(json!({"attributes": {"room": "kitchen"}})));
    let (manager, connector, _forwarded) = open_manager_with(connection, Some(enrichment.clone())).await;

    assert_eq!(manager.publish(lamp_event(4)).await, 1);
    assert_eq!(manager.publish(lamp_event(4)).await, 1);
    assert!(eventually(|| async { connector.published().len() == 2 }).await);
    assert_eq!(enrichment.calls.load(Ordering::SeqCst), 1);

    let (_, message) = connector.published().remove(0);
    assert!(message.text_payload().is_some_and(|p| p.contains("kitchen")));
    manager.shutdown().await;
}

#[tokio::test]
async fn inaccessible_entity_publishes_without_extra_fields() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let topic = FilteredTopic::new(TopicKind::TwinEvents).with_extra_fields(["attributes/room"]);
    let connection = mqtt_connection("fallback", port).with_target(Target::new("rooms", vec![topic]));
    let id = connection.id.clone();
    let enrichment = Arc::new(FailingEnrichment::new(ConnectivityError::EntityNotAccessible {
        entity_id: "org:lamp".into(),
        entity_type: EntityType::Thing,
    }));
    let (manager, connector, _forwarded) = open_manager_with(connection, Some(enrichment.clone())).await;

    assert_eq!(manager.publish(lamp_event(5)).await, 1);
    assert!(eventually(|| async { connector.published().len() == 1 }).await);
    let (address, message) = connector.published().remove(0);
    assert_eq!(address, "rooms");
    assert!(message.text_payload().is_some_and(|p| p.contains("twin/events/modified")));
    assert_eq!(enrichment.calls.load(Ordering::SeqCst), 1);

    let status = manager.retrieve_status(&id, DittoHeaders::new()).await.unwrap();
    assert_eq!(status.metrics.enrichment_failures, 1);
    assert_eq!(status.metrics.enriched, 0);
    assert_eq!(connector.connects(), 1, "an inaccessible entity does not restart the client");
    manager.shutdown().await;
}

#[tokio::test]
async fn enriched_signal_failing_the_filter_is_dropped() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let topic = FilteredTopic::new(TopicKind::TwinEvents)
        .with_filter(RqlFilter::parse(r#"eq(attributes/room,"kitchen")"#).unwrap())
        .with_extra_fields(["attributes/room"]);
    let connection = mqtt_connection("refiltered", port).with_target(Target::new("kitchen", vec![topic]));
    let id = connection.id.clone();
    let enrichment = Arc::new(StaticEnrichment::new(json!({"attributes": {"room": "garage"}})));
    let (manager, connector, _forwarded) = open_manager_with(connection, Some(enrichment.clone())).await;

    assert_eq!(manager.publish(lamp_event(6)).await, 1);
    assert!(
        eventually(|| async {
            let status = manager.retrieve_status(&id, DittoHeaders::new()).await.unwrap();
            status.metrics.filtered == 1
        })
        .await
    );
    assert_eq!(enrichment.calls.load(Ordering::SeqCst), 1);
    assert!(connector.published().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn live_command_to_several_targets_yields_one_response() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let connection = mqtt_connection("live-commands", port)
        .with_source(Source::new(["responses"]))
        .with_target(Target::new("devices/a", vec![FilteredTopic::new(TopicKind::LiveCommands)]))
        .with_target(Target::new("devices/b", vec![FilteredTopic::new(TopicKind::LiveCommands)]));
    let (manager, connector, mut forwarded) = open_manager(connection).await;

    let command = Signal::Command(Command {
        entity_id: EntityId::thing("org", "lamp"),
        channel: Channel::Live,
        action: Action::Modify,
        path: "/attributes/on".into(),
        value: Some(json!(true)),
        headers: DittoHeaders::new().with_correlation_id("cmd-1"),
    });
    assert_eq!(manager.publish(command).await, 1);
    assert!(eventually(|| async { connector.published().len() == 2 }).await);

    let response = json!({
        "topic": "org/lamp/things/live/commands/modify",
        "path": "/attributes/on",
        "status": 204,
        "headers": {"correlation-id": "cmd-1"}
    });
    connector
        .sink()
        .unwrap()
        .deliver(
            0,
            ExternalMessage::new([("content-type", "application/json")])
                .with_text(response.to_string())
                .with_source_address("responses"),
        )
        .await
        .unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(2), forwarded.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(&signal, Signal::CommandResponse(r) if r.status == 204));
    assert_eq!(signal.correlation_id(), Some("cmd-1"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(forwarded.try_recv().is_err(), "no acknowledgement for the sibling target");
    manager.shutdown().await;
}

#[tokio::test]
async fn restricted_target_needs_a_read_grant() {
    init_tracing();
    let (_listener, port) = listening_port().await;
    let target = Target::new("audit", vec![FilteredTopic::new(TopicKind::TwinEvents)])
        .with_authorization_context(AuthorizationContext::new(["integration:auditor"]));
    let connection = mqtt_connection("restricted", port).with_target(target);
    let (manager, connector, _forwarded) = open_manager(connection).await;

    assert_eq!(manager.publish(lamp_event(7)).await, 0);
    let Signal::Event(mut granted) = lamp_event(8) else {
        unreachable!()
    };
    granted.headers = granted.headers.with_read_subjects(["integration:auditor"]);
    assert_eq!(manager.publish(Signal::Event(granted)).await, 1);
    assert!(eventually(|| async { connector.published().len() == 1 }).await);
    manager.shutdown().await;
}
