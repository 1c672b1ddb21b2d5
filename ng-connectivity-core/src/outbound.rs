//! Outbound dispatch: from a signal and its subscribed targets to published messages.
//!
//! Per signal the dispatcher
//! - splits targets into one group per payload mapping for plain topics, and one
//!   outbound signal per target whose topic asks for extra fields
//! - enriches the latter, falling back to publishing without extra fields on failure
//! - maps, re-checks topic filters against the enriched view and publishes
//! - turns every publish result into the acknowledgement it stands for

use crate::{
    ack::sending::{expected_ack_label, to_acknowledgement},
    client::ClientConnector,
    enrichment::SignalEnrichmentFacade,
    forwarder::SignalForwarder,
    logs::{ConnectionLogger, LogCategory, LogEntry, LogType},
    mapping::{MappingOutcome, OutboundMappingProcessor, OutboundSignal, OutcomeVisitor},
    metrics::ConnectionMetrics,
};
use dashmap::DashMap;
use futures::future::join_all;
use ng_connectivity_models::{settings::AcksConfig, Connection, ConnectionId, ReplyTarget, ResponseType, Target};
use ng_connectivity_sdk::{
    placeholder::{resolve_required, resolve_template},
    Acknowledgement, AcknowledgementLabel, ConnectivityError, EntityId, ExternalMessage, HeaderMapping,
    PayloadMapping, PlaceholderContext, PublishError, Resolved, RqlFilter, Signal, TopicPath,
};
use serde_json::{Map, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, error, info, warn};

/// Marks an acknowledgement issued for a target that did not publish the signal.
pub const WEAK_ACK_HEADER: &str = "ditto-weak-ack";

/// Work item of the outbound mapping pool.
#[derive(Debug)]
pub enum OutboundJob {
    Dispatch { signal: Signal, targets: Vec<Target> },
    Reply { response: Signal, reply_target: ReplyTarget, payload_mapping: PayloadMapping },
}

/// One publish waiting for a live response.
pub struct PendingResponse {
    pub id: u64,
    /// `None` when a sibling publish of the same command got the response
    pub response: oneshot::Receiver<Option<Signal>>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Option<Signal>>,
}

/// Live commands waiting for their live response, by correlation id.
///
/// A command published to several targets registers one waiter per target. The
/// response goes to the first waiter still listening; the others are released empty.
#[derive(Clone, Default)]
pub struct PendingResponses {
    waiting: Arc<DashMap<String, Vec<Waiter>>>,
    next_id: Arc<AtomicU64>,
}

impl PendingResponses {
    pub fn register(&self, correlation_id: &str) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiting
            .entry(correlation_id.to_string())
            .or_default()
            .push(Waiter { id, tx });
        PendingResponse { id, response: rx }
    }

    /// Hands a response to its waiting command; gives it back if nobody waits.
    pub fn complete(&self, response: Signal) -> Result<(), Signal> {
        let Some(correlation_id) = response.correlation_id() else {
            return Err(response);
        };
        let Some((_, waiters)) = self.waiting.remove(correlation_id) else {
            return Err(response);
        };
        let mut unclaimed = Some(response);
        for waiter in waiters {
            match unclaimed.take() {
                Some(response) => {
                    if let Err(returned) = waiter.tx.send(Some(response)) {
                        unclaimed = returned;
                    }
                }
                None => {
                    let _ = waiter.tx.send(None);
                }
            }
        }
        match unclaimed {
            Some(response) => Err(response),
            None => Ok(()),
        }
    }

    /// Removes one waiter; the entry goes once its last waiter is gone.
    pub fn cancel(&self, correlation_id: &str, id: u64) {
        if let Some(mut waiters) = self.waiting.get_mut(correlation_id) {
            waiters.retain(|w| w.id != id);
        }
        self.waiting.remove_if(correlation_id, |_, waiters| waiters.is_empty());
    }

    /// Number of correlation ids waiting.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn clear(&self) {
        self.waiting.clear();
    }
}

/// Partial entity view carried by the signal itself.
pub fn signal_entity_view(signal: &Signal) -> Value {
    let mut view = Value::Object(Map::new());
    if let Some(value) = signal.value() {
        let segments: Vec<&str> = signal.resource_path().split('/').filter(|s| !s.is_empty()).collect();
        let mut nested = value.clone();
        for segment in segments.iter().rev() {
            let mut object = Map::new();
            object.insert((*segment).to_string(), nested);
            nested = Value::Object(object);
        }
        merge_json(&mut view, &nested);
    }
    if let (Some(id), Value::Object(object)) = (signal.entity_id(), &mut view) {
        object.insert("thingId".to_string(), Value::String(id.to_string()));
    }
    view
}

/// Deep merge; values of `patch` win.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Splits the targets of one signal into mapping units.
///
/// Targets without extra fields share one unit per payload mapping, in first-seen
/// order; their topic filter is checked against the signal. Targets with extra fields
/// get a unit each, tagged with the matching topic; their filter is checked after
/// enrichment. Returns the units and the targets filtered out.
pub fn split_targets(signal: &Signal, targets: Vec<Target>) -> (Vec<OutboundSignal>, Vec<Target>) {
    let view = signal_entity_view(signal);
    let mut grouped: Vec<OutboundSignal> = Vec::new();
    let mut enriched: Vec<OutboundSignal> = Vec::new();
    let mut filtered = Vec::new();
    for target in targets {
        let Some(topic) = target.matching_topic(signal).cloned() else {
            filtered.push(target);
            continue;
        };
        if topic.has_extra_fields() {
            let mapping = target.payload_mapping.clone();
            enriched.push(OutboundSignal::new(signal.clone(), vec![target], mapping).with_topic(topic));
            continue;
        }
        if topic.filter().is_some_and(|f| !f.matches(&view)) {
            filtered.push(target);
            continue;
        }
        match grouped.iter_mut().find(|o| o.payload_mapping == target.payload_mapping) {
            Some(group) => group.targets.push(target),
            None => {
                let mapping = target.payload_mapping.clone();
                grouped.push(OutboundSignal::new(signal.clone(), vec![target], mapping));
            }
        }
    }
    grouped.extend(enriched);
    (grouped, filtered)
}

enum MappedAction {
    Publish(ExternalMessage),
    Filtered,
    Dropped,
    Failed(ConnectivityError),
}

/// Applies the post-enrichment filter while visiting outbound outcomes.
struct OutboundVisitor<'a> {
    post_filter: Option<(&'a RqlFilter, Value)>,
}

impl OutcomeVisitor<ExternalMessage> for OutboundVisitor<'_> {
    type Output = MappedAction;

    fn on_mapped(&mut self, _mapper_id: &str, message: ExternalMessage) -> Result<MappedAction, ConnectivityError> {
        if let Some((filter, merged)) = &self.post_filter {
            if !filter.matches(merged) {
                return Ok(MappedAction::Filtered);
            }
        }
        Ok(MappedAction::Publish(message))
    }

    fn on_dropped(&mut self, _mapper_id: &str) -> MappedAction {
        MappedAction::Dropped
    }

    fn on_error(&mut self, _mapper_id: &str, error: ConnectivityError, _topic: Option<&TopicPath>) -> MappedAction {
        MappedAction::Failed(error)
    }
}

/// Outbound half of a connected client.
pub struct OutboundDispatcher {
    connection_id: ConnectionId,
    connection: Arc<Connection>,
    processor: OutboundMappingProcessor,
    connector: Arc<dyn ClientConnector>,
    forwarder: Arc<dyn SignalForwarder>,
    enrichment: Option<Arc<dyn SignalEnrichmentFacade>>,
    pending: PendingResponses,
    failures: mpsc::UnboundedSender<ConnectivityError>,
    metrics: Arc<ConnectionMetrics>,
    logger: ConnectionLogger,
    acks: AcksConfig,
}

impl OutboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<Connection>,
        processor: OutboundMappingProcessor,
        connector: Arc<dyn ClientConnector>,
        forwarder: Arc<dyn SignalForwarder>,
        enrichment: Option<Arc<dyn SignalEnrichmentFacade>>,
        pending: PendingResponses,
        failures: mpsc::UnboundedSender<ConnectivityError>,
        metrics: Arc<ConnectionMetrics>,
        logger: ConnectionLogger,
        acks: AcksConfig,
    ) -> Self {
        Self {
            connection_id: connection.id.clone(),
            connection,
            processor,
            connector,
            forwarder,
            enrichment,
            pending,
            failures,
            metrics,
            logger,
            acks,
        }
    }

    pub async fn handle(&self, job: OutboundJob) {
        match job {
            OutboundJob::Dispatch { signal, targets } => self.dispatch(signal, targets).await,
            OutboundJob::Reply {
                response,
                reply_target,
                payload_mapping,
            } => self.publish_reply(response, &reply_target, payload_mapping).await,
        }
    }

    pub async fn dispatch(&self, signal: Signal, targets: Vec<Target>) {
        let (units, filtered) = split_targets(&signal, targets);
        for target in &filtered {
            self.metrics.increment_filtered();
            self.issue_weak_ack(&signal, target).await;
        }
        let units = join_all(units.into_iter().map(|unit| self.enrich(unit))).await;
        for unit in units {
            self.map_and_publish(unit).await;
        }
    }

    async fn enrich(&self, unit: OutboundSignal) -> OutboundSignal {
        let (Some(facade), Some(selector)) = (
            self.enrichment.as_ref(),
            unit.topic.as_ref().and_then(|t| t.extra_fields_selector()),
        ) else {
            return unit;
        };
        let Some(entity_id) = unit.signal.entity_id().cloned() else {
            return unit;
        };
        let caller = match unit.targets.first() {
            Some(target) if !target.authorization_context.is_empty() => unit
                .signal
                .headers()
                .clone()
                .with_authorization_context(target.authorization_context.clone()),
            _ => unit.signal.headers().clone(),
        };
        match facade
            .retrieve_partial_thing(&entity_id, &selector, &caller, Some(&unit.signal))
            .await
        {
            Ok(extra) => {
                self.metrics.increment_enriched();
                unit.with_extra(extra)
            }
            Err(e) => {
                self.on_enrichment_failure(&unit, e);
                unit
            }
        }
    }

    fn on_enrichment_failure(&self, unit: &OutboundSignal, e: ConnectivityError) {
        self.metrics.increment_enrichment_failures();
        let address = unit.targets.first().map(|t| t.address.as_str());
        self.logger.log(
            LogEntry::failure(
                LogCategory::Target,
                LogType::Enriched,
                format!("Retrieving extra fields failed, publishing without them: {e}"),
            )
            .with_correlation_id(unit.signal.correlation_id())
            .with_address(address)
            .with_entity_id(unit.signal.entity_id().map(ToString::to_string)),
        );
        match e {
            ConnectivityError::EntityNotAccessible { .. } => info!(
                connection_id = %self.connection_id,
                correlation_id = ?unit.signal.correlation_id(),
                error = %e,
                "Entity no longer accessible, publishing without extra fields"
            ),
            _ => {
                error!(
                    connection_id = %self.connection_id,
                    correlation_id = ?unit.signal.correlation_id(),
                    error = %e,
                    "Signal enrichment failed, publishing without extra fields"
                );
                let _ = self.failures.send(e);
            }
        }
    }

    async fn map_and_publish(&self, unit: OutboundSignal) {
        let post_filter = match (&unit.topic, &unit.extra) {
            (Some(topic), extra) if topic.has_extra_fields() => topic.filter().map(|filter| {
                let mut merged = signal_entity_view(&unit.signal);
                if let Some(extra) = extra {
                    merge_json(&mut merged, extra);
                }
                (filter, merged)
            }),
            _ => None,
        };
        let mut visitor = OutboundVisitor { post_filter };
        let actions: Vec<MappedAction> = self
            .processor
            .process(&unit)
            .into_iter()
            .map(|outcome: MappingOutcome<ExternalMessage>| outcome.accept(&mut visitor))
            .collect();

        let mut answered = vec![false; unit.targets.len()];
        for action in actions {
            match action {
                MappedAction::Publish(message) => {
                    let sends = unit
                        .targets
                        .iter()
                        .map(|target| self.publish_to_target(&unit.signal, target, message.clone()));
                    for (index, sent) in join_all(sends).await.into_iter().enumerate() {
                        answered[index] |= sent;
                    }
                }
                MappedAction::Filtered => {
                    self.metrics.increment_filtered();
                    debug!(
                        connection_id = %self.connection_id,
                        correlation_id = ?unit.signal.correlation_id(),
                        "Enriched signal no longer matches the topic filter"
                    );
                    self.logger.log(
                        LogEntry::success(LogCategory::Target, LogType::Filtered, "Dropped by filter after enrichment")
                            .with_correlation_id(unit.signal.correlation_id()),
                    );
                }
                MappedAction::Dropped => {
                    self.metrics.increment_dropped();
                    self.logger.log(
                        LogEntry::success(LogCategory::Target, LogType::Dropped, "Mapper dropped the outbound signal")
                            .with_correlation_id(unit.signal.correlation_id()),
                    );
                }
                MappedAction::Failed(e) => {
                    self.metrics.increment_mapping_errors();
                    warn!(
                        connection_id = %self.connection_id,
                        correlation_id = ?unit.signal.correlation_id(),
                        error = %e,
                        "Outbound mapping failed"
                    );
                    self.logger.log(
                        LogEntry::failure(LogCategory::Target, LogType::Mapped, e.to_string())
                            .with_correlation_id(unit.signal.correlation_id()),
                    );
                    for (index, target) in unit.targets.iter().enumerate() {
                        answered[index] = true;
                        let label = expected_ack_label(&unit.signal, target, &self.connection_id);
                        if let Some(ack) =
                            to_acknowledgement(Err(PublishError::Connectivity(e.clone())), &unit.signal, label.as_ref())
                        {
                            self.send_upstream(ack).await;
                        }
                    }
                }
            }
        }
        for (target, answered) in unit.targets.iter().zip(answered) {
            if !answered {
                self.issue_weak_ack(&unit.signal, target).await;
            }
        }
    }

    /// Publishes to one target and reports the resulting acknowledgement.
    ///
    /// Returns whether a publish was attempted.
    async fn publish_to_target(&self, signal: &Signal, target: &Target, message: ExternalMessage) -> bool {
        let label = expected_ack_label(signal, target, &self.connection_id);
        let result = match self.prepare(signal, &target.address, &target.header_mapping, message) {
            Ok((address, message)) => self.publish(signal, &address, message, label.as_ref()).await,
            Err(e) => Err(PublishError::Connectivity(e)),
        };
        match &result {
            Ok(_) => self.logger.log(
                LogEntry::success(LogCategory::Target, LogType::Published, "Message published")
                    .with_correlation_id(signal.correlation_id())
                    .with_address(Some(target.address.as_str())),
            ),
            Err(e) => {
                self.metrics.increment_publish_failures();
                warn!(
                    connection_id = %self.connection_id,
                    address = %target.address,
                    correlation_id = ?signal.correlation_id(),
                    error = %e,
                    "Publishing failed"
                );
                self.logger.log(
                    LogEntry::failure(LogCategory::Target, LogType::Published, e.to_string())
                        .with_correlation_id(signal.correlation_id())
                        .with_address(Some(target.address.as_str())),
                );
            }
        }
        if let Some(ack) = to_acknowledgement(result, signal, label.as_ref()) {
            self.send_upstream(ack).await;
        }
        true
    }

    async fn publish(
        &self,
        signal: &Signal,
        address: &str,
        message: ExternalMessage,
        label: Option<&AcknowledgementLabel>,
    ) -> Result<Option<Signal>, PublishError> {
        let awaits_live_response = signal.is_live_command() && signal.headers().is_response_required();
        let pending = match (awaits_live_response, signal.correlation_id()) {
            (true, Some(cid)) => Some((cid.to_string(), self.pending.register(cid))),
            _ => None,
        };
        let published = self.connector.publish(address, message, label).await;
        if published.is_ok() {
            self.metrics.increment_published();
        }
        let Some((cid, waiter)) = pending else {
            return published;
        };
        match published {
            Ok(Some(response)) => {
                self.pending.cancel(&cid, waiter.id);
                Ok(Some(response))
            }
            Ok(None) => {
                let budget = self.acks.effective_timeout(signal.headers().timeout());
                match timeout(budget, waiter.response).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(_)) => Err(PublishError::Connectivity(ConnectivityError::ConnectionUnavailable {
                        connection_id: self.connection_id.to_string(),
                    })),
                    Err(_) => {
                        self.pending.cancel(&cid, waiter.id);
                        Err(PublishError::Connectivity(ConnectivityError::CommandTimeout {
                            timeout_ms: budget.as_millis() as u64,
                        }))
                    }
                }
            }
            Err(e) => {
                self.pending.cancel(&cid, waiter.id);
                Err(e)
            }
        }
    }

    /// Resolves the address and applies the header mapping.
    fn prepare(
        &self,
        signal: &Signal,
        address: &str,
        header_mapping: &HeaderMapping,
        mut message: ExternalMessage,
    ) -> Result<(String, ExternalMessage), ConnectivityError> {
        let headers = signal.headers().as_map();
        let mut ctx = PlaceholderContext::new()
            .with_headers(headers)
            .with_connection_id(self.connection_id.as_str());
        if let Some(entity_id) = signal.entity_id() {
            ctx = ctx.with_entity_id(entity_id);
        }
        let topic = message.topic_path().cloned();
        if let Some(topic) = &topic {
            ctx = ctx.with_topic(topic);
        }
        let address = resolve_required(address, &ctx)?;
        for (key, template) in header_mapping.iter() {
            match resolve_template(template, &ctx)? {
                Resolved::Value(value) => {
                    message.headers_mut().insert(key.clone(), value);
                }
                Resolved::Deleted => {
                    message.headers_mut().remove(key);
                }
                Resolved::Unresolved(placeholder) => {
                    debug!(connection_id = %self.connection_id, header = %key, %placeholder, "Skipping unresolved header");
                }
            }
        }
        Ok((address.clone(), message.with_target_address(address)))
    }

    /// Publishes a response to the reply target of the source that consumed its command.
    pub async fn publish_reply(&self, response: Signal, reply_target: &ReplyTarget, payload_mapping: PayloadMapping) {
        let response_type = match &response {
            Signal::Error(_) => ResponseType::Error,
            Signal::Acknowledgement(a) if !a.is_success() => ResponseType::Nack,
            Signal::Acknowledgements(a) if !a.is_success() => ResponseType::Nack,
            _ => ResponseType::Response,
        };
        if !reply_target.expects(response_type) {
            debug!(connection_id = %self.connection_id, ?response_type, "Reply target does not expect response type");
            return;
        }
        let target = Target::new(reply_target.address.clone(), Vec::new())
            .with_header_mapping(reply_target.header_mapping.clone())
            .with_payload_mapping(payload_mapping.clone());
        let unit = OutboundSignal::new(response, vec![target], payload_mapping);
        let mut visitor = OutboundVisitor { post_filter: None };
        for outcome in self.processor.process(&unit) {
            match outcome.accept(&mut visitor) {
                MappedAction::Publish(message) => {
                    let prepared = self.prepare(&unit.signal, &reply_target.address, &reply_target.header_mapping, message);
                    let result = match prepared {
                        Ok((address, message)) => self
                            .connector
                            .publish(&address, message, None)
                            .await
                            .map_err(|e| e.root_cause().to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    match result {
                        Ok(_) => {
                            self.metrics.increment_published();
                            self.logger.log(
                                LogEntry::success(LogCategory::Response, LogType::Published, "Response published")
                                    .with_correlation_id(unit.signal.correlation_id())
                                    .with_address(Some(reply_target.address.as_str())),
                            );
                        }
                        Err(message) => {
                            self.metrics.increment_publish_failures();
                            warn!(
                                connection_id = %self.connection_id,
                                address = %reply_target.address,
                                error = %message,
                                "Publishing response failed"
                            );
                            self.logger.log(
                                LogEntry::failure(LogCategory::Response, LogType::Published, message)
                                    .with_correlation_id(unit.signal.correlation_id())
                                    .with_address(Some(reply_target.address.as_str())),
                            );
                        }
                    }
                }
                MappedAction::Failed(e) => {
                    self.metrics.increment_mapping_errors();
                    warn!(connection_id = %self.connection_id, error = %e, "Mapping response failed");
                }
                MappedAction::Dropped | MappedAction::Filtered => self.metrics.increment_dropped(),
            }
        }
    }

    /// Answers a requested target ack for a target that did not publish.
    async fn issue_weak_ack(&self, signal: &Signal, target: &Target) {
        let Some(label) = expected_ack_label(signal, target, &self.connection_id) else {
            return;
        };
        let entity_id = signal.entity_id().cloned().unwrap_or_else(EntityId::unknown);
        let headers = signal.headers().clone().with(WEAK_ACK_HEADER, "true");
        let ack = Acknowledgement::new(label, entity_id, 200, headers);
        self.send_upstream(Signal::Acknowledgement(ack)).await;
    }

    async fn send_upstream(&self, signal: Signal) {
        match &signal {
            Signal::Acknowledgement(a) => self.metrics.record_ack(a.is_success()),
            Signal::Acknowledgements(a) => self.metrics.record_ack(a.is_success()),
            _ => {}
        }
        if let Err(e) = self.forwarder.forward(signal).await {
            warn!(connection_id = %self.connection_id, error = %e, "Forwarding acknowledgement failed");
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn pending_responses(&self) -> &PendingResponses {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_connectivity_models::{FilteredTopic, TopicKind};
    use ng_connectivity_sdk::{Action, Channel, DittoHeaders, EntityId, Event};
    use serde_json::json;

    fn event(value: Value) -> Signal {
        Signal::Event(Event {
            entity_id: EntityId::thing("org", "lamp"),
            channel: Channel::Twin,
            action: Action::Modified,
            path: "/attributes/on".into(),
            value: Some(value),
            revision: Some(2),
            timestamp: None,
            headers: DittoHeaders::new(),
        })
    }

    #[test]
    fn entity_view_nests_value_under_resource_path() {
        let view = signal_entity_view(&event(json!(true)));
        assert_eq!(view, json!({"attributes": {"on": true}, "thingId": "org:lamp"}));
    }

    #[test]
    fn merge_prefers_patch() {
        let mut base = json!({"attributes": {"on": true, "room": "a"}});
        merge_json(&mut base, &json!({"attributes": {"room": "b"}, "features": {}}));
        assert_eq!(base, json!({"attributes": {"on": true, "room": "b"}, "features": {}}));
    }

    #[test]
    fn targets_are_split_by_mapping_and_extra_fields() {
        let plain = FilteredTopic::new(TopicKind::TwinEvents);
        let extra = FilteredTopic::new(TopicKind::TwinEvents).with_extra_fields(["attributes/location"]);
        let rejecting = FilteredTopic::new(TopicKind::TwinEvents)
            .with_filter(RqlFilter::parse("eq(attributes/on,false)").unwrap());
        let targets = vec![
            Target::new("a", vec![plain.clone()]),
            Target::new("b", vec![plain.clone()]),
            Target::new("c", vec![plain]).with_payload_mapping(PayloadMapping::new(["json"])),
            Target::new("d", vec![extra.clone()]),
            Target::new("e", vec![rejecting]),
            Target::new("f", vec![FilteredTopic::new(TopicKind::LiveMessages)]),
        ];
        let (units, filtered) = split_targets(&event(json!(true)), targets);
        let addresses: Vec<Vec<&str>> = units
            .iter()
            .map(|u| u.targets.iter().map(|t| t.address.as_str()).collect())
            .collect();
        assert_eq!(addresses, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);
        assert_eq!(units[2].topic.as_ref(), Some(&extra));
        assert_eq!(filtered.iter().map(|t| t.address.as_str()).collect::<Vec<_>>(), vec!["e", "f"]);
    }

    #[tokio::test]
    async fn pending_response_completes_waiter() {
        let pending = PendingResponses::default();
        let waiter = pending.register("cid-1");
        let response = event(json!(1)).with_headers(DittoHeaders::new().with_correlation_id("cid-1"));
        pending.complete(response.clone()).unwrap();
        assert_eq!(waiter.response.await.unwrap(), Some(response.clone()));
        assert!(pending.is_empty());
        assert!(pending.complete(response).is_err());
    }

    #[tokio::test]
    async fn one_response_serves_every_target_of_a_command() {
        let pending = PendingResponses::default();
        let first = pending.register("cid-2");
        let second = pending.register("cid-2");
        assert_eq!(pending.len(), 1);

        let response = event(json!(1)).with_headers(DittoHeaders::new().with_correlation_id("cid-2"));
        pending.complete(response.clone()).unwrap();
        assert_eq!(first.response.await.unwrap(), Some(response));
        assert_eq!(second.response.await.unwrap(), None);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_its_sibling_registered() {
        let pending = PendingResponses::default();
        let gone = pending.register("cid-3");
        let kept = pending.register("cid-3");
        pending.cancel("cid-3", gone.id);
        assert_eq!(pending.len(), 1);
        drop(gone);

        let response = event(json!(2)).with_headers(DittoHeaders::new().with_correlation_id("cid-3"));
        pending.complete(response.clone()).unwrap();
        assert_eq!(kept.response.await.unwrap(), Some(response));
        pending.cancel("cid-3", kept.id);
        assert!(pending.is_empty());
    }
}
