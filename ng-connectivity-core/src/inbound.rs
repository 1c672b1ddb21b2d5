//! Inbound dispatch of consumed messages.
//!
//! Every consumed message is mapped, and each mapped signal is then
//! - completed with the source's header mapping, authorization context and ack requests
//! - checked against the source's signal id enforcement (fails closed)
//! - classified and handed on: acknowledgements upstream if their labels are
//!   declared, live responses and search commands to the client actor, ack-requesting
//!   signals to the aggregator starter, everything else upstream
//!
//! The message's response collector learns the number of ack-requesting signals once
//! all outcomes are dispatched and settles the broker delivery when it completes.

use crate::{
    ack::{
        AcknowledgementAggregator, AggregatedAcknowledgements, AggregatorStarter, Collectable, CollectorOutput,
        ResponseCollector,
    },
    forwarder::SignalForwarder,
    logs::{ConnectionLogger, LogCategory, LogEntry, LogType},
    mapping::{InboundMappingProcessor, OutcomeVisitor},
    metrics::ConnectionMetrics,
    outbound::OutboundDispatcher,
};
use ng_connectivity_models::{settings::AcksConfig, Connection, ConnectionId, Source};
use ng_connectivity_sdk::{
    placeholder::resolve_template, ConnectivityError, DittoHeaders, EntityId, ErrorResponse, ExternalMessage,
    MessageSettlement, PlaceholderContext, Resolved, Signal, TopicPath,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Work item of the inbound mapping pool.
#[derive(Debug)]
pub struct InboundJob {
    pub source_index: usize,
    pub message: ExternalMessage,
}

/// Signals the client actor handles itself.
#[derive(Debug, Clone)]
pub enum ClientRouted {
    LiveResponse(Signal),
    Search(Signal),
}

/// Where one mapped outcome goes.
#[derive(Debug)]
pub enum InboundDispatch {
    Forward(Signal),
    AckRequesting(Signal),
    LiveResponse(Signal),
    Search(Signal),
    Failed {
        error: ConnectivityError,
        entity_id: EntityId,
        headers: DittoHeaders,
    },
    Dropped,
}

/// Attaches the source's configuration to a consumed message.
///
/// Returns the error of an enforcement input that cannot be resolved; every signal of
/// such a message is rejected.
pub fn prepare_message(
    source: &Source,
    connection_id: &ConnectionId,
    message: ExternalMessage,
) -> (ExternalMessage, Option<ConnectivityError>) {
    let mut message = message.with_authorization_context(source.authorization_context.clone());
    if !source.header_mapping.is_empty() {
        message = message.with_header_mapping(source.header_mapping.clone());
    }
    if !source.payload_mapping.is_empty() {
        message = message.with_payload_mapping(source.payload_mapping.clone());
    }
    let Some(enforcement) = &source.enforcement else {
        return (message, None);
    };
    let resolved = {
        let mut ctx = PlaceholderContext::new()
            .with_headers(message.headers())
            .with_connection_id(connection_id.as_str());
        if let Some(address) = message.source_address() {
            ctx = ctx.with_source_address(address);
        }
        enforcement.filter_for(&ctx)
    };
    match resolved {
        Ok(filter) => (message.with_enforcement_filter(filter), None),
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "Enforcement input unresolved");
            let error = ConnectivityError::SignalIdEnforcementFailed {
                entity_id: String::new(),
                input: enforcement.input.clone(),
            };
            (message, Some(error))
        }
    }
}

/// Applies the source's header mapping, authorization context and ack requests.
///
/// Ack requests of the source are merged in unless the signal explicitly requests none.
pub fn apply_source(
    source: &Source,
    connection_id: &ConnectionId,
    message: &ExternalMessage,
    mut signal: Signal,
    topic: Option<&TopicPath>,
) -> Result<Signal, ConnectivityError> {
    if let Some(mapping) = message.header_mapping() {
        let entity_id = signal.entity_id().cloned();
        let mut ctx = PlaceholderContext::new()
            .with_headers(message.headers())
            .with_connection_id(connection_id.as_str());
        if let Some(entity_id) = &entity_id {
            ctx = ctx.with_entity_id(entity_id);
        }
        if let Some(topic) = topic {
            ctx = ctx.with_topic(topic);
        }
        if let Some(address) = message.source_address() {
            ctx = ctx.with_source_address(address);
        }
        for (key, template) in mapping.iter() {
            match resolve_template(template, &ctx)? {
                Resolved::Value(value) => signal.headers_mut().insert(key, value),
                Resolved::Deleted => {
                    signal.headers_mut().remove(key);
                }
                Resolved::Unresolved(_) => {}
            }
        }
    }

    if !message.authorization_context().is_empty() {
        let headers = std::mem::take(signal.headers_mut());
        *signal.headers_mut() = headers.with_authorization_context(message.authorization_context().clone());
    }

    let may_request = matches!(signal, Signal::Command(_) | Signal::Event(_) | Signal::Message(_)) && !signal.is_response();
    if may_request && !source.acknowledgement_requests.is_empty() && !signal.headers().has_explicit_empty_ack_requests() {
        let mut labels = signal.headers().acknowledgement_requests()?;
        for label in &source.acknowledgement_requests {
            let label = label.resolve_connection_id(connection_id.as_str());
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        signal.headers_mut().set_acknowledgement_requests(&labels);
    }
    Ok(signal)
}

/// Enforces the signal id filter and decides where the signal goes.
pub fn classify(source: &Source, connection_id: &ConnectionId, message: &ExternalMessage, signal: Signal, topic: Option<&TopicPath>) -> InboundDispatch {
    let entity_id = signal.entity_id().cloned().unwrap_or_else(EntityId::unknown);
    let failed = |error: ConnectivityError, signal: &Signal| InboundDispatch::Failed {
        error,
        entity_id: entity_id.clone(),
        headers: signal.headers().clone(),
    };

    if let Some(filter) = message.enforcement_filter() {
        if let Err(e) = filter.check(&entity_id, topic) {
            return failed(e, &signal);
        }
    }

    let declared = source.resolved_declared_acks(connection_id);
    let undeclared = match &signal {
        Signal::Acknowledgement(ack) => (!declared.contains(&ack.label)).then(|| ack.label.clone()),
        Signal::Acknowledgements(acks) => acks.labels().find(|l| !declared.contains(*l)).cloned(),
        _ => None,
    };
    if let Some(label) = undeclared {
        let error = ConnectivityError::AcknowledgementLabelNotDeclared {
            label: label.to_string(),
            declared: declared.iter().map(ToString::to_string).collect(),
        };
        return failed(error, &signal);
    }

    if signal.is_acknowledgement() {
        InboundDispatch::Forward(signal)
    } else if signal.is_live_command_response() {
        InboundDispatch::LiveResponse(signal)
    } else if matches!(signal, Signal::Search(_)) {
        InboundDispatch::Search(signal)
    } else if signal.is_ack_requesting() {
        InboundDispatch::AckRequesting(signal)
    } else {
        InboundDispatch::Forward(signal)
    }
}

/// Result of dispatching one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatched {
    Done,
    /// An aggregation was started; its result goes to the message's collector
    Awaiting,
    Failed,
}

/// Settles a consumed message once its responses are collected.
///
/// Failed dispatches reject without redelivery; incomplete or failed aggregations
/// reject with redelivery when retrying may help.
pub fn settle(
    settlement: &dyn MessageSettlement,
    failed: bool,
    output: Option<&CollectorOutput<AggregatedAcknowledgements>>,
) {
    if failed {
        settlement.reject(false);
        return;
    }
    match output {
        Some(output) if output.is_success() => settlement.acknowledge(),
        Some(output) => {
            let requeue = output.timed_out
                || !output.is_complete()
                || output.responses.iter().any(|r| r.is_failure() && r.is_retryable());
            settlement.reject(requeue);
        }
        None => settlement.reject(true),
    }
}

struct InboundVisitor<'a> {
    source: &'a Source,
    connection_id: &'a ConnectionId,
    message: &'a ExternalMessage,
    enforcement_error: Option<&'a ConnectivityError>,
}

impl OutcomeVisitor<Signal> for InboundVisitor<'_> {
    type Output = InboundDispatch;

    fn on_mapped(&mut self, _mapper_id: &str, signal: Signal) -> Result<InboundDispatch, ConnectivityError> {
        if let Some(error) = self.enforcement_error {
            return Ok(InboundDispatch::Failed {
                error: error.clone(),
                entity_id: signal.entity_id().cloned().unwrap_or_else(EntityId::unknown),
                headers: signal.headers().clone(),
            });
        }
        let topic = self.message.topic_path().cloned();
        let signal = apply_source(self.source, self.connection_id, self.message, signal, topic.as_ref())?;
        Ok(classify(self.source, self.connection_id, self.message, signal, topic.as_ref()))
    }

    fn on_dropped(&mut self, _mapper_id: &str) -> InboundDispatch {
        InboundDispatch::Dropped
    }

    fn on_error(&mut self, mapper_id: &str, error: ConnectivityError, topic: Option<&TopicPath>) -> InboundDispatch {
        debug!(connection_id = %self.connection_id, mapper = %mapper_id, error = %error, "Inbound mapping failed");
        let entity_id = match (topic, error.entity_type()) {
            (Some(topic), _) => topic.entity_id(),
            (None, Some(entity_type)) => EntityId::new(entity_type, "_", "_"),
            (None, None) => EntityId::unknown(),
        };
        let headers = DittoHeaders::from_map(self.message.headers().iter().map(|(k, v)| (k, v.clone())));
        InboundDispatch::Failed {
            error,
            entity_id,
            headers,
        }
    }
}

/// Inbound half of a connected client.
pub struct InboundDispatcher {
    connection_id: ConnectionId,
    connection: Arc<Connection>,
    processor: InboundMappingProcessor,
    forwarder: Arc<dyn SignalForwarder>,
    starter: AggregatorStarter,
    outbound: Arc<OutboundDispatcher>,
    client: mpsc::UnboundedSender<ClientRouted>,
    metrics: Arc<ConnectionMetrics>,
    logger: ConnectionLogger,
    acks: AcksConfig,
}

impl InboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<Connection>,
        processor: InboundMappingProcessor,
        forwarder: Arc<dyn SignalForwarder>,
        starter: AggregatorStarter,
        outbound: Arc<OutboundDispatcher>,
        client: mpsc::UnboundedSender<ClientRouted>,
        metrics: Arc<ConnectionMetrics>,
        logger: ConnectionLogger,
        acks: AcksConfig,
    ) -> Self {
        Self {
            connection_id: connection.id.clone(),
            connection,
            processor,
            forwarder,
            starter,
            outbound,
            client,
            metrics,
            logger,
            acks,
        }
    }

    pub async fn handle(&self, job: InboundJob) {
        self.metrics.increment_consumed();
        let Some(source) = self.connection.sources.get(job.source_index) else {
            warn!(connection_id = %self.connection_id, source_index = job.source_index, "Message from unknown source");
            let mut message = job.message;
            if let Some(settlement) = message.take_settlement() {
                settlement.reject(false);
            }
            return;
        };
        let (mut message, enforcement_error) = prepare_message(source, &self.connection_id, job.message);
        let settlement = message.take_settlement();
        self.logger.log(
            LogEntry::success(LogCategory::Source, LogType::Consumed, "Message consumed")
                .with_correlation_id(message.header("correlation-id"))
                .with_address(message.source_address()),
        );

        let dispatches: Vec<InboundDispatch> = {
            let mut visitor = InboundVisitor {
                source,
                connection_id: &self.connection_id,
                message: &message,
                enforcement_error: enforcement_error.as_ref(),
            };
            self.processor
                .process(&message)
                .into_iter()
                .map(|outcome| outcome.accept(&mut visitor))
                .collect()
        };

        let (collector, done) = ResponseCollector::<AggregatedAcknowledgements>::spawn(self.acks.collector_timeout());
        let mut failed = false;
        let mut awaiting = 0;
        for dispatch in dispatches {
            match self.dispatch(source, dispatch, &collector).await {
                Dispatched::Done => {}
                Dispatched::Awaiting => awaiting += 1,
                Dispatched::Failed => failed = true,
            }
        }
        collector.set_count(awaiting);
        drop(collector);

        if let Some(settlement) = settlement {
            let connection_id = self.connection_id.clone();
            tokio::spawn(async move {
                let output = done.await.ok();
                if output.as_ref().is_some_and(|o| o.timed_out) {
                    info!(%connection_id, "Settling consumed message after collector timeout");
                }
                settle(settlement.as_ref(), failed, output.as_ref());
            });
        }
    }

    async fn dispatch(
        &self,
        source: &Source,
        dispatch: InboundDispatch,
        collector: &ResponseCollector<AggregatedAcknowledgements>,
    ) -> Dispatched {
        match dispatch {
            InboundDispatch::Dropped => {
                self.metrics.increment_dropped();
                self.logger
                    .log(LogEntry::success(LogCategory::Source, LogType::Dropped, "Message dropped by mapper"));
                Dispatched::Done
            }
            InboundDispatch::Failed {
                error,
                entity_id,
                headers,
            } => {
                self.fail(source, error, entity_id, headers).await;
                Dispatched::Failed
            }
            InboundDispatch::Forward(signal) => {
                self.mapped(&signal);
                let entity_id = signal.entity_id().cloned().unwrap_or_else(EntityId::unknown);
                let headers = signal.headers().clone();
                match self.forwarder.forward(signal).await {
                    Ok(()) => Dispatched::Done,
                    Err(e) => {
                        self.fail(source, e, entity_id, headers).await;
                        Dispatched::Failed
                    }
                }
            }
            InboundDispatch::LiveResponse(signal) | InboundDispatch::Search(signal) => {
                self.mapped(&signal);
                let routed = if signal.is_live_command_response() {
                    ClientRouted::LiveResponse(signal)
                } else {
                    ClientRouted::Search(signal)
                };
                if self.client.send(routed).is_err() {
                    warn!(connection_id = %self.connection_id, "Client actor gone, dropping routed signal");
                    return Dispatched::Failed;
                }
                Dispatched::Done
            }
            InboundDispatch::AckRequesting(signal) => {
                self.mapped(&signal);
                let entity_id = signal.entity_id().cloned().unwrap_or_else(EntityId::unknown);
                let headers = signal.headers().clone();
                let fallback = AcknowledgementAggregator::new(
                    entity_id.clone(),
                    signal.acknowledgement_requests().unwrap_or_default(),
                    headers.clone(),
                    self.acks.effective_timeout(headers.timeout()),
                );
                let rx = match self.starter.start(signal) {
                    Ok(rx) => rx,
                    Err(e) => {
                        self.fail(source, e, entity_id, headers).await;
                        return Dispatched::Failed;
                    }
                };
                let collector = collector.clone();
                let outbound = Arc::clone(&self.outbound);
                let metrics = Arc::clone(&self.metrics);
                let reply_target = source.reply_target.clone();
                let payload_mapping = source.payload_mapping.clone();
                let connection_id = self.connection_id.clone();
                tokio::spawn(async move {
                    let result = match rx.await {
                        Ok(result) => result,
                        Err(_) => {
                            debug!(%connection_id, "Aggregation ended without a result");
                            fallback.fail_pending(&ConnectivityError::ConnectionUnavailable {
                                connection_id: connection_id.to_string(),
                            })
                        }
                    };
                    metrics.record_ack(result.is_success());
                    if let Some(reply_target) = reply_target {
                        outbound
                            .publish_reply(result.to_response(), &reply_target, payload_mapping)
                            .await;
                    }
                    collector.push(result);
                });
                Dispatched::Awaiting
            }
        }
    }

    fn mapped(&self, signal: &Signal) {
        self.metrics.increment_mapped();
        self.logger.log(
            LogEntry::success(LogCategory::Source, LogType::Mapped, format!("Mapped to {}", signal.type_name()))
                .with_correlation_id(signal.correlation_id())
                .with_entity_id(signal.entity_id().map(ToString::to_string)),
        );
    }

    /// Logs the failure and answers it to the source's reply target.
    async fn fail(&self, source: &Source, error: ConnectivityError, entity_id: EntityId, headers: DittoHeaders) {
        self.metrics.increment_mapping_errors();
        warn!(
            connection_id = %self.connection_id,
            correlation_id = ?headers.correlation_id(),
            error_code = %error.error_code(),
            error = %error,
            "Consumed message failed"
        );
        self.logger.log(
            LogEntry::failure(LogCategory::Source, LogType::Mapped, error.to_string())
                .with_correlation_id(headers.correlation_id())
                .with_entity_id(Some(entity_id.to_string())),
        );
        if let Some(reply_target) = &source.reply_target {
            let response = Signal::Error(ErrorResponse::new(entity_id, error, headers));
            self.outbound
                .publish_reply(response, reply_target, source.payload_mapping.clone())
                .await;
        }
    }
}
