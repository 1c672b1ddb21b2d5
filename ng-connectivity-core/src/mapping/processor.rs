use super::{guarded, registry::ConfiguredMapper, MappingOutcome, MessageMapperRegistry};
use ng_connectivity_models::{ConnectionId, FilteredTopic, Target};
use ng_connectivity_sdk::{
    header_keys, placeholder::evaluate_condition, Adaptable, ConnectivityError, ExternalMessage,
    PayloadMapping, PlaceholderContext, ProtocolAdapter, Signal, TopicPath,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// One outbound signal addressed to targets that share a payload mapping.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub signal: Signal,
    pub targets: Vec<Target>,
    pub payload_mapping: PayloadMapping,
    /// Filtered topic of a single target requesting extra fields
    pub topic: Option<FilteredTopic>,
    /// Extra fields retrieved for `topic`
    pub extra: Option<Value>,
}

impl OutboundSignal {
    pub fn new(signal: Signal, targets: Vec<Target>, payload_mapping: PayloadMapping) -> Self {
        Self {
            signal,
            targets,
            payload_mapping,
            topic: None,
            extra: None,
        }
    }

    pub fn with_topic(mut self, topic: FilteredTopic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

fn conditions_hold(conditions: &[String], ctx: &PlaceholderContext<'_>) -> Result<bool, ConnectivityError> {
    for condition in conditions {
        if !evaluate_condition(condition, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Maps consumed external messages to signals.
///
/// Pure with respect to connection state; one instance is shared by all inbound workers.
pub struct InboundMappingProcessor {
    connection_id: ConnectionId,
    registry: Arc<MessageMapperRegistry>,
    adapter: Arc<dyn ProtocolAdapter>,
    max_header_bytes: usize,
}

impl InboundMappingProcessor {
    pub fn new(
        connection_id: ConnectionId,
        registry: Arc<MessageMapperRegistry>,
        adapter: Arc<dyn ProtocolAdapter>,
        max_header_bytes: usize,
    ) -> Self {
        Self {
            connection_id,
            registry,
            adapter,
            max_header_bytes,
        }
    }

    /// Runs the message through its mapper chain.
    ///
    /// Every mapper contributes at least one outcome; a failing mapper never hides the
    /// outcomes of the others.
    pub fn process(&self, message: &ExternalMessage) -> Vec<MappingOutcome<Signal>> {
        let chain = self.registry.resolve(message.payload_mapping());
        let mut outcomes = Vec::with_capacity(chain.len());
        for mapper in &chain {
            self.process_with(mapper, message, &mut outcomes);
        }
        outcomes
    }

    fn process_with(&self, mapper: &ConfiguredMapper, message: &ExternalMessage, outcomes: &mut Vec<MappingOutcome<Signal>>) {
        let mapper_id = mapper.id().to_string();
        if mapper.is_blocked(message.content_type()) {
            debug!(
                connection_id = %self.connection_id,
                mapper = %mapper_id,
                content_type = ?message.content_type(),
                "Content type is blocked for mapper"
            );
            outcomes.push(MappingOutcome::Dropped { mapper_id });
            return;
        }

        let mut ctx = PlaceholderContext::new()
            .with_headers(message.headers())
            .with_connection_id(self.connection_id.as_str())
            .with_authorization_context(message.authorization_context());
        if let Some(address) = message.source_address() {
            ctx = ctx.with_source_address(address);
        }
        if let Some(topic) = message.topic_path() {
            ctx = ctx.with_topic(topic);
        }
        match conditions_hold(mapper.incoming_conditions(), &ctx) {
            Ok(true) => {}
            Ok(false) => {
                trace!(connection_id = %self.connection_id, mapper = %mapper_id, "Incoming condition not met");
                outcomes.push(MappingOutcome::Dropped { mapper_id });
                return;
            }
            Err(error) => {
                outcomes.push(MappingOutcome::Error {
                    mapper_id,
                    error,
                    topic_path: message.topic_path().cloned(),
                });
                return;
            }
        }

        let adaptables = match guarded(|| mapper.mapper().map_inbound(message)) {
            Ok(adaptables) => adaptables,
            Err(error) => {
                outcomes.push(MappingOutcome::Error {
                    mapper_id,
                    error,
                    topic_path: message.topic_path().cloned(),
                });
                return;
            }
        };
        if adaptables.is_empty() {
            outcomes.push(MappingOutcome::Dropped { mapper_id });
            return;
        }
        for adaptable in adaptables {
            let topic_path = Some(adaptable.topic.clone());
            match self.to_signal(&mapper_id, &adaptable) {
                Ok(signal) => outcomes.push(MappingOutcome::Mapped {
                    mapper_id: mapper_id.clone(),
                    value: signal,
                    topic_path,
                }),
                Err(error) => outcomes.push(MappingOutcome::Error {
                    mapper_id: mapper_id.clone(),
                    error,
                    topic_path,
                }),
            }
        }
    }

    fn to_signal(&self, mapper_id: &str, adaptable: &Adaptable) -> Result<Signal, ConnectivityError> {
        let mut signal = guarded(|| self.adapter.from_adaptable(adaptable))?;
        let size = signal.headers().header_size();
        if size > self.max_header_bytes {
            return Err(ConnectivityError::HeaderSizeExceeded {
                size,
                max: self.max_header_bytes,
            });
        }
        signal.headers_mut().insert(header_keys::MAPPER, mapper_id);
        Ok(signal)
    }
}

/// Maps outbound signals to external messages, one chain per payload mapping.
pub struct OutboundMappingProcessor {
    connection_id: ConnectionId,
    registry: Arc<MessageMapperRegistry>,
    adapter: Arc<dyn ProtocolAdapter>,
}

impl OutboundMappingProcessor {
    pub fn new(connection_id: ConnectionId, registry: Arc<MessageMapperRegistry>, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        Self {
            connection_id,
            registry,
            adapter,
        }
    }

    pub fn process(&self, outbound: &OutboundSignal) -> Vec<MappingOutcome<ExternalMessage>> {
        let chain = self.registry.resolve(Some(&outbound.payload_mapping));
        let adaptable = match guarded(|| self.adapter.to_adaptable(&outbound.signal)) {
            Ok(mut adaptable) => {
                adaptable.extra = outbound.extra.clone();
                adaptable
            }
            Err(error) => {
                return chain
                    .iter()
                    .map(|mapper| MappingOutcome::Error {
                        mapper_id: mapper.id().to_string(),
                        error: error.clone(),
                        topic_path: None,
                    })
                    .collect();
            }
        };

        let mut outcomes = Vec::with_capacity(chain.len());
        for mapper in &chain {
            self.process_with(mapper, outbound, &adaptable, &mut outcomes);
        }
        outcomes
    }

    fn process_with(
        &self,
        mapper: &ConfiguredMapper,
        outbound: &OutboundSignal,
        adaptable: &Adaptable,
        outcomes: &mut Vec<MappingOutcome<ExternalMessage>>,
    ) {
        let mapper_id = mapper.id().to_string();
        let topic_path: Option<TopicPath> = Some(adaptable.topic.clone());
        let mut ctx = PlaceholderContext::new()
            .with_headers(outbound.signal.headers().as_map())
            .with_connection_id(self.connection_id.as_str())
            .with_topic(&adaptable.topic)
            .with_authorization_context(outbound.signal.headers().authorization_context());
        if let Some(entity_id) = outbound.signal.entity_id() {
            ctx = ctx.with_entity_id(entity_id);
        }
        match conditions_hold(mapper.outgoing_conditions(), &ctx) {
            Ok(true) => {}
            Ok(false) => {
                trace!(connection_id = %self.connection_id, mapper = %mapper_id, "Outgoing condition not met");
                outcomes.push(MappingOutcome::Dropped { mapper_id });
                return;
            }
            Err(error) => {
                outcomes.push(MappingOutcome::Error {
                    mapper_id,
                    error,
                    topic_path,
                });
                return;
            }
        }

        match guarded(|| mapper.mapper().map_outbound(adaptable)) {
            Ok(messages) if messages.is_empty() => outcomes.push(MappingOutcome::Dropped { mapper_id }),
            Ok(messages) => outcomes.extend(messages.into_iter().map(|message| MappingOutcome::Mapped {
                mapper_id: mapper_id.clone(),
                value: message,
                topic_path: topic_path.clone(),
            })),
            Err(error) => outcomes.push(MappingOutcome::Error {
                mapper_id,
                error,
                topic_path,
            }),
        }
    }
}
