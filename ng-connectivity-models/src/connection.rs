//! The persisted connection aggregate.
//!
//! A [`Connection`] is an immutable value: every change produces a new instance
//! (see [`crate::event::apply_event`]). Sources consume from the broker, targets
//! publish to it.

use chrono::{DateTime, Utc};
use ng_connectivity_sdk::{
    mapper::DEFAULT_MAPPING_ID,
    placeholder::validate_template,
    AcknowledgementLabel, AuthorizationContext, Channel, ConnectivityError, Enforcement,
    HeaderMapping, MappingContext, PayloadMapping, RqlFilter, Signal,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "amqp-091")]
    Amqp091,
    #[serde(rename = "amqp-10")]
    Amqp10,
    #[serde(rename = "mqtt")]
    Mqtt,
    #[serde(rename = "mqtt-5")]
    Mqtt5,
    #[serde(rename = "kafka")]
    Kafka,
    #[serde(rename = "http-push")]
    HttpPush,
}

impl ConnectionType {
    fn default_port(&self) -> u16 {
        match self {
            ConnectionType::Amqp091 | ConnectionType::Amqp10 => 5672,
            ConnectionType::Mqtt | ConnectionType::Mqtt5 => 1883,
            ConnectionType::Kafka => 9092,
            ConnectionType::HttpPush => 80,
        }
    }
}

/// Desired or actual status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Open,
    Closed,
    Failed,
    Unknown,
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityStatus::Open => "open",
            ConnectivityStatus::Closed => "closed",
            ConnectivityStatus::Failed => "failed",
            ConnectivityStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionLifecycle {
    #[default]
    Active,
    Deleted,
}

/// Kind of signals a target subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    TwinEvents,
    LiveEvents,
    LiveMessages,
    LiveCommands,
}

impl TopicKind {
    pub fn path(&self) -> &'static str {
        match self {
            TopicKind::TwinEvents => "_/_/things/twin/events",
            TopicKind::LiveEvents => "_/_/things/live/events",
            TopicKind::LiveMessages => "_/_/things/live/messages",
            TopicKind::LiveCommands => "_/_/things/live/commands",
        }
    }

    pub fn matches(&self, signal: &Signal) -> bool {
        match (self, signal) {
            (TopicKind::TwinEvents, Signal::Event(e)) => e.channel == Channel::Twin,
            (TopicKind::LiveEvents, Signal::Event(e)) => e.channel == Channel::Live,
            (TopicKind::LiveMessages, Signal::Message(_)) => true,
            (TopicKind::LiveCommands, Signal::Command(c)) => c.channel == Channel::Live,
            _ => false,
        }
    }
}

/// Target topic with optional namespace restriction, RQL filter and extra fields.
///
/// String form: `_/_/things/twin/events?namespaces=org.acme,org.demo&filter=gt(attributes/x,1)&extraFields=attributes/location`
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredTopic {
    kind: TopicKind,
    namespaces: Vec<String>,
    filter: Option<RqlFilter>,
    extra_fields: Vec<String>,
}

impl FilteredTopic {
    pub fn new(kind: TopicKind) -> Self {
        Self {
            kind,
            namespaces: Vec::new(),
            filter: None,
            extra_fields: Vec::new(),
        }
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filter(mut self, filter: RqlFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_extra_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn filter(&self) -> Option<&RqlFilter> {
        self.filter.as_ref()
    }

    pub fn has_extra_fields(&self) -> bool {
        !self.extra_fields.is_empty()
    }

    pub fn extra_fields(&self) -> &[String] {
        &self.extra_fields
    }

    /// Comma separated field selector for partial entity lookups.
    pub fn extra_fields_selector(&self) -> Option<String> {
        (!self.extra_fields.is_empty()).then(|| self.extra_fields.join(","))
    }

    /// Kind and namespace match; the RQL filter is evaluated by the dispatcher.
    pub fn matches(&self, signal: &Signal) -> bool {
        if !self.kind.matches(signal) {
            return false;
        }
        if self.namespaces.is_empty() {
            return true;
        }
        signal
            .entity_id()
            .is_some_and(|id| self.namespaces.iter().any(|ns| ns == id.namespace()))
    }
}

impl FromStr for FilteredTopic {
    type Err = ConnectivityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| ConnectivityError::ConnectionConfigurationInvalid { message };
        let (path, query) = s.split_once('?').unwrap_or((s, ""));
        let kind = [
            TopicKind::TwinEvents,
            TopicKind::LiveEvents,
            TopicKind::LiveMessages,
            TopicKind::LiveCommands,
        ]
        .into_iter()
        .find(|k| k.path() == path.trim())
        .ok_or_else(|| invalid(format!("unknown target topic '{path}'")))?;
        let mut topic = FilteredTopic::new(kind);
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed topic parameter '{pair}'")))?;
            let list = || value.split(',').map(str::trim).filter(|v| !v.is_empty()).map(String::from);
            match key {
                "namespaces" => topic.namespaces = list().collect(),
                "extraFields" => topic.extra_fields = list().collect(),
                "filter" => topic.filter = Some(RqlFilter::parse(value)?),
                other => return Err(invalid(format!("unknown topic parameter '{other}'"))),
            }
        }
        Ok(topic)
    }
}

impl fmt::Display for FilteredTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.path())?;
        let mut params = Vec::new();
        if !self.namespaces.is_empty() {
            params.push(format!("namespaces={}", self.namespaces.join(",")));
        }
        if !self.extra_fields.is_empty() {
            params.push(format!("extraFields={}", self.extra_fields.join(",")));
        }
        if let Some(filter) = &self.filter {
            params.push(format!("filter={filter}"));
        }
        if !params.is_empty() {
            write!(f, "?{}", params.join("&"))?;
        }
        Ok(())
    }
}

impl Serialize for FilteredTopic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FilteredTopic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Response,
    Error,
    Nack,
}

/// Where responses to consumed messages are published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyTarget {
    pub address: String,
    #[serde(default)]
    pub header_mapping: HeaderMapping,
    #[serde(default = "ReplyTarget::expected_response_types_default")]
    pub expected_response_types: Vec<ResponseType>,
}

impl ReplyTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            header_mapping: HeaderMapping::default(),
            expected_response_types: Self::expected_response_types_default(),
        }
    }

    fn expected_response_types_default() -> Vec<ResponseType> {
        vec![ResponseType::Response, ResponseType::Error]
    }

    pub fn expects(&self, response_type: ResponseType) -> bool {
        self.expected_response_types.contains(&response_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub addresses: Vec<String>,
    #[serde(default = "Source::consumer_count_default")]
    pub consumer_count: usize,
    #[serde(default)]
    pub authorization_context: AuthorizationContext,
    #[serde(default)]
    pub header_mapping: HeaderMapping,
    #[serde(default)]
    pub enforcement: Option<Enforcement>,
    /// Ack requests added to every consumed signal unless the message opts out.
    #[serde(default)]
    pub acknowledgement_requests: Vec<AcknowledgementLabel>,
    /// Labels this source may send acknowledgements for.
    #[serde(default)]
    pub declared_acks: Vec<AcknowledgementLabel>,
    #[serde(default)]
    pub payload_mapping: PayloadMapping,
    #[serde(default)]
    pub reply_target: Option<ReplyTarget>,
}

impl Source {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            consumer_count: Self::consumer_count_default(),
            authorization_context: AuthorizationContext::default(),
            header_mapping: HeaderMapping::default(),
            enforcement: None,
            acknowledgement_requests: Vec::new(),
            declared_acks: Vec::new(),
            payload_mapping: PayloadMapping::default(),
            reply_target: None,
        }
    }

    fn consumer_count_default() -> usize {
        1
    }

    pub fn with_authorization_context(mut self, context: AuthorizationContext) -> Self {
        self.authorization_context = context;
        self
    }

    pub fn with_header_mapping(mut self, mapping: HeaderMapping) -> Self {
        self.header_mapping = mapping;
        self
    }

    pub fn with_enforcement(mut self, enforcement: Enforcement) -> Self {
        self.enforcement = Some(enforcement);
        self
    }

    pub fn with_acknowledgement_requests(mut self, labels: Vec<AcknowledgementLabel>) -> Self {
        self.acknowledgement_requests = labels;
        self
    }

    pub fn with_declared_acks(mut self, labels: Vec<AcknowledgementLabel>) -> Self {
        self.declared_acks = labels;
        self
    }

    pub fn with_payload_mapping(mut self, mapping: PayloadMapping) -> Self {
        self.payload_mapping = mapping;
        self
    }

    pub fn with_reply_target(mut self, reply_target: ReplyTarget) -> Self {
        self.reply_target = Some(reply_target);
        self
    }

    /// Declared labels with the connection id placeholder substituted.
    pub fn resolved_declared_acks(&self, connection_id: &ConnectionId) -> Vec<AcknowledgementLabel> {
        self.declared_acks
            .iter()
            .map(|l| l.resolve_connection_id(connection_id.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub address: String,
    pub topics: Vec<FilteredTopic>,
    #[serde(default)]
    pub authorization_context: AuthorizationContext,
    #[serde(default)]
    pub header_mapping: HeaderMapping,
    /// Ack emitted once the broker confirms a publish to this target.
    #[serde(default)]
    pub issued_acknowledgement_label: Option<AcknowledgementLabel>,
    #[serde(default)]
    pub payload_mapping: PayloadMapping,
}

impl Target {
    pub fn new(address: impl Into<String>, topics: Vec<FilteredTopic>) -> Self {
        Self {
            address: address.into(),
            topics,
            authorization_context: AuthorizationContext::default(),
            header_mapping: HeaderMapping::default(),
            issued_acknowledgement_label: None,
            payload_mapping: PayloadMapping::default(),
        }
    }

    pub fn with_authorization_context(mut self, context: AuthorizationContext) -> Self {
        self.authorization_context = context;
        self
    }

    pub fn with_header_mapping(mut self, mapping: HeaderMapping) -> Self {
        self.header_mapping = mapping;
        self
    }

    pub fn with_issued_acknowledgement_label(mut self, label: AcknowledgementLabel) -> Self {
        self.issued_acknowledgement_label = Some(label);
        self
    }

    pub fn with_payload_mapping(mut self, mapping: PayloadMapping) -> Self {
        self.payload_mapping = mapping;
        self
    }

    /// First subscribed topic accepting the signal.
    pub fn matching_topic(&self, signal: &Signal) -> Option<&FilteredTopic> {
        self.topics.iter().find(|t| t.matches(signal))
    }

    /// A target without authorization context is unrestricted. Otherwise one of its
    /// subjects must be among the signal's read subjects.
    pub fn is_authorized(&self, signal: &Signal) -> bool {
        if self.authorization_context.is_empty() {
            return true;
        }
        let granted = signal.headers().read_subjects();
        self.authorization_context
            .subjects()
            .iter()
            .any(|subject| granted.contains(subject))
    }

    /// Authorized and subscribed.
    pub fn accepts(&self, signal: &Signal) -> bool {
        self.is_authorized(signal) && self.matching_topic(signal).is_some()
    }
}

/// Host and port a connection dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    #[serde(default)]
    pub name: Option<String>,
    pub connection_type: ConnectionType,
    /// Desired status.
    pub connection_status: ConnectivityStatus,
    pub uri: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default = "Connection::one")]
    pub client_count: usize,
    #[serde(default = "Connection::one")]
    pub processor_pool_size: usize,
    #[serde(default = "Connection::one")]
    pub outbound_processor_pool_size: usize,
    #[serde(default)]
    pub mapping_definitions: BTreeMap<String, MappingContext>,
    #[serde(default)]
    pub specific_config: BTreeMap<String, String>,
    #[serde(default)]
    pub lifecycle: ConnectionLifecycle,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl Connection {
    pub fn new(id: ConnectionId, connection_type: ConnectionType, uri: impl Into<String>) -> Self {
        Self {
            id,
            name: None,
            connection_type,
            connection_status: ConnectivityStatus::Closed,
            uri: uri.into(),
            sources: Vec::new(),
            targets: Vec::new(),
            client_count: 1,
            processor_pool_size: 1,
            outbound_processor_pool_size: 1,
            mapping_definitions: BTreeMap::new(),
            specific_config: BTreeMap::new(),
            lifecycle: ConnectionLifecycle::Active,
            revision: 0,
            modified: None,
        }
    }

    fn one() -> usize {
        1
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: ConnectivityStatus) -> Self {
        self.connection_status = status;
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_client_count(mut self, count: usize) -> Self {
        self.client_count = count;
        self
    }

    pub fn with_processor_pool_size(mut self, size: usize) -> Self {
        self.processor_pool_size = size;
        self
    }

    pub fn with_outbound_processor_pool_size(mut self, size: usize) -> Self {
        self.outbound_processor_pool_size = size;
        self
    }

    pub fn with_mapping_definition(mut self, id: impl Into<String>, context: MappingContext) -> Self {
        self.mapping_definitions.insert(id.into(), context);
        self
    }

    pub fn with_specific_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.specific_config.insert(key.into(), value.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle == ConnectionLifecycle::Deleted
    }

    /// Parses `scheme://[user[:password]@]host[:port][/path]`.
    pub fn endpoint(&self) -> Result<Endpoint, ConnectivityError> {
        let invalid = |message: &str| ConnectivityError::ConnectionConfigurationInvalid {
            message: format!("invalid uri '{}': {message}", self.uri),
        };
        let (scheme, rest) = self.uri.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(|| invalid("unterminated ipv6 host"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match host_port.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (host_port, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => match scheme {
                "amqp" => 5672,
                "amqps" => 5671,
                "tcp" | "mqtt" | "ws" => 1883,
                "ssl" | "mqtts" | "wss" => 8883,
                "http" => 80,
                "https" => 443,
                _ => self.connection_type.default_port(),
            },
        };
        Ok(Endpoint {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Static validation run on create, modify and test.
    pub fn validate(&self) -> Result<(), ConnectivityError> {
        let invalid = |message: String| ConnectivityError::ConnectionConfigurationInvalid { message };
        self.endpoint()?;
        if self.client_count == 0 {
            return Err(invalid("clientCount must be at least 1".to_string()));
        }
        if self.processor_pool_size == 0 || self.outbound_processor_pool_size == 0 {
            return Err(invalid("processor pool sizes must be at least 1".to_string()));
        }
        for (index, source) in self.sources.iter().enumerate() {
            if source.addresses.is_empty() {
                return Err(invalid(format!("source {index} has no addresses")));
            }
            if let Some(enforcement) = &source.enforcement {
                enforcement.validate()?;
            }
            for (_, template) in source.header_mapping.iter() {
                validate_template(template)?;
            }
            if let Some(label) = source.declared_acks.iter().find(|l| l.is_built_in()) {
                return Err(invalid(format!("source {index} must not declare built-in ack '{label}'")));
            }
            self.validate_payload_mapping(&source.payload_mapping)?;
        }
        for (index, target) in self.targets.iter().enumerate() {
            if target.topics.is_empty() {
                return Err(invalid(format!("target {index} subscribes to no topics")));
            }
            validate_template(&target.address)?;
            for (_, template) in target.header_mapping.iter() {
                validate_template(template)?;
            }
            if let Some(label) = target.issued_acknowledgement_label.as_ref().filter(|l| l.is_built_in()) {
                return Err(invalid(format!("target {index} must not issue built-in ack '{label}'")));
            }
            self.validate_payload_mapping(&target.payload_mapping)?;
        }
        Ok(())
    }

    fn validate_payload_mapping(&self, mapping: &PayloadMapping) -> Result<(), ConnectivityError> {
        match mapping
            .ids()
            .iter()
            .find(|id| id.as_str() != DEFAULT_MAPPING_ID && !self.mapping_definitions.contains_key(id.as_str()))
        {
            Some(id) => Err(ConnectivityError::ConnectionConfigurationInvalid {
                message: format!("payload mapping '{id}' is not defined"),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_connectivity_sdk::{DittoHeaders, EntityId, Event};
    use serde_json::json;

    fn twin_event(namespace: &str) -> Signal {
        Signal::Event(Event {
            entity_id: EntityId::thing(namespace, "lamp"),
            channel: Channel::Twin,
            action: ng_connectivity_sdk::Action::Modified,
            path: "/attributes/on".into(),
            value: Some(json!(true)),
            revision: Some(3),
            timestamp: None,
            headers: DittoHeaders::new(),
        })
    }

    #[test]
    fn filtered_topic_round_trips() {
        let raw = r#"_/_/things/twin/events?namespaces=org.acme,org.demo&extraFields=attributes/location&filter=eq(attributes/on,true)"#;
        let topic: FilteredTopic = raw.parse().unwrap();
        assert_eq!(topic.kind(), TopicKind::TwinEvents);
        assert_eq!(topic.namespaces(), ["org.acme", "org.demo"]);
        assert_eq!(topic.extra_fields_selector().as_deref(), Some("attributes/location"));
        assert!(topic.filter().is_some());
        let again: FilteredTopic = topic.to_string().parse().unwrap();
        assert_eq!(again, topic);
    }

    #[test]
    fn filtered_topic_matches_kind_and_namespace() {
        let topic: FilteredTopic = "_/_/things/twin/events?namespaces=org.acme".parse().unwrap();
        assert!(topic.matches(&twin_event("org.acme")));
        assert!(!topic.matches(&twin_event("org.other")));
        let live: FilteredTopic = "_/_/things/live/events".parse().unwrap();
        assert!(!live.matches(&twin_event("org.acme")));
        assert!("_/_/things/twin/nope".parse::<FilteredTopic>().is_err());
        assert!("_/_/things/twin/events?bogus=1".parse::<FilteredTopic>().is_err());
    }

    #[test]
    fn restricted_targets_need_a_read_grant() {
        let open = Target::new("out", vec!["_/_/things/twin/events".parse().unwrap()]);
        let restricted = open
            .clone()
            .with_authorization_context(AuthorizationContext::new(["integration:reader"]));
        let plain = twin_event("org.acme");
        assert!(open.accepts(&plain));
        assert!(!restricted.accepts(&plain));

        let granted = plain
            .clone()
            .with_headers(DittoHeaders::new().with_read_subjects(["user:x", "integration:reader"]));
        assert!(restricted.accepts(&granted));
        let other = plain.with_headers(DittoHeaders::new().with_read_subjects(["user:x"]));
        assert!(!restricted.is_authorized(&other));
    }

    #[test]
    fn endpoint_parsing() {
        let c = Connection::new("c".into(), ConnectionType::Mqtt, "tcp://user:pw@broker.local:1884");
        let e = c.endpoint().unwrap();
        assert_eq!((e.host.as_str(), e.port), ("broker.local", 1884));
        let c = Connection::new("c".into(), ConnectionType::Amqp091, "amqps://broker");
        assert_eq!(c.endpoint().unwrap().port, 5671);
        let c = Connection::new("c".into(), ConnectionType::Kafka, "tcp://[::1]:9093/x");
        let e = c.endpoint().unwrap();
        assert_eq!(e.host, "::1");
        assert_eq!(e.authority(), "[::1]:9093");
        assert!(Connection::new("c".into(), ConnectionType::Mqtt, "broker:1883").endpoint().is_err());
    }

    #[test]
    fn validation_catches_undefined_mappings_and_built_in_acks() {
        let base = Connection::new("c".into(), ConnectionType::Mqtt, "tcp://localhost:1883");
        let undefined = base
            .clone()
            .with_source(Source::new(["in"]).with_payload_mapping(PayloadMapping::new(["js"])));
        assert!(undefined.validate().is_err());

        let built_in = base
            .clone()
            .with_source(Source::new(["in"]).with_declared_acks(vec![AcknowledgementLabel::twin_persisted()]));
        assert!(built_in.validate().is_err());

        let ok = base
            .with_mapping_definition("js", MappingContext::new("Ditto"))
            .with_source(Source::new(["in"]).with_payload_mapping(PayloadMapping::new(["js", "default"])));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn connection_deserializes_with_defaults() {
        let c: Connection = serde_json::from_value(json!({
            "id": "mqtt-1",
            "connectionType": "mqtt",
            "connectionStatus": "open",
            "uri": "tcp://localhost:1883",
            "targets": [{"address": "out/{{ thing:id }}", "topics": ["_/_/things/twin/events"]}]
        }))
        .unwrap();
        assert_eq!(c.client_count, 1);
        assert_eq!(c.connection_status, ConnectivityStatus::Open);
        assert_eq!(c.targets[0].topics[0].kind(), TopicKind::TwinEvents);
        assert!(c.validate().is_ok());
    }
}
