use crate::{
    enforcement::EnforcementFilter,
    headers::{keys, AuthorizationContext, DittoHeaders, HeaderMapping},
    mapper::PayloadMapping,
    topic::TopicPath,
};
use bytes::Bytes;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Body of a wire message.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    Text(String),
    Bytes(Bytes),
    #[default]
    Empty,
}

impl Payload {
    /// Text view of the payload; bytes must be valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            Payload::Bytes(b) => std::str::from_utf8(b).ok(),
            Payload::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(s) => s.is_empty(),
            Payload::Bytes(b) => b.is_empty(),
            Payload::Empty => true,
        }
    }
}

/// Settles the broker delivery that produced an inbound message.
pub trait MessageSettlement: Send + Sync {
    fn acknowledge(&self);

    fn reject(&self, requeue: bool);
}

/// Wire-level message entering or leaving a connection.
#[derive(Clone, Default)]
pub struct ExternalMessage {
    headers: BTreeMap<String, String>,
    payload: Payload,
    response: bool,
    error: bool,
    source_address: Option<String>,
    target_address: Option<String>,
    authorization_context: AuthorizationContext,
    topic_path: Option<TopicPath>,
    header_mapping: Option<HeaderMapping>,
    enforcement_filter: Option<EnforcementFilter>,
    payload_mapping: Option<PayloadMapping>,
    internal_headers: DittoHeaders,
    settlement: Option<Arc<dyn MessageSettlement>>,
}

impl fmt::Debug for ExternalMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalMessage")
            .field("headers", &self.headers)
            .field("payload", &self.payload)
            .field("response", &self.response)
            .field("error", &self.error)
            .field("source_address", &self.source_address)
            .field("target_address", &self.target_address)
            .field("topic_path", &self.topic_path)
            .field("settled", &self.settlement.is_none())
            .finish()
    }
}

impl ExternalMessage {
    pub fn new<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.payload = Payload::Text(text.into());
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.payload = Payload::Bytes(bytes.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn as_response(mut self, response: bool) -> Self {
        self.response = response;
        self
    }

    pub fn as_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    pub fn with_source_address(mut self, address: impl Into<String>) -> Self {
        self.source_address = Some(address.into());
        self
    }

    pub fn with_target_address(mut self, address: impl Into<String>) -> Self {
        self.target_address = Some(address.into());
        self
    }

    pub fn with_authorization_context(mut self, context: AuthorizationContext) -> Self {
        self.authorization_context = context;
        self
    }

    pub fn with_topic_path(mut self, topic: TopicPath) -> Self {
        self.topic_path = Some(topic);
        self
    }

    pub fn with_header_mapping(mut self, mapping: HeaderMapping) -> Self {
        self.header_mapping = Some(mapping);
        self
    }

    pub fn with_enforcement_filter(mut self, filter: EnforcementFilter) -> Self {
        self.enforcement_filter = Some(filter);
        self
    }

    pub fn with_payload_mapping(mut self, mapping: PayloadMapping) -> Self {
        self.payload_mapping = Some(mapping);
        self
    }

    pub fn with_internal_headers(mut self, headers: DittoHeaders) -> Self {
        self.internal_headers = headers;
        self
    }

    pub fn with_settlement(mut self, settlement: Arc<dyn MessageSettlement>) -> Self {
        self.settlement = Some(settlement);
        self
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(keys::CONTENT_TYPE)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn text_payload(&self) -> Option<&str> {
        self.payload.as_text()
    }

    pub fn is_response(&self) -> bool {
        self.response
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn source_address(&self) -> Option<&str> {
        self.source_address.as_deref()
    }

    pub fn target_address(&self) -> Option<&str> {
        self.target_address.as_deref()
    }

    pub fn headers_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.headers
    }

    pub fn authorization_context(&self) -> &AuthorizationContext {
        &self.authorization_context
    }

    pub fn topic_path(&self) -> Option<&TopicPath> {
        self.topic_path.as_ref()
    }

    pub fn header_mapping(&self) -> Option<&HeaderMapping> {
        self.header_mapping.as_ref()
    }

    pub fn enforcement_filter(&self) -> Option<&EnforcementFilter> {
        self.enforcement_filter.as_ref()
    }

    pub fn payload_mapping(&self) -> Option<&PayloadMapping> {
        self.payload_mapping.as_ref()
    }

    pub fn internal_headers(&self) -> &DittoHeaders {
        &self.internal_headers
    }

    pub fn settlement(&self) -> Option<&Arc<dyn MessageSettlement>> {
        self.settlement.as_ref()
    }

    /// Takes the settlement handle so that it is settled at most once.
    pub fn take_settlement(&mut self) -> Option<Arc<dyn MessageSettlement>> {
        self.settlement.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let msg = ExternalMessage::new([("Content-Type", "application/json")]).with_text("{}");
        assert_eq!(msg.content_type(), Some("application/json"));
        assert_eq!(msg.text_payload(), Some("{}"));
    }

    #[test]
    fn byte_payloads_expose_utf8_text() {
        let msg = ExternalMessage::new(Vec::<(String, String)>::new()).with_bytes(&b"hello"[..]);
        assert_eq!(msg.text_payload(), Some("hello"));
        let binary = ExternalMessage::default().with_bytes(vec![0xff, 0xfe]);
        assert_eq!(binary.text_payload(), None);
        assert!(!binary.payload().is_empty());
    }
}
