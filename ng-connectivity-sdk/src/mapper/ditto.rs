use super::{MapperFactory, MappingContext, MessageMapper};
use crate::{
    adaptable::Adaptable,
    error::ConnectivityError,
    external::ExternalMessage,
    headers::{keys, DittoHeaders},
    topic::Criterion,
};
use serde_json::Value;
use std::sync::Arc;

pub const DITTO_ENGINE: &str = "Ditto";
pub const DITTO_PROTOCOL_CONTENT_TYPE: &str = "application/vnd.eclipse.ditto+json";

const HONO_NOTIFICATIONS: [&str; 4] = [
    "application/vnd.eclipse-hono-empty-notification",
    "application/vnd.eclipse-hono-device-provisioning-notification",
    "application/vnd.eclipse-hono-dc-notification+json",
    "application/vnd.eclipse-hono-delivery-failure-notification+json",
];

/// Maps payloads that already are Ditto protocol JSON (single envelope or array).
#[derive(Debug, Clone)]
pub struct DittoMessageMapper {
    id: String,
}

impl DittoMessageMapper {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl MessageMapper for DittoMessageMapper {
    fn id(&self) -> &str {
        &self.id
    }

    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Adaptable>, ConnectivityError> {
        if message.payload().is_empty() {
            return Ok(Vec::new());
        }
        let text = message.text_payload().ok_or_else(|| ConnectivityError::MappingFailed {
            message: "payload is not valid UTF-8".to_string(),
            description: Some(format!("Mapper '{}' expects Ditto protocol JSON.", self.id)),
        })?;
        let json: Value = serde_json::from_str(text).map_err(|e| ConnectivityError::MappingFailed {
            message: format!("payload is not valid JSON: {e}"),
            description: Some(format!("Mapper '{}' expects Ditto protocol JSON.", self.id)),
        })?;
        let envelopes = match json {
            Value::Array(items) => items,
            other => vec![other],
        };
        let message_headers = DittoHeaders::from_map(message.headers().iter().map(|(k, v)| (k, v.clone())))
            .with_authorization_context(message.authorization_context().clone());
        envelopes
            .iter()
            .map(|envelope| {
                let mut adaptable = Adaptable::from_json(envelope)?;
                adaptable.headers = message_headers.clone().merged(&adaptable.headers);
                Ok(adaptable)
            })
            .collect()
    }

    fn map_outbound(&self, adaptable: &Adaptable) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        let text = serde_json::to_string(&adaptable.to_json())?;
        let message = ExternalMessage::new(adaptable.headers.iter().map(|(k, v)| (k.clone(), v.clone())))
            .with_header(keys::CONTENT_TYPE, DITTO_PROTOCOL_CONTENT_TYPE)
            .with_text(text)
            .with_topic_path(adaptable.topic.clone())
            .as_response(adaptable.status.is_some())
            .as_error(adaptable.topic.criterion == Criterion::Errors);
        Ok(vec![message])
    }

    fn default_content_type_blocklist(&self) -> Vec<String> {
        HONO_NOTIFICATIONS.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Default)]
pub struct DittoMapperFactory;

impl MapperFactory for DittoMapperFactory {
    fn engine(&self) -> &'static str {
        DITTO_ENGINE
    }

    fn create(&self, id: &str, _context: &MappingContext) -> Result<Arc<dyn MessageMapper>, ConnectivityError> {
        Ok(Arc::new(DittoMessageMapper::new(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arrays_produce_adaptables_in_order() {
        let payload = json!([
            {"topic": "org/a/things/twin/commands/modify", "path": "/attributes/x", "value": 1},
            {"topic": "org/b/things/twin/commands/modify", "path": "/attributes/x", "value": 2}
        ]);
        let msg = ExternalMessage::new([("correlation-id", "c-1")]).with_text(payload.to_string());
        let adaptables = DittoMessageMapper::new("ditto").map_inbound(&msg).unwrap();
        assert_eq!(adaptables.len(), 2);
        assert_eq!(adaptables[0].topic.entity_name, "a");
        assert_eq!(adaptables[1].topic.entity_name, "b");
        assert_eq!(adaptables[1].headers.correlation_id(), Some("c-1"));
    }

    #[test]
    fn envelope_headers_win_over_message_headers() {
        let payload = json!({
            "topic": "org/a/things/twin/commands/delete",
            "path": "/",
            "headers": {"correlation-id": "from-envelope"}
        });
        let msg = ExternalMessage::new([("correlation-id", "from-wire")]).with_text(payload.to_string());
        let adaptables = DittoMessageMapper::new("ditto").map_inbound(&msg).unwrap();
        assert_eq!(adaptables[0].headers.correlation_id(), Some("from-envelope"));
    }

    #[test]
    fn empty_payload_maps_to_nothing_and_garbage_fails() {
        let mapper = DittoMessageMapper::new("ditto");
        assert!(mapper.map_inbound(&ExternalMessage::default()).unwrap().is_empty());
        let garbage = ExternalMessage::default().with_text("not json");
        assert!(matches!(
            mapper.map_inbound(&garbage),
            Err(ConnectivityError::MappingFailed { .. })
        ));
    }
}
