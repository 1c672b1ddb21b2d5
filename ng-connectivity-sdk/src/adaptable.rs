use crate::{error::ConnectivityError, headers::DittoHeaders, topic::TopicPath};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Protocol envelope between signals and wire payloads.
///
/// JSON form:
/// `{ "topic": .., "headers": {..}, "path": "/..", "value": .., "status": .., "revision": .., "timestamp": .., "extra": {..} }`
#[derive(Debug, Clone, PartialEq)]
pub struct Adaptable {
    pub topic: TopicPath,
    pub headers: DittoHeaders,
    pub path: String,
    pub value: Option<Value>,
    pub status: Option<u16>,
    pub revision: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Enriched extra fields attached before outbound mapping.
    pub extra: Option<Value>,
}

impl Adaptable {
    pub fn new(topic: TopicPath, path: impl Into<String>) -> Self {
        Self {
            topic,
            headers: DittoHeaders::new(),
            path: path.into(),
            value: None,
            status: None,
            revision: None,
            timestamp: None,
            extra: None,
        }
    }

    pub fn with_headers(mut self, headers: DittoHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("topic".into(), Value::String(self.topic.to_string()));
        obj.insert("headers".into(), self.headers.to_json());
        obj.insert("path".into(), Value::String(self.path.clone()));
        if let Some(value) = &self.value {
            obj.insert("value".into(), value.clone());
        }
        if let Some(status) = self.status {
            obj.insert("status".into(), Value::from(status));
        }
        if let Some(revision) = self.revision {
            obj.insert("revision".into(), Value::from(revision));
        }
        if let Some(ts) = &self.timestamp {
            obj.insert("timestamp".into(), Value::String(ts.to_rfc3339()));
        }
        if let Some(extra) = &self.extra {
            obj.insert("extra".into(), extra.clone());
        }
        Value::Object(obj)
    }

    pub fn from_json(json: &Value) -> Result<Self, ConnectivityError> {
        let Value::Object(obj) = json else {
            return Err(ConnectivityError::protocol("protocol message must be a JSON object"));
        };
        let topic = obj
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectivityError::protocol("field 'topic' is missing"))?;
        let topic = TopicPath::parse(topic)?;
        let headers = match obj.get("headers") {
            Some(h) => DittoHeaders::from_json(h)?,
            None => DittoHeaders::new(),
        };
        let path = obj
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();
        let status = match obj.get("status") {
            Some(v) => Some(
                v.as_u64()
                    .filter(|s| (100..600).contains(s))
                    .ok_or_else(|| ConnectivityError::protocol("field 'status' must be an HTTP status"))?
                    as u16,
            ),
            None => None,
        };
        let timestamp = match obj.get("timestamp").and_then(Value::as_str) {
            Some(ts) => Some(
                DateTime::parse_from_rfc3339(ts)
                    .map_err(|e| ConnectivityError::protocol(format!("invalid timestamp: {e}")))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Self {
            topic,
            headers,
            path,
            value: obj.get("value").cloned(),
            status,
            revision: obj.get("revision").and_then(Value::as_i64),
            timestamp,
            extra: obj.get("extra").cloned(),
        })
    }
}
