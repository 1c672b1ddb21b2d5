use crate::{entity::EntityId, error::ConnectivityError, headers::DittoHeaders};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

const CONNECTION_ID_PLACEHOLDERS: [&str; 2] = ["{{connection:id}}", "{{ connection:id }}"];

/// Name of an acknowledgement contributor (`twin-persisted`, `live-response`, custom labels).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AcknowledgementLabel(String);

impl AcknowledgementLabel {
    pub const TWIN_PERSISTED: &'static str = "twin-persisted";
    pub const LIVE_RESPONSE: &'static str = "live-response";
    pub const SEARCH_PERSISTED: &'static str = "search-persisted";

    /// Labels are 3 to 165 characters of `[a-zA-Z0-9-_:]`; a label may also contain
    /// a `{{connection:id}}` placeholder that is resolved per connection.
    pub fn parse(label: &str) -> Result<Self, ConnectivityError> {
        let stripped = CONNECTION_ID_PLACEHOLDERS
            .iter()
            .fold(label.to_string(), |acc, p| acc.replace(p, "xxx"));
        let valid_len = (3..=165).contains(&stripped.len());
        let valid_chars = stripped
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':');
        if valid_len && valid_chars {
            Ok(Self(label.to_string()))
        } else {
            Err(ConnectivityError::AcknowledgementLabelInvalid {
                label: label.to_string(),
            })
        }
    }

    pub fn twin_persisted() -> Self {
        Self(Self::TWIN_PERSISTED.to_string())
    }

    pub fn live_response() -> Self {
        Self(Self::LIVE_RESPONSE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_built_in(&self) -> bool {
        matches!(
            self.0.as_str(),
            Self::TWIN_PERSISTED | Self::LIVE_RESPONSE | Self::SEARCH_PERSISTED
        )
    }

    pub fn has_connection_placeholder(&self) -> bool {
        CONNECTION_ID_PLACEHOLDERS.iter().any(|p| self.0.contains(p))
    }

    pub fn resolve_connection_id(&self, connection_id: &str) -> Self {
        let resolved = CONNECTION_ID_PLACEHOLDERS
            .iter()
            .fold(self.0.clone(), |acc, p| acc.replace(p, connection_id));
        Self(resolved)
    }
}

impl fmt::Display for AcknowledgementLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AcknowledgementLabel {
    type Error = ConnectivityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AcknowledgementLabel> for String {
    fn from(value: AcknowledgementLabel) -> Self {
        value.0
    }
}

/// Result reported by one contributor for one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    pub label: AcknowledgementLabel,
    pub entity_id: EntityId,
    pub status: u16,
    pub payload: Option<Value>,
    pub headers: DittoHeaders,
}

impl Acknowledgement {
    pub fn new(
        label: AcknowledgementLabel,
        entity_id: EntityId,
        status: u16,
        headers: DittoHeaders,
    ) -> Self {
        Self {
            label,
            entity_id,
            status,
            payload: None,
            headers,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_timeout(&self) -> bool {
        self.status == 408
    }

    fn to_entry_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("status".into(), Value::from(self.status));
        if let Some(payload) = &self.payload {
            obj.insert("payload".into(), payload.clone());
        }
        obj.insert("headers".into(), self.headers.to_json());
        Value::Object(obj)
    }
}

/// Several acknowledgements for the same signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgements {
    pub entity_id: EntityId,
    pub acknowledgements: Vec<Acknowledgement>,
    pub headers: DittoHeaders,
}

impl Acknowledgements {
    pub fn new(entity_id: EntityId, acknowledgements: Vec<Acknowledgement>, headers: DittoHeaders) -> Self {
        Self {
            entity_id,
            acknowledgements,
            headers,
        }
    }

    /// The common status of all acks, `200` for mixed successes and `424` otherwise.
    pub fn status(&self) -> u16 {
        let mut statuses = self.acknowledgements.iter().map(|a| a.status);
        let Some(first) = statuses.next() else {
            return 200;
        };
        if statuses.all(|s| s == first) {
            return first;
        }
        if self.acknowledgements.iter().all(Acknowledgement::is_success) {
            200
        } else {
            424
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &AcknowledgementLabel> {
        self.acknowledgements.iter().map(|a| &a.label)
    }

    pub fn is_success(&self) -> bool {
        self.acknowledgements.iter().all(Acknowledgement::is_success)
    }

    /// `{ "<label>": { "status": .., "payload": .., "headers": .. }, .. }`
    pub fn entries_json(&self) -> Value {
        let mut obj = Map::new();
        for ack in &self.acknowledgements {
            obj.insert(ack.label.to_string(), ack.to_entry_json());
        }
        Value::Object(obj)
    }

    pub fn from_entries_json(
        entity_id: &EntityId,
        value: &Value,
        headers: DittoHeaders,
    ) -> Result<Self, ConnectivityError> {
        let Value::Object(obj) = value else {
            return Err(ConnectivityError::protocol("acknowledgements value must be an object"));
        };
        let mut acknowledgements = Vec::with_capacity(obj.len());
        for (label, entry) in obj {
            let status = entry
                .get("status")
                .and_then(Value::as_u64)
                .ok_or_else(|| ConnectivityError::protocol(format!("acknowledgement '{label}' has no status")))?;
            let ack_headers = match entry.get("headers") {
                Some(h) => DittoHeaders::from_json(h)?,
                None => DittoHeaders::new(),
            };
            acknowledgements.push(Acknowledgement {
                label: AcknowledgementLabel::parse(label)?,
                entity_id: entity_id.clone(),
                status: status as u16,
                payload: entry.get("payload").cloned(),
                headers: ack_headers,
            });
        }
        Ok(Self::new(entity_id.clone(), acknowledgements, headers))
    }
}
