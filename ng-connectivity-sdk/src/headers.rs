use crate::{ack::AcknowledgementLabel, error::ConnectivityError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, time::Duration};

/// Well-known header keys.
pub mod keys {
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const REQUESTED_ACKS: &str = "requested-acks";
    pub const RESPONSE_REQUIRED: &str = "response-required";
    pub const TIMEOUT: &str = "timeout";
    pub const REPLY_TO: &str = "reply-to";
    pub const ORIGIN: &str = "ditto-origin";
    pub const MAPPER: &str = "ditto-inbound-mapper";
    pub const ENTITY_REVISION: &str = "ditto-entity-revision";
    pub const READ_SUBJECTS: &str = "read-subjects";
}

/// Subjects on whose behalf a signal is processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizationContext(Vec<String>);

impl AuthorizationContext {
    pub fn new<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(subjects.into_iter().map(Into::into).collect())
    }

    pub fn subjects(&self) -> &[String] {
        &self.0
    }

    pub fn first_subject(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Header name to placeholder template, applied to inbound and outbound messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMapping(BTreeMap<String, String>);

impl HeaderMapping {
    pub fn new(mapping: BTreeMap<String, String>) -> Self {
        Self(mapping)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMapping {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Headers of a signal. Keys are case-insensitive and stored lowercase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DittoHeaders {
    entries: BTreeMap<String, String>,
    authorization_context: AuthorizationContext,
}

impl DittoHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (k, v) in entries {
            headers.insert(k.as_ref(), v);
        }
        headers
    }

    /// Reads a JSON object; non-string values are stored in their JSON form.
    pub fn from_json(value: &Value) -> Result<Self, ConnectivityError> {
        let Value::Object(obj) = value else {
            return Err(ConnectivityError::protocol("headers must be a JSON object"));
        };
        let mut headers = Self::new();
        for (k, v) in obj {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            headers.insert(k, v);
        }
        Ok(headers)
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for (k, v) in &self.entries {
            let json = match k.as_str() {
                keys::REQUESTED_ACKS | keys::READ_SUBJECTS => {
                    serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()))
                }
                keys::RESPONSE_REQUIRED => match v.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => Value::String(v.clone()),
                },
                _ => Value::String(v.clone()),
            };
            obj.insert(k.clone(), json);
        }
        Value::Object(obj)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries of `other` win over entries of `self`.
    pub fn merged(mut self, other: &DittoHeaders) -> Self {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
        if !other.authorization_context.is_empty() {
            self.authorization_context = other.authorization_context.clone();
        }
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(keys::CORRELATION_ID)
    }

    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.with(keys::CORRELATION_ID, correlation_id)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(keys::CONTENT_TYPE)
    }

    /// Defaults to `true` when the header is absent or not a boolean.
    pub fn is_response_required(&self) -> bool {
        !matches!(self.get(keys::RESPONSE_REQUIRED), Some("false"))
    }

    pub fn authorization_context(&self) -> &AuthorizationContext {
        &self.authorization_context
    }

    pub fn with_authorization_context(mut self, context: AuthorizationContext) -> Self {
        self.authorization_context = context;
        self
    }

    /// Subjects granted to read the entity the signal is about.
    ///
    /// Accepts a JSON array of strings or a comma separated list. Absent means no grants.
    pub fn read_subjects(&self) -> Vec<String> {
        let Some(raw) = self.get(keys::READ_SUBJECTS).map(str::trim) else {
            return Vec::new();
        };
        if raw.starts_with('[') {
            return serde_json::from_str(raw).unwrap_or_default();
        }
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn with_read_subjects<I, S>(self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subjects: Vec<String> = subjects.into_iter().map(Into::into).collect();
        let json = serde_json::to_string(&subjects).unwrap_or_else(|_| "[]".to_string());
        self.with(keys::READ_SUBJECTS, json)
    }

    /// Requested ack labels, in request order and without duplicates.
    ///
    /// Accepts a JSON array of strings or a comma separated list.
    pub fn acknowledgement_requests(&self) -> Result<Vec<AcknowledgementLabel>, ConnectivityError> {
        let Some(raw) = self.get(keys::REQUESTED_ACKS) else {
            return Ok(Vec::new());
        };
        let raw = raw.trim();
        let names: Vec<String> = if raw.starts_with('[') {
            serde_json::from_str(raw).map_err(|e| {
                ConnectivityError::protocol(format!("invalid '{}' header: {e}", keys::REQUESTED_ACKS))
            })?
        } else {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };
        let mut labels: Vec<AcknowledgementLabel> = Vec::with_capacity(names.len());
        for name in names {
            let label = AcknowledgementLabel::parse(&name)?;
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        Ok(labels)
    }

    /// `true` when the sender explicitly requested no acknowledgements.
    pub fn has_explicit_empty_ack_requests(&self) -> bool {
        match self.get(keys::REQUESTED_ACKS) {
            Some(raw) => {
                let raw = raw.trim();
                raw.is_empty() || raw.replace(char::is_whitespace, "") == "[]"
            }
            None => false,
        }
    }

    pub fn set_acknowledgement_requests(&mut self, labels: &[AcknowledgementLabel]) {
        let names: Vec<&str> = labels.iter().map(AcknowledgementLabel::as_str).collect();
        let json = serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string());
        self.insert(keys::REQUESTED_ACKS, json);
    }

    /// Parses `500ms`, `10s`, `2m` or a plain number of seconds.
    pub fn timeout(&self) -> Option<Duration> {
        let raw = self.get(keys::TIMEOUT)?.trim();
        if let Some(ms) = raw.strip_suffix("ms") {
            return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
        }
        if let Some(s) = raw.strip_suffix('s') {
            return s.trim().parse::<u64>().ok().map(Duration::from_secs);
        }
        if let Some(m) = raw.strip_suffix('m') {
            return m.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
        }
        raw.parse::<u64>().ok().map(Duration::from_secs)
    }

    /// Size in bytes of all keys and values.
    pub fn header_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub fn without_correlation_id(&self) -> Self {
        let mut copy = self.clone();
        copy.remove(keys::CORRELATION_ID);
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let headers = DittoHeaders::new().with("Correlation-ID", "c-1");
        assert_eq!(headers.correlation_id(), Some("c-1"));
        assert!(headers.contains_key("CORRELATION-id"));
    }

    #[test]
    fn ack_requests_parse_json_and_csv() {
        let json = DittoHeaders::new().with(keys::REQUESTED_ACKS, r#"["twin-persisted","custom-ack","custom-ack"]"#);
        let labels = json.acknowledgement_requests().unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].as_str(), "twin-persisted");

        let csv = DittoHeaders::new().with(keys::REQUESTED_ACKS, "twin-persisted, live-response");
        assert_eq!(csv.acknowledgement_requests().unwrap().len(), 2);
    }

    #[test]
    fn explicit_empty_ack_request_is_detected() {
        assert!(DittoHeaders::new().with(keys::REQUESTED_ACKS, "[ ]").has_explicit_empty_ack_requests());
        assert!(!DittoHeaders::new().has_explicit_empty_ack_requests());
        assert!(!DittoHeaders::new()
            .with(keys::REQUESTED_ACKS, "[\"twin-persisted\"]")
            .has_explicit_empty_ack_requests());
    }

    #[test]
    fn timeout_units() {
        let t = |v: &str| DittoHeaders::new().with(keys::TIMEOUT, v).timeout();
        assert_eq!(t("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(t("10s"), Some(Duration::from_secs(10)));
        assert_eq!(t("2m"), Some(Duration::from_secs(120)));
        assert_eq!(t("7"), Some(Duration::from_secs(7)));
        assert_eq!(t("soon"), None);
    }

    #[test]
    fn read_subjects_parse_json_and_csv() {
        let json = DittoHeaders::new().with_read_subjects(["integration:a", "user:b"]);
        assert_eq!(json.read_subjects(), vec!["integration:a", "user:b"]);
        assert!(json.to_json()[keys::READ_SUBJECTS].is_array());

        let csv = DittoHeaders::new().with(keys::READ_SUBJECTS, "integration:a, user:b");
        assert_eq!(csv.read_subjects().len(), 2);
        assert!(DittoHeaders::new().read_subjects().is_empty());
    }

    #[test]
    fn json_roundtrip_keeps_requested_acks_as_array() {
        let mut headers = DittoHeaders::new().with_correlation_id("x");
        headers.set_acknowledgement_requests(&[AcknowledgementLabel::twin_persisted()]);
        let json = headers.to_json();
        assert!(json[keys::REQUESTED_ACKS].is_array());
        assert_eq!(DittoHeaders::from_json(&json).unwrap(), headers);
    }
}
