//! Payload mapper contract.
//!
//! A mapper turns one external message into zero or more adaptables (inbound) and one
//! adaptable into zero or more external messages (outbound). Mappers are created by a
//! [`MapperFactory`] from a [`MappingContext`] and must be pure: they are invoked
//! concurrently from the mapping worker pool.

pub mod ditto;
pub mod mapped_json;

use crate::{adaptable::Adaptable, error::ConnectivityError, external::ExternalMessage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

/// Option listing content types a mapper refuses (comma separated).
pub const CONTENT_TYPE_BLOCKLIST_OPTION: &str = "content-type-blocklist";

/// Mapping id of the implicit default mapper.
pub const DEFAULT_MAPPING_ID: &str = "default";

/// Configuration of one mapper instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingContext {
    pub mapping_engine: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub incoming_conditions: BTreeMap<String, String>,
    #[serde(default)]
    pub outgoing_conditions: BTreeMap<String, String>,
}

impl MappingContext {
    pub fn new(mapping_engine: impl Into<String>) -> Self {
        Self {
            mapping_engine: mapping_engine.into(),
            ..Default::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    pub fn with_incoming_condition(mut self, name: impl Into<String>, condition: impl Into<String>) -> Self {
        self.incoming_conditions.insert(name.into(), condition.into());
        self
    }

    pub fn with_outgoing_condition(mut self, name: impl Into<String>, condition: impl Into<String>) -> Self {
        self.outgoing_conditions.insert(name.into(), condition.into());
        self
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    /// Blocklist from the options, if configured.
    pub fn content_type_blocklist(&self) -> Option<Vec<String>> {
        let raw = self.options.get(CONTENT_TYPE_BLOCKLIST_OPTION)?;
        let list = match raw {
            Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Value::Array(items) => items.iter().filter_map(Value::as_str).map(String::from).collect(),
            _ => Vec::new(),
        };
        Some(list)
    }
}

/// Ordered list of mapping ids applied to a source or target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadMapping(Vec<String>);

impl PayloadMapping {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(ids.into_iter().map(Into::into).collect())
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub trait MessageMapper: Send + Sync + Debug {
    /// Mapping id this instance was configured under.
    fn id(&self) -> &str;

    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Adaptable>, ConnectivityError>;

    fn map_outbound(&self, adaptable: &Adaptable) -> Result<Vec<ExternalMessage>, ConnectivityError>;

    /// Content types refused unless the mapping options override the list.
    fn default_content_type_blocklist(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Creates mapper instances of one mapping engine.
pub trait MapperFactory: Send + Sync {
    fn engine(&self) -> &'static str;

    /// Fails with `MapperConfigurationInvalid` on bad options.
    fn create(&self, id: &str, context: &MappingContext) -> Result<Arc<dyn MessageMapper>, ConnectivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mapping_context_reads_camel_case() {
        let ctx: MappingContext = serde_json::from_value(json!({
            "mappingEngine": "Ditto",
            "options": {"content-type-blocklist": "application/octet-stream, text/plain"},
            "incomingConditions": {"onlyJson": "fn:filter(header:content-type,'eq','application/json')"}
        }))
        .unwrap();
        assert_eq!(ctx.mapping_engine, "Ditto");
        assert_eq!(
            ctx.content_type_blocklist().unwrap(),
            vec!["application/octet-stream".to_string(), "text/plain".to_string()]
        );
        assert_eq!(ctx.incoming_conditions.len(), 1);
        assert!(ctx.outgoing_conditions.is_empty());
    }
}
