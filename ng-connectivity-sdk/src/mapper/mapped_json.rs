//! Declarative JSON mapper driven by JMESPath rules.
//!
//! Each direction is a set of rules `out_path -> expr`. Expressions are compiled once when
//! the mapper is created and evaluated against a stable input view:
//!
//! - inbound: `{ headers, payload, sourceAddress, contentType }`; the output must form a
//!   Ditto protocol envelope (`topic`, `path`, `value`, optional `headers`). A `null`
//!   topic means the message is not handled by this mapper.
//! - outbound: the JSON envelope of the adaptable (including `extra`); the output is the
//!   wire payload.
//!
//! Options:
//! `{ "incoming": { "<out.path>": "<expr>" }, "outgoing": { .. }, "outgoingContentType": "..", "conflictPolicy": "overwrite" | "error" }`

use super::{MapperFactory, MappingContext, MessageMapper};
use crate::{
    adaptable::Adaptable,
    error::ConnectivityError,
    external::ExternalMessage,
    headers::{keys, DittoHeaders},
};
use jmespath::Expression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;

pub const MAPPED_JSON_ENGINE: &str = "MappedJson";

/// One mapping rule: write `expr(input)` into `out_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedRule {
    /// Dot-separated output path (e.g. `value.temperature`).
    pub out_path: String,
    /// JMESPath expression evaluated against the input JSON.
    pub expr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedJsonSpec {
    /// Ordered rules (stable evaluation order).
    #[serde(default)]
    pub rules: Vec<MappedRule>,
}

impl From<BTreeMap<String, String>> for MappedJsonSpec {
    fn from(map: BTreeMap<String, String>) -> Self {
        let rules = map
            .into_iter()
            .map(|(out_path, expr)| MappedRule { out_path, expr })
            .collect();
        Self { rules }
    }
}

/// Conflict policy for output-path writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutPathConflictPolicy {
    /// Overwrite conflicting nodes.
    #[default]
    Overwrite,
    /// Fail on type conflicts.
    Error,
}

#[derive(Debug, Error)]
pub enum MappedJsonError {
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("compile failed (expr={expr}): {error}")]
    Compile { expr: String, error: String },
    #[error("eval failed (expr={expr}): {error}")]
    Eval { expr: String, error: String },
    #[error("out_path conflict (path={path}): {error}")]
    OutPath { path: String, error: String },
}

/// A compiled rule set ready for the hot path.
#[derive(Clone)]
pub struct CompiledMappedJson {
    rules: Arc<[CompiledRule]>,
    conflict_policy: OutPathConflictPolicy,
}

impl fmt::Debug for CompiledMappedJson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMappedJson")
            .field("rules", &self.rules.iter().map(|r| (&r.out_path, &r.expr)).collect::<Vec<_>>())
            .field("conflict_policy", &self.conflict_policy)
            .finish()
    }
}

#[derive(Clone)]
struct CompiledRule {
    out_path: String,
    segments: Arc<[String]>,
    expr: String,
    compiled: Expression<'static>,
}

impl CompiledMappedJson {
    pub fn compile(spec: &MappedJsonSpec, conflict_policy: OutPathConflictPolicy) -> Result<Self, MappedJsonError> {
        let mut out: Vec<CompiledRule> = Vec::with_capacity(spec.rules.len());
        for r in spec.rules.iter() {
            let out_path = r.out_path.trim();
            let expr = r.expr.trim();
            if out_path.is_empty() {
                return Err(MappedJsonError::InvalidRule("out_path must not be empty".to_string()));
            }
            if expr.is_empty() {
                return Err(MappedJsonError::InvalidRule(format!(
                    "expr must not be empty (out_path={out_path})"
                )));
            }
            let segments: Vec<String> = out_path
                .split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if segments.is_empty() {
                return Err(MappedJsonError::InvalidRule(format!(
                    "out_path has no segments (out_path={out_path})"
                )));
            }
            let compiled = jmespath::compile(expr).map_err(|e| MappedJsonError::Compile {
                expr: expr.to_string(),
                error: e.to_string(),
            })?;
            out.push(CompiledRule {
                out_path: out_path.to_string(),
                segments: Arc::from(segments.into_boxed_slice()),
                expr: expr.to_string(),
                compiled,
            });
        }
        Ok(Self {
            rules: Arc::from(out.into_boxed_slice()),
            conflict_policy,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, input: &Value) -> Result<Value, MappedJsonError> {
        let mut out = Value::Object(Map::new());
        for r in self.rules.iter() {
            let result = r.compiled.search(input).map_err(|e| MappedJsonError::Eval {
                expr: r.expr.clone(),
                error: e.to_string(),
            })?;
            let v = serde_json::to_value(result.as_ref()).map_err(|e| MappedJsonError::Eval {
                expr: r.expr.clone(),
                error: e.to_string(),
            })?;
            set_out_path(&mut out, &r.out_path, &r.segments, v, self.conflict_policy)?;
        }
        Ok(out)
    }
}

fn set_out_path(
    root: &mut Value,
    out_path: &str,
    segments: &[String],
    value: Value,
    policy: OutPathConflictPolicy,
) -> Result<(), MappedJsonError> {
    let conflict = |error: String| MappedJsonError::OutPath {
        path: out_path.to_string(),
        error,
    };
    let Some((last, parents)) = segments.split_last() else {
        return Err(MappedJsonError::InvalidRule(format!(
            "out_path has no segments (out_path={out_path})"
        )));
    };
    let mut cur = root;
    for seg in parents {
        let Value::Object(m) = cur else {
            return Err(conflict("parent is not an object".to_string()));
        };
        let is_object = m.get(seg).is_some_and(Value::is_object);
        if !is_object {
            if m.contains_key(seg) && policy == OutPathConflictPolicy::Error {
                return Err(conflict(format!("segment {seg} conflicts with non-object value")));
            }
            m.insert(seg.clone(), Value::Object(Map::new()));
        }
        cur = m
            .get_mut(seg)
            .ok_or_else(|| conflict(format!("failed to access segment {seg}")))?;
    }
    match cur {
        Value::Object(m) => {
            m.insert(last.clone(), value);
            Ok(())
        }
        _ => Err(conflict("parent is not an object".to_string())),
    }
}

/// Mapper applying compiled rules per direction.
#[derive(Debug, Clone)]
pub struct MappedJsonMapper {
    id: String,
    incoming: Option<CompiledMappedJson>,
    outgoing: Option<CompiledMappedJson>,
    outgoing_content_type: String,
}

impl MappedJsonMapper {
    pub fn from_context(id: &str, context: &MappingContext) -> Result<Self, ConnectivityError> {
        let invalid = |message: String| ConnectivityError::MapperConfigurationInvalid {
            mapper: id.to_string(),
            message,
        };
        let policy = match context.option_str("conflictPolicy") {
            None | Some("overwrite") => OutPathConflictPolicy::Overwrite,
            Some("error") => OutPathConflictPolicy::Error,
            Some(other) => return Err(invalid(format!("unknown conflictPolicy '{other}'"))),
        };
        let compile_direction = |key: &str| -> Result<Option<CompiledMappedJson>, ConnectivityError> {
            let Some(raw) = context.options.get(key) else {
                return Ok(None);
            };
            let spec: MappedJsonSpec = if raw.get("rules").is_some() {
                serde_json::from_value(raw.clone()).map_err(|e| invalid(format!("'{key}': {e}")))?
            } else {
                let map: BTreeMap<String, String> =
                    serde_json::from_value(raw.clone()).map_err(|e| invalid(format!("'{key}': {e}")))?;
                map.into()
            };
            let compiled = CompiledMappedJson::compile(&spec, policy).map_err(|e| invalid(format!("'{key}': {e}")))?;
            Ok(Some(compiled))
        };
        let incoming = compile_direction("incoming")?;
        let outgoing = compile_direction("outgoing")?;
        if incoming.is_none() && outgoing.is_none() {
            return Err(invalid("at least one of 'incoming' or 'outgoing' is required".to_string()));
        }
        Ok(Self {
            id: id.to_string(),
            incoming,
            outgoing,
            outgoing_content_type: context
                .option_str("outgoingContentType")
                .unwrap_or("application/json")
                .to_string(),
        })
    }

    fn inbound_view(message: &ExternalMessage) -> Value {
        let payload = match message.text_payload() {
            Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
            None => Value::Null,
        };
        let headers: Map<String, Value> = message
            .headers()
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), Value::String(v.clone())))
            .collect();
        let mut view = Map::new();
        view.insert("headers".into(), Value::Object(headers));
        view.insert("payload".into(), payload);
        view.insert(
            "sourceAddress".into(),
            message.source_address().map_or(Value::Null, |a| Value::String(a.to_string())),
        );
        view.insert(
            "contentType".into(),
            message.content_type().map_or(Value::Null, |c| Value::String(c.to_string())),
        );
        Value::Object(view)
    }
}

impl MessageMapper for MappedJsonMapper {
    fn id(&self) -> &str {
        &self.id
    }

    fn map_inbound(&self, message: &ExternalMessage) -> Result<Vec<Adaptable>, ConnectivityError> {
        let Some(rules) = &self.incoming else {
            return Ok(Vec::new());
        };
        let envelope = rules
            .apply(&Self::inbound_view(message))
            .map_err(|e| ConnectivityError::mapping_failed(format!("mapper '{}': {e}", self.id)))?;
        if envelope.get("topic").map_or(true, Value::is_null) {
            return Ok(Vec::new());
        }
        let mut adaptable = Adaptable::from_json(&envelope)?;
        let wire_headers = DittoHeaders::from_map(message.headers().iter().map(|(k, v)| (k, v.clone())))
            .with_authorization_context(message.authorization_context().clone());
        adaptable.headers = wire_headers.merged(&adaptable.headers);
        Ok(vec![adaptable])
    }

    fn map_outbound(&self, adaptable: &Adaptable) -> Result<Vec<ExternalMessage>, ConnectivityError> {
        let Some(rules) = &self.outgoing else {
            return Ok(Vec::new());
        };
        let payload = rules
            .apply(&adaptable.to_json())
            .map_err(|e| ConnectivityError::mapping_failed(format!("mapper '{}': {e}", self.id)))?;
        let message = ExternalMessage::new(adaptable.headers.iter().map(|(k, v)| (k.clone(), v.clone())))
            .with_header(keys::CONTENT_TYPE, self.outgoing_content_type.clone())
            .with_text(serde_json::to_string(&payload)?)
            .with_topic_path(adaptable.topic.clone())
            .as_response(adaptable.status.is_some());
        Ok(vec![message])
    }
}

#[derive(Debug, Default)]
pub struct MappedJsonMapperFactory;

impl MapperFactory for MappedJsonMapperFactory {
    fn engine(&self) -> &'static str {
        MAPPED_JSON_ENGINE
    }

    fn create(&self, id: &str, context: &MappingContext) -> Result<Arc<dyn MessageMapper>, ConnectivityError> {
        Ok(Arc::new(MappedJsonMapper::from_context(id, context)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::{Action, Criterion};
    use serde_json::json;

    fn context() -> MappingContext {
        MappingContext::new(MAPPED_JSON_ENGINE)
            .with_option(
                "incoming",
                json!({
                    "topic": "join('/', ['org.acme', headers.\"device-id\", 'things/twin/commands/modify'])",
                    "path": "'/features/temperature/properties/value'",
                    "value": "payload.temp"
                }),
            )
            .with_option(
                "outgoing",
                json!({
                    "device": "topic",
                    "reading.value": "value",
                    "reading.location": "extra.attributes.location"
                }),
            )
    }

    #[test]
    fn inbound_builds_envelope_from_rules() {
        let mapper = MappedJsonMapper::from_context("telemetry", &context()).unwrap();
        let msg = ExternalMessage::new([("device-id", "sensor-7")]).with_text(r#"{"temp": 21.5}"#);
        let adaptables = mapper.map_inbound(&msg).unwrap();
        assert_eq!(adaptables.len(), 1);
        let a = &adaptables[0];
        assert_eq!(a.topic.entity_name, "sensor-7");
        assert_eq!(a.topic.criterion, Criterion::Commands);
        assert_eq!(a.topic.action, Some(Action::Modify));
        assert_eq!(a.value, Some(json!(21.5)));
        assert_eq!(a.headers.get("device-id"), Some("sensor-7"));
    }

    #[test]
    fn inbound_without_topic_is_not_handled() {
        let mapper = MappedJsonMapper::from_context("telemetry", &context()).unwrap();
        let msg = ExternalMessage::default().with_text(r#"{"temp": 1}"#);
        assert!(mapper.map_inbound(&msg).unwrap().is_empty());
    }

    #[test]
    fn outbound_reads_extra_fields() {
        let mapper = MappedJsonMapper::from_context("telemetry", &context()).unwrap();
        let adaptable = Adaptable::from_json(&json!({
            "topic": "org.acme/lamp/things/twin/events/modified",
            "path": "/attributes/on",
            "value": true,
            "extra": {"attributes": {"location": "kitchen"}}
        }))
        .unwrap();
        let messages = mapper.map_outbound(&adaptable).unwrap();
        let payload: Value = serde_json::from_str(messages[0].text_payload().unwrap()).unwrap();
        assert_eq!(payload["reading"]["location"], json!("kitchen"));
        assert_eq!(payload["device"], json!("org.acme/lamp/things/twin/events/modified"));
        assert_eq!(messages[0].content_type(), Some("application/json"));
    }

    #[test]
    fn malformed_options_are_configuration_errors() {
        let broken = MappingContext::new(MAPPED_JSON_ENGINE).with_option("incoming", json!({"topic": "join(("}));
        assert!(matches!(
            MappedJsonMapper::from_context("broken", &broken),
            Err(ConnectivityError::MapperConfigurationInvalid { .. })
        ));
        assert!(MappedJsonMapper::from_context("empty", &MappingContext::new(MAPPED_JSON_ENGINE)).is_err());
    }

    #[test]
    fn conflict_policy_error_rejects_overwrites() {
        let spec = MappedJsonSpec {
            rules: vec![
                MappedRule {
                    out_path: "a".into(),
                    expr: "`1`".into(),
                },
                MappedRule {
                    out_path: "a.b".into(),
                    expr: "`2`".into(),
                },
            ],
        };
        let strict = CompiledMappedJson::compile(&spec, OutPathConflictPolicy::Error).unwrap();
        assert!(strict.apply(&json!({})).is_err());
        let tolerant = CompiledMappedJson::compile(&spec, OutPathConflictPolicy::Overwrite).unwrap();
        assert_eq!(tolerant.apply(&json!({})).unwrap(), json!({"a": {"b": 2}}));
    }
}
