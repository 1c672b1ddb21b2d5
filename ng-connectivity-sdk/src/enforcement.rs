use crate::{
    entity::EntityId,
    error::ConnectivityError,
    placeholder::{resolve_required, resolve_template, validate_template, PlaceholderContext, Resolved},
    topic::TopicPath,
};
use serde::{Deserialize, Serialize};

/// Signal id enforcement of a source.
///
/// `input` is resolved against the consumed message (e.g. `{{ header:device_id }}` or
/// `{{ source:address }}`); every mapped signal must then match at least one of the
/// `filters`, resolved against the signal (e.g. `{{ thing:id }}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enforcement {
    pub input: String,
    pub filters: Vec<String>,
}

impl Enforcement {
    pub fn validate(&self) -> Result<(), ConnectivityError> {
        if self.filters.is_empty() {
            return Err(ConnectivityError::ConnectionConfigurationInvalid {
                message: "enforcement requires at least one filter".to_string(),
            });
        }
        validate_template(&self.input)?;
        for filter in &self.filters {
            validate_template(filter)?;
        }
        Ok(())
    }

    /// Resolves the input for one consumed message.
    pub fn filter_for(&self, ctx: &PlaceholderContext<'_>) -> Result<EnforcementFilter, ConnectivityError> {
        Ok(EnforcementFilter {
            input_value: resolve_required(&self.input, ctx)?,
            filters: self.filters.clone(),
        })
    }
}

/// Enforcement bound to the resolved input of one consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementFilter {
    input_value: String,
    filters: Vec<String>,
}

impl EnforcementFilter {
    pub fn new(input_value: impl Into<String>, filters: Vec<String>) -> Self {
        Self {
            input_value: input_value.into(),
            filters,
        }
    }

    pub fn input_value(&self) -> &str {
        &self.input_value
    }

    /// Fails closed: a filter that cannot be resolved never matches.
    pub fn check(&self, entity_id: &EntityId, topic: Option<&TopicPath>) -> Result<(), ConnectivityError> {
        let mut ctx = PlaceholderContext::new().with_entity_id(entity_id);
        if let Some(topic) = topic {
            ctx = ctx.with_topic(topic);
        }
        for filter in &self.filters {
            if let Resolved::Value(v) = resolve_template(filter, &ctx)? {
                if v == self.input_value {
                    return Ok(());
                }
            }
        }
        Err(ConnectivityError::SignalIdEnforcementFailed {
            entity_id: entity_id.to_string(),
            input: self.input_value.clone(),
        })
    }
}
