use crate::entity::EntityType;
use thiserror::Error;

/// Typed, client-visible errors of the connectivity layer.
///
/// Every variant carries a stable error code and an HTTP-like status so that it can be
/// published back to the party that caused it as an error response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectivityError {
    /// The physical connection could not be established or broke down.
    #[error("Connection '{connection_id}' failed: {message}")]
    ConnectionFailed {
        connection_id: String,
        message: String,
        description: Option<String>,
    },

    /// The client actor of the connection is currently not running.
    #[error("The connection '{connection_id}' is currently not available")]
    ConnectionUnavailable { connection_id: String },

    /// No connection with this id exists (or it was deleted).
    #[error("The connection '{connection_id}' could not be found")]
    ConnectionNotAccessible { connection_id: String },

    /// The connection definition is not valid.
    #[error("The connection configuration is invalid: {message}")]
    ConnectionConfigurationInvalid { message: String },

    /// A command arrived while a connect/disconnect/test attempt was in flight.
    #[error("The operation '{operation}' is not allowed while connection '{connection_id}' is {state}")]
    OperationNotAllowedDuringTransition {
        connection_id: String,
        operation: String,
        state: String,
    },

    /// A command that has no meaning in the current stable state.
    #[error("The operation '{operation}' is illegal for connection '{connection_id}' in state {state}")]
    IllegalForState {
        connection_id: String,
        operation: String,
        state: String,
    },

    /// A mapper or the protocol conversion failed on a message.
    #[error("The message could not be mapped: {message}")]
    MappingFailed {
        message: String,
        description: Option<String>,
    },

    /// Mapper options are invalid or the mapping engine is unknown.
    #[error("The configuration of mapper '{mapper}' is invalid: {message}")]
    MapperConfigurationInvalid { mapper: String, message: String },

    /// The headers produced by mapping are too large.
    #[error("The headers are too large: {size} bytes exceed the maximum of {max} bytes")]
    HeaderSizeExceeded { size: usize, max: usize },

    /// Signal id enforcement rejected the message.
    #[error("The entity id '{entity_id}' does not match the enforced input '{input}'")]
    SignalIdEnforcementFailed { entity_id: String, input: String },

    /// A requested or issued ack label was not declared by the source.
    #[error("The acknowledgement label '{label}' is not declared; declared labels: {declared:?}")]
    AcknowledgementLabelNotDeclared {
        label: String,
        declared: Vec<String>,
    },

    #[error("The acknowledgement label '{label}' is invalid")]
    AcknowledgementLabelInvalid { label: String },

    /// A placeholder in a template could not be resolved.
    #[error("The placeholder '{placeholder}' could not be resolved")]
    UnresolvedPlaceholder { placeholder: String },

    #[error("The placeholder expression '{expression}' is invalid: {reason}")]
    PlaceholderInvalid { expression: String, reason: String },

    #[error("The filter '{filter}' is invalid: {reason}")]
    FilterInvalid { filter: String, reason: String },

    /// A payload is not valid for the protocol adapter.
    #[error("The protocol message is invalid: {message}")]
    ProtocolConversionFailed { message: String },

    /// The entity does not exist or is not visible to the caller.
    #[error("The {entity_type} with id '{entity_id}' could not be found or is not accessible")]
    EntityNotAccessible {
        entity_id: String,
        entity_type: EntityType,
    },

    /// Retrieving extra fields for an outbound signal failed.
    #[error("Retrieving extra fields of '{entity_id}' failed: {message}")]
    EnrichmentFailed { entity_id: String, message: String },

    /// A command or its acknowledgements did not complete in time.
    #[error("The command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    /// Publishing to a target failed.
    #[error("Sending the message to '{address}' failed: {message}")]
    PublishFailed { address: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Error response received from a device or another service.
    #[error("{error_code}: {message}")]
    Remote {
        error_code: String,
        status: u16,
        message: String,
        description: Option<String>,
    },
}

impl ConnectivityError {
    /// Stable error code as seen by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::ConnectionFailed { .. } => "connectivity:connection.failed",
            Self::ConnectionUnavailable { .. } => "connectivity:connection.unavailable",
            Self::ConnectionNotAccessible { .. } => "connectivity:connection.notfound",
            Self::ConnectionConfigurationInvalid { .. } => "connectivity:connection.configuration.invalid",
            Self::OperationNotAllowedDuringTransition { .. } | Self::IllegalForState { .. } => {
                "connectivity:connection.signal.illegal"
            }
            Self::MappingFailed { .. } => "connectivity:message.mapping.failed",
            Self::MapperConfigurationInvalid { .. } => "connectivity:message.mapper.config.invalid",
            Self::HeaderSizeExceeded { .. } => "headers:headers.too.large",
            Self::SignalIdEnforcementFailed { .. } => "connectivity:connection.id.enforcement.failed",
            Self::AcknowledgementLabelNotDeclared { .. } => "acknowledgement:label.not.declared",
            Self::AcknowledgementLabelInvalid { .. } => "acknowledgement:label.invalid",
            Self::UnresolvedPlaceholder { .. } => "placeholder:placeholder.unresolved",
            Self::PlaceholderInvalid { .. } => "placeholder:placeholder.invalid",
            Self::FilterInvalid { .. } => "rql.expression.invalid",
            Self::ProtocolConversionFailed { .. } => "connectivity:message.format.invalid",
            Self::EntityNotAccessible { entity_type, .. } => match entity_type {
                EntityType::Thing => "things:thing.notfound",
                EntityType::Policy => "policies:policy.notfound",
                EntityType::Connection => "connectivity:connection.notfound",
            },
            Self::EnrichmentFailed { .. } => "connectivity:signal.enrichment.failed",
            Self::CommandTimeout { .. } => "command.timeout",
            Self::PublishFailed { .. } => "connectivity:message.sending.failed",
            Self::Internal { .. } => "internal.error",
            Self::Remote { error_code, .. } => error_code.as_str(),
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::ConnectionFailed { .. } => 502,
            Self::ConnectionUnavailable { .. } | Self::PublishFailed { .. } => 503,
            Self::ConnectionNotAccessible { .. } | Self::EntityNotAccessible { .. } => 404,
            Self::OperationNotAllowedDuringTransition { .. } | Self::IllegalForState { .. } => 409,
            Self::HeaderSizeExceeded { .. } => 431,
            Self::CommandTimeout { .. } => 408,
            Self::EnrichmentFailed { .. } | Self::Internal { .. } => 500,
            Self::Remote { status, .. } => *status,
            Self::ConnectionConfigurationInvalid { .. }
            | Self::MappingFailed { .. }
            | Self::MapperConfigurationInvalid { .. }
            | Self::SignalIdEnforcementFailed { .. }
            | Self::AcknowledgementLabelNotDeclared { .. }
            | Self::AcknowledgementLabelInvalid { .. }
            | Self::UnresolvedPlaceholder { .. }
            | Self::PlaceholderInvalid { .. }
            | Self::FilterInvalid { .. }
            | Self::ProtocolConversionFailed { .. } => 400,
        }
    }

    pub fn description(&self) -> Option<String> {
        match self {
            Self::ConnectionFailed { description, .. }
            | Self::MappingFailed { description, .. }
            | Self::Remote { description, .. } => description.clone(),
            Self::ConnectionUnavailable { .. } => {
                Some("The connection is being restarted, please retry later.".to_string())
            }
            Self::OperationNotAllowedDuringTransition { .. } => {
                Some("Wait until the current connect or disconnect attempt finished.".to_string())
            }
            Self::HeaderSizeExceeded { .. } => {
                Some("Reduce the number or size of mapped headers.".to_string())
            }
            Self::AcknowledgementLabelNotDeclared { .. } => Some(
                "Declare the label on the source or prefix it with the connection id.".to_string(),
            ),
            _ => None,
        }
    }

    /// Entity type the error is about, if the error declares one.
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            Self::EntityNotAccessible { entity_type, .. } => Some(*entity_type),
            Self::SignalIdEnforcementFailed { .. } | Self::EnrichmentFailed { .. } => {
                Some(EntityType::Thing)
            }
            Self::ConnectionFailed { .. }
            | Self::ConnectionUnavailable { .. }
            | Self::ConnectionNotAccessible { .. }
            | Self::OperationNotAllowedDuringTransition { .. }
            | Self::IllegalForState { .. } => Some(EntityType::Connection),
            _ => None,
        }
    }

    pub fn mapping_failed(message: impl Into<String>) -> Self {
        Self::MappingFailed {
            message: message.into(),
            description: None,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolConversionFailed {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ConnectivityError {
    fn from(err: serde_json::Error) -> Self {
        ConnectivityError::ProtocolConversionFailed {
            message: err.to_string(),
        }
    }
}

/// Failure of a physical publish.
///
/// Connectors may wrap failures into `Completion` layers; consumers unwrap them with
/// [`PublishError::root_cause`] before classifying.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("completion failed: {0}")]
    Completion(#[source] Box<PublishError>),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error("{kind}: {message}")]
    Other { kind: String, message: String },
}

impl PublishError {
    pub fn other(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Other {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn root_cause(&self) -> &PublishError {
        let mut current = self;
        while let PublishError::Completion(inner) = current {
            current = inner;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_completions() {
        let err = PublishError::Completion(Box::new(PublishError::Completion(Box::new(
            PublishError::other("IoError", "broken pipe"),
        ))));
        match err.root_cause() {
            PublishError::Other { kind, message } => {
                assert_eq!(kind, "IoError");
                assert_eq!(message, "broken pipe");
            }
            other => panic!("unexpected root cause {other:?}"),
        }
    }

    #[test]
    fn not_found_code_follows_entity_type() {
        let thing = ConnectivityError::EntityNotAccessible {
            entity_id: "org:t".into(),
            entity_type: EntityType::Thing,
        };
        let policy = ConnectivityError::EntityNotAccessible {
            entity_id: "org:p".into(),
            entity_type: EntityType::Policy,
        };
        assert_eq!(thing.error_code(), "things:thing.notfound");
        assert_eq!(policy.error_code(), "policies:policy.notfound");
        assert_eq!(thing.status(), 404);
    }
}
