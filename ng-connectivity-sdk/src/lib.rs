pub mod ack;
pub mod adaptable;
pub mod enforcement;
pub mod entity;
mod error;
pub mod external;
pub mod filter;
pub mod headers;
pub mod mapper;
pub mod placeholder;
pub mod protocol;
pub mod signal;
pub mod topic;

/// Internal re-exports so plugin crates resolve the same versions.
pub mod export {
    pub use serde_json;
    pub use tracing;
}

pub type ConnectivityResult<T> = Result<T, ConnectivityError>;

pub use ack::{Acknowledgement, AcknowledgementLabel, Acknowledgements};
pub use adaptable::Adaptable;
pub use enforcement::{Enforcement, EnforcementFilter};
pub use entity::{EntityId, EntityType};
pub use error::{ConnectivityError, PublishError};
pub use external::{ExternalMessage, MessageSettlement, Payload};
pub use filter::RqlFilter;
pub use headers::{keys as header_keys, AuthorizationContext, DittoHeaders, HeaderMapping};
pub use mapper::{
    ditto::{DittoMapperFactory, DittoMessageMapper, DITTO_ENGINE},
    mapped_json::{MappedJsonMapper, MappedJsonMapperFactory, MAPPED_JSON_ENGINE},
    MapperFactory, MappingContext, MessageMapper, PayloadMapping, DEFAULT_MAPPING_ID,
};
pub use placeholder::{PlaceholderContext, Resolved};
pub use protocol::{DittoProtocolAdapter, ProtocolAdapter};
pub use signal::{
    Command, CommandResponse, ErrorResponse, Event, MessageCommand, SearchCommand, Signal,
};
pub use topic::{Action, Channel, Criterion, Group, TopicPath};
