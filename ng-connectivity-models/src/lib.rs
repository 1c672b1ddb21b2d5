pub mod connection;
pub mod event;
pub mod settings;

pub use connection::{
    Connection, ConnectionId, ConnectionLifecycle, ConnectionType, ConnectivityStatus, Endpoint,
    FilteredTopic, ReplyTarget, ResponseType, Source, Target, TopicKind,
};
pub use event::{apply_event, ConnectionEvent};
pub use settings::Settings;
