//! Client side of a connection: connector contract, lifecycle actor and its state.

mod actor;
mod connector;
mod reachability;
mod state;

pub use actor::{run_connection_test, ClientActor, ClientCommand, ClientContext, ClientExit, ClientMode};
pub use connector::{
    ClientConnector, ConnectorEvent, ConnectorEvents, ConnectorFactory, ConnectorRegistry, EpochEvent, InboundSink,
};
pub use reachability::check_socket;
pub use state::{BaseClientData, ClientState, ClientStatus, CommandFailure, CommandResult};
