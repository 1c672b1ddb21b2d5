//! Connection runtime of the connectivity gateway.
//!
//! - `client`: per-client lifecycle actor and the connector contract it drives
//! - `supervisor`: restart with exponential backoff
//! - `manager`: hosts connections, journals their lifecycle, routes outbound signals
//! - `mapping`, `inbound`, `outbound`: the message mapping pipeline
//! - `ack`: acknowledgement aggregation and response collection
//! - `enrichment`: extra-field retrieval with caching

pub mod ack;
pub mod client;
pub mod enrichment;
pub mod forwarder;
pub mod inbound;
pub mod journal;
pub mod logs;
pub mod manager;
pub mod mapping;
pub mod metrics;
pub mod outbound;
pub mod pool;
pub mod supervisor;

pub use ack::{AggregatedAcknowledgements, CollectorOutput, ResponseCollector};
pub use client::{
    ClientCommand, ClientConnector, ClientContext, ClientState, ClientStatus, CommandFailure, ConnectorEvent,
    ConnectorFactory, ConnectorRegistry, InboundSink,
};
pub use enrichment::SignalEnrichmentFacade;
pub use forwarder::SignalForwarder;
pub use journal::{ConnectionJournal, InMemoryConnectionJournal};
pub use manager::{ConnectionManager, ConnectionStatus};
pub use mapping::MapperFactoryRegistry;
