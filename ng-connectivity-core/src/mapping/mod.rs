//! Mapping engine: mapper registry, inbound/outbound processors and the outcome protocol.

mod outcome;
mod processor;
mod registry;

pub use outcome::{MappingOutcome, OutcomeVisitor};
pub use processor::{InboundMappingProcessor, OutboundMappingProcessor, OutboundSignal};
pub use registry::{ConfiguredMapper, MapperFactoryRegistry, MessageMapperRegistry};

use ng_connectivity_sdk::ConnectivityError;
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
};

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs plugin code, turning a panic into a mapping failure.
pub(crate) fn guarded<R>(f: impl FnOnce() -> Result<R, ConnectivityError>) -> Result<R, ConnectivityError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        Err(ConnectivityError::MappingFailed {
            message: format!("mapper panicked: {}", panic_message(panic)),
            description: None,
        })
    })
}
