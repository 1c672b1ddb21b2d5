//! Retrieval of extra fields for outbound signals.

mod caching;

pub use caching::CachingSignalEnrichmentFacade;

use async_trait::async_trait;
use ng_connectivity_sdk::{ConnectivityError, DittoHeaders, EntityId, Signal};
use serde_json::Value;

/// Looks up a partial view of an entity on behalf of the signal's subjects.
///
/// Fails with `EntityNotAccessible` when the entity was deleted or is not visible.
#[async_trait]
pub trait SignalEnrichmentFacade: Send + Sync {
    async fn retrieve_partial_thing(
        &self,
        entity_id: &EntityId,
        field_selector: &str,
        headers: &DittoHeaders,
        origin: Option<&Signal>,
    ) -> Result<Value, ConnectivityError>;
}
