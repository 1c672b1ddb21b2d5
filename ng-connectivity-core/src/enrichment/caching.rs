use super::SignalEnrichmentFacade;
use async_trait::async_trait;
use moka::future::{Cache, CacheBuilder};
use ng_connectivity_models::settings::EnrichmentConfig;
use ng_connectivity_sdk::{ConnectivityError, DittoHeaders, EntityId, Signal};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::trace;

/// Correlation ids are not part of the key; every request for the same view shares an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    entity_id: EntityId,
    field_selector: String,
    subjects: Vec<String>,
}

#[derive(Debug)]
struct CachedEntity {
    value: Value,
    revision: Option<i64>,
}

/// Caches partial entities of a delegate facade.
///
/// An entry is refreshed when the originating event carries a newer revision than the
/// cached view. Failures are never cached.
pub struct CachingSignalEnrichmentFacade {
    delegate: Arc<dyn SignalEnrichmentFacade>,
    cache: Cache<CacheKey, Arc<CachedEntity>>,
}

impl CachingSignalEnrichmentFacade {
    pub fn new(delegate: Arc<dyn SignalEnrichmentFacade>, config: &EnrichmentConfig) -> Self {
        let cache = CacheBuilder::new(config.cache_capacity)
            .time_to_live(Duration::from_millis(config.cache_ttl_ms))
            .build();
        Self { delegate, cache }
    }

    pub async fn invalidate(&self, entity_id: &EntityId) {
        let stale: Vec<_> = self
            .cache
            .iter()
            .filter(|(key, _)| key.entity_id == *entity_id)
            .map(|(key, _)| key)
            .collect();
        for key in stale {
            self.cache.invalidate(&*key).await;
        }
    }
}

fn origin_revision(origin: Option<&Signal>) -> Option<i64> {
    match origin {
        Some(Signal::Event(event)) => event.revision,
        _ => None,
    }
}

#[async_trait]
impl SignalEnrichmentFacade for CachingSignalEnrichmentFacade {
    async fn retrieve_partial_thing(
        &self,
        entity_id: &EntityId,
        field_selector: &str,
        headers: &DittoHeaders,
        origin: Option<&Signal>,
    ) -> Result<Value, ConnectivityError> {
        let key = CacheKey {
            entity_id: entity_id.clone(),
            field_selector: field_selector.to_string(),
            subjects: headers.authorization_context().subjects().to_vec(),
        };
        let wanted = origin_revision(origin);
        if let Some(cached) = self.cache.get(&key).await {
            let fresh = match (wanted, cached.revision) {
                (Some(wanted), Some(have)) => have >= wanted,
                (Some(_), None) => false,
                (None, _) => true,
            };
            if fresh {
                trace!(entity_id = %entity_id, field_selector, "Enrichment cache hit");
                return Ok(cached.value.clone());
            }
        }

        let value = self
            .delegate
            .retrieve_partial_thing(entity_id, field_selector, headers, origin)
            .await?;
        let revision = value.get("_revision").and_then(Value::as_i64).or(wanted);
        self.cache
            .insert(
                key,
                Arc::new(CachedEntity {
                    value: value.clone(),
                    revision,
                }),
            )
            .await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_connectivity_sdk::{Action, AuthorizationContext, Channel, Event};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl SignalEnrichmentFacade for Counting {
        async fn retrieve_partial_thing(
            &self,
            entity_id: &EntityId,
            _: &str,
            _: &DittoHeaders,
            _: Option<&Signal>,
        ) -> Result<Value, ConnectivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectivityError::EnrichmentFailed {
                    entity_id: entity_id.to_string(),
                    message: "backend down".into(),
                });
            }
            Ok(json!({"attributes": {"call": call}}))
        }
    }

    fn headers(correlation_id: &str) -> DittoHeaders {
        DittoHeaders::new()
            .with_correlation_id(correlation_id)
            .with_authorization_context(AuthorizationContext::new(["integration:c"]))
    }

    fn event(revision: i64) -> Signal {
        Signal::Event(Event {
            entity_id: EntityId::thing("org", "lamp"),
            channel: Channel::Twin,
            action: Action::Modified,
            path: "/attributes/on".into(),
            value: Some(json!(true)),
            revision: Some(revision),
            timestamp: None,
            headers: DittoHeaders::new(),
        })
    }

    #[tokio::test]
    async fn correlation_id_does_not_fragment_cache() {
        let delegate = Arc::new(Counting::default());
        let facade = CachingSignalEnrichmentFacade::new(delegate.clone(), &EnrichmentConfig::default());
        let id = EntityId::thing("org", "lamp");
        facade.retrieve_partial_thing(&id, "attributes", &headers("a"), None).await.unwrap();
        facade.retrieve_partial_thing(&id, "attributes", &headers("b"), None).await.unwrap();
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);

        let other_subject = DittoHeaders::new().with_authorization_context(AuthorizationContext::new(["other"]));
        facade.retrieve_partial_thing(&id, "attributes", &other_subject, None).await.unwrap();
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn newer_revision_refreshes_and_failures_are_not_cached() {
        let delegate = Arc::new(Counting::default());
        let facade = CachingSignalEnrichmentFacade::new(delegate.clone(), &EnrichmentConfig::default());
        let id = EntityId::thing("org", "lamp");
        facade
            .retrieve_partial_thing(&id, "attributes", &headers("a"), Some(&event(3)))
            .await
            .unwrap();
        facade
            .retrieve_partial_thing(&id, "attributes", &headers("a"), Some(&event(3)))
            .await
            .unwrap();
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 1);
        facade
            .retrieve_partial_thing(&id, "attributes", &headers("a"), Some(&event(4)))
            .await
            .unwrap();
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 2);

        facade.invalidate(&id).await;
        delegate.fail.store(true, Ordering::SeqCst);
        assert!(facade.retrieve_partial_thing(&id, "attributes", &headers("a"), None).await.is_err());
        assert!(facade.retrieve_partial_thing(&id, "attributes", &headers("a"), None).await.is_err());
        assert_eq!(delegate.calls.load(Ordering::SeqCst), 4);
    }
}
