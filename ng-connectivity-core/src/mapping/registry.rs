use dashmap::DashMap;
use ng_connectivity_models::Connection;
use ng_connectivity_sdk::{
    placeholder::evaluate_condition, ConnectivityError, DittoMapperFactory, DittoMessageMapper,
    MapperFactory, MappedJsonMapperFactory, MappingContext, MessageMapper, PayloadMapping,
    PlaceholderContext, DEFAULT_MAPPING_ID,
};
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

/// Mapping engines known to the process, keyed by lowercase engine name.
pub struct MapperFactoryRegistry {
    factories: DashMap<String, Arc<dyn MapperFactory>>,
}

impl Default for MapperFactoryRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl MapperFactoryRegistry {
    pub fn empty() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Registry with the `Ditto` and `MappedJson` engines.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(DittoMapperFactory));
        registry.register(Arc::new(MappedJsonMapperFactory));
        registry
    }

    /// Registers `factory`, replacing any factory of the same engine.
    pub fn register(&self, factory: Arc<dyn MapperFactory>) {
        self.factories.insert(factory.engine().to_ascii_lowercase(), factory);
    }

    pub fn contains(&self, engine: &str) -> bool {
        self.factories.contains_key(&engine.to_ascii_lowercase())
    }

    pub fn create(&self, id: &str, context: &MappingContext) -> Result<Arc<dyn MessageMapper>, ConnectivityError> {
        let factory = self
            .factories
            .get(&context.mapping_engine.to_ascii_lowercase())
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| ConnectivityError::MapperConfigurationInvalid {
                mapper: id.to_string(),
                message: format!("unknown mapping engine '{}'", context.mapping_engine),
            })?;
        factory.create(id, context)
    }
}

/// A mapper together with the guards configured for it.
#[derive(Debug)]
pub struct ConfiguredMapper {
    mapper: Arc<dyn MessageMapper>,
    blocklist: Vec<String>,
    incoming_conditions: Vec<String>,
    outgoing_conditions: Vec<String>,
}

impl ConfiguredMapper {
    pub fn new(mapper: Arc<dyn MessageMapper>, context: Option<&MappingContext>) -> Self {
        let blocklist = context
            .and_then(MappingContext::content_type_blocklist)
            .unwrap_or_else(|| mapper.default_content_type_blocklist());
        let (incoming_conditions, outgoing_conditions) = context
            .map(|c| {
                (
                    c.incoming_conditions.values().cloned().collect(),
                    c.outgoing_conditions.values().cloned().collect(),
                )
            })
            .unwrap_or_default();
        Self {
            mapper,
            blocklist,
            incoming_conditions,
            outgoing_conditions,
        }
    }

    pub fn id(&self) -> &str {
        self.mapper.id()
    }

    pub fn mapper(&self) -> &Arc<dyn MessageMapper> {
        &self.mapper
    }

    pub fn incoming_conditions(&self) -> &[String] {
        &self.incoming_conditions
    }

    pub fn outgoing_conditions(&self) -> &[String] {
        &self.outgoing_conditions
    }

    /// Compares the media type (parameters stripped) case-insensitively.
    pub fn is_blocked(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        self.blocklist.iter().any(|b| b.trim().eq_ignore_ascii_case(media_type))
    }
}

/// Mapper instances of one connection.
///
/// Built once per connection configuration and shared read-only by all mapping workers.
#[derive(Debug)]
pub struct MessageMapperRegistry {
    default: Arc<ConfiguredMapper>,
    mappers: HashMap<String, Arc<ConfiguredMapper>>,
}

impl MessageMapperRegistry {
    /// Instantiates every mapping definition of `connection`.
    ///
    /// Fails on the first unknown engine, invalid option or malformed condition.
    pub fn build(connection: &Connection, factories: &MapperFactoryRegistry) -> Result<Self, ConnectivityError> {
        let mut mappers = HashMap::with_capacity(connection.mapping_definitions.len());
        for (id, context) in &connection.mapping_definitions {
            let empty = PlaceholderContext::new();
            for condition in context
                .incoming_conditions
                .values()
                .chain(context.outgoing_conditions.values())
            {
                evaluate_condition(condition, &empty).map_err(|e| ConnectivityError::MapperConfigurationInvalid {
                    mapper: id.clone(),
                    message: format!("invalid condition '{condition}': {e}"),
                })?;
            }
            let mapper = factories.create(id, context)?;
            mappers.insert(id.clone(), Arc::new(ConfiguredMapper::new(mapper, Some(context))));
        }
        let default = match mappers.get(DEFAULT_MAPPING_ID) {
            Some(configured) => Arc::clone(configured),
            None => Arc::new(ConfiguredMapper::new(
                Arc::new(DittoMessageMapper::new(DEFAULT_MAPPING_ID)),
                None,
            )),
        };
        Ok(Self { default, mappers })
    }

    pub fn default_mapper(&self) -> &Arc<ConfiguredMapper> {
        &self.default
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ConfiguredMapper>> {
        if id == DEFAULT_MAPPING_ID {
            return Some(&self.default);
        }
        self.mappers.get(id)
    }

    /// Mapper chain for a payload mapping, in configured order.
    ///
    /// Falls back to the default mapper when nothing is configured or nothing resolves.
    pub fn resolve(&self, mapping: Option<&PayloadMapping>) -> Vec<Arc<ConfiguredMapper>> {
        let chain: Vec<_> = mapping
            .map(PayloadMapping::ids)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| {
                let mapper = self.get(id).cloned();
                if mapper.is_none() {
                    warn!(mapper = %id, "Payload mapping references an unknown mapper");
                }
                mapper
            })
            .collect();
        if chain.is_empty() {
            vec![Arc::clone(&self.default)]
        } else {
            chain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_connectivity_models::{ConnectionId, ConnectionType};
    use serde_json::json;

    fn connection() -> Connection {
        Connection::new(ConnectionId::new("c"), ConnectionType::Mqtt, "tcp://localhost:1883")
    }

    #[test]
    fn empty_chain_falls_back_to_default() {
        let registry = MessageMapperRegistry::build(&connection(), &MapperFactoryRegistry::with_builtins()).unwrap();
        let chain = registry.resolve(None);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id(), DEFAULT_MAPPING_ID);
        let unknown_only = registry.resolve(Some(&PayloadMapping::new(["missing"])));
        assert_eq!(unknown_only[0].id(), DEFAULT_MAPPING_ID);
    }

    #[test]
    fn chain_keeps_configured_order() {
        let conn = connection()
            .with_mapping_definition("json", MappingContext::new("Ditto"))
            .with_mapping_definition("binary", MappingContext::new("ditto"));
        let registry = MessageMapperRegistry::build(&conn, &MapperFactoryRegistry::with_builtins()).unwrap();
        let ids: Vec<_> = registry
            .resolve(Some(&PayloadMapping::new(["binary", "json"])))
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, ["binary", "json"]);
    }

    #[test]
    fn unknown_engine_and_bad_condition_fail() {
        let unknown = connection().with_mapping_definition("x", MappingContext::new("Nope"));
        assert!(matches!(
            MessageMapperRegistry::build(&unknown, &MapperFactoryRegistry::with_builtins()),
            Err(ConnectivityError::MapperConfigurationInvalid { .. })
        ));
        let bad_condition = connection().with_mapping_definition(
            "x",
            MappingContext::new("Ditto").with_incoming_condition("c", "{{ fn:nope() }}"),
        );
        assert!(MessageMapperRegistry::build(&bad_condition, &MapperFactoryRegistry::with_builtins()).is_err());
    }

    #[test]
    fn blocklist_ignores_parameters_and_case() {
        let conn = connection().with_mapping_definition(
            "binary",
            MappingContext::new("Ditto").with_option("content-type-blocklist", json!("application/json")),
        );
        let registry = MessageMapperRegistry::build(&conn, &MapperFactoryRegistry::with_builtins()).unwrap();
        let binary = registry.get("binary").unwrap();
        assert!(binary.is_blocked(Some("Application/JSON; charset=utf-8")));
        assert!(!binary.is_blocked(Some("text/plain")));
        assert!(!binary.is_blocked(None));
    }
}
