use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity a signal addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Thing,
    Policy,
    Connection,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Thing => write!(f, "thing"),
            EntityType::Policy => write!(f, "policy"),
            EntityType::Connection => write!(f, "connection"),
        }
    }
}

/// Namespaced entity id (`<namespace>:<name>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityId {
    entity_type: EntityType,
    namespace: String,
    name: String,
}

/// Namespace and name used by signals that address no single entity (search).
pub const PLACEHOLDER_SEGMENT: &str = "_";

impl EntityId {
    pub fn new(entity_type: EntityType, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity_type,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parses `<namespace>:<name>`; the namespace may be empty, the name may contain `:`.
    pub fn parse(entity_type: EntityType, id: &str) -> Option<Self> {
        let (namespace, name) = id.split_once(':')?;
        if name.is_empty() || name.contains('/') || namespace.contains('/') {
            return None;
        }
        Some(Self::new(entity_type, namespace, name))
    }

    pub fn thing(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(EntityType::Thing, namespace, name)
    }

    pub fn policy(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(EntityType::Policy, namespace, name)
    }

    pub fn unknown() -> Self {
        Self::new(EntityType::Thing, PLACEHOLDER_SEGMENT, PLACEHOLDER_SEGMENT)
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_placeholder(&self) -> bool {
        self.namespace == PLACEHOLDER_SEGMENT && self.name == PLACEHOLDER_SEGMENT
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}
