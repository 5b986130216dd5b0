//! Schema identifiers for index targets
//!
//! A [`SchemaKey`] names what an index covers: the entity kind, the tokens
//! (labels or a relationship type) and the property keys. The two variants
//! carry different matching semantics, which the diff engine dispatches on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an entity (node or relationship)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId(id)
    }
}

/// Identifier of a token: a label for nodes, a type for relationships
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub u32);

impl TokenId {
    pub fn new(id: u32) -> Self {
        TokenId(id)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.0)
    }
}

/// Identifier of a property key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyKeyId(pub u32);

impl PropertyKeyId {
    pub fn new(id: u32) -> Self {
        PropertyKeyId(id)
    }
}

impl fmt::Display for PropertyKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyKeyId({})", self.0)
    }
}

/// Identifier of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u64);

impl IndexId {
    pub fn new(id: u64) -> Self {
        IndexId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexId({})", self.0)
    }
}

/// The kind of entity an index covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Node,
    Relationship,
}

/// What an index is keyed on. Immutable once constructed.
///
/// - `Composite`: all tokens must be present on the entity and all
///   property keys must have a value, in the listed order.
/// - `AnyOf`: the entity matches with any one token from the set, and the
///   tuple carries whichever of the property keys are present,
///   positionally, with null placeholders for the rest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SchemaKey {
    Composite {
        entity: EntityKind,
        tokens: Vec<TokenId>,
        properties: Vec<PropertyKeyId>,
    },
    AnyOf {
        entity: EntityKind,
        tokens: Vec<TokenId>,
        properties: Vec<PropertyKeyId>,
    },
}

impl SchemaKey {
    /// Composite key for a node label index
    pub fn for_label(token: TokenId, properties: Vec<PropertyKeyId>) -> Self {
        SchemaKey::Composite {
            entity: EntityKind::Node,
            tokens: vec![token],
            properties,
        }
    }

    /// Composite key for a relationship type index
    pub fn for_relationship_type(token: TokenId, properties: Vec<PropertyKeyId>) -> Self {
        SchemaKey::Composite {
            entity: EntityKind::Relationship,
            tokens: vec![token],
            properties,
        }
    }

    /// Composite key over an explicit token set
    pub fn composite(entity: EntityKind, tokens: Vec<TokenId>, properties: Vec<PropertyKeyId>) -> Self {
        SchemaKey::Composite {
            entity,
            tokens,
            properties,
        }
    }

    /// Fulltext-like key matching any one token and any one property
    pub fn any_of(entity: EntityKind, tokens: Vec<TokenId>, properties: Vec<PropertyKeyId>) -> Self {
        SchemaKey::AnyOf {
            entity,
            tokens,
            properties,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            SchemaKey::Composite { entity, .. } | SchemaKey::AnyOf { entity, .. } => *entity,
        }
    }

    pub fn tokens(&self) -> &[TokenId] {
        match self {
            SchemaKey::Composite { tokens, .. } | SchemaKey::AnyOf { tokens, .. } => tokens,
        }
    }

    /// Property keys in schema order
    pub fn properties(&self) -> &[PropertyKeyId] {
        match self {
            SchemaKey::Composite { properties, .. } | SchemaKey::AnyOf { properties, .. } => {
                properties
            }
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, SchemaKey::Composite { .. })
    }

    /// Token membership test: all tokens for composite keys, any one
    /// token for any-of keys.
    pub fn matches_tokens(&self, entity_tokens: &[TokenId]) -> bool {
        match self {
            SchemaKey::Composite { tokens, .. } => {
                tokens.iter().all(|t| entity_tokens.contains(t))
            }
            SchemaKey::AnyOf { tokens, .. } => tokens.iter().any(|t| entity_tokens.contains(t)),
        }
    }

    /// True if the key indexes the given property
    pub fn has_property(&self, property: PropertyKeyId) -> bool {
        self.properties().contains(&property)
    }
}
