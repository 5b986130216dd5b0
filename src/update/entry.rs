//! Index entry update value objects
//!
//! An [`IndexEntryUpdate`] is one required mutation of one index for one
//! entity. It is the message type exchanged between the diff engine and
//! every index consumer; it carries no behavior beyond equality and
//! ordering.

use crate::schema::{EntityId, PropertyKeyId, SchemaKey};
use crate::values::ValueTuple;
use thiserror::Error;

/// Update model errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// Asked an add or remove update for its before values
    #[error("before values are only recorded on change updates")]
    NoBeforeValues,

    /// The injected property reader failed to resolve a property
    #[error("failed to load property {key} for entity {entity}: {reason}")]
    PropertyLoad {
        entity: EntityId,
        key: PropertyKeyId,
        reason: String,
    },
}

pub type UpdateResult<T> = Result<T, UpdateError>;

/// The kind of mutation an update describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdateKind {
    Add,
    Remove,
    Change,
}

/// One required mutation to one index for one entity.
///
/// Equality is structural over the logical value tuple: an update built
/// from a single value equals one built from a one-element tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntryUpdate {
    kind: UpdateKind,
    entity: EntityId,
    key: SchemaKey,
    values: ValueTuple,
    /// Present only for change updates
    before: Option<ValueTuple>,
}

impl IndexEntryUpdate {
    /// An entry must be added for `entity` with the given values
    pub fn add(entity: EntityId, key: SchemaKey, values: impl Into<ValueTuple>) -> Self {
        IndexEntryUpdate {
            kind: UpdateKind::Add,
            entity,
            key,
            values: values.into(),
            before: None,
        }
    }

    /// The entry for `entity` with the given values must be removed
    pub fn remove(entity: EntityId, key: SchemaKey, values: impl Into<ValueTuple>) -> Self {
        IndexEntryUpdate {
            kind: UpdateKind::Remove,
            entity,
            key,
            values: values.into(),
            before: None,
        }
    }

    /// The entry for `entity` must change from `before` to `after`
    pub fn change(
        entity: EntityId,
        key: SchemaKey,
        before: impl Into<ValueTuple>,
        after: impl Into<ValueTuple>,
    ) -> Self {
        IndexEntryUpdate {
            kind: UpdateKind::Change,
            entity,
            key,
            values: after.into(),
            before: Some(before.into()),
        }
    }

    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn key(&self) -> &SchemaKey {
        &self.key
    }

    /// The value tuple in property-key order: the after values for add
    /// and change updates, the removed values for remove updates.
    pub fn values(&self) -> &ValueTuple {
        &self.values
    }

    /// The pre-change values. Only change updates carry them.
    pub fn before_values(&self) -> UpdateResult<&ValueTuple> {
        self.before.as_ref().ok_or(UpdateError::NoBeforeValues)
    }
}
