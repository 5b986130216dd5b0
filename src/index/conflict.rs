//! Uniqueness conflict detection
//!
//! A unique index never surfaces two entities with the same value tuple.
//! During population the check is deferred: candidates accumulate freely
//! and [`ConflictDetector::verify_deferred`] makes a second pass,
//! resolving each candidate's current values through a property reader.
//! Online, a transaction's adds are checked against each other with
//! [`detect_in_transaction`]. Non-unique indexes never come near this
//! module.

use crate::schema::{EntityId, PropertyKeyId};
use crate::update::{PropertyReader, UpdateError};
use crate::values::{Value, ValueTuple};
use std::collections::BTreeMap;
use thiserror::Error;

/// Uniqueness violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// Two committed entities share the same indexed values
    #[error("both entity {existing} and entity {added} carry the indexed values {tuple}")]
    DuplicateEntry {
        tuple: ValueTuple,
        existing: EntityId,
        added: EntityId,
    },

    /// Several entities were given the same unique value in one batch
    #[error("entities {ids:?} were all given the indexed values {tuple} in the same transaction")]
    DuplicateInTransaction {
        tuple: ValueTuple,
        ids: Vec<EntityId>,
    },

    /// Resolving a candidate's current values failed
    #[error(transparent)]
    Load(#[from] UpdateError),
}

pub type ConflictResult<T> = Result<T, ConflictError>;

/// Deferred conflict detector for one unique index population
#[derive(Debug)]
pub struct ConflictDetector {
    properties: Vec<PropertyKeyId>,
    candidates: Vec<EntityId>,
}

impl ConflictDetector {
    pub fn new(properties: Vec<PropertyKeyId>) -> Self {
        ConflictDetector {
            properties,
            candidates: Vec::new(),
        }
    }

    /// Record a candidate entity; duplicates are accepted here and only
    /// rejected by the verification pass.
    pub fn record(&mut self, entity: EntityId) {
        self.candidates.push(entity);
    }

    /// Second pass over all candidates. Resolves each entity's current
    /// values through `properties` and fails on the first tuple owned by
    /// two different entities. Entities that no longer carry all indexed
    /// properties are skipped.
    pub fn verify_deferred(&self, properties: &dyn PropertyReader) -> ConflictResult<()> {
        let mut seen: BTreeMap<ValueTuple, EntityId> = BTreeMap::new();
        for &entity in &self.candidates {
            let Some(tuple) = self.current_tuple(entity, properties)? else {
                continue;
            };
            match seen.get(&tuple) {
                Some(&existing) if existing != entity => {
                    return Err(ConflictError::DuplicateEntry {
                        tuple,
                        existing,
                        added: entity,
                    });
                }
                Some(_) => {}
                None => {
                    seen.insert(tuple, entity);
                }
            }
        }
        Ok(())
    }

    fn current_tuple(
        &self,
        entity: EntityId,
        properties: &dyn PropertyReader,
    ) -> ConflictResult<Option<ValueTuple>> {
        let mut values: Vec<Value> = Vec::with_capacity(self.properties.len());
        for &key in &self.properties {
            match properties.load_property(entity, key)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(ValueTuple::new(values)))
    }
}

/// Check a single transaction's adds against each other. A tuple claimed
/// by more than one entity reports the full conflicting id set.
pub fn detect_in_transaction<'a>(
    adds: impl IntoIterator<Item = (&'a ValueTuple, EntityId)>,
) -> ConflictResult<()> {
    let mut by_tuple: BTreeMap<&ValueTuple, Vec<EntityId>> = BTreeMap::new();
    for (tuple, entity) in adds {
        let ids = by_tuple.entry(tuple).or_default();
        if !ids.contains(&entity) {
            ids.push(entity);
        }
    }
    for (tuple, mut ids) in by_tuple {
        if ids.len() > 1 {
            ids.sort();
            return Err(ConflictError::DuplicateInTransaction {
                tuple: tuple.clone(),
                ids,
            });
        }
    }
    Ok(())
}
