//! Entity update diff engine
//!
//! [`EntityUpdates`] is the frozen mutation record for one entity in one
//! transaction: token membership before and after, plus a map of property
//! changes. [`EntityUpdates::updates_for_keys`] diffs it against a set of
//! schema keys and produces exactly the index entry updates required,
//! loading missing properties through the injected [`PropertyReader`].
//!
//! The no-load rule is a hard contract: a key whose token membership rules
//! it out, or whose properties are untouched while membership is
//! unchanged, must never trigger a property load. Tests verify this with
//! a reader that panics on any call.

use super::entry::{IndexEntryUpdate, UpdateResult};
use crate::schema::{EntityId, PropertyKeyId, SchemaKey, TokenId};
use crate::values::{Value, ValueTuple};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

/// Lazy access to an entity's stored properties, used to fill in values
/// the transaction did not touch.
pub trait PropertyReader {
    /// Resolve the current stored value of a property, or `None` if the
    /// entity has no such property. Unknown property keys are absent.
    fn load_property(&self, entity: EntityId, key: PropertyKeyId) -> UpdateResult<Option<Value>>;
}

/// How one property changed within the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
enum PropertyChange {
    /// Untouched, value known from the caller's snapshot
    Existing(Value),
    Added(Value),
    Removed(Value),
    Changed { before: Value, after: Value },
}

impl PropertyChange {
    fn before(&self) -> Option<&Value> {
        match self {
            PropertyChange::Existing(v) | PropertyChange::Removed(v) => Some(v),
            PropertyChange::Changed { before, .. } => Some(before),
            PropertyChange::Added(_) => None,
        }
    }

    fn after(&self) -> Option<&Value> {
        match self {
            PropertyChange::Existing(v) | PropertyChange::Added(v) => Some(v),
            PropertyChange::Changed { after, .. } => Some(after),
            PropertyChange::Removed(_) => None,
        }
    }

    fn is_mutation(&self) -> bool {
        !matches!(self, PropertyChange::Existing(_))
    }
}

/// Builder for [`EntityUpdates`]; accumulate then freeze with `build()`.
#[derive(Debug)]
pub struct EntityUpdatesBuilder {
    entity: EntityId,
    tokens_before: Vec<TokenId>,
    tokens_after: Option<Vec<TokenId>>,
    properties: IndexMap<PropertyKeyId, PropertyChange>,
}

impl EntityUpdatesBuilder {
    /// Tokens the entity carried before the transaction. Unless
    /// `with_tokens_after` is also called, membership is unchanged.
    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = TokenId>) -> Self {
        self.tokens_before = tokens.into_iter().collect();
        self
    }

    /// Tokens the entity carries after the transaction
    pub fn with_tokens_after(mut self, tokens: impl IntoIterator<Item = TokenId>) -> Self {
        self.tokens_after = Some(tokens.into_iter().collect());
        self
    }

    /// Record a property the transaction did not touch
    pub fn existing(mut self, key: PropertyKeyId, value: impl Into<Value>) -> Self {
        self.properties
            .insert(key, PropertyChange::Existing(value.into()));
        self
    }

    /// Record a property added by the transaction
    pub fn added(mut self, key: PropertyKeyId, value: impl Into<Value>) -> Self {
        self.properties
            .insert(key, PropertyChange::Added(value.into()));
        self
    }

    /// Record a property removed by the transaction
    pub fn removed(mut self, key: PropertyKeyId, value: impl Into<Value>) -> Self {
        self.properties
            .insert(key, PropertyChange::Removed(value.into()));
        self
    }

    /// Record a property whose value the transaction changed
    pub fn changed(
        mut self,
        key: PropertyKeyId,
        before: impl Into<Value>,
        after: impl Into<Value>,
    ) -> Self {
        self.properties.insert(
            key,
            PropertyChange::Changed {
                before: before.into(),
                after: after.into(),
            },
        );
        self
    }

    /// Freeze into an immutable mutation record
    pub fn build(self) -> EntityUpdates {
        let tokens_after = self.tokens_after.unwrap_or_else(|| self.tokens_before.clone());
        EntityUpdates {
            entity: self.entity,
            tokens_before: self.tokens_before,
            tokens_after,
            properties: self.properties,
        }
    }
}

/// The frozen mutation record for one entity, consumed once by the diff
/// engine and then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityUpdates {
    entity: EntityId,
    tokens_before: Vec<TokenId>,
    tokens_after: Vec<TokenId>,
    properties: IndexMap<PropertyKeyId, PropertyChange>,
}

impl EntityUpdates {
    pub fn for_entity(entity: EntityId) -> EntityUpdatesBuilder {
        EntityUpdatesBuilder {
            entity,
            tokens_before: Vec::new(),
            tokens_after: None,
            properties: IndexMap::new(),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Diff this mutation record against `keys`, producing the minimal
    /// set of index entry updates. Properties the record does not mention
    /// are loaded through `reader` at most once across the whole call,
    /// and never for a key the record cannot affect.
    pub fn updates_for_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a SchemaKey>,
        reader: &dyn PropertyReader,
    ) -> UpdateResult<Vec<IndexEntryUpdate>> {
        let mut loaded: FxHashMap<PropertyKeyId, Option<Value>> = FxHashMap::default();
        let mut updates = Vec::new();
        for key in keys {
            if let Some(update) = self.diff_key(key, reader, &mut loaded)? {
                updates.push(update);
            }
        }
        Ok(updates)
    }

    fn diff_key(
        &self,
        key: &SchemaKey,
        reader: &dyn PropertyReader,
        loaded: &mut FxHashMap<PropertyKeyId, Option<Value>>,
    ) -> UpdateResult<Option<IndexEntryUpdate>> {
        let before_match = key.matches_tokens(&self.tokens_before);
        let after_match = key.matches_tokens(&self.tokens_after);

        // Irrelevant key: no update, and crucially no property load
        if !before_match && !after_match {
            return Ok(None);
        }
        if before_match && after_match && !self.touches(key) {
            return Ok(None);
        }

        if key.is_composite() {
            self.diff_composite(key, before_match, after_match, reader, loaded)
        } else {
            self.diff_any_of(key, before_match, after_match, reader, loaded)
        }
    }

    /// Composite keys require every property present; a tuple with a hole
    /// never reaches the index.
    fn diff_composite(
        &self,
        key: &SchemaKey,
        before_match: bool,
        after_match: bool,
        reader: &dyn PropertyReader,
        loaded: &mut FxHashMap<PropertyKeyId, Option<Value>>,
    ) -> UpdateResult<Option<IndexEntryUpdate>> {
        let before = if before_match {
            self.complete_tuple(key, Side::Before, reader, loaded)?
        } else {
            None
        };
        let after = if after_match {
            self.complete_tuple(key, Side::After, reader, loaded)?
        } else {
            None
        };

        Ok(match (before, after) {
            (Some(b), Some(a)) => Some(IndexEntryUpdate::change(self.entity, key.clone(), b, a)),
            (Some(b), None) => Some(IndexEntryUpdate::remove(self.entity, key.clone(), b)),
            (None, Some(a)) => Some(IndexEntryUpdate::add(self.entity, key.clone(), a)),
            (None, None) => None,
        })
    }

    /// Any-of keys carry partial tuples positionally; a tuple with no
    /// real value at all means the entity leaves (or never enters) the
    /// index.
    fn diff_any_of(
        &self,
        key: &SchemaKey,
        before_match: bool,
        after_match: bool,
        reader: &dyn PropertyReader,
        loaded: &mut FxHashMap<PropertyKeyId, Option<Value>>,
    ) -> UpdateResult<Option<IndexEntryUpdate>> {
        let before = if before_match {
            Some(self.partial_tuple(key, Side::Before, reader, loaded)?)
        } else {
            None
        };
        let after = if after_match {
            Some(self.partial_tuple(key, Side::After, reader, loaded)?)
        } else {
            None
        };

        Ok(match (before, after) {
            (None, Some(a)) if a.is_occupied() => {
                Some(IndexEntryUpdate::add(self.entity, key.clone(), a))
            }
            (Some(b), None) if b.is_occupied() => {
                Some(IndexEntryUpdate::remove(self.entity, key.clone(), b))
            }
            (Some(b), Some(a)) => {
                if !a.is_occupied() && b.is_occupied() {
                    // Removing the last surviving property removes the
                    // whole composite-with-nulls tuple
                    Some(IndexEntryUpdate::remove(self.entity, key.clone(), b))
                } else if !b.is_occupied() && a.is_occupied() {
                    Some(IndexEntryUpdate::add(self.entity, key.clone(), a))
                } else if b.is_occupied() && a.is_occupied() {
                    Some(IndexEntryUpdate::change(self.entity, key.clone(), b, a))
                } else {
                    None
                }
            }
            _ => None,
        })
    }

    /// True if any of the key's properties was actually mutated
    fn touches(&self, key: &SchemaKey) -> bool {
        key.properties()
            .iter()
            .any(|p| self.properties.get(p).is_some_and(|c| c.is_mutation()))
    }

    /// All-or-nothing tuple for composite keys
    fn complete_tuple(
        &self,
        key: &SchemaKey,
        side: Side,
        reader: &dyn PropertyReader,
        loaded: &mut FxHashMap<PropertyKeyId, Option<Value>>,
    ) -> UpdateResult<Option<ValueTuple>> {
        let mut values = Vec::with_capacity(key.properties().len());
        for &property in key.properties() {
            match self.value_for(property, side, reader, loaded)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(ValueTuple::new(values)))
    }

    /// Positional tuple for any-of keys, nulls in absent slots
    fn partial_tuple(
        &self,
        key: &SchemaKey,
        side: Side,
        reader: &dyn PropertyReader,
        loaded: &mut FxHashMap<PropertyKeyId, Option<Value>>,
    ) -> UpdateResult<ValueTuple> {
        let mut values = Vec::with_capacity(key.properties().len());
        for &property in key.properties() {
            values.push(
                self.value_for(property, side, reader, loaded)?
                    .unwrap_or(Value::Null),
            );
        }
        Ok(ValueTuple::new(values))
    }

    fn value_for(
        &self,
        property: PropertyKeyId,
        side: Side,
        reader: &dyn PropertyReader,
        loaded: &mut FxHashMap<PropertyKeyId, Option<Value>>,
    ) -> UpdateResult<Option<Value>> {
        if let Some(change) = self.properties.get(&property) {
            let value = match side {
                Side::Before => change.before(),
                Side::After => change.after(),
            };
            return Ok(value.cloned());
        }
        if let Some(cached) = loaded.get(&property) {
            return Ok(cached.clone());
        }
        let value = reader.load_property(self.entity, property)?;
        loaded.insert(property, value.clone());
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Before,
    After,
}
