//! In-memory reference index
//!
//! B-Tree backed value-tuple index used by the built-in provider. One
//! sorted map from tuple to entity-id set gives exact and ordered access;
//! the string and existence queries scan. Entity ids always come back in
//! ascending order so results compare deterministically.

use super::conflict::{ConflictError, ConflictResult};
use super::provider::IndexQuery;
use crate::schema::EntityId;
use crate::update::{IndexEntryUpdate, UpdateKind, UpdateResult};
use crate::values::{Value, ValueTuple};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Index contents for one index: value tuple -> set of entity ids
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: BTreeMap<ValueTuple, BTreeSet<EntityId>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        MemoryIndex {
            entries: BTreeMap::new(),
        }
    }

    /// Insert an entry; duplicates coexist, and re-inserting the same
    /// pair is a no-op.
    pub fn insert(&mut self, tuple: ValueTuple, entity: EntityId) {
        self.entries.entry(tuple).or_default().insert(entity);
    }

    /// Insert for a unique index: an equal tuple owned by a different
    /// entity is a conflict.
    pub fn insert_unique(&mut self, tuple: ValueTuple, entity: EntityId) -> ConflictResult<()> {
        if let Some(ids) = self.entries.get(&tuple) {
            if let Some(&existing) = ids.iter().find(|&&id| id != entity) {
                return Err(ConflictError::DuplicateEntry {
                    tuple,
                    existing,
                    added: entity,
                });
            }
        }
        self.insert(tuple, entity);
        Ok(())
    }

    pub fn remove(&mut self, tuple: &ValueTuple, entity: EntityId) {
        if let Some(ids) = self.entries.get_mut(tuple) {
            ids.remove(&entity);
            if ids.is_empty() {
                self.entries.remove(tuple);
            }
        }
    }

    /// Apply one entry update (non-unique path)
    pub fn apply(&mut self, update: &IndexEntryUpdate) -> UpdateResult<()> {
        match update.kind() {
            UpdateKind::Add => self.insert(update.values().clone(), update.entity()),
            UpdateKind::Remove => self.remove(update.values(), update.entity()),
            UpdateKind::Change => {
                let before = update.before_values()?.clone();
                self.remove(&before, update.entity());
                self.insert(update.values().clone(), update.entity());
            }
        }
        Ok(())
    }

    /// Apply one entry update, enforcing uniqueness on insertion
    pub fn apply_unique(&mut self, update: &IndexEntryUpdate) -> ConflictResult<()> {
        match update.kind() {
            UpdateKind::Add => self.insert_unique(update.values().clone(), update.entity())?,
            UpdateKind::Remove => self.remove(update.values(), update.entity()),
            UpdateKind::Change => {
                let before = update.before_values().map_err(ConflictError::from)?.clone();
                self.remove(&before, update.entity());
                self.insert_unique(update.values().clone(), update.entity())?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All (tuple, entity) pairs in tuple order
    pub fn iter(&self) -> impl Iterator<Item = (&ValueTuple, EntityId)> {
        self.entries
            .iter()
            .flat_map(|(tuple, ids)| ids.iter().map(move |&id| (tuple, id)))
    }

    /// Evaluate a query; entity ids in ascending order
    pub fn query(&self, query: &IndexQuery) -> Vec<EntityId> {
        let mut result = BTreeSet::new();
        match query {
            IndexQuery::Exact(tuple) => {
                if let Some(ids) = self.entries.get(tuple) {
                    result.extend(ids.iter().copied());
                }
            }
            IndexQuery::Range { from, to } => {
                for (tuple, ids) in &self.entries {
                    if let Some(first) = tuple.first() {
                        if within(first, from, to) {
                            result.extend(ids.iter().copied());
                        }
                    }
                }
            }
            IndexQuery::Prefix(prefix) => {
                self.collect_text(&mut result, |s| s.starts_with(prefix.as_str()));
            }
            IndexQuery::Suffix(suffix) => {
                self.collect_text(&mut result, |s| s.ends_with(suffix.as_str()));
            }
            IndexQuery::Contains(needle) => {
                self.collect_text(&mut result, |s| s.contains(needle.as_str()));
            }
            IndexQuery::Exists => {
                for (tuple, ids) in &self.entries {
                    if tuple.is_occupied() {
                        result.extend(ids.iter().copied());
                    }
                }
            }
        }
        result.into_iter().collect()
    }

    fn collect_text(&self, result: &mut BTreeSet<EntityId>, matches: impl Fn(&str) -> bool) {
        for (tuple, ids) in &self.entries {
            if let Some(Value::Text(s)) = tuple.first() {
                if matches(s) {
                    result.extend(ids.iter().copied());
                }
            }
        }
    }
}

fn within(value: &Value, from: &Bound<Value>, to: &Bound<Value>) -> bool {
    let lower_ok = match from {
        Bound::Included(low) => value >= low,
        Bound::Excluded(low) => value > low,
        Bound::Unbounded => true,
    };
    let upper_ok = match to {
        Bound::Included(high) => value <= high,
        Bound::Excluded(high) => value < high,
        Bound::Unbounded => true,
    };
    lower_ok && upper_ok && !value.is_null()
}
