//! Index update model and diff engine
//!
//! Turns an entity mutation (token and property changes) into the exact
//! set of index entry updates needed to keep a collection of indexes
//! consistent, loading at most the properties it actually needs.

pub mod entity;
pub mod entry;

pub use entity::{EntityUpdates, EntityUpdatesBuilder, PropertyReader};
pub use entry::{IndexEntryUpdate, UpdateError, UpdateKind, UpdateResult};
