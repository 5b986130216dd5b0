//! Trellis Index
//!
//! The indexing subsystem of a property graph store: schema-driven value
//! indexes over nodes and relationships, with deterministic diffing of
//! entity changes into index entry updates, durable population state,
//! uniqueness enforcement and a bounded cache of open index resources.
//!
//! # Example
//!
//! ```
//! use trellis_index::index::{IndexQuery, MemoryIndex};
//! use trellis_index::schema::{EntityId, PropertyKeyId, SchemaKey, TokenId};
//! use trellis_index::update::IndexEntryUpdate;
//! use trellis_index::values::Value;
//!
//! let key = SchemaKey::for_label(TokenId(0), vec![PropertyKeyId(7)]);
//! let mut index = MemoryIndex::new();
//! index
//!     .apply(&IndexEntryUpdate::add(
//!         EntityId(1),
//!         key,
//!         Value::Text("alice".into()),
//!     ))
//!     .unwrap();
//!
//! let hits = index.query(&IndexQuery::Exact(Value::Text("alice".into()).into()));
//! assert_eq!(hits, vec![EntityId(1)]);
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod index;
pub mod schema;
pub mod state;
pub mod update;
pub mod values;

// Re-export main types for convenience
pub use index::{
    ConflictDetector, ConflictError, DirectoryLayout, HandleCache, IndexDescriptor, IndexError,
    IndexLifecycle, IndexProvider, IndexQuery, IndexResult, MemoryIndexProvider, PopulationState,
    ProviderDescriptor,
};

pub use schema::{EntityId, EntityKind, IndexId, PropertyKeyId, SchemaKey, TokenId};

pub use state::{StateSnapshot, StateStore, StateStoreError, StateStoreResult};

pub use update::{
    EntityUpdates, EntityUpdatesBuilder, IndexEntryUpdate, PropertyReader, UpdateError,
    UpdateKind, UpdateResult,
};

pub use values::{Value, ValueTuple};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
