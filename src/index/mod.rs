//! Index subsystem
//!
//! Everything downstream of an [`crate::update::IndexEntryUpdate`] lives
//! here. Providers open populators and accessors per index, the
//! lifecycle manager drives each index through population into online
//! service, conflict detection guards unique indexes and the handle
//! cache bounds how many index resources stay open at once.

pub mod cache;
pub mod conflict;
pub mod directory;
pub mod lifecycle;
pub mod memory;
pub mod provider;

pub use cache::{CacheConfig, CacheError, HandleCache, HandleGuard, HandleResource, IndexHandle};
pub use conflict::{detect_in_transaction, ConflictDetector, ConflictError, ConflictResult};
pub use directory::{sanitize_key, DirectoryLayout, ProviderDescriptor};
pub use lifecycle::IndexLifecycle;
pub use memory::MemoryIndex;
pub use provider::{
    IndexAccessor, IndexDescriptor, IndexPopulator, IndexProvider, IndexQuery, IndexUpdater,
    MemoryIndexProvider, PopulationState,
};

use crate::state::StateStoreError;
use crate::update::UpdateError;
use thiserror::Error;

/// Errors surfaced by the index subsystem
#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("index population failed: {reason}")]
    Population { reason: String },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;
