//! Provider contracts and the built-in in-memory provider
//!
//! A provider opens populators (bulk build) and accessors (online
//! serving) for an index, and answers durable state questions without
//! needing the transient populator object back: `initial_state` and
//! `population_failure` survive process restart.

use super::conflict::{detect_in_transaction, ConflictDetector};
use super::directory::DirectoryLayout;
use super::memory::MemoryIndex;
use super::{IndexError, IndexResult};
use crate::schema::{EntityId, IndexId, SchemaKey};
use crate::state::{StateStore, StateStoreError};
use crate::update::{IndexEntryUpdate, PropertyReader, UpdateKind};
use crate::values::Value;
use std::collections::HashMap;
use std::fs;
use std::ops::Bound;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// File inside an index directory holding the population failure text
const FAILURE_FILE: &str = "failure-message";

/// Lifecycle state of one index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationState {
    Creating,
    Populating,
    Online,
    Failed,
}

impl PopulationState {
    /// Persistent record value; `Creating` is never persisted
    pub fn as_record(self) -> u64 {
        match self {
            PopulationState::Creating | PopulationState::Populating => 1,
            PopulationState::Online => 2,
            PopulationState::Failed => 3,
        }
    }

    pub fn from_record(value: u64) -> Option<Self> {
        match value {
            1 => Some(PopulationState::Populating),
            2 => Some(PopulationState::Online),
            3 => Some(PopulationState::Failed),
            _ => None,
        }
    }
}

/// Everything needed to open an index: id, schema and uniqueness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub id: IndexId,
    pub key: SchemaKey,
    pub unique: bool,
}

impl IndexDescriptor {
    pub fn new(id: IndexId, key: SchemaKey) -> Self {
        IndexDescriptor {
            id,
            key,
            unique: false,
        }
    }

    pub fn unique(id: IndexId, key: SchemaKey) -> Self {
        IndexDescriptor {
            id,
            key,
            unique: true,
        }
    }
}

/// Queries the accessor can answer. Range and the string queries target
/// the first slot of each tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexQuery {
    Exact(crate::values::ValueTuple),
    Range {
        from: Bound<Value>,
        to: Bound<Value>,
    },
    Prefix(String),
    Suffix(String),
    Contains(String),
    Exists,
}

/// Bulk build-time writer for an index that is not yet online.
///
/// `close` and `drop_index` are idempotent terminal operations: calling
/// them on a populator that never started, or twice, must not raise.
pub trait IndexPopulator: Send {
    fn add(&mut self, update: IndexEntryUpdate) -> IndexResult<()>;

    /// Deferred uniqueness verification; invoked after all adds and
    /// before the index goes online.
    fn verify_deferred_constraints(&mut self, properties: &dyn PropertyReader) -> IndexResult<()>;

    /// Record a population failure durably
    fn mark_as_failed(&mut self, reason: &str) -> IndexResult<()>;

    fn close(&mut self, populated_successfully: bool) -> IndexResult<()>;

    fn drop_index(&mut self) -> IndexResult<()>;
}

/// Incremental writer for an online index. Updates buffer until `close`,
/// which is also where in-transaction uniqueness conflicts surface.
pub trait IndexUpdater: Send {
    fn process(&mut self, update: IndexEntryUpdate) -> IndexResult<()>;

    fn close(&mut self) -> IndexResult<()>;
}

/// Online read/write surface of a populated index
pub trait IndexAccessor: Send {
    fn updater(&self) -> IndexResult<Box<dyn IndexUpdater>>;

    fn query(&self, query: &IndexQuery) -> IndexResult<Vec<EntityId>>;
}

/// Opens populators and accessors, and answers durable state questions
pub trait IndexProvider: Send + Sync {
    fn populator(&self, descriptor: &IndexDescriptor) -> IndexResult<Box<dyn IndexPopulator>>;

    fn accessor(&self, descriptor: &IndexDescriptor) -> IndexResult<Box<dyn IndexAccessor>>;

    /// State to resume with after restart; an index population that never
    /// completed reports `Populating`.
    fn initial_state(&self, id: IndexId) -> IndexResult<PopulationState>;

    /// The persisted failure text of a failed population
    fn population_failure(&self, id: IndexId) -> IndexResult<String>;

    /// Remove the index and its durable state; idempotent
    fn drop_index(&self, id: IndexId) -> IndexResult<()>;
}

type SharedIndex = Arc<RwLock<MemoryIndex>>;

/// The built-in provider: in-memory indexes with durable population
/// state under the provider's directory layout.
pub struct MemoryIndexProvider {
    layout: DirectoryLayout,
    store: Arc<StateStore>,
    indexes: Arc<RwLock<HashMap<IndexId, SharedIndex>>>,
}

impl MemoryIndexProvider {
    pub fn open(layout: DirectoryLayout) -> IndexResult<Self> {
        let root = layout.root();
        fs::create_dir_all(&root)?;
        let store = StateStore::open(root.join("population-state"))?;
        Ok(MemoryIndexProvider {
            layout,
            store: Arc::new(store),
            indexes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    fn index(&self, id: IndexId) -> IndexResult<SharedIndex> {
        self.indexes
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| IndexError::IllegalState(format!("index {} doesn't exist", id)))
    }
}

impl IndexProvider for MemoryIndexProvider {
    fn populator(&self, descriptor: &IndexDescriptor) -> IndexResult<Box<dyn IndexPopulator>> {
        let id = descriptor.id;
        fs::create_dir_all(self.layout.directory_for_index(id))?;

        // Population always starts from an empty index
        let index: SharedIndex = Arc::new(RwLock::new(MemoryIndex::new()));
        self.indexes.write().unwrap().insert(id, index.clone());
        self.store.set(id, PopulationState::Populating.as_record())?;
        self.store.force()?;
        debug!("opened populator for index {}", id);

        let detector = descriptor
            .unique
            .then(|| ConflictDetector::new(descriptor.key.properties().to_vec()));
        Ok(Box::new(MemoryIndexPopulator {
            descriptor: descriptor.clone(),
            index,
            detector,
            store: self.store.clone(),
            indexes: self.indexes.clone(),
            layout: self.layout.clone(),
            closed: false,
            failed: false,
        }))
    }

    fn accessor(&self, descriptor: &IndexDescriptor) -> IndexResult<Box<dyn IndexAccessor>> {
        let index = self.index(descriptor.id)?;
        Ok(Box::new(MemoryIndexAccessor {
            index,
            unique: descriptor.unique,
        }))
    }

    fn initial_state(&self, id: IndexId) -> IndexResult<PopulationState> {
        match self.store.get(id) {
            Ok(record) => PopulationState::from_record(record).ok_or_else(|| {
                IndexError::IllegalState(format!("index {} has a corrupt state record", id))
            }),
            // Never recorded: population did not complete before restart
            Err(StateStoreError::InvalidRecord(_)) => Ok(PopulationState::Populating),
            Err(e) => Err(e.into()),
        }
    }

    fn population_failure(&self, id: IndexId) -> IndexResult<String> {
        let path = self.layout.directory_for_index(id).join(FAILURE_FILE);
        if !path.exists() {
            return Err(IndexError::IllegalState(format!(
                "index {} has not failed",
                id
            )));
        }
        Ok(fs::read_to_string(path)?)
    }

    fn drop_index(&self, id: IndexId) -> IndexResult<()> {
        self.indexes.write().unwrap().remove(&id);
        self.store.remove(id);
        self.store.force()?;
        let dir = self.layout.directory_for_index(id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        debug!("dropped index {}", id);
        Ok(())
    }
}

struct MemoryIndexPopulator {
    descriptor: IndexDescriptor,
    index: SharedIndex,
    detector: Option<ConflictDetector>,
    store: Arc<StateStore>,
    indexes: Arc<RwLock<HashMap<IndexId, SharedIndex>>>,
    layout: DirectoryLayout,
    closed: bool,
    failed: bool,
}

impl IndexPopulator for MemoryIndexPopulator {
    fn add(&mut self, update: IndexEntryUpdate) -> IndexResult<()> {
        if self.closed {
            return Err(IndexError::IllegalState(format!(
                "populator for index {} is closed",
                self.descriptor.id
            )));
        }
        // Duplicates are accepted during population; uniqueness is only
        // checked by the deferred verification pass
        if let Some(detector) = &mut self.detector {
            if update.kind() == UpdateKind::Add {
                detector.record(update.entity());
            }
        }
        self.index.write().unwrap().apply(&update)?;
        Ok(())
    }

    fn verify_deferred_constraints(&mut self, properties: &dyn PropertyReader) -> IndexResult<()> {
        if let Some(detector) = &self.detector {
            detector.verify_deferred(properties)?;
        }
        Ok(())
    }

    fn mark_as_failed(&mut self, reason: &str) -> IndexResult<()> {
        let id = self.descriptor.id;
        let dir = self.layout.directory_for_index(id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(FAILURE_FILE), reason)?;
        self.store.set(id, PopulationState::Failed.as_record())?;
        self.store.force()?;
        self.failed = true;
        warn!("population of index {} failed: {}", id, reason);
        Ok(())
    }

    fn close(&mut self, populated_successfully: bool) -> IndexResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if populated_successfully && !self.failed {
            let id = self.descriptor.id;
            self.store.set(id, PopulationState::Online.as_record())?;
            self.store.force()?;
            info!(
                "index {} populated with {} entries",
                id,
                self.index.read().unwrap().len()
            );
        }
        Ok(())
    }

    fn drop_index(&mut self) -> IndexResult<()> {
        self.closed = true;
        let id = self.descriptor.id;
        self.indexes.write().unwrap().remove(&id);
        self.store.remove(id);
        self.store.force()?;
        let dir = self.layout.directory_for_index(id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

struct MemoryIndexAccessor {
    index: SharedIndex,
    unique: bool,
}

impl IndexAccessor for MemoryIndexAccessor {
    fn updater(&self) -> IndexResult<Box<dyn IndexUpdater>> {
        Ok(Box::new(MemoryIndexUpdater {
            index: self.index.clone(),
            unique: self.unique,
            pending: Vec::new(),
            closed: false,
        }))
    }

    fn query(&self, query: &IndexQuery) -> IndexResult<Vec<EntityId>> {
        Ok(self.index.read().unwrap().query(query))
    }
}

struct MemoryIndexUpdater {
    index: SharedIndex,
    unique: bool,
    pending: Vec<IndexEntryUpdate>,
    closed: bool,
}

impl IndexUpdater for MemoryIndexUpdater {
    fn process(&mut self, update: IndexEntryUpdate) -> IndexResult<()> {
        if self.closed {
            return Err(IndexError::IllegalState(
                "updater is already closed".to_string(),
            ));
        }
        self.pending.push(update);
        Ok(())
    }

    fn close(&mut self) -> IndexResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut index = self.index.write().unwrap();
        if self.unique {
            // Conflicts within the batch first, so the error names every
            // id competing for the tuple
            let adds = self
                .pending
                .iter()
                .filter(|u| u.kind() != UpdateKind::Remove)
                .map(|u| (u.values(), u.entity()));
            detect_in_transaction(adds)?;
            for update in &self.pending {
                index.apply_unique(update)?;
            }
        } else {
            for update in &self.pending {
                index.apply(update)?;
            }
        }
        Ok(())
    }
}
