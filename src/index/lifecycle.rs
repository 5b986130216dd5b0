//! Index lifecycle management
//!
//! Drives each index through Creating -> Populating -> Online, or into
//! Failed when population goes wrong. A populator failure never crashes
//! the caller: the reason is persisted through the provider so it can be
//! inspected long after the populator object is gone, and the index stays
//! Failed until an operator drops and recreates it.

use super::provider::{
    IndexDescriptor, IndexPopulator, IndexProvider, IndexQuery, IndexUpdater, PopulationState,
};
use super::{IndexError, IndexResult};
use crate::schema::{EntityId, IndexId};
use crate::update::{IndexEntryUpdate, PropertyReader};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

struct IndexProxy {
    descriptor: IndexDescriptor,
    state: PopulationState,
    populator: Option<Box<dyn IndexPopulator>>,
}

/// Tracks every declared index and its lifecycle state
pub struct IndexLifecycle {
    provider: Arc<dyn IndexProvider>,
    indexes: RwLock<HashMap<IndexId, Arc<Mutex<IndexProxy>>>>,
}

impl IndexLifecycle {
    pub fn new(provider: Arc<dyn IndexProvider>) -> Self {
        IndexLifecycle {
            provider,
            indexes: RwLock::new(HashMap::new()),
        }
    }

    /// Declare an index. Creating -> Populating happens synchronously
    /// here; the actual build runs through [`IndexLifecycle::populate`].
    pub fn create_index(&self, descriptor: IndexDescriptor) -> IndexResult<()> {
        let id = descriptor.id;
        let mut indexes = self.indexes.write().unwrap();
        if indexes.contains_key(&id) {
            return Err(IndexError::IllegalState(format!(
                "index {} already exists",
                id
            )));
        }
        debug!("creating index {} on {:?}", id, descriptor.key);
        let populator = self.provider.populator(&descriptor)?;
        indexes.insert(
            id,
            Arc::new(Mutex::new(IndexProxy {
                descriptor,
                state: PopulationState::Populating,
                populator: Some(populator),
            })),
        );
        Ok(())
    }

    /// Bulk-build the index from a scan. On success the index comes
    /// online; on any error the failure is persisted, the index is left
    /// Failed, and the original error is returned.
    pub fn populate(
        &self,
        id: IndexId,
        updates: impl IntoIterator<Item = IndexEntryUpdate>,
        properties: &dyn PropertyReader,
    ) -> IndexResult<()> {
        let proxy = self.proxy(id)?;
        let mut proxy = proxy.lock().unwrap();
        let mut populator = proxy.populator.take().ok_or_else(|| {
            IndexError::IllegalState(format!("index {} is not populating", id))
        })?;

        let unique = proxy.descriptor.unique;
        let result = run_population(populator.as_mut(), unique, updates, properties);
        match result {
            Ok(()) => {
                populator.close(true)?;
                proxy.state = PopulationState::Online;
                info!("index {} is online", id);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                populator.mark_as_failed(&reason)?;
                populator.close(false)?;
                proxy.state = PopulationState::Failed;
                warn!("index {} failed to populate: {}", id, reason);
                Err(e)
            }
        }
    }

    /// Fail an index from outside the population loop, e.g. when the
    /// scan feeding it breaks
    pub fn mark_as_failed(&self, id: IndexId, reason: &str) -> IndexResult<()> {
        let proxy = self.proxy(id)?;
        let mut proxy = proxy.lock().unwrap();
        if let Some(mut populator) = proxy.populator.take() {
            populator.mark_as_failed(reason)?;
            populator.close(false)?;
        }
        proxy.state = PopulationState::Failed;
        Ok(())
    }

    /// Current in-memory state of an index
    pub fn state(&self, id: IndexId) -> IndexResult<PopulationState> {
        Ok(self.proxy(id)?.lock().unwrap().state)
    }

    /// Durable state as the provider would report it after restart
    pub fn initial_state(&self, id: IndexId) -> IndexResult<PopulationState> {
        self.provider.initial_state(id)
    }

    /// The persisted failure description of a failed index
    pub fn population_failure(&self, id: IndexId) -> IndexResult<String> {
        self.provider.population_failure(id)
    }

    /// Incremental writer for an online index
    pub fn updater(&self, id: IndexId) -> IndexResult<Box<dyn IndexUpdater>> {
        let proxy = self.proxy(id)?;
        let proxy = proxy.lock().unwrap();
        self.require_online(id, proxy.state)?;
        self.provider.accessor(&proxy.descriptor)?.updater()
    }

    /// Query an online index
    pub fn query(&self, id: IndexId, query: &IndexQuery) -> IndexResult<Vec<EntityId>> {
        let proxy = self.proxy(id)?;
        let proxy = proxy.lock().unwrap();
        self.require_online(id, proxy.state)?;
        self.provider.accessor(&proxy.descriptor)?.query(query)
    }

    /// A failed index reports why its population failed; any other
    /// not-online state is a plain illegal state.
    fn require_online(&self, id: IndexId, state: PopulationState) -> IndexResult<()> {
        match state {
            PopulationState::Online => Ok(()),
            PopulationState::Failed => {
                let reason = self
                    .provider
                    .population_failure(id)
                    .unwrap_or_else(|_| "population failed".to_string());
                Err(IndexError::Population { reason })
            }
            other => Err(IndexError::IllegalState(format!(
                "index {} is not online (state: {:?})",
                id, other
            ))),
        }
    }

    /// Drop an index in any state; dropping an unknown index is a no-op
    pub fn drop_index(&self, id: IndexId) -> IndexResult<()> {
        let removed = self.indexes.write().unwrap().remove(&id);
        if let Some(proxy) = removed {
            let mut proxy = proxy.lock().unwrap();
            if let Some(mut populator) = proxy.populator.take() {
                populator.drop_index()?;
                return Ok(());
            }
        }
        self.provider.drop_index(id)
    }

    fn proxy(&self, id: IndexId) -> IndexResult<Arc<Mutex<IndexProxy>>> {
        self.indexes
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| IndexError::IllegalState(format!("index {} doesn't exist", id)))
    }
}

fn run_population(
    populator: &mut dyn IndexPopulator,
    unique: bool,
    updates: impl IntoIterator<Item = IndexEntryUpdate>,
    properties: &dyn PropertyReader,
) -> IndexResult<()> {
    for update in updates {
        populator.add(update)?;
    }
    if unique {
        populator.verify_deferred_constraints(properties)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::directory::{DirectoryLayout, ProviderDescriptor};
    use crate::index::provider::MemoryIndexProvider;
    use crate::schema::{PropertyKeyId, SchemaKey, TokenId};
    use crate::update::UpdateResult;
    use crate::values::Value;
    use tempfile::TempDir;

    struct NoProperties;

    impl PropertyReader for NoProperties {
        fn load_property(
            &self,
            _entity: EntityId,
            _key: PropertyKeyId,
        ) -> UpdateResult<Option<Value>> {
            Ok(None)
        }
    }

    fn lifecycle_in(dir: &TempDir) -> IndexLifecycle {
        let layout = DirectoryLayout::new(dir.path(), ProviderDescriptor::new("memory", "0.1"));
        IndexLifecycle::new(Arc::new(MemoryIndexProvider::open(layout).unwrap()))
    }

    fn descriptor(id: u64) -> IndexDescriptor {
        IndexDescriptor::new(
            IndexId(id),
            SchemaKey::for_label(TokenId(0), vec![PropertyKeyId(0)]),
        )
    }

    #[test]
    fn test_create_transitions_to_populating() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(&dir);
        lifecycle.create_index(descriptor(1)).unwrap();
        assert_eq!(
            lifecycle.state(IndexId(1)).unwrap(),
            PopulationState::Populating
        );
    }

    #[test]
    fn test_creating_the_same_index_twice_fails() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(&dir);
        lifecycle.create_index(descriptor(1)).unwrap();
        assert!(lifecycle.create_index(descriptor(1)).is_err());
    }

    #[test]
    fn test_successful_population_brings_index_online() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(&dir);
        let desc = descriptor(1);
        lifecycle.create_index(desc.clone()).unwrap();
        lifecycle
            .populate(
                IndexId(1),
                vec![IndexEntryUpdate::add(EntityId(1), desc.key, Value::Int(1))],
                &NoProperties,
            )
            .unwrap();
        assert_eq!(lifecycle.state(IndexId(1)).unwrap(), PopulationState::Online);
        assert_eq!(
            lifecycle.initial_state(IndexId(1)).unwrap(),
            PopulationState::Online
        );
    }

    #[test]
    fn test_updates_before_online_are_rejected() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(&dir);
        lifecycle.create_index(descriptor(1)).unwrap();
        assert!(matches!(
            lifecycle.updater(IndexId(1)),
            Err(IndexError::IllegalState(_))
        ));
    }

    #[test]
    fn test_failed_population_is_terminal_and_inspectable() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(&dir);
        lifecycle.create_index(descriptor(1)).unwrap();
        lifecycle
            .mark_as_failed(IndexId(1), "scan aborted at entity 42")
            .unwrap();
        assert_eq!(lifecycle.state(IndexId(1)).unwrap(), PopulationState::Failed);
        assert_eq!(
            lifecycle.population_failure(IndexId(1)).unwrap(),
            "scan aborted at entity 42"
        );
        // Failed indexes answer queries and updates with the persisted
        // failure, not a generic state error
        assert!(matches!(
            lifecycle.query(IndexId(1), &IndexQuery::Exists),
            Err(IndexError::Population { ref reason }) if reason == "scan aborted at entity 42"
        ));
        assert!(matches!(
            lifecycle.updater(IndexId(1)),
            Err(IndexError::Population { .. })
        ));
    }

    #[test]
    fn test_drop_is_idempotent_across_states() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(&dir);
        lifecycle.create_index(descriptor(1)).unwrap();
        lifecycle.drop_index(IndexId(1)).unwrap();
        // dropping an index that no longer exists must not raise
        lifecycle.drop_index(IndexId(1)).unwrap();
    }

    #[test]
    fn test_online_updates_are_visible_to_queries() {
        let dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(&dir);
        let desc = descriptor(1);
        lifecycle.create_index(desc.clone()).unwrap();
        lifecycle
            .populate(IndexId(1), Vec::new(), &NoProperties)
            .unwrap();

        let mut updater = lifecycle.updater(IndexId(1)).unwrap();
        updater
            .process(IndexEntryUpdate::add(EntityId(7), desc.key, Value::Int(3)))
            .unwrap();
        updater.close().unwrap();

        let ids = lifecycle
            .query(IndexId(1), &IndexQuery::Exact(Value::Int(3).into()))
            .unwrap();
        assert_eq!(ids, vec![EntityId(7)]);
    }
}
