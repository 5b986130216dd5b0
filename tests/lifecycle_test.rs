use rustc_hash::FxHashMap;
use std::sync::Arc;
use tempfile::TempDir;
use trellis_index::index::{
    ConflictError, DirectoryLayout, IndexDescriptor, IndexError, IndexLifecycle, IndexQuery,
    MemoryIndexProvider, PopulationState, ProviderDescriptor,
};
use trellis_index::schema::{EntityId, IndexId, PropertyKeyId, SchemaKey, TokenId};
use trellis_index::update::{EntityUpdates, IndexEntryUpdate, PropertyReader, UpdateResult};
use trellis_index::values::Value;

const USER: TokenId = TokenId(0);
const EMAIL: PropertyKeyId = PropertyKeyId(0);

#[derive(Default)]
struct PropertyStore(FxHashMap<(EntityId, PropertyKeyId), Value>);

impl PropertyStore {
    fn set(&mut self, entity: EntityId, key: PropertyKeyId, value: Value) {
        self.0.insert((entity, key), value);
    }
}

impl PropertyReader for PropertyStore {
    fn load_property(&self, entity: EntityId, key: PropertyKeyId) -> UpdateResult<Option<Value>> {
        Ok(self.0.get(&(entity, key)).cloned())
    }
}

fn lifecycle_in(dir: &TempDir) -> IndexLifecycle {
    let layout = DirectoryLayout::new(dir.path(), ProviderDescriptor::new("memory", "0.1"));
    IndexLifecycle::new(Arc::new(MemoryIndexProvider::open(layout).unwrap()))
}

fn unique_email_index() -> IndexDescriptor {
    IndexDescriptor::unique(IndexId(1), SchemaKey::for_label(USER, vec![EMAIL]))
}

fn email_scan(store: &PropertyStore, ids: &[u64]) -> Vec<IndexEntryUpdate> {
    let key = SchemaKey::for_label(USER, vec![EMAIL]);
    let mut scan = Vec::new();
    for &id in ids {
        let updates = EntityUpdates::for_entity(EntityId(id))
            .with_tokens([])
            .with_tokens_after([USER])
            .build();
        scan.extend(updates.updates_for_keys([key.clone()].iter(), store).unwrap());
    }
    scan
}

#[test]
fn test_duplicate_values_fail_unique_population() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);
    lifecycle.create_index(unique_email_index()).unwrap();

    let mut store = PropertyStore::default();
    store.set(EntityId(1), EMAIL, Value::Text("a@b.c".into()));
    store.set(EntityId(2), EMAIL, Value::Text("a@b.c".into()));

    let err = lifecycle
        .populate(IndexId(1), email_scan(&store, &[1, 2]), &store)
        .unwrap_err();
    match err {
        IndexError::Conflict(ConflictError::DuplicateEntry {
            existing, added, ..
        }) => {
            assert_eq!(existing, EntityId(1));
            assert_eq!(added, EntityId(2));
        }
        other => panic!("expected a duplicate entry conflict, got {other}"),
    }

    // the failure sticks, in memory and durably
    assert_eq!(lifecycle.state(IndexId(1)).unwrap(), PopulationState::Failed);
    assert_eq!(
        lifecycle.initial_state(IndexId(1)).unwrap(),
        PopulationState::Failed
    );
    assert!(lifecycle
        .population_failure(IndexId(1))
        .unwrap()
        .contains("a@b.c"));
}

#[test]
fn test_value_changed_after_scan_no_longer_conflicts() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);
    lifecycle.create_index(unique_email_index()).unwrap();

    let mut before = PropertyStore::default();
    before.set(EntityId(1), EMAIL, Value::Text("a@b.c".into()));
    before.set(EntityId(2), EMAIL, Value::Text("a@b.c".into()));
    let scan = email_scan(&before, &[1, 2]);

    // By verification time entity 2 has moved to another address, and
    // the deferred check resolves current values
    let mut current = PropertyStore::default();
    current.set(EntityId(1), EMAIL, Value::Text("a@b.c".into()));
    current.set(EntityId(2), EMAIL, Value::Text("x@y.z".into()));

    lifecycle.populate(IndexId(1), scan, &current).unwrap();
    assert_eq!(lifecycle.state(IndexId(1)).unwrap(), PopulationState::Online);
}

#[test]
fn test_in_transaction_duplicates_surface_on_updater_close() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);
    lifecycle.create_index(unique_email_index()).unwrap();
    lifecycle
        .populate(IndexId(1), Vec::new(), &PropertyStore::default())
        .unwrap();

    let key = SchemaKey::for_label(USER, vec![EMAIL]);
    let mut updater = lifecycle.updater(IndexId(1)).unwrap();
    updater
        .process(IndexEntryUpdate::add(
            EntityId(1),
            key.clone(),
            Value::Text("a@b.c".into()),
        ))
        .unwrap();
    updater
        .process(IndexEntryUpdate::add(
            EntityId(2),
            key,
            Value::Text("a@b.c".into()),
        ))
        .unwrap();

    let err = updater.close().unwrap_err();
    match err {
        IndexError::Conflict(ConflictError::DuplicateInTransaction { ids, .. }) => {
            assert_eq!(ids, vec![EntityId(1), EntityId(2)]);
        }
        other => panic!("expected an in-transaction conflict, got {other}"),
    }
}

#[test]
fn test_unique_index_accepts_distinct_values_online() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);
    lifecycle.create_index(unique_email_index()).unwrap();
    lifecycle
        .populate(IndexId(1), Vec::new(), &PropertyStore::default())
        .unwrap();

    let key = SchemaKey::for_label(USER, vec![EMAIL]);
    let mut updater = lifecycle.updater(IndexId(1)).unwrap();
    for (id, email) in [(1, "a@b.c"), (2, "x@y.z")] {
        updater
            .process(IndexEntryUpdate::add(
                EntityId(id),
                key.clone(),
                Value::Text(email.into()),
            ))
            .unwrap();
    }
    updater.close().unwrap();

    let hits = lifecycle
        .query(IndexId(1), &IndexQuery::Exact(Value::Text("x@y.z".into()).into()))
        .unwrap();
    assert_eq!(hits, vec![EntityId(2)]);
}

#[test]
fn test_failure_text_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let lifecycle = lifecycle_in(&dir);
        lifecycle.create_index(unique_email_index()).unwrap();
        lifecycle
            .mark_as_failed(IndexId(1), "store scan lost entity 9")
            .unwrap();
    }

    // A new lifecycle over the same directory knows nothing in memory
    // but reads the durable state and failure text back
    let lifecycle = lifecycle_in(&dir);
    assert_eq!(
        lifecycle.initial_state(IndexId(1)).unwrap(),
        PopulationState::Failed
    );
    assert_eq!(
        lifecycle.population_failure(IndexId(1)).unwrap(),
        "store scan lost entity 9"
    );
}

#[test]
fn test_dropping_a_failed_index_clears_its_failure() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);
    lifecycle.create_index(unique_email_index()).unwrap();
    lifecycle.mark_as_failed(IndexId(1), "boom").unwrap();
    lifecycle.drop_index(IndexId(1)).unwrap();

    // Recreating under the same id starts clean
    lifecycle.create_index(unique_email_index()).unwrap();
    lifecycle
        .populate(IndexId(1), Vec::new(), &PropertyStore::default())
        .unwrap();
    assert_eq!(lifecycle.state(IndexId(1)).unwrap(), PopulationState::Online);
    assert!(lifecycle.population_failure(IndexId(1)).is_err());
}
