use rustc_hash::FxHashMap;
use std::ops::Bound;
use std::sync::Arc;
use tempfile::TempDir;
use trellis_index::index::{
    DirectoryLayout, IndexDescriptor, IndexLifecycle, IndexQuery, MemoryIndexProvider,
    PopulationState, ProviderDescriptor,
};
use trellis_index::schema::{EntityId, EntityKind, IndexId, PropertyKeyId, SchemaKey, TokenId};
use trellis_index::update::{EntityUpdates, PropertyReader, UpdateResult};
use trellis_index::values::Value;

const PERSON: TokenId = TokenId(0);
const NAME: PropertyKeyId = PropertyKeyId(0);
const AGE: PropertyKeyId = PropertyKeyId(1);

/// Shared stored-property backing for a small set of entities
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

#[test]
fn test_entity_changes_flow_through_diff_into_an_online_index() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);

    let key = SchemaKey::for_label(PERSON, vec![NAME]);
    let descriptor = IndexDescriptor::new(IndexId(1), key.clone());
    lifecycle.create_index(descriptor).unwrap();

    // Two entities gain the Person label with a name in one transaction
    let mut store = PropertyStore::default();
    let mut scan = Vec::new();
    for (id, name) in [(1, "alice"), (2, "bob")] {
        store.set(EntityId(id), NAME, Value::Text(name.into()));
        let updates = EntityUpdates::for_entity(EntityId(id))
            .with_tokens([])
            .with_tokens_after([PERSON])
            .build();
        scan.extend(updates.updates_for_keys([key.clone()].iter(), &store).unwrap());
    }

    lifecycle.populate(IndexId(1), scan, &store).unwrap();
    assert_eq!(lifecycle.state(IndexId(1)).unwrap(), PopulationState::Online);

    let hits = lifecycle
        .query(IndexId(1), &IndexQuery::Exact(Value::Text("alice".into()).into()))
        .unwrap();
    assert_eq!(hits, vec![EntityId(1)]);
}

#[test]
fn test_online_transaction_applies_diffed_updates() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);

    let key = SchemaKey::for_label(PERSON, vec![AGE]);
    lifecycle
        .create_index(IndexDescriptor::new(IndexId(1), key.clone()))
        .unwrap();
    let store = PropertyStore::default();
    lifecycle.populate(IndexId(1), Vec::new(), &store).unwrap();

    // A transaction adds ages to three existing Person entities
    let mut updater = lifecycle.updater(IndexId(1)).unwrap();
    for (id, age) in [(1, 25), (2, 30), (3, 35)] {
        let updates = EntityUpdates::for_entity(EntityId(id))
            .with_tokens([PERSON])
            .added(AGE, Value::Int(age))
            .build();
        for update in updates.updates_for_keys([key.clone()].iter(), &store).unwrap() {
            updater.process(update).unwrap();
        }
    }
    updater.close().unwrap();

    let hits = lifecycle
        .query(
            IndexId(1),
            &IndexQuery::Range {
                from: Bound::Included(Value::Int(30)),
                to: Bound::Unbounded,
            },
        )
        .unwrap();
    assert_eq!(hits, vec![EntityId(2), EntityId(3)]);
}

#[test]
fn test_property_change_moves_entity_between_tuples() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);

    let key = SchemaKey::for_label(PERSON, vec![NAME]);
    lifecycle
        .create_index(IndexDescriptor::new(IndexId(1), key.clone()))
        .unwrap();
    let store = PropertyStore::default();

    let add = EntityUpdates::for_entity(EntityId(1))
        .with_tokens([PERSON])
        .added(NAME, Value::Text("carol".into()))
        .build();
    lifecycle
        .populate(
            IndexId(1),
            add.updates_for_keys([key.clone()].iter(), &store).unwrap(),
            &store,
        )
        .unwrap();

    // Rename carol to carola
    let change = EntityUpdates::for_entity(EntityId(1))
        .with_tokens([PERSON])
        .changed(NAME, Value::Text("carol".into()), Value::Text("carola".into()))
        .build();
    let mut updater = lifecycle.updater(IndexId(1)).unwrap();
    for update in change.updates_for_keys([key.clone()].iter(), &store).unwrap() {
        updater.process(update).unwrap();
    }
    updater.close().unwrap();

    let old = lifecycle
        .query(IndexId(1), &IndexQuery::Exact(Value::Text("carol".into()).into()))
        .unwrap();
    assert!(old.is_empty());
    let new = lifecycle
        .query(IndexId(1), &IndexQuery::Prefix("carol".into()))
        .unwrap();
    assert_eq!(new, vec![EntityId(1)]);
}

#[test]
fn test_any_of_index_holds_positional_tuples() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);

    // Any-of over two labels and two properties, the shape a fulltext
    // index declares
    let key = SchemaKey::any_of(
        EntityKind::Node,
        vec![PERSON, TokenId(1)],
        vec![NAME, AGE],
    );
    lifecycle
        .create_index(IndexDescriptor::new(IndexId(1), key.clone()))
        .unwrap();
    let store = PropertyStore::default();

    // Only NAME is present; AGE rides along as a null slot
    let updates = EntityUpdates::for_entity(EntityId(1))
        .with_tokens([PERSON])
        .added(NAME, Value::Text("dora".into()))
        .build();
    lifecycle
        .populate(
            IndexId(1),
            updates.updates_for_keys([key.clone()].iter(), &store).unwrap(),
            &store,
        )
        .unwrap();

    let hits = lifecycle
        .query(
            IndexId(1),
            &IndexQuery::Exact(vec![Value::Text("dora".into()), Value::Null].into()),
        )
        .unwrap();
    assert_eq!(hits, vec![EntityId(1)]);
    // a partially filled tuple still counts as indexed
    assert_eq!(
        lifecycle.query(IndexId(1), &IndexQuery::Exists).unwrap(),
        vec![EntityId(1)]
    );
}

#[test]
fn test_composite_index_skips_entities_with_missing_properties() {
    let dir = TempDir::new().unwrap();
    let lifecycle = lifecycle_in(&dir);

    let key = SchemaKey::for_label(PERSON, vec![NAME, AGE]);
    lifecycle
        .create_index(IndexDescriptor::new(IndexId(1), key.clone()))
        .unwrap();

    let mut store = PropertyStore::default();
    store.set(EntityId(1), NAME, Value::Text("eve".into()));
    store.set(EntityId(1), AGE, Value::Int(41));
    // entity 2 has a name but no age, so it never enters the index
    store.set(EntityId(2), NAME, Value::Text("frank".into()));

    let mut scan = Vec::new();
    for id in [1, 2] {
        let updates = EntityUpdates::for_entity(EntityId(id))
            .with_tokens([])
            .with_tokens_after([PERSON])
            .build();
        scan.extend(updates.updates_for_keys([key.clone()].iter(), &store).unwrap());
    }
    lifecycle.populate(IndexId(1), scan, &store).unwrap();

    assert_eq!(
        lifecycle.query(IndexId(1), &IndexQuery::Exists).unwrap(),
        vec![EntityId(1)]
    );
}

#[test]
fn test_index_state_survives_provider_restart() {
    let dir = TempDir::new().unwrap();
    let key = SchemaKey::for_label(PERSON, vec![NAME]);
    {
        let lifecycle = lifecycle_in(&dir);
        lifecycle
            .create_index(IndexDescriptor::new(IndexId(3), key.clone()))
            .unwrap();
        lifecycle
            .populate(IndexId(3), Vec::new(), &PropertyStore::default())
            .unwrap();
    }

    // A fresh provider over the same store directory reads the durable
    // record back
    let layout = DirectoryLayout::new(dir.path(), ProviderDescriptor::new("memory", "0.1"));
    let provider = MemoryIndexProvider::open(layout).unwrap();
    use trellis_index::index::IndexProvider;
    assert_eq!(
        provider.initial_state(IndexId(3)).unwrap(),
        PopulationState::Online
    );
}
