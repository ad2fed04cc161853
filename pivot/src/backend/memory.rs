//! The in-process reference backend.
//!
//! Collections live in maps behind a read-write lock; the indexer and
//! aggregator evaluate filters with the compiled in-memory predicate. This
//! driver defines the semantics the others are held to.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{
    Aggregator, Backend, Feature, Indexer, QueryPage, QueryResultFn, connect,
    enforce_delete_constraints,
};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Filter};
use crate::generator::memory::compile;
use crate::schema::collection::Collection;
use crate::schema::field::Operation;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::{Kind, Value};

/// Separator for flat storage keys; outside any printable value.
const KEY_SEP: &str = "\u{1f}";

struct StoredCollection {
    schema: Collection,
    records: BTreeMap<String, Record>,
    next_sequence: i64,
}

impl StoredCollection {
    fn new(schema: Collection) -> StoredCollection {
        StoredCollection {
            schema,
            records: BTreeMap::new(),
            next_sequence: 1,
        }
    }
}

pub(crate) struct MemoryStore {
    collections: RwLock<HashMap<String, StoredCollection>>,
}

impl MemoryStore {
    fn new() -> MemoryStore {
        MemoryStore {
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn schema(&self, name: &str) -> Result<Collection> {
        self.collections
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.schema.clone())
            .ok_or_else(|| Error::CollectionNotFound {
                name: name.to_string(),
            })
    }

    /// Live (non-expired) records of a collection; expired entries are
    /// dropped on the way out.
    fn live_records(&self, name: &str) -> Result<Vec<Record>> {
        let mut collections = self.collections.write().unwrap();
        let stored = collections.get_mut(name).ok_or_else(|| Error::CollectionNotFound {
            name: name.to_string(),
        })?;
        let expired: Vec<String> = stored
            .records
            .iter()
            .filter(|(_, r)| stored.schema.is_expired(r))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            stored.records.remove(&key);
        }
        Ok(stored.records.values().cloned().collect())
    }
}

pub struct MemoryBackend {
    dsn: ConnectionString,
    store: Arc<MemoryStore>,
    self_ref: Weak<MemoryBackend>,
    indexer: RwLock<Option<Arc<MemoryIndexer>>>,
    aggregator: RwLock<Option<Arc<MemoryAggregator>>>,
    /// Override backend whose indexer serves queries, from `set_indexer`.
    external: RwLock<Option<Arc<dyn Backend>>>,
}

impl MemoryBackend {
    pub fn construct(dsn: ConnectionString) -> Result<Arc<dyn Backend>> {
        Ok(MemoryBackend::with_dsn(dsn))
    }

    pub fn with_dsn(dsn: ConnectionString) -> Arc<MemoryBackend> {
        Arc::new_cyclic(|weak| MemoryBackend {
            dsn,
            store: Arc::new(MemoryStore::new()),
            self_ref: weak.clone(),
            indexer: RwLock::new(None),
            aggregator: RwLock::new(None),
            external: RwLock::new(None),
        })
    }

    fn self_arc(&self) -> Option<Arc<dyn Backend>> {
        self.self_ref.upgrade().map(|arc| arc as Arc<dyn Backend>)
    }

    fn own_indexer(&self) -> Arc<MemoryIndexer> {
        if let Some(indexer) = self.indexer.read().unwrap().as_ref() {
            return Arc::clone(indexer);
        }
        let mut slot = self.indexer.write().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(MemoryIndexer {
                dsn: self.dsn.clone(),
                store: Arc::clone(&self.store),
                parent: RwLock::new(self.self_arc()),
            })
        })
        .clone()
    }

    fn own_aggregator(&self) -> Arc<MemoryAggregator> {
        if let Some(aggregator) = self.aggregator.read().unwrap().as_ref() {
            return Arc::clone(aggregator);
        }
        let mut slot = self.aggregator.write().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(MemoryAggregator {
                store: Arc::clone(&self.store),
            })
        })
        .clone()
    }

    /// Assign a fresh identity for a record the backend must key itself.
    fn assign_identity(stored: &mut StoredCollection, record: &mut Record) -> Result<()> {
        let identity_field = stored.schema.identity_field.clone();
        let value = match stored.schema.identity_field_type {
            Kind::Int => {
                let assigned = stored.next_sequence;
                stored.next_sequence += 1;
                Value::Int(assigned)
            }
            _ => crate::schema::formatters::generate_encoded_uuid(Value::Null, Operation::Create)?,
        };
        record.set(&identity_field, value);
        record.id = stored.schema.record_id(record)?;
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn set_indexer(&self, dsn: ConnectionString) -> Result<()> {
        let external = connect(&dsn.to_string()).await?;
        if let (Some(indexer), Some(parent)) = (external.with_search(""), self.self_arc()) {
            indexer.index_initialize(parent).await?;
        }
        *self.external.write().unwrap() = Some(external);
        Ok(())
    }

    fn register_collection(&self, collection: Collection) {
        let mut collections = self.store.collections.write().unwrap();
        match collections.get_mut(&collection.name) {
            Some(stored) => stored.schema = collection,
            None => {
                collections.insert(collection.name.clone(), StoredCollection::new(collection));
            }
        }
    }

    fn get_collection(&self, name: &str) -> Result<Collection> {
        self.store.schema(name)
    }

    fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.store.collections.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    async fn create_collection(&self, definition: Collection) -> Result<()> {
        self.register_collection(definition);
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.store.collections.write().unwrap().remove(name);
        Ok(())
    }

    async fn exists(&self, collection: &str, id: &Id) -> bool {
        let collections = self.store.collections.read().unwrap();
        let Some(stored) = collections.get(collection) else {
            return false;
        };
        if id.len() != stored.schema.key_count() {
            return false;
        }
        stored
            .records
            .get(&id.to_key(KEY_SEP))
            .map(|r| !stored.schema.is_expired(r))
            .unwrap_or(false)
    }

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record> {
        let schema = self.store.schema(collection)?;
        id.check_arity(&schema)?;
        let mut record = {
            let collections = self.store.collections.read().unwrap();
            let stored = collections.get(collection).ok_or_else(|| Error::CollectionNotFound {
                name: collection.to_string(),
            })?;
            stored
                .records
                .get(&id.to_key(KEY_SEP))
                .filter(|r| !stored.schema.is_expired(r))
                .cloned()
                .ok_or_else(|| Error::record_not_found(collection, id))?
        };
        record.populate(&schema)?;
        if fields.is_empty() {
            Ok(record)
        } else {
            let mut projection: Vec<String> = fields.to_vec();
            if !projection.iter().any(|f| schema.is_identity_field(f)) {
                projection.push(schema.identity_field.clone());
            }
            Ok(record.only_fields(&projection))
        }
    }

    async fn insert(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        let schema = self.store.schema(collection)?;
        for record in &mut records.records {
            let mut made = schema.make_record(record, Operation::Create)?;
            // Writes of already-expired records are a silent no-op.
            if schema.is_expired(&made) {
                continue;
            }
            let mut collections = self.store.collections.write().unwrap();
            let stored = collections.get_mut(collection).ok_or_else(|| Error::CollectionNotFound {
                name: collection.to_string(),
            })?;
            if made.id.is_empty() {
                MemoryBackend::assign_identity(stored, &mut made)?;
            }
            made.id.check_arity(&schema)?;
            let key = made.id.to_key(KEY_SEP);
            if stored
                .records
                .get(&key)
                .map(|r| !stored.schema.is_expired(r))
                .unwrap_or(false)
            {
                return Err(Error::conflict(
                    collection,
                    format!("record {} already exists", made.id),
                ));
            }
            made.snapshot();
            record.id = made.id.clone();
            record.set(&schema.identity_field, made.get_value(&schema.identity_field));
            stored.records.insert(key, made);
        }
        Ok(())
    }

    async fn update(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        let schema = self.store.schema(collection)?;
        for record in &mut records.records {
            let mut made = schema.make_record(record, Operation::Update)?;
            if schema.is_expired(&made) {
                continue;
            }
            made.id.check_arity(&schema)?;
            let mut collections = self.store.collections.write().unwrap();
            let stored = collections.get_mut(collection).ok_or_else(|| Error::CollectionNotFound {
                name: collection.to_string(),
            })?;
            let key = made.id.to_key(KEY_SEP);
            if !stored.records.contains_key(&key) {
                return Err(Error::record_not_found(collection, &made.id));
            }
            made.snapshot();
            stored.records.insert(key, made);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[Id]) -> Result<()> {
        let schema = self.store.schema(collection)?;
        for id in ids {
            id.check_arity(&schema)?;
        }
        if let Some(backend) = self.self_arc() {
            enforce_delete_constraints(backend, collection, ids).await?;
        }
        let mut collections = self.store.collections.write().unwrap();
        let stored = collections.get_mut(collection).ok_or_else(|| Error::CollectionNotFound {
            name: collection.to_string(),
        })?;
        for id in ids {
            stored.records.remove(&id.to_key(KEY_SEP));
        }
        Ok(())
    }

    fn with_search(&self, collection: &str) -> Option<Arc<dyn Indexer>> {
        if let Some(external) = self.external.read().unwrap().as_ref() {
            return external.with_search(collection);
        }
        Some(self.own_indexer())
    }

    fn with_aggregator(&self, _collection: &str) -> Option<Arc<dyn Aggregator>> {
        Some(self.own_aggregator())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn supports(&self, features: &[Feature]) -> bool {
        features.iter().all(|f| {
            matches!(
                f,
                Feature::PartialSearch | Feature::CompositeKeys | Feature::Constraints
            )
        })
    }
}

pub struct MemoryIndexer {
    dsn: ConnectionString,
    store: Arc<MemoryStore>,
    parent: RwLock<Option<Arc<dyn Backend>>>,
}

impl MemoryIndexer {
    fn matched(&self, collection: &str, filter: &Filter) -> Result<(Vec<Record>, u64)> {
        let schema = self.store.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let compiled = compile(&filter)?;
        let records = self.store.live_records(collection)?;
        let total = compiled.count(&records);
        let mut hits: Vec<Record> = records.into_iter().filter(|r| compiled.matches(r)).collect();
        compiled.sort(&mut hits);
        Ok((compiled.window(hits), total))
    }
}

#[async_trait]
impl Indexer for MemoryIndexer {
    fn index_connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn index_initialize(&self, parent: Arc<dyn Backend>) -> Result<()> {
        *self.parent.write().unwrap() = Some(parent);
        Ok(())
    }

    fn parent(&self) -> Option<Arc<dyn Backend>> {
        self.parent.read().unwrap().clone()
    }

    async fn index_exists(&self, collection: &str, id: &Id) -> bool {
        let collections = self.store.collections.read().unwrap();
        collections
            .get(collection)
            .map(|stored| stored.records.contains_key(&id.to_key(KEY_SEP)))
            .unwrap_or(false)
    }

    async fn index_retrieve(&self, collection: &str, id: &Id) -> Result<Record> {
        let collections = self.store.collections.read().unwrap();
        let stored = collections.get(collection).ok_or_else(|| Error::CollectionNotFound {
            name: collection.to_string(),
        })?;
        stored
            .records
            .get(&id.to_key(KEY_SEP))
            .cloned()
            .ok_or_else(|| Error::record_not_found(collection, id))
    }

    async fn index_remove(&self, _collection: &str, _ids: &[Id]) -> Result<()> {
        // The backend map is the index; removal happens with the record.
        Ok(())
    }

    async fn index(&self, _collection: &str, _records: &RecordSet) -> Result<()> {
        Ok(())
    }

    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        let (hits, total) = self.matched(collection, filter)?;
        let per_page = filter.limit.unwrap_or_else(|| hits.len().max(1));
        let total_pages = (total as usize).div_ceil(per_page.max(1));
        let page = QueryPage {
            page: filter.offset / per_page.max(1) + 1,
            total_pages,
            per_page,
            total_results: total,
            offset: filter.offset,
        };
        debug!(collection, hits = hits.len(), total, "memory query");
        for record in hits {
            each(record, &page)?;
        }
        Ok(())
    }

    async fn list_values(
        &self,
        collection: &str,
        fields: &[String],
        filter: &Filter,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let (hits, _) = self.matched(collection, filter)?;
        let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for field in fields {
            let mut seen: Vec<Value> = Vec::new();
            for record in &hits {
                let value = match record.get(field) {
                    Some(v) => v.clone(),
                    None if field == "id" || field == "_id" => {
                        record.id.first().cloned().unwrap_or(Value::Null)
                    }
                    None => continue,
                };
                if !value.is_null() && !seen.contains(&value) {
                    seen.push(value);
                }
            }
            out.insert(field.clone(), seen);
        }
        Ok(out)
    }

    async fn delete_query(&self, collection: &str, filter: &Filter) -> Result<()> {
        let (hits, _) = self.matched(collection, filter)?;
        let ids: Vec<Id> = hits.into_iter().map(|r| r.id).collect();
        match self.parent() {
            Some(parent) => parent.delete(collection, &ids).await,
            None => {
                let mut collections = self.store.collections.write().unwrap();
                if let Some(stored) = collections.get_mut(collection) {
                    for id in &ids {
                        stored.records.remove(&id.to_key(KEY_SEP));
                    }
                }
                Ok(())
            }
        }
    }

    async fn flush_index(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryAggregator {
    store: Arc<MemoryStore>,
}

impl MemoryAggregator {
    fn field_values(&self, collection: &str, field: &str, filter: &Filter) -> Result<Vec<Value>> {
        let schema = self.store.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let compiled = compile(&filter)?;
        let records = self.store.live_records(collection)?;
        let mut hits: Vec<Record> = records.into_iter().filter(|r| compiled.matches(r)).collect();
        compiled.sort(&mut hits);
        Ok(hits.into_iter().map(|r| r.get_value(field)).collect())
    }

    fn reduce(aggregation: Aggregation, values: &[Value]) -> Value {
        let numbers: Vec<f64> = values.iter().filter_map(Value::as_float).collect();
        match aggregation {
            Aggregation::Count => Value::Int(values.iter().filter(|v| !v.is_null()).count() as i64),
            Aggregation::Sum => Value::Float(numbers.iter().sum()),
            Aggregation::Min => numbers
                .iter()
                .cloned()
                .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.min(n))))
                .map(Value::Float)
                .unwrap_or(Value::Null),
            Aggregation::Max => numbers
                .iter()
                .cloned()
                .fold(None::<f64>, |acc, n| Some(acc.map_or(n, |a| a.max(n))))
                .map(Value::Float)
                .unwrap_or(Value::Null),
            Aggregation::Avg => {
                if numbers.is_empty() {
                    Value::Float(0.0)
                } else {
                    Value::Float(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            Aggregation::First => values.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null),
            Aggregation::Last => values
                .iter()
                .rev()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl Aggregator for MemoryAggregator {
    async fn aggregate(&self, collection: &str, aggregate: &Aggregate, filter: &Filter) -> Result<Value> {
        let field = if aggregate.aggregation == Aggregation::Count && aggregate.field == "id" {
            let schema = self.store.schema(collection)?;
            schema.identity_field.clone()
        } else {
            aggregate.field.clone()
        };
        let values = self.field_values(collection, &field, filter)?;
        Ok(MemoryAggregator::reduce(aggregate.aggregation, &values))
    }

    async fn group_by(
        &self,
        collection: &str,
        group_fields: &[String],
        aggregates: &[Aggregate],
        filter: &Filter,
    ) -> Result<RecordSet> {
        let schema = self.store.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let compiled = compile(&filter)?;
        let records = self.store.live_records(collection)?;
        let hits: Vec<Record> = records.into_iter().filter(|r| compiled.matches(r)).collect();

        // Group rows by the rendered tuple of group-field values, keeping
        // first-seen order.
        let mut order: Vec<String> = Vec::new();
        let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        for record in hits {
            let key = group_fields
                .iter()
                .map(|f| record.get_value(f).to_display_string())
                .collect::<Vec<_>>()
                .join(KEY_SEP);
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(record);
        }

        let mut out = RecordSet::new();
        for key in order {
            let members = groups.remove(&key).unwrap_or_default();
            let Some(first) = members.first() else { continue };
            let mut row = Record::new(Id::from(Value::from(key.replace(KEY_SEP, ":"))));
            for field in group_fields {
                row.set(field, first.get_value(field));
            }
            for aggregate in aggregates {
                let values: Vec<Value> = members.iter().map(|r| r.get_value(&aggregate.field)).collect();
                row.set(
                    &format!("{}_{}", aggregate.aggregation.as_str(), aggregate.field),
                    MemoryAggregator::reduce(aggregate.aggregation, &values),
                );
            }
            out.push(row);
        }
        out.known_size = true;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::Field;

    fn users() -> Collection {
        Collection::new("users")
            .with_field(Field::identity("id", Kind::Int))
            .with_field(Field::new("email", Kind::String).required().unique())
            .with_field(Field::new("age", Kind::Int))
    }

    fn backend() -> Arc<MemoryBackend> {
        let backend = MemoryBackend::with_dsn(ConnectionString::parse("memory://").unwrap());
        backend.register_collection(users());
        backend
    }

    #[tokio::test]
    async fn insert_assigns_sequential_identities() {
        let backend = backend();
        let mut set = RecordSet::from_records(vec![
            Record::anonymous().with_field("email", "a@b.c").with_field("age", 30),
            Record::anonymous().with_field("email", "d@e.f").with_field("age", 40),
        ]);
        backend.insert("users", &mut set).await.unwrap();
        assert_eq!(set.records[0].id, Id::from(1i64));
        assert_eq!(set.records[1].id, Id::from(2i64));

        let fetched = backend.retrieve("users", &Id::from(1), &[]).await.unwrap();
        assert_eq!(fetched.get_value("email"), Value::from("a@b.c"));
        assert_eq!(fetched.get_value("age"), Value::Int(30));
        assert_eq!(fetched.get_value("id"), Value::Int(1));
    }

    #[tokio::test]
    async fn insert_conflicts_on_present_identity() {
        let backend = backend();
        let mut set = RecordSet::from(Record::new(7i64).with_field("email", "x@y.z"));
        backend.insert("users", &mut set).await.unwrap();

        let mut dup = RecordSet::from(Record::new(7i64).with_field("email", "other@y.z"));
        let err = backend.insert("users", &mut dup).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_requires_presence() {
        let backend = backend();
        let mut missing = RecordSet::from(Record::new(1i64).with_field("email", "a@b.c"));
        let err = backend.update("users", &mut missing).await.unwrap_err();
        assert!(err.is_not_found());

        backend
            .insert("users", &mut RecordSet::from(Record::new(1i64).with_field("email", "a@b.c")))
            .await
            .unwrap();
        let mut change = RecordSet::from(
            Record::new(1i64).with_field("email", "a@b.c").with_field("age", 31),
        );
        backend.update("users", &mut change).await.unwrap();
        let fetched = backend.retrieve("users", &Id::from(1), &[]).await.unwrap();
        assert_eq!(fetched.get_value("age"), Value::Int(31));
    }

    #[tokio::test]
    async fn exists_and_delete() {
        let backend = backend();
        backend
            .insert("users", &mut RecordSet::from(Record::new(5i64).with_field("email", "e@f.g")))
            .await
            .unwrap();
        assert!(backend.exists("users", &Id::from(5)).await);
        backend.delete("users", &[Id::from(5)]).await.unwrap();
        assert!(!backend.exists("users", &Id::from(5)).await);
        // Deleting a missing id is a no-op.
        backend.delete("users", &[Id::from(5)]).await.unwrap();
    }

    #[tokio::test]
    async fn retrieve_projects_but_keeps_identity() {
        let backend = backend();
        backend
            .insert(
                "users",
                &mut RecordSet::from(
                    Record::new(3i64).with_field("email", "p@q.r").with_field("age", 9),
                ),
            )
            .await
            .unwrap();
        let fetched = backend
            .retrieve("users", &Id::from(3), &["age".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.get_value("age"), Value::Int(9));
        assert_eq!(fetched.get("email"), None);
        assert_eq!(fetched.get_value("id"), Value::Int(3));
    }

    #[tokio::test]
    async fn bad_arity_is_checked_before_the_store() {
        let backend = backend();
        let err = backend
            .retrieve("users", &Id::composite([Value::Int(1), Value::Int(2)]), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadArity { expected: 1, actual: 2, .. }));
    }

    #[tokio::test]
    async fn query_filters_sorts_and_pages() {
        let backend = backend();
        let mut set = RecordSet::from_records(
            (1..=9)
                .map(|i| {
                    Record::anonymous()
                        .with_field("email", format!("u{i}@x.y"))
                        .with_field("age", 20 + i)
                })
                .collect(),
        );
        backend.insert("users", &mut set).await.unwrap();

        let indexer = backend.with_search("users").unwrap();
        let filter = Filter::parse("age/gte:25/sort/-age/limit/3").unwrap();
        let results = indexer.query("users", &filter).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results.result_count, 5);
        assert_eq!(results.records[0].get_value("age"), Value::Int(29));
        assert_eq!(results.records[2].get_value("age"), Value::Int(27));
    }

    #[tokio::test]
    async fn query_by_identity_alias() {
        let backend = backend();
        backend
            .insert("users", &mut RecordSet::from(Record::new(4i64).with_field("email", "z@z.z")))
            .await
            .unwrap();
        let indexer = backend.with_search("users").unwrap();
        let results = indexer
            .query("users", &Filter::parse("id/4").unwrap())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn list_values_returns_distinct() {
        let backend = backend();
        let mut set = RecordSet::from_records(vec![
            Record::anonymous().with_field("email", "a@x.y").with_field("age", 30),
            Record::anonymous().with_field("email", "b@x.y").with_field("age", 30),
            Record::anonymous().with_field("email", "c@x.y").with_field("age", 40),
        ]);
        backend.insert("users", &mut set).await.unwrap();
        let indexer = backend.with_search("users").unwrap();
        let values = indexer
            .list_values("users", &["age".to_string()], &Filter::all())
            .await
            .unwrap();
        assert_eq!(values["age"], vec![Value::Int(30), Value::Int(40)]);
    }

    #[tokio::test]
    async fn aggregates_over_filtered_records() {
        let backend = backend();
        let mut set = RecordSet::from_records(vec![
            Record::anonymous().with_field("email", "a@x.y").with_field("age", 10),
            Record::anonymous().with_field("email", "b@x.y").with_field("age", 20),
            Record::anonymous().with_field("email", "c@x.y").with_field("age", 30),
        ]);
        backend.insert("users", &mut set).await.unwrap();
        let aggregator = backend.with_aggregator("users").unwrap();
        assert_eq!(aggregator.sum("users", "age", &Filter::all()).await.unwrap(), 60.0);
        assert_eq!(aggregator.minimum("users", "age", &Filter::all()).await.unwrap(), 10.0);
        assert_eq!(aggregator.maximum("users", "age", &Filter::all()).await.unwrap(), 30.0);
        assert_eq!(aggregator.average("users", "age", &Filter::all()).await.unwrap(), 20.0);
        assert_eq!(aggregator.count("users", &Filter::all()).await.unwrap(), 3);
        assert_eq!(
            aggregator
                .count("users", &Filter::parse("age/gt:10").unwrap())
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn group_by_produces_rows() {
        let backend = backend();
        let mut set = RecordSet::from_records(vec![
            Record::anonymous().with_field("email", "a@x.y").with_field("age", 30),
            Record::anonymous().with_field("email", "b@x.y").with_field("age", 30),
            Record::anonymous().with_field("email", "c@x.y").with_field("age", 40),
        ]);
        backend.insert("users", &mut set).await.unwrap();
        let aggregator = backend.with_aggregator("users").unwrap();
        let rows = aggregator
            .group_by(
                "users",
                &["age".to_string()],
                &[Aggregate::new(Aggregation::Count, "email")],
                &Filter::all(),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let thirty = rows
            .iter()
            .find(|r| r.get_value("age") == Value::Int(30))
            .unwrap();
        assert_eq!(thirty.get_value("count_email"), Value::Int(2));
    }

    #[tokio::test]
    async fn ttl_writes_of_expired_records_are_noops() {
        let sessions = Collection::new("sessions")
            .with_field(Field::identity("id", Kind::String))
            .with_time_to_live(Duration::from_secs(60));
        let backend = MemoryBackend::with_dsn(ConnectionString::parse("memory://").unwrap());
        backend.register_collection(sessions);

        let mut expired = Record::new("s1");
        expired.set(
            crate::schema::collection::EXPIRES_AT_FIELD,
            Value::Time(chrono::Utc::now() - chrono::Duration::seconds(10)),
        );
        backend
            .insert("sessions", &mut RecordSet::from(expired))
            .await
            .unwrap();
        assert!(!backend.exists("sessions", &Id::from("s1")).await);
    }

    #[tokio::test]
    async fn expired_records_read_as_missing() {
        let sessions = Collection::new("sessions")
            .with_field(Field::identity("id", Kind::String))
            .with_time_to_live(Duration::from_millis(50));
        let backend = MemoryBackend::with_dsn(ConnectionString::parse("memory://").unwrap());
        backend.register_collection(sessions);

        backend
            .insert("sessions", &mut RecordSet::from(Record::new("s2")))
            .await
            .unwrap();
        assert!(backend.exists("sessions", &Id::from("s2")).await);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!backend.exists("sessions", &Id::from("s2")).await);
        let err = backend.retrieve("sessions", &Id::from("s2"), &[]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn composite_keys_round_trip() {
        let sessions = Collection::new("sessions")
            .with_field(Field::identity("user", Kind::String))
            .with_field(Field::new("device", Kind::String).key())
            .with_field(Field::new("token", Kind::String));
        let backend = MemoryBackend::with_dsn(ConnectionString::parse("memory://").unwrap());
        backend.register_collection(sessions);

        let mut set = RecordSet::from(
            Record::anonymous()
                .with_field("user", "u1")
                .with_field("device", "d1")
                .with_field("token", "t"),
        );
        backend.insert("sessions", &mut set).await.unwrap();

        let id = Id::composite(["u1", "d1"]);
        assert!(backend.exists("sessions", &id).await);
        let fetched = backend.retrieve("sessions", &id, &[]).await.unwrap();
        assert_eq!(fetched.get_value("token"), Value::from("t"));

        let err = backend.retrieve("sessions", &Id::from("u1"), &[]).await.unwrap_err();
        assert!(matches!(err, Error::BadArity { .. }));

        backend.delete("sessions", &[id.clone()]).await.unwrap();
        assert!(!backend.exists("sessions", &id).await);
    }

    #[tokio::test]
    async fn delete_constraints_restrict_and_cascade() {
        use crate::schema::collection::{Constraint, DeletePolicy};
        let backend = MemoryBackend::with_dsn(ConnectionString::parse("memory://").unwrap());
        backend.register_collection(users());
        backend.register_collection(
            Collection::new("posts")
                .with_field(Field::identity("id", Kind::Int))
                .with_field(Field::new("author_id", Kind::Int))
                .with_constraint(Constraint {
                    collection: "users".to_string(),
                    field: "author_id".to_string(),
                    related_field: None,
                    on_delete: DeletePolicy::Restrict,
                }),
        );

        backend
            .insert("users", &mut RecordSet::from(Record::new(1i64).with_field("email", "a@b.c")))
            .await
            .unwrap();
        backend
            .insert(
                "posts",
                &mut RecordSet::from(Record::new(10i64).with_field("author_id", 1)),
            )
            .await
            .unwrap();

        // Restrict refuses while a post references the user.
        let err = backend.delete("users", &[Id::from(1)]).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(backend.exists("users", &Id::from(1)).await);

        // Switch the policy to cascade and try again.
        let mut posts = backend.get_collection("posts").unwrap();
        posts.constraints[0].on_delete = DeletePolicy::Cascade;
        backend.register_collection(posts);
        backend.delete("users", &[Id::from(1)]).await.unwrap();
        assert!(!backend.exists("users", &Id::from(1)).await);
        assert!(!backend.exists("posts", &Id::from(10)).await);
    }
}
