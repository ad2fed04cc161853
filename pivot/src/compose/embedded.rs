//! Embedded-record (relationship) inflation.
//!
//! Wraps a backend so that after every successful read, each declared
//! relationship is resolved and inlined into the owning record: `belongs_to`
//! through a `retrieve`, `has_many` through a query. A per-call deferred
//! cache keyed by `(collection, key)` means N records sharing a parent fetch
//! it exactly once. Traversal is bounded by a depth limit, and relations
//! back into the root collection degrade to a `{collection, id}` placeholder
//! instead of expanding.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::backend::{Aggregator, Backend, Feature, Indexer, QueryResultFn};
use crate::dsn::ConnectionString;
use crate::errors::Result;
use crate::filter::{Criterion, Filter, Operator};
use crate::schema::collection::{Collection, Relationship};
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::Value;

/// Default traversal depth: direct relations inflate, their relations don't.
pub const DEFAULT_MAX_DEPTH: usize = 1;

/// Per-call lookup cache. `None` records a confirmed miss so it is not
/// retried within the call.
#[derive(Default)]
struct InflateCache {
    single: HashMap<(String, String), Option<Record>>,
    many: HashMap<(String, String), Vec<Record>>,
}

pub struct EmbeddedRecordBackend {
    inner: Arc<dyn Backend>,
    max_depth: usize,
    allow_root_reentry: bool,
    self_ref: Weak<EmbeddedRecordBackend>,
    indexer: RwLock<Option<Arc<InflatingIndexer>>>,
}

impl EmbeddedRecordBackend {
    pub fn wrap(inner: Arc<dyn Backend>) -> Arc<EmbeddedRecordBackend> {
        EmbeddedRecordBackend::with_depth(inner, DEFAULT_MAX_DEPTH, false)
    }

    pub fn with_depth(
        inner: Arc<dyn Backend>,
        max_depth: usize,
        allow_root_reentry: bool,
    ) -> Arc<EmbeddedRecordBackend> {
        Arc::new_cyclic(|weak| EmbeddedRecordBackend {
            inner,
            max_depth,
            allow_root_reentry,
            self_ref: weak.clone(),
            indexer: RwLock::new(None),
        })
    }

    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    fn own_indexer(&self) -> Option<Arc<InflatingIndexer>> {
        if let Some(indexer) = self.indexer.read().unwrap().as_ref() {
            return Some(Arc::clone(indexer));
        }
        let backend = self.self_ref.upgrade()?;
        let mut slot = self.indexer.write().unwrap();
        Some(
            slot.get_or_insert_with(|| Arc::new(InflatingIndexer { backend }))
                .clone(),
        )
    }

    /// Remove relationship fields before a write so inflated copies never
    /// persist.
    fn deflate(&self, collection: &str, records: &mut RecordSet) {
        if let Ok(schema) = self.inner.get_collection(collection) {
            for record in &mut records.records {
                for relationship in &schema.relationships {
                    record.fields.remove(&relationship.field);
                }
            }
        }
    }

    async fn inflate_set(&self, collection: &str, records: &mut [Record]) -> Result<()> {
        let Ok(schema) = self.inner.get_collection(collection) else {
            return Ok(());
        };
        if schema.relationships.is_empty() {
            return Ok(());
        }
        let mut cache = InflateCache::default();
        for record in records {
            inflate(
                &self.inner,
                collection,
                &schema,
                record,
                0,
                self.max_depth,
                self.allow_root_reentry,
                &mut cache,
            )
            .await?;
        }
        Ok(())
    }
}

fn placeholder(relationship: &Relationship, key: &Value) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert("collection".to_string(), Value::from(relationship.collection.as_str()));
    fields.insert("id".to_string(), key.clone());
    Value::Object(fields)
}

/// Recursive inflation step; boxed because relations nest.
#[allow(clippy::too_many_arguments)]
fn inflate<'a>(
    inner: &'a Arc<dyn Backend>,
    root: &'a str,
    schema: &'a Collection,
    record: &'a mut Record,
    depth: usize,
    max_depth: usize,
    allow_root_reentry: bool,
    cache: &'a mut InflateCache,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for relationship in &schema.relationships {
            if relationship.many {
                inflate_many(inner, schema, record, relationship, cache).await?;
                continue;
            }

            let key = record.get_value(&relationship.via);
            if key.is_null() {
                continue;
            }
            // A relation back into the root degrades to a placeholder
            // rather than expanding a cycle.
            if relationship.collection == root && !allow_root_reentry {
                record.set(&relationship.field, placeholder(relationship, &key));
                continue;
            }

            let cache_key = (relationship.collection.clone(), key.to_display_string());
            let related = match cache.single.get(&cache_key) {
                Some(hit) => hit.clone(),
                None => {
                    let fetched = match inner
                        .retrieve(&relationship.collection, &Id::from(key.clone()), &[])
                        .await
                    {
                        Ok(related) => Some(related),
                        Err(err) if err.is_not_found() => None,
                        Err(err) => return Err(err),
                    };
                    cache.single.insert(cache_key, fetched.clone());
                    fetched
                }
            };

            match related {
                Some(mut related) => {
                    if depth + 1 < max_depth
                        && let Ok(related_schema) = inner.get_collection(&relationship.collection)
                    {
                        inflate(
                            inner,
                            root,
                            &related_schema,
                            &mut related,
                            depth + 1,
                            max_depth,
                            allow_root_reentry,
                            cache,
                        )
                        .await?;
                    }
                    record.set(&relationship.field, Value::Object(related.fields));
                }
                None => {
                    record.set(&relationship.field, placeholder(relationship, &key));
                }
            }
        }
        Ok(())
    })
}

async fn inflate_many(
    inner: &Arc<dyn Backend>,
    schema: &Collection,
    record: &mut Record,
    relationship: &Relationship,
    cache: &mut InflateCache,
) -> Result<()> {
    let key = record
        .get(&schema.identity_field)
        .cloned()
        .or_else(|| record.id.first().cloned());
    let Some(key) = key else {
        return Ok(());
    };

    let cache_key = (
        relationship.collection.clone(),
        format!("{}={}", relationship.via, key.to_display_string()),
    );
    let related = match cache.many.get(&cache_key) {
        Some(hit) => hit.clone(),
        None => {
            let Some(indexer) = inner.with_search(&relationship.collection) else {
                return Ok(());
            };
            let filter = Filter::new().add(Criterion::new(
                relationship.via.as_str(),
                Operator::Is,
                vec![key.clone()],
            ));
            let results = indexer.query(&relationship.collection, &filter).await?;
            let records: Vec<Record> = results.records;
            cache.many.insert(cache_key, records.clone());
            records
        }
    };

    let items: Vec<Value> = related.into_iter().map(|r| Value::Object(r.fields)).collect();
    record.set(&relationship.field, Value::Array(items));
    Ok(())
}

#[async_trait]
impl Backend for EmbeddedRecordBackend {
    fn connection_string(&self) -> &ConnectionString {
        self.inner.connection_string()
    }

    fn label(&self) -> String {
        format!("embedded({})", self.inner.label())
    }

    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    async fn set_indexer(&self, dsn: ConnectionString) -> Result<()> {
        self.inner.set_indexer(dsn).await
    }

    fn register_collection(&self, collection: Collection) {
        self.inner.register_collection(collection)
    }

    fn get_collection(&self, name: &str) -> Result<Collection> {
        self.inner.get_collection(name)
    }

    fn list_collections(&self) -> Vec<String> {
        self.inner.list_collections()
    }

    async fn create_collection(&self, definition: Collection) -> Result<()> {
        self.inner.create_collection(definition).await
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.inner.delete_collection(name).await
    }

    async fn exists(&self, collection: &str, id: &Id) -> bool {
        self.inner.exists(collection, id).await
    }

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record> {
        let mut record = self.inner.retrieve(collection, id, fields).await?;
        self.inflate_set(collection, std::slice::from_mut(&mut record)).await?;
        Ok(record)
    }

    async fn insert(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        self.deflate(collection, records);
        self.inner.insert(collection, records).await
    }

    async fn update(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        self.deflate(collection, records);
        self.inner.update(collection, records).await
    }

    async fn delete(&self, collection: &str, ids: &[Id]) -> Result<()> {
        self.inner.delete(collection, ids).await
    }

    fn with_search(&self, _collection: &str) -> Option<Arc<dyn Indexer>> {
        self.own_indexer().map(|indexer| indexer as Arc<dyn Indexer>)
    }

    fn with_aggregator(&self, collection: &str) -> Option<Arc<dyn Aggregator>> {
        self.inner.with_aggregator(collection)
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        self.inner.ping(timeout).await
    }

    fn supports(&self, features: &[Feature]) -> bool {
        self.inner.supports(features)
    }
}

/// Indexer wrapper that inflates every query hit; one deferred cache spans
/// the whole materialised query.
pub struct InflatingIndexer {
    backend: Arc<EmbeddedRecordBackend>,
}

#[async_trait]
impl Indexer for InflatingIndexer {
    fn index_connection_string(&self) -> &ConnectionString {
        self.backend.inner.connection_string()
    }

    async fn index_initialize(&self, parent: Arc<dyn Backend>) -> Result<()> {
        match self.backend.inner.with_search("") {
            Some(indexer) => indexer.index_initialize(parent).await,
            None => Ok(()),
        }
    }

    fn parent(&self) -> Option<Arc<dyn Backend>> {
        self.backend
            .self_ref
            .upgrade()
            .map(|arc| arc as Arc<dyn Backend>)
    }

    async fn index_exists(&self, collection: &str, id: &Id) -> bool {
        match self.backend.inner.with_search(collection) {
            Some(indexer) => indexer.index_exists(collection, id).await,
            None => false,
        }
    }

    async fn index_retrieve(&self, collection: &str, id: &Id) -> Result<Record> {
        let indexer = self.inner_indexer(collection)?;
        indexer.index_retrieve(collection, id).await
    }

    async fn index_remove(&self, collection: &str, ids: &[Id]) -> Result<()> {
        let indexer = self.inner_indexer(collection)?;
        indexer.index_remove(collection, ids).await
    }

    async fn index(&self, collection: &str, records: &RecordSet) -> Result<()> {
        let indexer = self.inner_indexer(collection)?;
        indexer.index(collection, records).await
    }

    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        // Materialise, inflate under one shared cache, then stream.
        let results = self.query(collection, filter).await?;
        let page = crate::backend::QueryPage {
            page: results.page,
            total_pages: results.total_pages,
            per_page: results.records_per_page,
            total_results: results.result_count,
            offset: 0,
        };
        for record in results {
            each(record, &page)?;
        }
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<RecordSet> {
        let indexer = self.inner_indexer(collection)?;
        let mut results = indexer.query(collection, filter).await?;
        self.backend
            .inflate_set(collection, &mut results.records)
            .await?;
        Ok(results)
    }

    async fn list_values(
        &self,
        collection: &str,
        fields: &[String],
        filter: &Filter,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let indexer = self.inner_indexer(collection)?;
        indexer.list_values(collection, fields, filter).await
    }

    async fn delete_query(&self, collection: &str, filter: &Filter) -> Result<()> {
        let indexer = self.inner_indexer(collection)?;
        indexer.delete_query(collection, filter).await
    }

    async fn flush_index(&self) -> Result<()> {
        match self.backend.inner.with_search("") {
            Some(indexer) => indexer.flush_index().await,
            None => Ok(()),
        }
    }
}

impl InflatingIndexer {
    fn inner_indexer(&self, collection: &str) -> Result<Arc<dyn Indexer>> {
        self.backend
            .inner
            .with_search(collection)
            .ok_or_else(|| crate::errors::Error::not_implemented(self.backend.label(), "search"))
    }
}
