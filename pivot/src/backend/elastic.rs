//! Elasticsearch backend and indexer over the [`ElasticTransport`] adapter
//! contract.
//!
//! One index per collection; the document `_id` is the composite key joined
//! with the configured separator. Writes funnel through a mutex-guarded
//! deferred bulk batch that drains on size, elapsed interval, or an explicit
//! flush; queries beyond the bounded result window switch transparently to
//! the scroll API.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use crate::backend::{
    Aggregator, Backend, Feature, Indexer, QueryPage, QueryResultFn, enforce_delete_constraints,
    with_timeout,
};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Filter};
use crate::generator::elastic::ElasticGenerator;
use crate::generator::{render, render_aggregate};
use crate::schema::collection::Collection;
use crate::schema::field::Operation;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::{Kind, Value};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PAGE_SIZE: usize = 1000;
/// The engine's bounded-result cap; larger requests scroll.
const DEFAULT_MAX_WINDOW: usize = 10_000;
const DEFAULT_ID_SEPARATOR: &str = ":";
const SCROLL_KEEPALIVE: &str = "1m";

/// The wire seam. Implementations own the HTTP client, TLS, and auth; both
/// calls must release their connection on every exit path.
#[async_trait]
pub trait ElasticTransport: Send + Sync {
    /// A JSON request against the cluster; `path` starts with `/`.
    async fn request(&self, method: &str, path: &str, body: Option<JsonValue>) -> Result<JsonValue>;

    /// An NDJSON `_bulk` request: alternating action and document lines.
    /// Implementations should request `refresh=wait_for` so flushed writes
    /// are visible to subsequent queries.
    async fn bulk(&self, lines: Vec<JsonValue>) -> Result<JsonValue>;
}

struct DeferredBatch {
    lines: Vec<JsonValue>,
    pending_ops: usize,
    last_flush: Instant,
}

pub struct ElasticBackend {
    dsn: ConnectionString,
    transport: Arc<dyn ElasticTransport>,
    call_timeout: Duration,
    batch_size: usize,
    flush_interval: Duration,
    page_size: usize,
    max_window: usize,
    id_separator: String,
    collections: RwLock<HashMap<String, Collection>>,
    batch: Mutex<DeferredBatch>,
    self_ref: Weak<ElasticBackend>,
    indexer: RwLock<Option<Arc<ElasticIndexer>>>,
}

impl ElasticBackend {
    pub fn new(dsn: ConnectionString, transport: Arc<dyn ElasticTransport>) -> Arc<ElasticBackend> {
        let call_timeout = dsn.opt_duration("callTimeout", DEFAULT_CALL_TIMEOUT);
        let batch_size = dsn.opt_int("flushBatchSize", DEFAULT_BATCH_SIZE as i64).max(1) as usize;
        let flush_interval = dsn.opt_duration("flushInterval", DEFAULT_FLUSH_INTERVAL);
        let page_size = dsn.opt_int("pageSize", DEFAULT_PAGE_SIZE as i64).max(1) as usize;
        let max_window = dsn.opt_int("maxResultWindow", DEFAULT_MAX_WINDOW as i64).max(1) as usize;
        let id_separator = dsn.opt_str("separator", DEFAULT_ID_SEPARATOR);
        Arc::new_cyclic(|weak| ElasticBackend {
            dsn,
            transport,
            call_timeout,
            batch_size,
            flush_interval,
            page_size,
            max_window,
            id_separator,
            collections: RwLock::new(HashMap::new()),
            batch: Mutex::new(DeferredBatch {
                lines: Vec::new(),
                pending_ops: 0,
                last_flush: Instant::now(),
            }),
            self_ref: weak.clone(),
            indexer: RwLock::new(None),
        })
    }

    fn self_arc(&self) -> Option<Arc<dyn Backend>> {
        self.self_ref.upgrade().map(|arc| arc as Arc<dyn Backend>)
    }

    fn schema(&self, name: &str) -> Result<Collection> {
        self.collections
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound {
                name: name.to_string(),
            })
    }

    fn index_for(&self, collection: &str) -> String {
        self.schema(collection)
            .map(|c| c.index_name().to_string())
            .unwrap_or_else(|_| collection.to_string())
    }

    fn doc_id(&self, id: &Id) -> String {
        id.to_key(&self.id_separator)
    }

    fn doc_path(&self, collection: &str, id: &Id) -> String {
        format!("/{}/_doc/{}", self.index_for(collection), self.doc_id(id))
    }

    fn record_from_hit(&self, schema: &Collection, hit: &JsonValue) -> Result<Record> {
        let mut record = Record::anonymous();
        if let Some(source) = hit.get("_source") {
            record.fields = match Value::from_json(source.clone()) {
                Value::Object(map) => map,
                _ => BTreeMap::new(),
            };
        }
        record.id = schema.record_id(&record)?;
        if record.id.is_empty()
            && let Some(doc_id) = hit.get("_id").and_then(JsonValue::as_str)
        {
            record.id = Id::composite(
                doc_id
                    .split(self.id_separator.as_str())
                    .map(crate::value::autotype),
            );
        }
        Ok(record)
    }

    /// Enqueue bulk lines; drains under the same lock discipline when the
    /// batch crosses its size threshold or its flush interval has elapsed.
    async fn enqueue(&self, action: JsonValue, document: Option<JsonValue>) -> Result<()> {
        let should_flush = {
            let mut batch = self.batch.lock().unwrap();
            batch.lines.push(action);
            if let Some(document) = document {
                batch.lines.push(document);
            }
            batch.pending_ops += 1;
            batch.pending_ops >= self.batch_size || batch.last_flush.elapsed() >= self.flush_interval
        };
        if should_flush {
            self.flush_batch().await?;
        }
        Ok(())
    }

    /// Drain the deferred batch into one `_bulk` request. Per-item errors
    /// are collected in order: the first is returned, the rest are logged
    /// inside the joined multi-error.
    async fn flush_batch(&self) -> Result<()> {
        let lines = {
            let mut batch = self.batch.lock().unwrap();
            batch.last_flush = Instant::now();
            batch.pending_ops = 0;
            std::mem::take(&mut batch.lines)
        };
        if lines.is_empty() {
            return Ok(());
        }
        debug!(lines = lines.len(), "flushing deferred bulk batch");
        let response = with_timeout(&self.label(), self.call_timeout, self.transport.bulk(lines)).await?;
        if response.get("errors").and_then(JsonValue::as_bool).unwrap_or(false) {
            let mut errors = Vec::new();
            for item in response
                .get("items")
                .and_then(JsonValue::as_array)
                .into_iter()
                .flatten()
            {
                let op = item
                    .as_object()
                    .and_then(|map| map.values().next())
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                if let Some(reason) = op.get("error").map(|e| e.to_string()) {
                    warn!(error = %reason, "bulk item failed");
                    errors.push(Error::internal(format!("{}: bulk item failed: {reason}", self.label())));
                }
            }
            return Error::join(errors);
        }
        Ok(())
    }

    async fn doc_exists(&self, collection: &str, id: &Id) -> Result<bool> {
        let path = self.doc_path(collection, id);
        let response = with_timeout(
            &self.label(),
            self.call_timeout,
            self.transport.request("GET", &path, None),
        )
        .await?;
        Ok(response.get("found").and_then(JsonValue::as_bool).unwrap_or(false))
    }

    fn mapping_type(kind: Kind) -> &'static str {
        match kind {
            Kind::String => "keyword",
            Kind::Bool => "boolean",
            Kind::Int => "long",
            Kind::Float => "double",
            Kind::Time => "date",
            Kind::Object => "object",
            Kind::Array => "object",
            Kind::Raw => "binary",
        }
    }

    fn own_indexer(&self) -> Arc<ElasticIndexer> {
        if let Some(indexer) = self.indexer.read().unwrap().as_ref() {
            return Arc::clone(indexer);
        }
        let mut slot = self.indexer.write().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(ElasticIndexer {
                dsn: self.dsn.clone(),
                backend: self.self_ref.clone(),
                parent: RwLock::new(self.self_arc()),
            })
        })
        .clone()
    }
}

#[async_trait]
impl Backend for ElasticBackend {
    fn connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn initialize(&self) -> Result<()> {
        self.ping(self.call_timeout).await?;
        if self.dsn.opt_bool("autoregister", false) {
            let response = with_timeout(
                &self.label(),
                self.call_timeout,
                self.transport.request("GET", "/_cat/indices?format=json", None),
            )
            .await?;
            for entry in response.as_array().into_iter().flatten() {
                if let Some(name) = entry.get("index").and_then(JsonValue::as_str)
                    && !name.starts_with('.')
                    && self.schema(name).is_err()
                {
                    debug!(index = %name, "autoregistered index");
                    self.register_collection(Collection::new(name));
                }
            }
        }
        Ok(())
    }

    async fn set_indexer(&self, _dsn: ConnectionString) -> Result<()> {
        // This backend is itself a search engine; it has no separate
        // indexer to route to.
        Err(Error::not_implemented(self.label(), "set_indexer"))
    }

    fn register_collection(&self, collection: Collection) {
        self.collections
            .write()
            .unwrap()
            .insert(collection.name.clone(), collection);
    }

    fn get_collection(&self, name: &str) -> Result<Collection> {
        self.schema(name)
    }

    fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    async fn create_collection(&self, definition: Collection) -> Result<()> {
        let mut properties = serde_json::Map::new();
        for field in &definition.fields {
            properties.insert(
                field.name.clone(),
                json!({ "type": ElasticBackend::mapping_type(field.kind) }),
            );
        }
        let body = json!({ "mappings": { "properties": JsonValue::Object(properties) } });
        let path = format!("/{}", definition.index_name());
        with_timeout(
            &self.label(),
            self.call_timeout,
            self.transport.request("PUT", &path, Some(body)),
        )
        .await?;
        self.register_collection(definition);
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let path = format!("/{}", self.index_for(name));
        with_timeout(
            &self.label(),
            self.call_timeout,
            self.transport.request("DELETE", &path, None),
        )
        .await?;
        self.collections.write().unwrap().remove(name);
        Ok(())
    }

    async fn exists(&self, collection: &str, id: &Id) -> bool {
        let Ok(schema) = self.schema(collection) else {
            return false;
        };
        if id.len() != schema.key_count() {
            return false;
        }
        if self.flush_batch().await.is_err() {
            return false;
        }
        self.doc_exists(collection, id).await.unwrap_or(false)
    }

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record> {
        let schema = self.schema(collection)?;
        id.check_arity(&schema)?;
        // Reads observe deferred writes.
        self.flush_batch().await?;
        let path = self.doc_path(collection, id);
        let response = with_timeout(
            &self.label(),
            self.call_timeout,
            self.transport.request("GET", &path, None),
        )
        .await?;
        if !response.get("found").and_then(JsonValue::as_bool).unwrap_or(false) {
            return Err(Error::record_not_found(collection, id));
        }
        let mut record = self.record_from_hit(&schema, &response)?;
        if record.id.is_empty() {
            record.id = id.clone();
        }
        if schema.is_expired(&record) {
            return Err(Error::record_not_found(collection, id));
        }
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
        let schema = self.schema(collection)?;
        let index = self.index_for(collection);
        for record in &mut records.records {
            let mut made = schema.make_record(record, Operation::Create)?;
            if schema.is_expired(&made) {
                continue;
            }
            if made.id.is_empty() {
                let value =
                    crate::schema::formatters::generate_encoded_uuid(Value::Null, Operation::Create)?;
                made.set(&schema.identity_field, value.coerce(schema.identity_field_type).unwrap_or(value));
                made.id = schema.record_id(&made)?;
            } else if self.doc_exists(collection, &made.id).await? {
                return Err(Error::conflict(
                    collection,
                    format!("record {} already exists", made.id),
                ));
            }
            made.id.check_arity(&schema)?;
            let action = json!({ "index": { "_index": index, "_id": self.doc_id(&made.id) } });
            let document = Value::Object(made.fields.clone()).to_json();
            self.enqueue(action, Some(document)).await?;
            record.id = made.id.clone();
            record.set(&schema.identity_field, made.get_value(&schema.identity_field));
        }
        Ok(())
    }

    async fn update(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        let schema = self.schema(collection)?;
        let index = self.index_for(collection);
        for record in &mut records.records {
            let made = schema.make_record(record, Operation::Update)?;
            if schema.is_expired(&made) {
                continue;
            }
            made.id.check_arity(&schema)?;
            self.flush_batch().await?;
            if !self.doc_exists(collection, &made.id).await? {
                return Err(Error::record_not_found(collection, &made.id));
            }
            let action = json!({ "index": { "_index": index, "_id": self.doc_id(&made.id) } });
            let document = Value::Object(made.fields.clone()).to_json();
            self.enqueue(action, Some(document)).await?;
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[Id]) -> Result<()> {
        let schema = self.schema(collection)?;
        for id in ids {
            id.check_arity(&schema)?;
        }
        if let Some(backend) = self.self_arc() {
            enforce_delete_constraints(backend, collection, ids).await?;
        }
        self.flush_batch().await?;
        for id in ids {
            let path = self.doc_path(collection, id);
            // A missing document is a no-op, matching the other drivers.
            let _ = with_timeout(
                &self.label(),
                self.call_timeout,
                self.transport.request("DELETE", &path, None),
            )
            .await?;
        }
        Ok(())
    }

    fn with_search(&self, _collection: &str) -> Option<Arc<dyn Indexer>> {
        Some(self.own_indexer())
    }

    fn with_aggregator(&self, _collection: &str) -> Option<Arc<dyn Aggregator>> {
        Some(Arc::new(ElasticAggregator {
            backend: self.self_ref.clone(),
        }))
    }

    async fn flush(&self) -> Result<()> {
        self.flush_batch().await
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        with_timeout(&self.label(), timeout.min(self.call_timeout), async {
            self.transport.request("GET", "/", None).await.map(|_| ())
        })
        .await
    }

    fn supports(&self, features: &[Feature]) -> bool {
        features
            .iter()
            .all(|f| matches!(f, Feature::PartialSearch | Feature::CompositeKeys))
    }
}

pub struct ElasticIndexer {
    dsn: ConnectionString,
    backend: Weak<ElasticBackend>,
    parent: RwLock<Option<Arc<dyn Backend>>>,
}

impl ElasticIndexer {
    fn owner(&self) -> Result<Arc<ElasticBackend>> {
        self.backend
            .upgrade()
            .ok_or_else(|| Error::internal("elasticsearch backend has been dropped"))
    }

    fn total_of(response: &JsonValue) -> u64 {
        let total = &response["hits"]["total"];
        total["value"]
            .as_u64()
            .or_else(|| total.as_u64())
            .unwrap_or(0)
    }

    fn hits_of(response: &JsonValue) -> &[JsonValue] {
        response["hits"]["hits"].as_array().map(Vec::as_slice).unwrap_or(&[])
    }
}

#[async_trait]
impl Indexer for ElasticIndexer {
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
        match self.owner() {
            Ok(owner) => owner.exists(collection, id).await,
            Err(_) => false,
        }
    }

    async fn index_retrieve(&self, collection: &str, id: &Id) -> Result<Record> {
        self.owner()?.retrieve(collection, id, &[]).await
    }

    async fn index_remove(&self, collection: &str, ids: &[Id]) -> Result<()> {
        let owner = self.owner()?;
        let index = owner.index_for(collection);
        for id in ids {
            let action = json!({ "delete": { "_index": index, "_id": owner.doc_id(id) } });
            owner.enqueue(action, None).await?;
        }
        Ok(())
    }

    async fn index(&self, collection: &str, records: &RecordSet) -> Result<()> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        if schema.skip_index_persistence {
            return Ok(());
        }
        let index = owner.index_for(collection);
        for record in records.iter() {
            let action = json!({ "index": { "_index": index, "_id": owner.doc_id(&record.id) } });
            let document = Value::Object(record.fields.clone()).to_json();
            owner.enqueue(action, Some(document)).await?;
        }
        Ok(())
    }

    /// Search, switching to the scroll API when the request would exceed
    /// the bounded result window. Hits stream in sort order with
    /// non-overlapping increasing offsets.
    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        owner.flush_batch().await?;

        let index = owner.index_for(collection);
        let wanted = filter.limit;
        let needs_scroll = wanted.map(|n| n > owner.max_window).unwrap_or(true);

        if !needs_scroll {
            let mut generator = ElasticGenerator::new();
            let body = render(&mut generator, collection, &filter)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| Error::internal(err.to_string())))?;
            let path = format!("/{index}/_search");
            let response = with_timeout(
                &owner.label(),
                owner.call_timeout,
                owner.transport.request("POST", &path, Some(body)),
            )
            .await?;
            let total = ElasticIndexer::total_of(&response);
            let hits = ElasticIndexer::hits_of(&response);
            let per_page = wanted.unwrap_or(hits.len().max(1));
            let page = QueryPage {
                page: filter.offset / per_page.max(1) + 1,
                total_pages: (total as usize).div_ceil(per_page.max(1)),
                per_page,
                total_results: total,
                offset: filter.offset,
            };
            for hit in hits {
                each(owner.record_from_hit(&schema, hit)?, &page)?;
            }
            return Ok(());
        }

        // Scroll path: page_size-bounded batches under a keepalive cursor.
        let batch = owner.page_size.min(owner.max_window);
        let mut scroll_filter = filter.clone();
        scroll_filter.limit = Some(batch);
        scroll_filter.offset = 0;
        let mut generator = ElasticGenerator::new();
        let body = render(&mut generator, collection, &scroll_filter)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| Error::internal(err.to_string())))?;
        let path = format!("/{index}/_search?scroll={SCROLL_KEEPALIVE}");
        let mut response = with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.transport.request("POST", &path, Some(body)),
        )
        .await?;

        let total = ElasticIndexer::total_of(&response);
        let total_pages = (total as usize).div_ceil(batch);
        let mut delivered: u64 = 0;
        let mut page_no = 1;
        let mut scroll_id = response["_scroll_id"].as_str().map(str::to_string);

        loop {
            let hits = ElasticIndexer::hits_of(&response).to_vec();
            if hits.is_empty() {
                break;
            }
            let page = QueryPage {
                page: page_no,
                total_pages: total_pages.max(1),
                per_page: batch,
                total_results: total,
                offset: delivered as usize,
            };
            for hit in &hits {
                each(owner.record_from_hit(&schema, hit)?, &page)?;
                delivered += 1;
                if let Some(limit) = wanted
                    && delivered >= limit as u64
                {
                    break;
                }
            }
            if wanted.map(|limit| delivered >= limit as u64).unwrap_or(false) || delivered >= total {
                break;
            }
            let Some(current) = scroll_id.clone() else {
                break;
            };
            response = with_timeout(
                &owner.label(),
                owner.call_timeout,
                owner.transport.request(
                    "POST",
                    "/_search/scroll",
                    Some(json!({ "scroll": SCROLL_KEEPALIVE, "scroll_id": current })),
                ),
            )
            .await?;
            scroll_id = response["_scroll_id"].as_str().map(str::to_string).or(scroll_id);
            page_no += 1;
        }

        if let Some(current) = scroll_id {
            // Cursor cleanup failures are harmless; the keepalive reaps it.
            let _ = owner
                .transport
                .request("DELETE", "/_search/scroll", Some(json!({ "scroll_id": current })))
                .await;
        }
        Ok(())
    }

    async fn list_values(
        &self,
        collection: &str,
        fields: &[String],
        filter: &Filter,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        owner.flush_batch().await?;

        let mut generator = ElasticGenerator::new();
        let mut body: JsonValue = render(&mut generator, collection, &filter)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| Error::internal(err.to_string())))?;
        let mut aggs = serde_json::Map::new();
        for field in fields {
            aggs.insert(
                format!("values_{field}"),
                json!({ "terms": { "field": field, "size": owner.max_window } }),
            );
        }
        body["aggs"] = JsonValue::Object(aggs);
        body["size"] = json!(0);

        let path = format!("/{}/_search", owner.index_for(collection));
        let response = with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.transport.request("POST", &path, Some(body)),
        )
        .await?;

        let mut out = BTreeMap::new();
        for field in fields {
            let buckets = response["aggregations"][&format!("values_{field}")]["buckets"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let values: Vec<Value> = buckets
                .into_iter()
                .filter_map(|bucket| bucket.get("key").cloned())
                .map(Value::from_json)
                .collect();
            out.insert(field.clone(), values);
        }
        Ok(out)
    }

    async fn delete_query(&self, collection: &str, filter: &Filter) -> Result<()> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        owner.flush_batch().await?;

        let mut generator = ElasticGenerator::new();
        let body: JsonValue = render(&mut generator, collection, &filter)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| Error::internal(err.to_string())))?;
        let query = json!({ "query": body["query"].clone() });
        let path = format!("/{}/_delete_by_query", owner.index_for(collection));
        with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.transport.request("POST", &path, Some(query)),
        )
        .await?;
        Ok(())
    }

    async fn flush_index(&self) -> Result<()> {
        self.owner()?.flush_batch().await
    }
}

/// Native aggregation through the `aggs` DSL.
pub struct ElasticAggregator {
    backend: Weak<ElasticBackend>,
}

impl ElasticAggregator {
    fn owner(&self) -> Result<Arc<ElasticBackend>> {
        self.backend
            .upgrade()
            .ok_or_else(|| Error::internal("elasticsearch backend has been dropped"))
    }
}

#[async_trait]
impl Aggregator for ElasticAggregator {
    async fn aggregate(&self, collection: &str, aggregate: &Aggregate, filter: &Filter) -> Result<Value> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        owner.flush_batch().await?;

        let field = if aggregate.field == "id" {
            schema.identity_field.clone()
        } else {
            aggregate.field.clone()
        };
        let named = Aggregate::new(aggregate.aggregation, field);
        let mut generator = ElasticGenerator::new();
        let body: JsonValue = render_aggregate(&mut generator, collection, &filter, &[], std::slice::from_ref(&named))
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| Error::internal(err.to_string())))?;
        let path = format!("/{}/_search", owner.aggregator_path(collection));
        let response = with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.transport.request("POST", &path, Some(body)),
        )
        .await?;
        let key = format!("{}_{}", named.aggregation.as_str(), named.field);
        Ok(Value::from_json(
            response["aggregations"][&key]["value"].clone(),
        ))
    }

    async fn group_by(
        &self,
        collection: &str,
        group_fields: &[String],
        aggregates: &[Aggregate],
        filter: &Filter,
    ) -> Result<RecordSet> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        owner.flush_batch().await?;

        let mut generator = ElasticGenerator::new();
        let body: JsonValue =
            render_aggregate(&mut generator, collection, &filter, group_fields, aggregates)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|err| Error::internal(err.to_string())))?;
        let path = format!("/{}/_search", owner.aggregator_path(collection));
        let response = with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.transport.request("POST", &path, Some(body)),
        )
        .await?;

        let mut out = RecordSet::new();
        let Some(first_group) = group_fields.first() else {
            return Ok(out);
        };
        let buckets = response["aggregations"][&format!("group_{first_group}")]["buckets"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        for bucket in buckets {
            let key = Value::from_json(bucket["key"].clone());
            let mut record = Record::new(Id::from(key.clone()));
            record.set(first_group, key);
            for aggregate in aggregates {
                let name = format!("{}_{}", aggregate.aggregation.as_str(), aggregate.field);
                record.set(&name, Value::from_json(bucket[&name]["value"].clone()));
            }
            out.push(record);
        }
        out.known_size = true;
        Ok(out)
    }
}

impl ElasticBackend {
    /// The index used for aggregation requests; defaults to the collection's
    /// aggregator name.
    fn aggregator_path(&self, collection: &str) -> String {
        self.schema(collection)
            .map(|c| c.aggregator_name().to_string())
            .unwrap_or_else(|_| collection.to_string())
    }
}
