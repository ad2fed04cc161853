//! Filesystem backend: one directory per collection, one YAML or JSON file
//! per record.
//!
//! Layout: `<root>/<collection>/schema.<ext>` holds the persisted schema and
//! `<root>/<collection>/data/<id>.<ext>` holds each record's field map. A
//! `<id>.lock` sentinel serialises writers; reads go through a bounded LRU
//! record cache that is refreshed on write and invalidated on delete.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lru_cache::LruCache;
use tracing::{debug, warn};

use crate::backend::{
    Aggregator, Backend, Feature, Indexer, QueryPage, QueryResultFn, enforce_delete_constraints,
};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Filter};
use crate::generator::memory::compile;
use crate::schema::collection::Collection;
use crate::schema::field::Operation;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::Value;

const DEFAULT_CACHE_SIZE: usize = 1024;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const LOCK_RETRY_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn from_option(value: &str) -> Format {
        match value {
            "json" => Format::Json,
            _ => Format::Yaml,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Format::Yaml => "yaml",
            Format::Json => "json",
        }
    }

    fn encode(self, fields: &BTreeMap<String, Value>) -> Result<Vec<u8>> {
        match self {
            Format::Yaml => serde_yaml::to_vec(fields).map_err(|err| Error::internal(err.to_string())),
            Format::Json => serde_json::to_vec_pretty(fields).map_err(|err| Error::internal(err.to_string())),
        }
    }

    fn decode(self, bytes: &[u8]) -> Result<BTreeMap<String, Value>> {
        match self {
            Format::Yaml => serde_yaml::from_slice(bytes).map_err(|err| Error::internal(err.to_string())),
            Format::Json => serde_json::from_slice(bytes).map_err(|err| Error::internal(err.to_string())),
        }
    }

    fn encode_schema(self, collection: &Collection) -> Result<Vec<u8>> {
        match self {
            Format::Yaml => serde_yaml::to_vec(collection).map_err(|err| Error::internal(err.to_string())),
            Format::Json => serde_json::to_vec_pretty(collection).map_err(|err| Error::internal(err.to_string())),
        }
    }

    fn decode_schema(self, bytes: &[u8]) -> Result<Collection> {
        match self {
            Format::Yaml => serde_yaml::from_slice(bytes).map_err(|err| Error::internal(err.to_string())),
            Format::Json => serde_json::from_slice(bytes).map_err(|err| Error::internal(err.to_string())),
        }
    }
}

/// File-name-safe rendering of an identity.
fn id_file_key(id: &Id) -> String {
    id.to_key(":").replace(['/', '\\'], "_")
}

pub struct FsBackend {
    dsn: ConnectionString,
    root: PathBuf,
    format: Format,
    collections: RwLock<HashMap<String, Collection>>,
    cache: Mutex<LruCache<String, Record>>,
    self_ref: Weak<FsBackend>,
    indexer: RwLock<Option<Arc<FsIndexer>>>,
    external: RwLock<Option<Arc<dyn Backend>>>,
}

impl FsBackend {
    pub fn construct(dsn: ConnectionString) -> Result<Arc<dyn Backend>> {
        let root = PathBuf::from(format!("/{}", dsn.dataset()));
        Ok(FsBackend::at_root(root, dsn) as Arc<dyn Backend>)
    }

    /// Test-friendly constructor rooted at an explicit directory.
    pub fn at_root(root: impl Into<PathBuf>, dsn: ConnectionString) -> Arc<FsBackend> {
        let format = Format::from_option(&dsn.opt_str("format", "yaml"));
        let cache_size = dsn.opt_int("cacheSize", DEFAULT_CACHE_SIZE as i64).max(1) as usize;
        Arc::new_cyclic(|weak| FsBackend {
            dsn,
            root: root.into(),
            format,
            collections: RwLock::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(cache_size)),
            self_ref: weak.clone(),
            indexer: RwLock::new(None),
            external: RwLock::new(None),
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

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(collection)
    }

    fn data_dir(&self, collection: &str) -> PathBuf {
        self.collection_dir(collection).join("data")
    }

    fn schema_path(&self, collection: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("schema.{}", self.format.extension()))
    }

    fn record_path(&self, collection: &str, id: &Id) -> PathBuf {
        self.data_dir(collection)
            .join(format!("{}.{}", id_file_key(id), self.format.extension()))
    }

    fn lock_path(&self, collection: &str, id: &Id) -> PathBuf {
        self.data_dir(collection).join(format!("{}.lock", id_file_key(id)))
    }

    fn cache_key(&self, collection: &str, id: &Id) -> String {
        format!("{collection}/{}", id_file_key(id))
    }

    /// Take the write-lock sentinel, retrying briefly before reporting a
    /// collision.
    async fn acquire_lock(&self, collection: &str, id: &Id) -> Result<PathBuf> {
        let path = self.lock_path(collection, id);
        for _ in 0..LOCK_RETRY_LIMIT {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(path),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(Error::internal(format!("cannot take lock {path:?}: {err}"))),
            }
        }
        Err(Error::conflict(
            collection,
            format!("record {id} is locked by another writer"),
        ))
    }

    async fn release_lock(&self, path: &Path) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %err, "failed to remove lock sentinel");
        }
    }

    async fn write_record(&self, collection: &str, record: &Record) -> Result<()> {
        let path = self.record_path(collection, &record.id);
        let bytes = self.format.encode(&record.fields)?;
        let lock = self.acquire_lock(collection, &record.id).await?;
        let outcome = tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| Error::internal(format!("cannot write {path:?}: {err}")));
        self.release_lock(&lock).await;
        outcome?;
        self.cache
            .lock()
            .unwrap()
            .insert(self.cache_key(collection, &record.id), record.clone());
        Ok(())
    }

    async fn read_record(&self, collection: &str, schema: &Collection, id: &Id) -> Result<Record> {
        if let Some(cached) = self.cache.lock().unwrap().get_mut(&self.cache_key(collection, id)) {
            return Ok(cached.clone());
        }
        let path = self.record_path(collection, id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::record_not_found(collection, id));
            }
            Err(err) => return Err(Error::internal(format!("cannot read {path:?}: {err}"))),
        };
        let fields = self.format.decode(&bytes)?;
        let mut record = Record::new(id.clone());
        record.fields = fields;
        record.id = schema.record_id(&record)?;
        if record.id.is_empty() {
            record.id = id.clone();
        }
        self.cache
            .lock()
            .unwrap()
            .insert(self.cache_key(collection, id), record.clone());
        Ok(record)
    }

    async fn remove_record(&self, collection: &str, id: &Id) -> Result<()> {
        let path = self.record_path(collection, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::internal(format!("cannot remove {path:?}: {err}"))),
        }
        self.cache.lock().unwrap().remove(&self.cache_key(collection, id));
        Ok(())
    }

    /// Load every live record of a collection from disk.
    async fn load_all(&self, collection: &str) -> Result<Vec<Record>> {
        let schema = self.schema(collection)?;
        let dir = self.data_dir(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::internal(format!("cannot list {dir:?}: {err}"))),
        };
        let extension = self.format.extension();
        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| Error::internal(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|err| Error::internal(format!("cannot read {path:?}: {err}")))?;
            let fields = self.format.decode(&bytes)?;
            let mut record = Record::anonymous();
            record.fields = fields;
            record.id = schema.record_id(&record)?;
            if schema.is_expired(&record) {
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    fn own_indexer(&self) -> Arc<FsIndexer> {
        if let Some(indexer) = self.indexer.read().unwrap().as_ref() {
            return Arc::clone(indexer);
        }
        let mut slot = self.indexer.write().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(FsIndexer {
                dsn: self.dsn.clone(),
                backend: self.self_ref.clone(),
                parent: RwLock::new(self.self_arc()),
            })
        })
        .clone()
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| Error::internal(format!("cannot create {:?}: {err}", self.root)))?;
        if self.dsn.opt_bool("autoregister", false) {
            let mut entries = tokio::fs::read_dir(&self.root)
                .await
                .map_err(|err| Error::internal(err.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| Error::internal(err.to_string()))?
            {
                if !entry.path().is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let schema_path = self.schema_path(&name);
                match tokio::fs::read(&schema_path).await {
                    Ok(bytes) => {
                        let collection = self.format.decode_schema(&bytes)?;
                        debug!(collection = %collection.name, "autoregistered collection");
                        self.register_collection(collection);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(Error::internal(err.to_string())),
                }
            }
        }
        Ok(())
    }

    async fn set_indexer(&self, dsn: ConnectionString) -> Result<()> {
        let external = crate::backend::connect(&dsn.to_string()).await?;
        if let (Some(indexer), Some(parent)) = (external.with_search(""), self.self_arc()) {
            indexer.index_initialize(parent).await?;
        }
        *self.external.write().unwrap() = Some(external);
        Ok(())
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
        tokio::fs::create_dir_all(self.data_dir(&definition.name))
            .await
            .map_err(|err| Error::internal(err.to_string()))?;
        let bytes = self.format.encode_schema(&definition)?;
        tokio::fs::write(self.schema_path(&definition.name), bytes)
            .await
            .map_err(|err| Error::internal(err.to_string()))?;
        self.register_collection(definition);
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.collection_dir(name)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::internal(err.to_string())),
        }
        self.collections.write().unwrap().remove(name);
        self.cache.lock().unwrap().clear();
        Ok(())
    }

    async fn exists(&self, collection: &str, id: &Id) -> bool {
        let Ok(schema) = self.schema(collection) else {
            return false;
        };
        if id.len() != schema.key_count() {
            return false;
        }
        match self.read_record(collection, &schema, id).await {
            Ok(record) => !schema.is_expired(&record),
            Err(_) => false,
        }
    }

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record> {
        let schema = self.schema(collection)?;
        id.check_arity(&schema)?;
        let mut record = self.read_record(collection, &schema, id).await?;
        if schema.is_expired(&record) {
            self.remove_record(collection, id).await?;
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
        tokio::fs::create_dir_all(self.data_dir(collection))
            .await
            .map_err(|err| Error::internal(err.to_string()))?;
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
            }
            made.id.check_arity(&schema)?;
            if self.exists(collection, &made.id).await {
                return Err(Error::conflict(
                    collection,
                    format!("record {} already exists", made.id),
                ));
            }
            self.write_record(collection, &made).await?;
            record.id = made.id.clone();
            record.set(&schema.identity_field, made.get_value(&schema.identity_field));
        }
        Ok(())
    }

    async fn update(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        let schema = self.schema(collection)?;
        for record in &mut records.records {
            let made = schema.make_record(record, Operation::Update)?;
            if schema.is_expired(&made) {
                continue;
            }
            made.id.check_arity(&schema)?;
            if !self.exists(collection, &made.id).await {
                return Err(Error::record_not_found(collection, &made.id));
            }
            self.write_record(collection, &made).await?;
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
        for id in ids {
            self.remove_record(collection, id).await?;
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
        Some(Arc::new(FsAggregator {
            backend: self.self_ref.clone(),
        }))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        crate::backend::with_timeout(&self.label(), timeout, async {
            match tokio::fs::metadata(&self.root).await {
                Ok(meta) if meta.is_dir() => Ok(()),
                Ok(_) => Err(Error::unavailable(self.label(), "root is not a directory")),
                Err(err) => Err(Error::unavailable(self.label(), err.to_string())),
            }
        })
        .await
    }

    fn supports(&self, features: &[Feature]) -> bool {
        features
            .iter()
            .all(|f| matches!(f, Feature::CompositeKeys | Feature::Constraints | Feature::PartialSearch))
    }
}

pub struct FsIndexer {
    dsn: ConnectionString,
    backend: Weak<FsBackend>,
    parent: RwLock<Option<Arc<dyn Backend>>>,
}

impl FsIndexer {
    fn owner(&self) -> Result<Arc<FsBackend>> {
        self.backend
            .upgrade()
            .ok_or_else(|| Error::internal("filesystem backend has been dropped"))
    }

    async fn matched(&self, collection: &str, filter: &Filter) -> Result<(Vec<Record>, u64)> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let compiled = compile(&filter)?;
        let records = owner.load_all(collection).await?;
        let total = compiled.count(&records);
        let mut hits: Vec<Record> = records.into_iter().filter(|r| compiled.matches(r)).collect();
        compiled.sort(&mut hits);
        Ok((compiled.window(hits), total))
    }
}

#[async_trait]
impl Indexer for FsIndexer {
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
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        owner.read_record(collection, &schema, id).await
    }

    async fn index_remove(&self, _collection: &str, _ids: &[Id]) -> Result<()> {
        // Files are the index; removal happens with the record.
        Ok(())
    }

    async fn index(&self, _collection: &str, _records: &RecordSet) -> Result<()> {
        Ok(())
    }

    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        let (hits, total) = self.matched(collection, filter).await?;
        let per_page = filter.limit.unwrap_or_else(|| hits.len().max(1));
        let page = QueryPage {
            page: filter.offset / per_page.max(1) + 1,
            total_pages: (total as usize).div_ceil(per_page.max(1)),
            per_page,
            total_results: total,
            offset: filter.offset,
        };
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
        let (hits, _) = self.matched(collection, filter).await?;
        let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for field in fields {
            let mut seen: Vec<Value> = Vec::new();
            for record in &hits {
                if let Some(value) = record.get(field)
                    && !value.is_null()
                    && !seen.contains(value)
                {
                    seen.push(value.clone());
                }
            }
            out.insert(field.clone(), seen);
        }
        Ok(out)
    }

    async fn delete_query(&self, collection: &str, filter: &Filter) -> Result<()> {
        let (hits, _) = self.matched(collection, filter).await?;
        let ids: Vec<Id> = hits.into_iter().map(|r| r.id).collect();
        self.owner()?.delete(collection, &ids).await
    }

    async fn flush_index(&self) -> Result<()> {
        Ok(())
    }
}

/// The filesystem engine has no native aggregation: `count` is a filtered
/// scan, everything else declines.
pub struct FsAggregator {
    backend: Weak<FsBackend>,
}

#[async_trait]
impl Aggregator for FsAggregator {
    async fn aggregate(&self, collection: &str, aggregate: &Aggregate, filter: &Filter) -> Result<Value> {
        let owner = self
            .backend
            .upgrade()
            .ok_or_else(|| Error::internal("filesystem backend has been dropped"))?;
        match aggregate.aggregation {
            Aggregation::Count => {
                let schema = owner.schema(collection)?;
                let mut filter = filter.clone();
                filter.apply_identity(&schema);
                let compiled = compile(&filter)?;
                let records = owner.load_all(collection).await?;
                Ok(Value::Int(compiled.count(&records) as i64))
            }
            other => Err(Error::not_implemented(
                owner.label(),
                format!("aggregate {}", other.as_str()),
            )),
        }
    }

    async fn group_by(
        &self,
        _collection: &str,
        _group_fields: &[String],
        _aggregates: &[Aggregate],
        _filter: &Filter,
    ) -> Result<RecordSet> {
        Err(Error::not_implemented("fs", "group_by"))
    }
}
