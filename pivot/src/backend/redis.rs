//! Redis backend.
//!
//! Records are hashes at `<prefix><dataset>.<collection>:<id>[:<id>…]` with
//! per-field JSON-encoded values; a `<collection>.__schema__` sibling key
//! holds the JSON schema for autoregistration; TTLs propagate to native
//! `EXPIRE`. The indexer resolves identity/key-field equality by key
//! pattern; anything richer is `QueryTooComplex`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cmd;
use tracing::debug;

use crate::backend::{
    Aggregator, Backend, Feature, Indexer, QueryPage, QueryResultFn, enforce_delete_constraints,
    with_timeout,
};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Filter, Operator};
use crate::generator::memory::compile;
use crate::schema::collection::Collection;
use crate::schema::field::Operation;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::{Kind, Value};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(20);
const SCAN_COUNT: usize = 1000;
const SCHEMA_SUFFIX: &str = ".__schema__";
const SEQUENCE_SUFFIX: &str = ".__sequence__";

pub struct RedisBackend {
    dsn: ConnectionString,
    prefix: String,
    dataset: String,
    call_timeout: Duration,
    conn: RwLock<Option<ConnectionManager>>,
    collections: RwLock<HashMap<String, Collection>>,
    self_ref: Weak<RedisBackend>,
    indexer: RwLock<Option<Arc<RedisIndexer>>>,
    external: RwLock<Option<Arc<dyn Backend>>>,
}

impl RedisBackend {
    pub fn construct(dsn: ConnectionString) -> Result<Arc<dyn Backend>> {
        Ok(RedisBackend::with_dsn(dsn) as Arc<dyn Backend>)
    }

    pub fn with_dsn(dsn: ConnectionString) -> Arc<RedisBackend> {
        let prefix = dsn.opt_str("prefix", "");
        let dataset = dsn.dataset().to_string();
        let call_timeout = dsn.opt_duration("callTimeout", DEFAULT_CALL_TIMEOUT);
        Arc::new_cyclic(|weak| RedisBackend {
            dsn,
            prefix,
            dataset,
            call_timeout,
            conn: RwLock::new(None),
            collections: RwLock::new(HashMap::new()),
            self_ref: weak.clone(),
            indexer: RwLock::new(None),
            external: RwLock::new(None),
        })
    }

    fn self_arc(&self) -> Option<Arc<dyn Backend>> {
        self.self_ref.upgrade().map(|arc| arc as Arc<dyn Backend>)
    }

    /// `<prefix><dataset>.<collection>`, tolerating an empty dataset.
    fn base_key(&self, collection: &str) -> String {
        if self.dataset.is_empty() {
            format!("{}{}", self.prefix, collection)
        } else {
            format!("{}{}.{}", self.prefix, self.dataset, collection)
        }
    }

    fn record_key(&self, collection: &str, id: &Id) -> String {
        format!("{}:{}", self.base_key(collection), id.to_key(":"))
    }

    fn schema_key(&self, collection: &str) -> String {
        format!("{}{}", self.base_key(collection), SCHEMA_SUFFIX)
    }

    fn sequence_key(&self, collection: &str) -> String {
        format!("{}{}", self.base_key(collection), SEQUENCE_SUFFIX)
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::unavailable(self.label(), "not connected"))
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

    fn redis_url(&self) -> String {
        let host = self.dsn.host().unwrap_or_else(|| "127.0.0.1:6379".to_string());
        match (self.dsn.username(), self.dsn.password()) {
            (Some(user), Some(pass)) => format!("redis://{user}:{pass}@{host}/"),
            (None, Some(pass)) => format!("redis://:{pass}@{host}/"),
            _ => format!("redis://{host}/"),
        }
    }

    fn translate(&self, err: redis::RedisError) -> Error {
        if err.is_io_error() || err.is_timeout() || err.is_connection_refusal() {
            Error::unavailable(self.label(), err.to_string())
        } else {
            Error::internal(format!("{}: {err}", self.label()))
        }
    }

    /// SCAN every key matching a pattern; cursor loop keeps Redis
    /// responsive under large keyspaces.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|err| self.translate(err))?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn read_hash(&self, key: &str) -> Result<Option<BTreeMap<String, Value>>> {
        let mut conn = self.connection()?;
        let raw: HashMap<String, String> = cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| self.translate(err))?;
        if raw.is_empty() {
            return Ok(None);
        }
        let mut fields = BTreeMap::new();
        for (name, encoded) in raw {
            let value = serde_json::from_str::<serde_json::Value>(&encoded)
                .map(Value::from_json)
                .unwrap_or(Value::String(encoded));
            fields.insert(name, value);
        }
        Ok(Some(fields))
    }

    async fn write_hash(&self, key: &str, record: &Record, ttl: Duration, replace: bool) -> Result<()> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if replace {
            pipe.cmd("DEL").arg(key).ignore();
        }
        let mut hset = cmd("HSET");
        hset.arg(key);
        for (name, value) in &record.fields {
            let encoded = serde_json::to_string(&value.to_json())
                .map_err(|err| Error::internal(err.to_string()))?;
            hset.arg(name).arg(encoded);
        }
        pipe.add_command(hset).ignore();
        if ttl > Duration::ZERO {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| self.translate(err))
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let found: i64 = cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| self.translate(err))?;
        Ok(found > 0)
    }

    async fn next_sequence(&self, collection: &str) -> Result<i64> {
        let mut conn = self.connection()?;
        cmd("INCR")
            .arg(self.sequence_key(collection))
            .query_async(&mut conn)
            .await
            .map_err(|err| self.translate(err))
    }

    async fn record_at(&self, collection: &str, schema: &Collection, id: &Id) -> Result<Record> {
        let key = self.record_key(collection, id);
        let fields = self
            .read_hash(&key)
            .await?
            .ok_or_else(|| Error::record_not_found(collection, id))?;
        let mut record = Record::new(id.clone());
        record.fields = fields;
        if schema.is_expired(&record) {
            return Err(Error::record_not_found(collection, id));
        }
        Ok(record)
    }

    fn own_indexer(&self) -> Arc<RedisIndexer> {
        if let Some(indexer) = self.indexer.read().unwrap().as_ref() {
            return Arc::clone(indexer);
        }
        let mut slot = self.indexer.write().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(RedisIndexer {
                dsn: self.dsn.clone(),
                backend: self.self_ref.clone(),
                parent: RwLock::new(self.self_arc()),
            })
        })
        .clone()
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn initialize(&self) -> Result<()> {
        let client = redis::Client::open(self.redis_url())
            .map_err(|err| Error::unavailable(self.label(), err.to_string()))?;
        let manager = with_timeout(
            &self.label(),
            self.dsn.opt_duration("timeout", DEFAULT_CALL_TIMEOUT),
            async {
                ConnectionManager::new(client)
                    .await
                    .map_err(|err| Error::unavailable(self.label(), err.to_string()))
            },
        )
        .await?;
        *self.conn.write().unwrap() = Some(manager);

        if self.dsn.opt_bool("autoregister", false) {
            let pattern = if self.dataset.is_empty() {
                format!("{}*{}", self.prefix, SCHEMA_SUFFIX)
            } else {
                format!("{}{}.*{}", self.prefix, self.dataset, SCHEMA_SUFFIX)
            };
            for key in self.scan_keys(&pattern).await? {
                let mut conn = self.connection()?;
                let encoded: Option<String> = cmd("GET")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| self.translate(err))?;
                if let Some(encoded) = encoded
                    && let Ok(collection) = serde_json::from_str::<Collection>(&encoded)
                {
                    debug!(collection = %collection.name, "autoregistered collection");
                    self.register_collection(collection);
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
        let encoded =
            serde_json::to_string(&definition).map_err(|err| Error::internal(err.to_string()))?;
        let key = self.schema_key(&definition.name);
        let mut conn = self.connection()?;
        with_timeout(&self.label(), self.call_timeout, async {
            cmd("SET")
                .arg(&key)
                .arg(encoded)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|err| self.translate(err))
        })
        .await?;
        self.register_collection(definition);
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let keys = self.scan_keys(&format!("{}:*", self.base_key(name))).await?;
        let mut conn = self.connection()?;
        with_timeout(&self.label(), self.call_timeout, async {
            if !keys.is_empty() {
                cmd("DEL")
                    .arg(&keys)
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|err| self.translate(err))?;
            }
            cmd("DEL")
                .arg(self.schema_key(name))
                .arg(self.sequence_key(name))
                .query_async::<()>(&mut conn)
                .await
                .map_err(|err| self.translate(err))
        })
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
        let key = self.record_key(collection, id);
        match with_timeout(&self.label(), self.call_timeout, self.key_exists(&key)).await {
            Ok(found) => found,
            Err(_) => false,
        }
    }

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record> {
        let schema = self.schema(collection)?;
        id.check_arity(&schema)?;
        let mut record = with_timeout(
            &self.label(),
            self.call_timeout,
            self.record_at(collection, &schema, id),
        )
        .await?;
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
        for record in &mut records.records {
            let mut made = schema.make_record(record, Operation::Create)?;
            if schema.is_expired(&made) {
                continue;
            }
            if made.id.is_empty() {
                let value = match schema.identity_field_type {
                    Kind::Int => Value::Int(
                        with_timeout(&self.label(), self.call_timeout, self.next_sequence(collection))
                            .await?,
                    ),
                    _ => crate::schema::formatters::generate_encoded_uuid(Value::Null, Operation::Create)?,
                };
                made.set(&schema.identity_field, value);
                made.id = schema.record_id(&made)?;
            }
            made.id.check_arity(&schema)?;
            let key = self.record_key(collection, &made.id);
            if with_timeout(&self.label(), self.call_timeout, self.key_exists(&key)).await? {
                return Err(Error::conflict(
                    collection,
                    format!("record {} already exists", made.id),
                ));
            }
            with_timeout(
                &self.label(),
                self.call_timeout,
                self.write_hash(&key, &made, schema.time_to_live, false),
            )
            .await?;
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
            let key = self.record_key(collection, &made.id);
            if !with_timeout(&self.label(), self.call_timeout, self.key_exists(&key)).await? {
                return Err(Error::record_not_found(collection, &made.id));
            }
            with_timeout(
                &self.label(),
                self.call_timeout,
                self.write_hash(&key, &made, schema.time_to_live, true),
            )
            .await?;
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
        if ids.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.record_key(collection, id)).collect();
        let mut conn = self.connection()?;
        with_timeout(&self.label(), self.call_timeout, async {
            cmd("DEL")
                .arg(&keys)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|err| self.translate(err))
        })
        .await
    }

    fn with_search(&self, collection: &str) -> Option<Arc<dyn Indexer>> {
        if let Some(external) = self.external.read().unwrap().as_ref() {
            return external.with_search(collection);
        }
        Some(self.own_indexer())
    }

    fn with_aggregator(&self, _collection: &str) -> Option<Arc<dyn Aggregator>> {
        Some(Arc::new(RedisAggregator {
            backend: self.self_ref.clone(),
        }))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        let mut conn = self.connection()?;
        with_timeout(&self.label(), timeout.min(self.call_timeout), async {
            let pong: String = cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|err| self.translate(err))?;
            if pong == "PONG" {
                Ok(())
            } else {
                Err(Error::unavailable(self.label(), format!("unexpected ping reply {pong:?}")))
            }
        })
        .await
    }

    fn supports(&self, features: &[Feature]) -> bool {
        features
            .iter()
            .all(|f| matches!(f, Feature::CompositeKeys | Feature::Constraints))
    }
}

pub struct RedisIndexer {
    dsn: ConnectionString,
    backend: Weak<RedisBackend>,
    parent: RwLock<Option<Arc<dyn Backend>>>,
}

impl RedisIndexer {
    fn owner(&self) -> Result<Arc<RedisBackend>> {
        self.backend
            .upgrade()
            .ok_or_else(|| Error::internal("redis backend has been dropped"))
    }

    /// Key patterns covering the filter. Every criterion must be an
    /// equality on a composite-key member; each key member contributes its
    /// value set (or a wildcard), and the cartesian product forms the scan
    /// patterns.
    fn key_patterns(owner: &RedisBackend, schema: &Collection, filter: &Filter) -> Result<Vec<String>> {
        let key_fields: Vec<&str> = schema.key_fields().iter().map(|f| f.name.as_str()).collect();
        for criterion in filter.criteria.iter().filter(|_| !filter.match_all) {
            if criterion.operator != Operator::Is {
                return Err(Error::QueryTooComplex {
                    backend: owner.label(),
                    message: format!(
                        "only equality filters are supported, got {} on {}",
                        criterion.operator.as_str(),
                        criterion.field
                    ),
                });
            }
            if !key_fields.contains(&criterion.field.as_str()) {
                return Err(Error::QueryTooComplex {
                    backend: owner.label(),
                    message: format!("{} is not a key field", criterion.field),
                });
            }
        }

        let mut segment_sets: Vec<Vec<String>> = Vec::with_capacity(key_fields.len());
        for field in &key_fields {
            let values: Vec<String> = filter
                .criteria
                .iter()
                .filter(|c| !filter.match_all && c.field == *field)
                .flat_map(|c| c.values.iter().map(Value::to_display_string))
                .collect();
            if values.is_empty() {
                segment_sets.push(vec!["*".to_string()]);
            } else {
                segment_sets.push(values);
            }
        }

        let mut patterns: Vec<String> = vec![String::new()];
        for segments in segment_sets {
            let mut next = Vec::with_capacity(patterns.len() * segments.len());
            for prefix in &patterns {
                for segment in &segments {
                    next.push(if prefix.is_empty() {
                        segment.clone()
                    } else {
                        format!("{prefix}:{segment}")
                    });
                }
            }
            patterns = next;
        }
        Ok(patterns
            .into_iter()
            .map(|suffix| format!("{}:{}", owner.base_key(&schema.name), suffix))
            .collect())
    }

    async fn matched(&self, collection: &str, filter: &Filter) -> Result<(Vec<Record>, u64)> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let patterns = RedisIndexer::key_patterns(&owner, &schema, &filter)?;

        let mut records = Vec::new();
        for pattern in patterns {
            for key in owner.scan_keys(&pattern).await? {
                let Some(fields) = owner.read_hash(&key).await? else {
                    continue;
                };
                let mut record = Record::anonymous();
                record.fields = fields;
                record.id = schema.record_id(&record)?;
                if record.id.is_empty() {
                    // Reconstruct composite members from the key itself.
                    let base = format!("{}:", owner.base_key(&schema.name));
                    if let Some(suffix) = key.strip_prefix(&base) {
                        record.id = Id::composite(suffix.split(':').map(Value::from));
                    }
                }
                if schema.is_expired(&record) {
                    continue;
                }
                records.push(record);
            }
        }

        let compiled = compile(&filter)?;
        let total = records.len() as u64;
        compiled.sort(&mut records);
        Ok((compiled.window(records), total))
    }
}

#[async_trait]
impl Indexer for RedisIndexer {
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
        owner.record_at(collection, &schema, id).await
    }

    async fn index_remove(&self, _collection: &str, _ids: &[Id]) -> Result<()> {
        // The hash keys are the index; removal happens with the record.
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

/// Count-only aggregation; Redis has no native aggregation over hashes.
pub struct RedisAggregator {
    backend: Weak<RedisBackend>,
}

#[async_trait]
impl Aggregator for RedisAggregator {
    async fn aggregate(&self, collection: &str, aggregate: &Aggregate, filter: &Filter) -> Result<Value> {
        let owner = self
            .backend
            .upgrade()
            .ok_or_else(|| Error::internal("redis backend has been dropped"))?;
        match aggregate.aggregation {
            Aggregation::Count => {
                let indexer = owner.own_indexer();
                let (_, total) = indexer.matched(collection, filter).await?;
                Ok(Value::Int(total as i64))
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
        Err(Error::not_implemented("redis", "group_by"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::field::Field;

    fn backend() -> Arc<RedisBackend> {
        RedisBackend::with_dsn(ConnectionString::parse("redis://cache:6379/app?prefix=app.").unwrap())
    }

    fn sessions() -> Collection {
        Collection::new("sessions")
            .with_field(Field::identity("user", Kind::String))
            .with_field(Field::new("device", Kind::String).key())
            .with_field(Field::new("token", Kind::String))
    }

    #[test]
    fn key_layout() {
        let backend = backend();
        assert_eq!(backend.base_key("sessions"), "app.app.sessions");
        assert_eq!(
            backend.record_key("sessions", &Id::composite(["u1", "d1"])),
            "app.app.sessions:u1:d1"
        );
        assert_eq!(backend.schema_key("sessions"), "app.app.sessions.__schema__");

        let no_dataset =
            RedisBackend::with_dsn(ConnectionString::parse("redis://cache:6379?prefix=app.").unwrap());
        assert_eq!(
            no_dataset.record_key("sessions", &Id::composite(["u1", "d1"])),
            "app.sessions:u1:d1"
        );
    }

    #[test]
    fn key_patterns_for_equality_filters() {
        let backend = backend();
        let schema = sessions();

        let filter = Filter::parse("user/u1").unwrap();
        let patterns = RedisIndexer::key_patterns(&backend, &schema, &filter).unwrap();
        assert_eq!(patterns, vec!["app.app.sessions:u1:*".to_string()]);

        let filter = Filter::parse("user/u1/device/d1,d2").unwrap();
        let patterns = RedisIndexer::key_patterns(&backend, &schema, &filter).unwrap();
        assert_eq!(
            patterns,
            vec![
                "app.app.sessions:u1:d1".to_string(),
                "app.app.sessions:u1:d2".to_string(),
            ]
        );

        let patterns = RedisIndexer::key_patterns(&backend, &schema, &Filter::all()).unwrap();
        assert_eq!(patterns, vec!["app.app.sessions:*:*".to_string()]);
    }

    #[test]
    fn non_key_filters_are_too_complex() {
        let backend = backend();
        let schema = sessions();

        let filter = Filter::parse("token/t1").unwrap();
        let err = RedisIndexer::key_patterns(&backend, &schema, &filter).unwrap_err();
        assert!(matches!(err, Error::QueryTooComplex { .. }));

        let filter = Filter::parse("user/prefix:u").unwrap();
        let err = RedisIndexer::key_patterns(&backend, &schema, &filter).unwrap_err();
        assert!(matches!(err, Error::QueryTooComplex { .. }));
    }

    #[test]
    fn identity_alias_resolves_before_pattern_building() {
        let backend = backend();
        let schema = sessions();
        let mut filter = Filter::parse("_id/u9").unwrap();
        filter.apply_identity(&schema);
        let patterns = RedisIndexer::key_patterns(&backend, &schema, &filter).unwrap();
        assert_eq!(patterns, vec!["app.app.sessions:u9:*".to_string()]);
    }

    #[test]
    fn redis_url_carries_credentials() {
        let backend =
            RedisBackend::with_dsn(ConnectionString::parse("redis://:secret@cache:6379/app").unwrap());
        assert_eq!(backend.redis_url(), "redis://:secret@cache:6379/");
    }
}
