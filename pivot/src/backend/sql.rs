//! Relational backend over the [`SqlExecutor`] adapter contract.
//!
//! All CRUD, table admin, and querying renders through the SQL generator;
//! the executor is the seam wire drivers plug into (one per dialect). The
//! crate ships the contract and the orchestration, not the drivers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{
    Aggregator, Backend, Feature, Indexer, QueryPage, QueryResultFn, enforce_delete_constraints,
    with_timeout,
};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Criterion, Filter, Operator};
use crate::generator::sql::{SqlDialect, SqlGenerator};
use crate::generator::{Generator, render, render_aggregate};
use crate::schema::collection::Collection;
use crate::schema::field::Operation;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::Value;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// The per-dialect driver seam. Implementations own connection pooling and
/// parameter binding; every call must release its connection on all exit
/// paths and is expected to honour the backend's call timeout.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    fn dialect(&self) -> &'static SqlDialect;

    /// Run a statement without rows; returns the affected-row count.
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<u64>;

    /// Run an `INSERT`; returns the engine-assigned identity, if any.
    async fn insert(&self, statement: &str, params: &[Value]) -> Result<Option<Value>>;

    /// Run a rows query; one map per row, typed by the driver.
    async fn query(&self, statement: &str, params: &[Value]) -> Result<Vec<BTreeMap<String, Value>>>;

    async fn ping(&self) -> Result<()>;
}

pub struct SqlBackend {
    dsn: ConnectionString,
    executor: Arc<dyn SqlExecutor>,
    call_timeout: Duration,
    collections: RwLock<HashMap<String, Collection>>,
    self_ref: Weak<SqlBackend>,
    indexer: RwLock<Option<Arc<SqlIndexer>>>,
    external: RwLock<Option<Arc<dyn Backend>>>,
}

impl SqlBackend {
    pub fn new(dsn: ConnectionString, executor: Arc<dyn SqlExecutor>) -> Arc<SqlBackend> {
        let call_timeout = dsn.opt_duration("callTimeout", DEFAULT_CALL_TIMEOUT);
        Arc::new_cyclic(|weak| SqlBackend {
            dsn,
            executor,
            call_timeout,
            collections: RwLock::new(HashMap::new()),
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

    fn dialect(&self) -> &'static SqlDialect {
        self.executor.dialect()
    }

    /// An exact-match filter over a record's composite-key members.
    fn key_filter(schema: &Collection, id: &Id) -> Filter {
        let mut filter = Filter::new();
        for (field, value) in schema.key_fields().iter().zip(id.values()) {
            filter = filter.add(Criterion::new(field.name.as_str(), Operator::Is, vec![value.clone()]));
        }
        filter
    }

    /// Columns of a prepared record, in schema order.
    fn columns(schema: &Collection, record: &Record, include_identity: bool) -> Vec<(String, Value)> {
        schema
            .fields
            .iter()
            .filter(|f| include_identity || !f.identity)
            .filter_map(|f| record.get(&f.name).map(|v| (f.name.clone(), v.clone())))
            .filter(|(_, v)| !v.is_null())
            .collect()
    }

    async fn key_count_at(&self, schema: &Collection, id: &Id) -> Result<u64> {
        let filter = SqlBackend::key_filter(schema, id);
        let mut generator = SqlGenerator::new(self.dialect()).count_only();
        let statement = String::from_utf8(render(&mut generator, &schema.name, &filter)?)
            .map_err(|err| Error::internal(err.to_string()))?;
        let rows = with_timeout(
            &self.label(),
            self.call_timeout,
            self.executor.query(&statement, generator.values()),
        )
        .await?;
        Ok(rows
            .first()
            .and_then(|row| row.values().next())
            .and_then(Value::as_int)
            .unwrap_or(0) as u64)
    }

    fn row_to_record(schema: &Collection, row: BTreeMap<String, Value>) -> Result<Record> {
        let mut record = Record::anonymous();
        record.fields = row;
        record.id = schema.record_id(&record)?;
        Ok(record)
    }

    fn own_indexer(&self) -> Arc<SqlIndexer> {
        if let Some(indexer) = self.indexer.read().unwrap().as_ref() {
            return Arc::clone(indexer);
        }
        let mut slot = self.indexer.write().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(SqlIndexer {
                dsn: self.dsn.clone(),
                backend: self.self_ref.clone(),
                parent: RwLock::new(self.self_arc()),
            })
        })
        .clone()
    }
}

#[async_trait]
impl Backend for SqlBackend {
    fn connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn initialize(&self) -> Result<()> {
        with_timeout(&self.label(), self.call_timeout, self.executor.ping()).await?;
        if self.dsn.opt_bool("autoregister", false) {
            let statement = self.dialect().list_tables_statement();
            let rows = with_timeout(
                &self.label(),
                self.call_timeout,
                self.executor.query(statement, &[]),
            )
            .await?;
            for row in rows {
                if let Some(name) = row.values().next().map(Value::to_display_string)
                    && !name.is_empty()
                    && self.schema(&name).is_err()
                {
                    // Inferred registration; field metadata arrives when the
                    // application registers the full schema.
                    debug!(table = %name, "autoregistered table");
                    self.register_collection(Collection::new(name));
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
        let statement = self.dialect().create_table_statement(&definition);
        with_timeout(
            &self.label(),
            self.call_timeout,
            self.executor.execute(&statement, &[]),
        )
        .await?;
        self.register_collection(definition);
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let statement = format!("DROP TABLE IF EXISTS {}", self.dialect().quote_ident(name));
        with_timeout(
            &self.label(),
            self.call_timeout,
            self.executor.execute(&statement, &[]),
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
        self.key_count_at(&schema, id).await.map(|n| n > 0).unwrap_or(false)
    }

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record> {
        let schema = self.schema(collection)?;
        id.check_arity(&schema)?;
        let mut filter = SqlBackend::key_filter(&schema, id);
        filter.fields = fields.to_vec();
        let mut generator = SqlGenerator::new(self.dialect());
        let statement = String::from_utf8(render(&mut generator, collection, &filter)?)
            .map_err(|err| Error::internal(err.to_string()))?;
        let rows = with_timeout(
            &self.label(),
            self.call_timeout,
            self.executor.query(&statement, generator.values()),
        )
        .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::record_not_found(collection, id))?;
        let mut record = SqlBackend::row_to_record(&schema, row)?;
        if record.id.is_empty() {
            record.id = id.clone();
        }
        if schema.is_expired(&record) {
            return Err(Error::record_not_found(collection, id));
        }
        record.populate(&schema)?;
        Ok(record)
    }

    async fn insert(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        let schema = self.schema(collection)?;
        let generator = SqlGenerator::new(self.dialect());
        for record in &mut records.records {
            let mut made = schema.make_record(record, Operation::Create)?;
            if schema.is_expired(&made) {
                continue;
            }
            let assign_identity = made.id.is_empty();
            if !assign_identity {
                made.id.check_arity(&schema)?;
                if self.key_count_at(&schema, &made.id).await? > 0 {
                    return Err(Error::conflict(
                        collection,
                        format!("record {} already exists", made.id),
                    ));
                }
            }
            let columns = SqlBackend::columns(&schema, &made, !assign_identity);
            let (statement, params) = generator.insert_statement(collection, &columns);
            let assigned = with_timeout(
                &self.label(),
                self.call_timeout,
                self.executor.insert(&statement, &params),
            )
            .await?;
            if assign_identity {
                let value = assigned.ok_or_else(|| {
                    Error::internal(format!(
                        "{}: driver did not report an assigned identity",
                        self.label()
                    ))
                })?;
                made.set(&schema.identity_field, value.coerce(schema.identity_field_type)?);
                made.id = schema.record_id(&made)?;
            }
            record.id = made.id.clone();
            record.set(&schema.identity_field, made.get_value(&schema.identity_field));
        }
        Ok(())
    }

    async fn update(&self, collection: &str, records: &mut RecordSet) -> Result<()> {
        let schema = self.schema(collection)?;
        let generator = SqlGenerator::new(self.dialect());
        for record in &mut records.records {
            let made = schema.make_record(record, Operation::Update)?;
            if schema.is_expired(&made) {
                continue;
            }
            made.id.check_arity(&schema)?;
            if self.key_count_at(&schema, &made.id).await? == 0 {
                return Err(Error::record_not_found(collection, &made.id));
            }
            let keys: Vec<(String, Value)> = schema
                .key_fields()
                .iter()
                .zip(made.id.values())
                .map(|(f, v)| (f.name.clone(), v.clone()))
                .collect();
            let key_names: Vec<String> = keys.iter().map(|(n, _)| n.clone()).collect();
            let set: Vec<(String, Value)> = SqlBackend::columns(&schema, &made, true)
                .into_iter()
                .filter(|(n, _)| !key_names.contains(n))
                .collect();
            if set.is_empty() {
                continue;
            }
            let (statement, params) = generator.update_statement(collection, &set, &keys);
            with_timeout(
                &self.label(),
                self.call_timeout,
                self.executor.execute(&statement, &params),
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
        let generator = SqlGenerator::new(self.dialect());
        for id in ids {
            let keys: Vec<(String, Value)> = schema
                .key_fields()
                .iter()
                .zip(id.values())
                .map(|(f, v)| (f.name.clone(), v.clone()))
                .collect();
            let (statement, params) = generator.delete_statement(collection, &keys);
            with_timeout(
                &self.label(),
                self.call_timeout,
                self.executor.execute(&statement, &params),
            )
            .await?;
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
        Some(Arc::new(SqlAggregator {
            backend: self.self_ref.clone(),
        }))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        with_timeout(
            &self.label(),
            timeout.min(self.call_timeout),
            self.executor.ping(),
        )
        .await
    }

    fn supports(&self, features: &[Feature]) -> bool {
        features
            .iter()
            .all(|f| matches!(f, Feature::CompositeKeys | Feature::Constraints))
    }
}

pub struct SqlIndexer {
    dsn: ConnectionString,
    backend: Weak<SqlBackend>,
    parent: RwLock<Option<Arc<dyn Backend>>>,
}

impl SqlIndexer {
    fn owner(&self) -> Result<Arc<SqlBackend>> {
        self.backend
            .upgrade()
            .ok_or_else(|| Error::internal("sql backend has been dropped"))
    }

    async fn run(&self, collection: &str, filter: &Filter) -> Result<(Vec<Record>, u64)> {
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);

        let mut generator = SqlGenerator::new(owner.dialect());
        let statement = String::from_utf8(render(&mut generator, collection, &filter)?)
            .map_err(|err| Error::internal(err.to_string()))?;
        let rows = with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.executor.query(&statement, generator.values()),
        )
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = SqlBackend::row_to_record(&schema, row)?;
            if schema.is_expired(&record) {
                continue;
            }
            records.push(record);
        }

        // Window totals come from a parallel COUNT when the filter is
        // windowed; otherwise the row count is the total.
        let total = if filter.limit.is_some() || filter.offset > 0 {
            let mut count_filter = filter.clone();
            count_filter.limit = None;
            count_filter.offset = 0;
            count_filter.sort.clear();
            let mut counter = SqlGenerator::new(owner.dialect()).count_only();
            let statement = String::from_utf8(render(&mut counter, collection, &count_filter)?)
                .map_err(|err| Error::internal(err.to_string()))?;
            let rows = with_timeout(
                &owner.label(),
                owner.call_timeout,
                owner.executor.query(&statement, counter.values()),
            )
            .await?;
            rows.first()
                .and_then(|row| row.values().next())
                .and_then(Value::as_int)
                .unwrap_or(records.len() as i64) as u64
        } else {
            records.len() as u64
        };
        Ok((records, total))
    }
}

#[async_trait]
impl Indexer for SqlIndexer {
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

    async fn index_remove(&self, _collection: &str, _ids: &[Id]) -> Result<()> {
        // The table is the index; removal happens with the row.
        Ok(())
    }

    async fn index(&self, _collection: &str, _records: &RecordSet) -> Result<()> {
        Ok(())
    }

    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        let (hits, total) = self.run(collection, filter).await?;
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
        let owner = self.owner()?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let mut out: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for field in fields {
            // One DISTINCT projection per requested field.
            let mut generator = SqlGenerator::new(owner.dialect());
            generator.initialize(collection)?;
            if !filter.match_all {
                for criterion in &filter.criteria {
                    generator.push(criterion)?;
                }
            }
            let where_values = generator.values().to_vec();
            let statement = String::from_utf8(generator.finalize()?)
                .map_err(|err| Error::internal(err.to_string()))?;
            let statement = statement.replacen(
                "SELECT *",
                &format!("SELECT DISTINCT {}", owner.dialect().quote_ident(field)),
                1,
            );
            let rows = with_timeout(
                &owner.label(),
                owner.call_timeout,
                owner.executor.query(&statement, &where_values),
            )
            .await?;
            let values: Vec<Value> = rows
                .into_iter()
                .filter_map(|row| row.into_values().next())
                .filter(|v| !v.is_null())
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
        let (statement, params) =
            SqlGenerator::delete_by_filter(owner.dialect(), collection, &filter)?;
        with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.executor.execute(&statement, &params),
        )
        .await?;
        Ok(())
    }

    async fn flush_index(&self) -> Result<()> {
        Ok(())
    }
}

/// Native aggregation through `GROUP BY`/aggregate functions.
pub struct SqlAggregator {
    backend: Weak<SqlBackend>,
}

#[async_trait]
impl Aggregator for SqlAggregator {
    async fn aggregate(&self, collection: &str, aggregate: &Aggregate, filter: &Filter) -> Result<Value> {
        let owner = self
            .backend
            .upgrade()
            .ok_or_else(|| Error::internal("sql backend has been dropped"))?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let field = if aggregate.field == "id" {
            schema.identity_field.clone()
        } else {
            aggregate.field.clone()
        };
        let mut generator = SqlGenerator::new(owner.dialect());
        let statement = String::from_utf8(render_aggregate(
            &mut generator,
            collection,
            &filter,
            &[],
            &[Aggregate::new(aggregate.aggregation, field)],
        )?)
        .map_err(|err| Error::internal(err.to_string()))?;
        let rows = with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.executor.query(&statement, generator.values()),
        )
        .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_values().next())
            .unwrap_or(Value::Null))
    }

    async fn group_by(
        &self,
        collection: &str,
        group_fields: &[String],
        aggregates: &[Aggregate],
        filter: &Filter,
    ) -> Result<RecordSet> {
        let owner = self
            .backend
            .upgrade()
            .ok_or_else(|| Error::internal("sql backend has been dropped"))?;
        let schema = owner.schema(collection)?;
        let mut filter = filter.clone();
        filter.apply_identity(&schema);
        let mut generator = SqlGenerator::new(owner.dialect());
        let statement = String::from_utf8(render_aggregate(
            &mut generator,
            collection,
            &filter,
            group_fields,
            aggregates,
        )?)
        .map_err(|err| Error::internal(err.to_string()))?;
        let rows = with_timeout(
            &owner.label(),
            owner.call_timeout,
            owner.executor.query(&statement, generator.values()),
        )
        .await?;
        let mut out = RecordSet::new();
        for row in rows {
            let key = group_fields
                .iter()
                .map(|f| row.get(f).cloned().unwrap_or(Value::Null).to_display_string())
                .collect::<Vec<_>>()
                .join(":");
            let mut record = Record::new(key);
            record.fields = row;
            out.push(record);
        }
        out.known_size = true;
        Ok(out)
    }
}
