//! Backend, indexer, and aggregator contracts, the connection-string
//! registry, and the behaviours shared by every driver: constraint
//! pre-checks on delete, default query materialisation, and the optional
//! periodic pinger.

pub mod elastic;
pub mod file;
pub mod fs;
pub mod memory;
pub mod redis;
pub mod sql;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Criterion, Filter, Operator};
use crate::schema::collection::{Collection, DeletePolicy};
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::Value;

/// Capabilities a caller can probe for before relying on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// The indexer can resolve partial queries against a projected field
    /// set without hitting the authoritative store.
    PartialSearch,
    /// The driver supports `key_count() > 1`.
    CompositeKeys,
    /// The driver enforces declared foreign-key constraints at write time.
    Constraints,
}

/// Pagination metadata delivered alongside each streamed query result.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    /// 1-based page ordinal.
    pub page: usize,
    pub total_pages: usize,
    pub per_page: usize,
    pub total_results: u64,
    /// Offset of the first record on this page.
    pub offset: usize,
}

/// Streaming result callback: invoked once per hit, in sort order.
pub type QueryResultFn<'a> = &'a mut (dyn FnMut(Record, &QueryPage) -> Result<()> + Send);

/// The authoritative-store contract.
impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn connection_string(&self) -> &ConnectionString;

    /// Diagnostic label: scheme plus redacted target.
    fn label(&self) -> String {
        self.connection_string().redacted()
    }

    async fn initialize(&self) -> Result<()>;

    /// Route queries for this backend through a separate indexer.
    async fn set_indexer(&self, dsn: ConnectionString) -> Result<()>;

    fn register_collection(&self, collection: Collection);

    fn get_collection(&self, name: &str) -> Result<Collection>;

    fn list_collections(&self) -> Vec<String>;

    async fn create_collection(&self, definition: Collection) -> Result<()>;

    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Never errors on a miss; transport failures also read as `false`.
    async fn exists(&self, collection: &str, id: &Id) -> bool;

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record>;

    /// Fails with `Conflict` when an identity is already present. Assigned
    /// identities are written back into the record set.
    async fn insert(&self, collection: &str, records: &mut RecordSet) -> Result<()>;

    /// Fails with `RecordNotFound` when an identity is absent.
    async fn update(&self, collection: &str, records: &mut RecordSet) -> Result<()>;

    async fn delete(&self, collection: &str, ids: &[Id]) -> Result<()>;

    /// The indexer serving queries for this collection; possibly the
    /// backend itself.
    fn with_search(&self, collection: &str) -> Option<Arc<dyn Indexer>>;

    fn with_aggregator(&self, collection: &str) -> Option<Arc<dyn Aggregator>>;

    /// Push any deferred writes down to storage. A flush happens-before any
    /// subsequent read observing the flushed writes.
    async fn flush(&self) -> Result<()>;

    /// Must complete or fail within `timeout`.
    async fn ping(&self, timeout: Duration) -> Result<()>;

    fn supports(&self, features: &[Feature]) -> bool;
}

/// The query-engine contract. `query_func` is the canonical streaming path;
/// `query` is a materialising wrapper over it.
#[async_trait]
pub trait Indexer: Send + Sync {
    fn index_connection_string(&self) -> &ConnectionString;

    /// Attach the parent (authoritative) backend. Called once during
    /// backend initialisation.
    async fn index_initialize(&self, parent: Arc<dyn Backend>) -> Result<()>;

    fn parent(&self) -> Option<Arc<dyn Backend>>;

    async fn index_exists(&self, collection: &str, id: &Id) -> bool;

    async fn index_retrieve(&self, collection: &str, id: &Id) -> Result<Record>;

    async fn index_remove(&self, collection: &str, ids: &[Id]) -> Result<()>;

    /// Batch-persist records into the index.
    async fn index(&self, collection: &str, records: &RecordSet) -> Result<()>;

    /// Stream query hits to `each`, in sort order, with non-overlapping
    /// increasing offsets across pages.
    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()>;

    /// Materialise a query into a `RecordSet`. Consults `id_only`, and for
    /// collections whose records are not persisted in the index, hydrates
    /// each hit from the parent backend.
    async fn query(&self, collection: &str, filter: &Filter) -> Result<RecordSet> {
        let mut set = RecordSet::new();
        let mut last_page = QueryPage::default();
        self.query_func(collection, filter, &mut |record, page| {
            last_page = page.clone();
            set.records.push(record);
            Ok(())
        })
        .await?;
        set.result_count = if last_page.total_results > 0 {
            last_page.total_results
        } else {
            set.records.len() as u64
        };
        set.known_size = true;
        set.page = last_page.page;
        set.total_pages = last_page.total_pages;
        set.records_per_page = last_page.per_page;

        let collection_schema = self
            .parent()
            .and_then(|parent| parent.get_collection(collection).ok());

        if filter.id_only() {
            let identity = collection_schema
                .as_ref()
                .map(|c| c.identity_field.clone())
                .unwrap_or_else(|| "id".to_string());
            for record in &mut set.records {
                *record = record.only_fields(&[identity.as_str()]);
            }
            return Ok(set);
        }

        let hydrate = !filter.bool_option("ForceIndexRecord")
            && collection_schema
                .as_ref()
                .map(|c| c.skip_index_persistence)
                .unwrap_or(false);
        if hydrate && let Some(parent) = self.parent() {
            for record in &mut set.records {
                match parent.retrieve(collection, &record.id, &filter.fields).await {
                    Ok(full) => *record = full,
                    // The index can run ahead of the store; keep the index
                    // record on a miss.
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(set)
    }

    /// Distinct values per named field among the filter's hits.
    async fn list_values(
        &self,
        collection: &str,
        fields: &[String],
        filter: &Filter,
    ) -> Result<std::collections::BTreeMap<String, Vec<Value>>>;

    async fn delete_query(&self, collection: &str, filter: &Filter) -> Result<()>;

    /// Drain any deferred index batch.
    async fn flush_index(&self) -> Result<()>;
}

/// The analytics contract. Engines without native aggregation implement
/// `count` as a filtered scan and return `NotImplemented` for the rest.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, collection: &str, aggregate: &Aggregate, filter: &Filter) -> Result<Value>;

    async fn sum(&self, collection: &str, field: &str, filter: &Filter) -> Result<f64> {
        self.numeric(collection, Aggregation::Sum, field, filter).await
    }

    async fn minimum(&self, collection: &str, field: &str, filter: &Filter) -> Result<f64> {
        self.numeric(collection, Aggregation::Min, field, filter).await
    }

    async fn maximum(&self, collection: &str, field: &str, filter: &Filter) -> Result<f64> {
        self.numeric(collection, Aggregation::Max, field, filter).await
    }

    async fn average(&self, collection: &str, field: &str, filter: &Filter) -> Result<f64> {
        self.numeric(collection, Aggregation::Avg, field, filter).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let value = self
            .aggregate(collection, &Aggregate::new(Aggregation::Count, "id"), filter)
            .await?;
        Ok(value.as_int().unwrap_or(0) as u64)
    }

    async fn numeric(&self, collection: &str, aggregation: Aggregation, field: &str, filter: &Filter) -> Result<f64> {
        let value = self
            .aggregate(collection, &Aggregate::new(aggregation, field), filter)
            .await?;
        Ok(value.as_float().unwrap_or(0.0))
    }

    async fn group_by(
        &self,
        collection: &str,
        group_fields: &[String],
        aggregates: &[Aggregate],
        filter: &Filter,
    ) -> Result<RecordSet>;
}

type BackendConstructor = fn(ConnectionString) -> Result<Arc<dyn Backend>>;

static REGISTRY: OnceLock<RwLock<HashMap<String, BackendConstructor>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, BackendConstructor>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a constructor for a connection-string scheme. Idempotent:
/// re-registering a scheme replaces the constructor.
pub fn register_backend(scheme: &str, constructor: BackendConstructor) {
    registry()
        .write()
        .unwrap()
        .insert(scheme.to_string(), constructor);
}

/// Register every in-repo driver. Safe to call repeatedly.
pub fn register_builtin_backends() {
    register_backend("memory", memory::MemoryBackend::construct);
    register_backend("fs", fs::FsBackend::construct);
    register_backend("file", file::FileBackend::construct);
    register_backend("csv", file::FileBackend::construct);
    register_backend("tsv", file::FileBackend::construct);
    register_backend("redis", redis::RedisBackend::construct);
}

/// Resolve a connection string to a backend, initialize it, and start the
/// periodic pinger when the `ping` option is present.
pub async fn connect(raw: &str) -> Result<Arc<dyn Backend>> {
    register_builtin_backends();
    let dsn = ConnectionString::parse(raw)?;
    let constructor = registry()
        .read()
        .unwrap()
        .get(dsn.backend())
        .copied()
        .ok_or_else(|| Error::internal(format!("no backend registered for scheme {:?}", dsn.backend())))?;

    let backend = constructor(dsn.clone())?;
    if dsn.has_opt("indexer") {
        let indexer_dsn = ConnectionString::parse(&dsn.opt_str("indexer", ""))?;
        backend.set_indexer(indexer_dsn).await?;
    }
    backend.initialize().await?;
    debug!(backend = %backend.label(), "backend initialized");

    if dsn.has_opt("ping") {
        let interval = dsn.opt_duration("ping", Duration::from_secs(30));
        spawn_pinger(Arc::clone(&backend), interval);
    }
    Ok(backend)
}

/// Default timeout for pinger health checks.
pub const AUTOPING_TIMEOUT: Duration = Duration::from_secs(5);

/// Background health checks at a fixed interval. Failures are logged and
/// non-fatal.
pub fn spawn_pinger(backend: Arc<dyn Backend>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = backend.ping(AUTOPING_TIMEOUT).await {
                warn!(backend = %backend.label(), error = %err, "periodic ping failed");
            }
        }
    })
}

/// Run an operation under a timeout, translating expiry into
/// `BackendUnavailable`.
pub async fn with_timeout<T, F>(label: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::unavailable(
            label,
            format!("operation timed out after {timeout:?}"),
        )),
    }
}

/// Uniform constraint pre-check, run before the driver-level delete
/// regardless of native FK support. `Restrict` aborts, `Nullify` clears the
/// referencing field, `Delete`/`Cascade` removes dependents depth-first.
/// Data cycles terminate because each pass physically removes records and
/// driver deletes of already-missing ids are no-ops.
pub fn enforce_delete_constraints<'a>(
    backend: Arc<dyn Backend>,
    collection: &'a str,
    ids: &'a [Id],
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let key_values: Vec<Value> = ids.iter().filter_map(|id| id.first().cloned()).collect();
        if key_values.is_empty() {
            return Ok(());
        }
        for other_name in backend.list_collections() {
            let other = match backend.get_collection(&other_name) {
                Ok(c) => c,
                Err(_) => continue,
            };
            for constraint in other.constraints.iter().filter(|c| c.collection == collection) {
                let Some(indexer) = backend.with_search(&other_name) else {
                    warn!(
                        collection = %other_name,
                        "cannot enforce delete constraint without an indexer"
                    );
                    continue;
                };
                let filter = Filter::new().add(Criterion::new(
                    constraint.field.as_str(),
                    Operator::Is,
                    key_values.clone(),
                ));
                let dependents = indexer.query(&other_name, &filter).await?;
                if dependents.is_empty() {
                    continue;
                }
                match constraint.on_delete {
                    DeletePolicy::Restrict => {
                        return Err(Error::conflict(
                            collection,
                            format!(
                                "{} record(s) in {} still reference this collection",
                                dependents.len(),
                                other_name
                            ),
                        ));
                    }
                    DeletePolicy::Nullify => {
                        debug!(collection = %other_name, field = %constraint.field, "nullifying references");
                        let mut updates = RecordSet::new();
                        for mut record in dependents {
                            record.set(&constraint.field, Value::Null);
                            updates.push(record);
                        }
                        backend.update(&other_name, &mut updates).await?;
                    }
                    DeletePolicy::Delete | DeletePolicy::Cascade => {
                        debug!(collection = %other_name, "cascading delete to dependents");
                        let dependent_ids: Vec<Id> =
                            dependents.iter().map(|r| r.id.clone()).collect();
                        backend.delete(&other_name, &dependent_ids).await?;
                    }
                }
            }
        }
        Ok(())
    })
}

/// Targeted update: overlay a template record's fields onto every record
/// matching the target filters, then write the results back. Returns how
/// many records were touched.
pub async fn update_matching(
    backend: &Arc<dyn Backend>,
    collection: &str,
    template: &Record,
    targets: &[Filter],
) -> Result<u64> {
    let indexer = backend
        .with_search(collection)
        .ok_or_else(|| Error::not_implemented(backend.label(), "search"))?;
    let mut updated = 0u64;
    for target in targets {
        let hits = indexer.query(collection, target).await?;
        let mut set = RecordSet::new();
        for mut record in hits {
            for (name, value) in &template.fields {
                record.set(name, value.clone());
            }
            set.push(record);
        }
        updated += set.len() as u64;
        backend.update(collection, &mut set).await?;
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_idempotent() {
        register_builtin_backends();
        register_builtin_backends();
        let reg = registry().read().unwrap();
        assert!(reg.contains_key("memory"));
        assert!(reg.contains_key("csv"));
        assert!(reg.contains_key("redis"));
    }

    #[tokio::test]
    async fn with_timeout_translates_expiry() {
        let ok: Result<u8> = with_timeout("t", Duration::from_secs(1), async { Ok(7u8) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = with_timeout::<u8, _>("t", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(0u8)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable { .. }));
    }
}
