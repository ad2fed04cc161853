//! Read-only backend over a single CSV or TSV file.
//!
//! The schema is discovered by scanning the header plus a bounded sample of
//! body rows through the widening type inference; every mutation declines
//! with `NotImplemented`. Queries run over the loaded rows with the
//! in-memory predicate.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{Aggregator, Backend, Feature, Indexer, QueryPage, QueryResultFn};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Aggregate, Aggregation, Filter};
use crate::generator::memory::compile;
use crate::schema::collection::Collection;
use crate::schema::field::Field;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::{Kind, Value, autotype, detect_convert_type};

/// Rows scanned for type inference before the column type is fixed.
const TYPE_SAMPLE_LIMIT: usize = 100;

struct Loaded {
    collection: Collection,
    records: Vec<Record>,
}

pub struct FileBackend {
    dsn: ConnectionString,
    path: PathBuf,
    delimiter: u8,
    loaded: RwLock<Option<Arc<Loaded>>>,
    self_ref: Weak<FileBackend>,
    indexer: RwLock<Option<Arc<FileIndexer>>>,
}

fn dataset_path(dsn: &ConnectionString) -> PathBuf {
    let dataset = dsn.dataset();
    let relative = PathBuf::from(dataset);
    if relative.is_absolute() || relative.exists() {
        relative
    } else {
        PathBuf::from(format!("/{dataset}"))
    }
}

impl FileBackend {
    pub fn construct(dsn: ConnectionString) -> Result<Arc<dyn Backend>> {
        let path = dataset_path(&dsn);
        let delimiter = if dsn.backend() == "tsv"
            || path.extension().and_then(|e| e.to_str()) == Some("tsv")
        {
            b'\t'
        } else {
            b','
        };
        Ok(Arc::new_cyclic(|weak| FileBackend {
            dsn,
            path,
            delimiter,
            loaded: RwLock::new(None),
            self_ref: weak.clone(),
            indexer: RwLock::new(None),
        }) as Arc<dyn Backend>)
    }

    fn self_arc(&self) -> Option<Arc<dyn Backend>> {
        self.self_ref.upgrade().map(|arc| arc as Arc<dyn Backend>)
    }

    fn collection_name(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("data")
            .to_string()
    }

    fn state(&self) -> Result<Arc<Loaded>> {
        self.loaded
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::unavailable("file", "backend not initialized"))
    }

    fn not_writable(&self, operation: &str) -> Error {
        Error::not_implemented(self.label(), format!("{operation} (file backend is read-only)"))
    }

    /// Parse the sheet: headers name the fields, a bounded sample fixes the
    /// column types, and every row becomes a record. Rows are keyed by an
    /// `id` column when one exists, by 1-based row ordinal otherwise.
    fn load(&self) -> Result<Loaded> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|err| Error::unavailable("file", format!("{:?}: {err}", self.path)))?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|err| Error::internal(err.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows: Vec<Vec<String>> = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| Error::internal(err.to_string()))?;
            rows.push(row.iter().map(str::to_string).collect());
        }

        let mut kinds: Vec<Kind> = Vec::with_capacity(headers.len());
        for column in 0..headers.len() {
            let samples: Vec<Value> = rows
                .iter()
                .take(TYPE_SAMPLE_LIMIT)
                .filter_map(|row| row.get(column))
                .filter(|cell| !cell.is_empty())
                .map(|cell| Value::from(cell.as_str()))
                .collect();
            kinds.push(detect_convert_type(samples.iter()));
        }

        let id_column = headers.iter().position(|h| h == "id");
        let mut collection = Collection::new(self.collection_name());
        collection.source_uri = Some(self.dsn.to_string());
        match id_column {
            Some(column) => {
                collection = collection.with_field(Field::identity(headers[column].as_str(), kinds[column]));
            }
            None => {
                collection = collection.with_field(Field::identity("id", Kind::Int));
            }
        }
        for (i, header) in headers.iter().enumerate() {
            if Some(i) == id_column {
                continue;
            }
            collection = collection.with_field(Field::new(header.as_str(), kinds[i]));
        }

        let mut records = Vec::with_capacity(rows.len());
        for (ordinal, row) in rows.into_iter().enumerate() {
            let mut record = Record::anonymous();
            for (i, header) in headers.iter().enumerate() {
                let Some(cell) = row.get(i) else { continue };
                if cell.is_empty() {
                    continue;
                }
                let typed = autotype(cell);
                let value = typed.coerce(kinds[i]).unwrap_or(typed);
                record.set(header, value);
            }
            if id_column.is_none() {
                record.set("id", Value::Int(ordinal as i64 + 1));
            }
            record.id = collection.record_id(&record)?;
            records.push(record);
        }

        debug!(
            collection = %collection.name,
            rows = records.len(),
            "loaded file-backed collection"
        );
        Ok(Loaded { collection, records })
    }

    fn own_indexer(&self) -> Arc<FileIndexer> {
        if let Some(indexer) = self.indexer.read().unwrap().as_ref() {
            return Arc::clone(indexer);
        }
        let mut slot = self.indexer.write().unwrap();
        slot.get_or_insert_with(|| {
            Arc::new(FileIndexer {
                dsn: self.dsn.clone(),
                backend: self.self_ref.clone(),
                parent: RwLock::new(self.self_arc()),
            })
        })
        .clone()
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn initialize(&self) -> Result<()> {
        let loaded = self.load()?;
        *self.loaded.write().unwrap() = Some(Arc::new(loaded));
        Ok(())
    }

    async fn set_indexer(&self, _dsn: ConnectionString) -> Result<()> {
        Err(self.not_writable("set_indexer"))
    }

    fn register_collection(&self, _collection: Collection) {
        // The schema is inferred from the sheet; registrations are ignored.
    }

    fn get_collection(&self, name: &str) -> Result<Collection> {
        let state = self.state()?;
        if state.collection.name == name {
            Ok(state.collection.clone())
        } else {
            Err(Error::CollectionNotFound {
                name: name.to_string(),
            })
        }
    }

    fn list_collections(&self) -> Vec<String> {
        self.state()
            .map(|s| vec![s.collection.name.clone()])
            .unwrap_or_default()
    }

    async fn create_collection(&self, _definition: Collection) -> Result<()> {
        Err(self.not_writable("create_collection"))
    }

    async fn delete_collection(&self, _name: &str) -> Result<()> {
        Err(self.not_writable("delete_collection"))
    }

    async fn exists(&self, collection: &str, id: &Id) -> bool {
        let Ok(state) = self.state() else {
            return false;
        };
        state.collection.name == collection && state.records.iter().any(|r| &r.id == id)
    }

    async fn retrieve(&self, collection: &str, id: &Id, fields: &[String]) -> Result<Record> {
        let state = self.state()?;
        if state.collection.name != collection {
            return Err(Error::CollectionNotFound {
                name: collection.to_string(),
            });
        }
        id.check_arity(&state.collection)?;
        let mut record = state
            .records
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| Error::record_not_found(collection, id))?;
        record.populate(&state.collection)?;
        if fields.is_empty() {
            Ok(record)
        } else {
            Ok(record.only_fields(fields))
        }
    }

    async fn insert(&self, _collection: &str, _records: &mut RecordSet) -> Result<()> {
        Err(self.not_writable("insert"))
    }

    async fn update(&self, _collection: &str, _records: &mut RecordSet) -> Result<()> {
        Err(self.not_writable("update"))
    }

    async fn delete(&self, _collection: &str, _ids: &[Id]) -> Result<()> {
        Err(self.not_writable("delete"))
    }

    fn with_search(&self, _collection: &str) -> Option<Arc<dyn Indexer>> {
        Some(self.own_indexer())
    }

    fn with_aggregator(&self, _collection: &str) -> Option<Arc<dyn Aggregator>> {
        Some(Arc::new(FileAggregator {
            backend: self.self_ref.clone(),
        }))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, timeout: Duration) -> Result<()> {
        crate::backend::with_timeout(&self.label(), timeout, async {
            match tokio::fs::metadata(&self.path).await {
                Ok(meta) if meta.is_file() => Ok(()),
                Ok(_) => Err(Error::unavailable(self.label(), "dataset is not a file")),
                Err(err) => Err(Error::unavailable(self.label(), err.to_string())),
            }
        })
        .await
    }

    fn supports(&self, features: &[Feature]) -> bool {
        features.iter().all(|f| matches!(f, Feature::PartialSearch))
    }
}

pub struct FileIndexer {
    dsn: ConnectionString,
    backend: Weak<FileBackend>,
    parent: RwLock<Option<Arc<dyn Backend>>>,
}

impl FileIndexer {
    fn matched(&self, collection: &str, filter: &Filter) -> Result<(Vec<Record>, u64)> {
        let owner = self
            .backend
            .upgrade()
            .ok_or_else(|| Error::internal("file backend has been dropped"))?;
        let state = owner.state()?;
        if state.collection.name != collection {
            return Err(Error::CollectionNotFound {
                name: collection.to_string(),
            });
        }
        let mut filter = filter.clone();
        filter.apply_identity(&state.collection);
        let compiled = compile(&filter)?;
        let total = compiled.count(&state.records);
        let mut hits: Vec<Record> = state
            .records
            .iter()
            .filter(|r| compiled.matches(r))
            .cloned()
            .collect();
        compiled.sort(&mut hits);
        Ok((compiled.window(hits), total))
    }
}

#[async_trait]
impl Indexer for FileIndexer {
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
        match self.backend.upgrade() {
            Some(owner) => owner.exists(collection, id).await,
            None => false,
        }
    }

    async fn index_retrieve(&self, collection: &str, id: &Id) -> Result<Record> {
        let owner = self
            .backend
            .upgrade()
            .ok_or_else(|| Error::internal("file backend has been dropped"))?;
        owner.retrieve(collection, id, &[]).await
    }

    async fn index_remove(&self, _collection: &str, _ids: &[Id]) -> Result<()> {
        Err(Error::not_implemented("file", "index_remove"))
    }

    async fn index(&self, _collection: &str, _records: &RecordSet) -> Result<()> {
        Err(Error::not_implemented("file", "index"))
    }

    async fn query_func(&self, collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        let (hits, total) = self.matched(collection, filter)?;
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
        let (hits, _) = self.matched(collection, filter)?;
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

    async fn delete_query(&self, _collection: &str, _filter: &Filter) -> Result<()> {
        Err(Error::not_implemented("file", "delete_query"))
    }

    async fn flush_index(&self) -> Result<()> {
        Ok(())
    }
}

/// Count-only aggregation, per the rule for engines without native support.
pub struct FileAggregator {
    backend: Weak<FileBackend>,
}

#[async_trait]
impl Aggregator for FileAggregator {
    async fn aggregate(&self, collection: &str, aggregate: &Aggregate, filter: &Filter) -> Result<Value> {
        let owner = self
            .backend
            .upgrade()
            .ok_or_else(|| Error::internal("file backend has been dropped"))?;
        match aggregate.aggregation {
            Aggregation::Count => {
                let state = owner.state()?;
                if state.collection.name != collection {
                    return Err(Error::CollectionNotFound {
                        name: collection.to_string(),
                    });
                }
                let mut filter = filter.clone();
                filter.apply_identity(&state.collection);
                let compiled = compile(&filter)?;
                Ok(Value::Int(compiled.count(&state.records) as i64))
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
        Err(Error::not_implemented("file", "group_by"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sheet(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn backend_for(path: &Path) -> Arc<dyn Backend> {
        let dsn = ConnectionString::parse(&format!("file://{}", path.display())).unwrap();
        let backend = FileBackend::construct(dsn).unwrap();
        backend.initialize().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn infers_schema_and_loads_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(
            dir.path(),
            "people.csv",
            "name,age,score\nalice,31,9.5\nbob,24,7\n",
        );
        let backend = backend_for(&path).await;

        let collection = backend.get_collection("people").unwrap();
        assert_eq!(collection.identity_field, "id");
        assert_eq!(collection.field("age").unwrap().kind, Kind::Int);
        // Mixed int/float widens to float.
        assert_eq!(collection.field("score").unwrap().kind, Kind::Float);
        assert_eq!(collection.field("name").unwrap().kind, Kind::String);

        let record = backend.retrieve("people", &Id::from(1), &[]).await.unwrap();
        assert_eq!(record.get_value("name"), Value::from("alice"));
        assert_eq!(record.get_value("age"), Value::Int(31));
    }

    #[tokio::test]
    async fn uses_id_column_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(dir.path(), "rows.csv", "id,label\n10,x\n20,y\n");
        let backend = backend_for(&path).await;

        assert!(backend.exists("rows", &Id::from(20)).await);
        let record = backend.retrieve("rows", &Id::from(10), &[]).await.unwrap();
        assert_eq!(record.get_value("label"), Value::from("x"));
    }

    #[tokio::test]
    async fn tsv_delimiter_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(dir.path(), "data.tsv", "a\tb\n1\t2\n");
        let dsn = ConnectionString::parse(&format!("tsv://{}", path.display())).unwrap();
        let backend = FileBackend::construct(dsn).unwrap();
        backend.initialize().await.unwrap();
        let record = backend.retrieve("data", &Id::from(1), &[]).await.unwrap();
        assert_eq!(record.get_value("a"), Value::Int(1));
        assert_eq!(record.get_value("b"), Value::Int(2));
    }

    #[tokio::test]
    async fn mutations_decline() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(dir.path(), "ro.csv", "a\n1\n");
        let backend = backend_for(&path).await;

        let mut set = RecordSet::from(Record::new(9i64));
        assert!(matches!(
            backend.insert("ro", &mut set).await.unwrap_err(),
            Error::NotImplemented { .. }
        ));
        assert!(matches!(
            backend.delete("ro", &[Id::from(1)]).await.unwrap_err(),
            Error::NotImplemented { .. }
        ));
    }

    #[tokio::test]
    async fn queries_over_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sheet(
            dir.path(),
            "people.csv",
            "name,age\nalice,31\nbob,24\ncarol,45\n",
        );
        let backend = backend_for(&path).await;
        let indexer = backend.with_search("people").unwrap();
        let results = indexer
            .query("people", &Filter::parse("age/gt:30/sort/-age").unwrap())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.records[0].get_value("name"), Value::from("carol"));

        let aggregator = backend.with_aggregator("people").unwrap();
        assert_eq!(aggregator.count("people", &Filter::all()).await.unwrap(), 3);
        assert!(matches!(
            aggregator.sum("people", "age", &Filter::all()).await.unwrap_err(),
            Error::NotImplemented { .. }
        ));
    }
}
