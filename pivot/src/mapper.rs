//! Struct ↔ record marshalling.
//!
//! Application types serialize through serde into record field maps and
//! back; serde's field attributes (`rename`, `skip_serializing_if`, ...)
//! are the struct-side directives. `Model` binds a marshalled type to a
//! backend + collection pair for application-level convenience.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::Backend;
use crate::errors::{Error, Result};
use crate::filter::Filter;
use crate::schema::collection::Collection;
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::Value;

/// Marshal a struct into a record for the given collection. The identity
/// field moves into the record id; everything else lands in the field map.
pub fn to_record<T: Serialize>(value: &T, collection: &Collection) -> Result<Record> {
    let json = serde_json::to_value(value).map_err(|err| Error::internal(err.to_string()))?;
    let Value::Object(fields) = Value::from_json(json) else {
        return Err(Error::internal("only struct-like values marshal into records"));
    };
    let mut record = Record::anonymous();
    record.fields = fields;
    record.id = collection.record_id(&record)?;
    record.collection_name = Some(collection.name.clone());
    Ok(record)
}

/// Unmarshal a record into a struct, surfacing the identity as a field so
/// plain `#[derive(Deserialize)]` types round-trip.
pub fn from_record<T: DeserializeOwned>(record: &Record, collection: &Collection) -> Result<T> {
    let mut fields = record.fields.clone();
    if !fields.contains_key(&collection.identity_field)
        && let Some(identity) = record.id.first()
    {
        fields.insert(collection.identity_field.clone(), identity.clone());
    }
    let json = Value::Object(fields).to_json();
    serde_json::from_value(json).map_err(|err| Error::internal(err.to_string()))
}

/// A typed handle over one collection of one backend.
pub struct Model {
    backend: Arc<dyn Backend>,
    collection: Collection,
}

impl Model {
    pub fn new(backend: Arc<dyn Backend>, collection: Collection) -> Model {
        backend.register_collection(collection.clone());
        Model { backend, collection }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Insert a struct; returns its (possibly backend-assigned) identity.
    pub async fn create<T: Serialize>(&self, value: &T) -> Result<Id> {
        let record = to_record(value, &self.collection)?;
        let mut set = RecordSet::from(record);
        self.backend.insert(&self.collection.name, &mut set).await?;
        Ok(set.records.first().map(|r| r.id.clone()).unwrap_or_default())
    }

    pub async fn get<T: DeserializeOwned>(&self, id: impl Into<Id>) -> Result<T> {
        let record = self
            .backend
            .retrieve(&self.collection.name, &id.into(), &[])
            .await?;
        from_record(&record, &self.collection)
    }

    pub async fn update<T: Serialize>(&self, value: &T) -> Result<()> {
        let record = to_record(value, &self.collection)?;
        let mut set = RecordSet::from(record);
        self.backend.update(&self.collection.name, &mut set).await
    }

    pub async fn delete(&self, id: impl Into<Id>) -> Result<()> {
        self.backend.delete(&self.collection.name, &[id.into()]).await
    }

    pub async fn exists(&self, id: impl Into<Id>) -> bool {
        self.backend.exists(&self.collection.name, &id.into()).await
    }

    /// Query through the collection's indexer and unmarshal every hit.
    pub async fn find<T: DeserializeOwned>(&self, filter: &Filter) -> Result<Vec<T>> {
        let indexer = self
            .backend
            .with_search(&self.collection.name)
            .ok_or_else(|| Error::not_implemented(self.backend.label(), "search"))?;
        let results = indexer.query(&self.collection.name, filter).await?;
        results
            .iter()
            .map(|record| from_record(record, &self.collection))
            .collect()
    }
}
