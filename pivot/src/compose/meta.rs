//! Meta-index: a logical join of two indexers on
//! `left.left_field == right.right_field`.
//!
//! A query runs the caller's filter against the left side, collects the
//! distinct join-key values, issues one right-side query over that value
//! set, and emits a synthetic record per right hit carrying both sides,
//! keyed `[left_id, right_id]`. Only the query operations are supported;
//! mutations decline.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{Backend, Indexer, QueryPage, QueryResultFn};
use crate::dsn::ConnectionString;
use crate::errors::{Error, Result};
use crate::filter::{Criterion, Filter, Operator};
use crate::schema::record::{Id, Record, RecordSet};
use crate::value::Value;

/// Cap on the single right-side query joining the collected key values.
const JOIN_FETCH_LIMIT: usize = 10_000;

pub struct MetaIndex {
    dsn: ConnectionString,
    left: Arc<dyn Indexer>,
    left_collection: String,
    left_field: String,
    right: Arc<dyn Indexer>,
    right_collection: String,
    right_field: String,
}

impl MetaIndex {
    pub fn new(
        left: Arc<dyn Indexer>,
        left_collection: impl Into<String>,
        left_field: impl Into<String>,
        right: Arc<dyn Indexer>,
        right_collection: impl Into<String>,
        right_field: impl Into<String>,
    ) -> Arc<MetaIndex> {
        Arc::new(MetaIndex {
            dsn: ConnectionString::parse("metaindex://").unwrap_or_default(),
            left,
            left_collection: left_collection.into(),
            left_field: left_field.into(),
            right,
            right_collection: right_collection.into(),
            right_field: right_field.into(),
        })
    }

    fn query_only(&self) -> Error {
        Error::not_implemented("metaindex", "query only")
    }

    fn join_key(&self, record: &Record) -> Option<Value> {
        match record.get(&self.left_field) {
            Some(value) if !value.is_null() => Some(value.clone()),
            _ => record.id.first().cloned(),
        }
    }

    async fn joined(&self, filter: &Filter) -> Result<(Vec<Record>, u64)> {
        let left_hits = self.left.query(&self.left_collection, filter).await?;

        // Distinct join-key values, with the left records grouped by them.
        let mut by_key: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        let mut values: Vec<Value> = Vec::new();
        for record in left_hits {
            let Some(key) = self.join_key(&record) else {
                continue;
            };
            let rendered = key.to_display_string();
            if !by_key.contains_key(&rendered) {
                values.push(key);
            }
            by_key.entry(rendered).or_default().push(record);
        }
        if values.is_empty() {
            return Ok((Vec::new(), 0));
        }
        debug!(
            keys = values.len(),
            left = %self.left_collection,
            right = %self.right_collection,
            "joining indexes"
        );

        let right_filter = Filter::new()
            .add(Criterion::new(self.right_field.as_str(), Operator::Is, values))
            .with_limit(JOIN_FETCH_LIMIT);
        let right_hits = self.right.query(&self.right_collection, &right_filter).await?;

        let mut joined = Vec::new();
        for right in right_hits {
            let key = right.get_value(&self.right_field).to_display_string();
            let Some(lefts) = by_key.get(&key) else {
                continue;
            };
            for left in lefts {
                let left_id = left.id.first().cloned().unwrap_or(Value::Null);
                let right_id = right.id.first().cloned().unwrap_or(Value::Null);
                let mut merged = Record::new(Id::composite([left_id, right_id]));
                merged.fields = left.fields.clone();
                // Right side wins on field-name collisions.
                for (name, value) in &right.fields {
                    merged.fields.insert(name.clone(), value.clone());
                }
                joined.push(merged);
            }
        }
        let total = joined.len() as u64;
        Ok((joined, total))
    }
}

#[async_trait]
impl Indexer for MetaIndex {
    fn index_connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn index_initialize(&self, _parent: Arc<dyn Backend>) -> Result<()> {
        Ok(())
    }

    fn parent(&self) -> Option<Arc<dyn Backend>> {
        None
    }

    async fn index_exists(&self, _collection: &str, _id: &Id) -> bool {
        false
    }

    async fn index_retrieve(&self, _collection: &str, id: &Id) -> Result<Record> {
        Err(Error::record_not_found("metaindex", id))
    }

    async fn index_remove(&self, _collection: &str, _ids: &[Id]) -> Result<()> {
        Err(self.query_only())
    }

    async fn index(&self, _collection: &str, _records: &RecordSet) -> Result<()> {
        Err(self.query_only())
    }

    async fn query_func(&self, _collection: &str, filter: &Filter, each: QueryResultFn<'_>) -> Result<()> {
        let (hits, total) = self.joined(filter).await?;
        let per_page = filter.limit.unwrap_or_else(|| hits.len().max(1));
        let page = QueryPage {
            page: 1,
            total_pages: (total as usize).div_ceil(per_page.max(1)),
            per_page,
            total_results: total,
            offset: 0,
        };
        for record in hits {
            each(record, &page)?;
        }
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &Filter) -> Result<RecordSet> {
        let mut set = RecordSet::new();
        self.query_func(collection, filter, &mut |record, page| {
            set.result_count = page.total_results;
            set.records.push(record);
            Ok(())
        })
        .await?;
        set.known_size = true;
        Ok(set)
    }

    async fn list_values(
        &self,
        _collection: &str,
        fields: &[String],
        filter: &Filter,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let (hits, _) = self.joined(filter).await?;
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
        Err(self.query_only())
    }

    async fn flush_index(&self) -> Result<()> {
        Ok(())
    }
}
