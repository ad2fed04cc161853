//! Elasticsearch scenarios over a mock transport: scroll pagination beyond
//! the bounded result window, and deferred-batch flush visibility.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pivot::backend::elastic::{ElasticBackend, ElasticTransport};
use pivot::prelude::*;
use serde_json::{Value as JsonValue, json};

/// An in-process cluster stand-in: bulk lines land in a document store,
/// searches serve it back, and the scroll API pages through it.
#[derive(Default)]
struct MockTransport {
    docs: Mutex<Vec<(String, JsonValue)>>,
    scroll_cursor: Mutex<usize>,
    scroll_batch: Mutex<usize>,
    search_calls: AtomicUsize,
    scroll_calls: AtomicUsize,
    bulk_calls: AtomicUsize,
}

impl MockTransport {
    fn preload(&self, count: usize) {
        let mut docs = self.docs.lock().unwrap();
        for seq in 0..count {
            docs.push((
                format!("doc-{seq}"),
                json!({ "id": format!("doc-{seq}"), "seq": seq }),
            ));
        }
    }

    fn hits(&self, from: usize, size: usize) -> Vec<JsonValue> {
        let docs = self.docs.lock().unwrap();
        docs.iter()
            .skip(from)
            .take(size)
            .map(|(id, source)| json!({ "_id": id, "_source": source }))
            .collect()
    }

    fn total(&self) -> usize {
        self.docs.lock().unwrap().len()
    }
}

#[async_trait]
impl ElasticTransport for MockTransport {
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<JsonValue>,
    ) -> pivot::Result<JsonValue> {
        match (method, path) {
            ("GET", "/") => Ok(json!({ "cluster_name": "mock" })),
            ("POST", p) if p.contains("/_search?scroll=") => {
                self.search_calls.fetch_add(1, Ordering::SeqCst);
                let size = body
                    .as_ref()
                    .and_then(|b| b.get("size"))
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(10) as usize;
                *self.scroll_batch.lock().unwrap() = size;
                *self.scroll_cursor.lock().unwrap() = size;
                Ok(json!({
                    "_scroll_id": "cursor-1",
                    "hits": { "total": { "value": self.total() }, "hits": self.hits(0, size) }
                }))
            }
            ("POST", "/_search/scroll") => {
                self.scroll_calls.fetch_add(1, Ordering::SeqCst);
                let size = *self.scroll_batch.lock().unwrap();
                let mut cursor = self.scroll_cursor.lock().unwrap();
                let from = *cursor;
                *cursor += size;
                Ok(json!({
                    "_scroll_id": "cursor-1",
                    "hits": { "total": { "value": self.total() }, "hits": self.hits(from, size) }
                }))
            }
            ("DELETE", "/_search/scroll") => Ok(json!({ "succeeded": true })),
            ("POST", p) if p.ends_with("/_search") => {
                self.search_calls.fetch_add(1, Ordering::SeqCst);
                let size = body
                    .as_ref()
                    .and_then(|b| b.get("size"))
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(self.total() as u64) as usize;
                let from = body
                    .as_ref()
                    .and_then(|b| b.get("from"))
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(0) as usize;
                Ok(json!({
                    "hits": { "total": { "value": self.total() }, "hits": self.hits(from, size) }
                }))
            }
            ("GET", p) if p.contains("/_doc/") => {
                let id = p.rsplit('/').next().unwrap_or_default();
                let docs = self.docs.lock().unwrap();
                match docs.iter().find(|(doc_id, _)| doc_id == id) {
                    Some((doc_id, source)) => Ok(json!({
                        "found": true,
                        "_id": doc_id,
                        "_source": source
                    })),
                    None => Ok(json!({ "found": false })),
                }
            }
            ("DELETE", p) if p.contains("/_doc/") => {
                let id = p.rsplit('/').next().unwrap_or_default().to_string();
                self.docs.lock().unwrap().retain(|(doc_id, _)| doc_id != &id);
                Ok(json!({ "result": "deleted" }))
            }
            ("PUT", _) => Ok(json!({ "acknowledged": true })),
            _ => Ok(json!({})),
        }
    }

    async fn bulk(&self, lines: Vec<JsonValue>) -> pivot::Result<JsonValue> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.lock().unwrap();
        let mut iter = lines.into_iter();
        while let Some(action) = iter.next() {
            if let Some(meta) = action.get("index") {
                let id = meta
                    .get("_id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                let document = iter.next().unwrap_or(JsonValue::Null);
                docs.retain(|(doc_id, _)| doc_id != &id);
                docs.push((id, document));
            } else if let Some(meta) = action.get("delete") {
                let id = meta
                    .get("_id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                docs.retain(|(doc_id, _)| doc_id != &id);
            }
        }
        Ok(json!({ "errors": false, "items": [] }))
    }
}

fn docs_collection() -> Collection {
    Collection::new("docs")
        .with_field(Field::identity("id", Kind::String))
        .with_field(Field::new("seq", Kind::Int))
}

#[tokio::test]
async fn unbounded_queries_scroll_past_the_result_window() {
    let transport = Arc::new(MockTransport::default());
    transport.preload(25_000);

    let dsn = ConnectionString::parse("es://search:9200?pageSize=10000").unwrap();
    let backend = ElasticBackend::new(dsn, Arc::clone(&transport) as Arc<dyn ElasticTransport>);
    backend.register_collection(docs_collection());

    let indexer = backend.with_search("docs").unwrap();
    let mut seen: u64 = 0;
    let mut last_total: u64 = 0;
    let mut in_order = true;
    indexer
        .query_func("docs", &Filter::all(), &mut |record, page| {
            let seq = record.get_value("seq").as_int().unwrap_or(-1);
            if seq != seen as i64 {
                in_order = false;
            }
            seen += 1;
            last_total = page.total_results;
            Ok(())
        })
        .await
        .unwrap();

    // Every document delivered exactly once, in order, with ≥3 round-trips
    // at a 10 000-document page size.
    assert_eq!(seen, 25_000);
    assert!(in_order);
    assert_eq!(last_total, 25_000);
    assert_eq!(transport.search_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.scroll_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn bounded_queries_stay_on_the_search_api() {
    let transport = Arc::new(MockTransport::default());
    transport.preload(50);

    let dsn = ConnectionString::parse("es://search:9200").unwrap();
    let backend = ElasticBackend::new(dsn, Arc::clone(&transport) as Arc<dyn ElasticTransport>);
    backend.register_collection(docs_collection());

    let indexer = backend.with_search("docs").unwrap();
    let results = indexer
        .query("docs", &Filter::new().with_limit(10))
        .await
        .unwrap();
    assert_eq!(results.len(), 10);
    assert_eq!(results.result_count, 50);
    assert_eq!(transport.scroll_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn deferred_batch_flushes_on_demand() {
    let transport = Arc::new(MockTransport::default());
    let dsn = ConnectionString::parse("es://search:9200?flushBatchSize=100").unwrap();
    let backend = ElasticBackend::new(dsn, Arc::clone(&transport) as Arc<dyn ElasticTransport>);
    backend.register_collection(docs_collection());

    let mut set = RecordSet::from_records(
        (0..3)
            .map(|i| Record::new(format!("k{i}")).with_field("seq", i as i64))
            .collect(),
    );
    backend.insert("docs", &mut set).await.unwrap();
    // Writes are buffered until a flush trigger fires.
    assert_eq!(transport.bulk_calls.load(Ordering::SeqCst), 0);

    backend.flush().await.unwrap();
    assert_eq!(transport.bulk_calls.load(Ordering::SeqCst), 1);

    // Flushed writes are visible to a subsequent query.
    let indexer = backend.with_search("docs").unwrap();
    let results = indexer.query("docs", &Filter::new().with_limit(10)).await.unwrap();
    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn deferred_batch_flushes_on_size_threshold() {
    let transport = Arc::new(MockTransport::default());
    let dsn = ConnectionString::parse("es://search:9200?flushBatchSize=2").unwrap();
    let backend = ElasticBackend::new(dsn, Arc::clone(&transport) as Arc<dyn ElasticTransport>);
    backend.register_collection(docs_collection());

    let mut set = RecordSet::from_records(
        (0..2)
            .map(|i| Record::new(format!("s{i}")).with_field("seq", i as i64))
            .collect(),
    );
    backend.insert("docs", &mut set).await.unwrap();
    // The second enqueue crossed the threshold and drained the batch.
    assert_eq!(transport.bulk_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn insert_retrieve_and_delete_documents() {
    let transport = Arc::new(MockTransport::default());
    let dsn = ConnectionString::parse("es://search:9200").unwrap();
    let backend = ElasticBackend::new(dsn, Arc::clone(&transport) as Arc<dyn ElasticTransport>);
    backend.register_collection(docs_collection());

    let mut set = RecordSet::from(Record::new("d1").with_field("seq", 41));
    backend.insert("docs", &mut set).await.unwrap();

    // Retrieve flushes the pending batch first, so the write is observed.
    let record = backend.retrieve("docs", &Id::from("d1"), &[]).await.unwrap();
    assert_eq!(record.get_value("seq"), Value::Int(41));
    assert!(backend.exists("docs", &Id::from("d1")).await);

    // A second insert with the same identity conflicts.
    let mut dup = RecordSet::from(Record::new("d1").with_field("seq", 0));
    let err = backend.insert("docs", &mut dup).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));

    backend.delete("docs", &[Id::from("d1")]).await.unwrap();
    assert!(!backend.exists("docs", &Id::from("d1")).await);
}
