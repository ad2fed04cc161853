//! Multi-indexer selection strategies and the meta-index join.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pivot::backend::memory::MemoryBackend;
use pivot::compose::{IndexerOp, MetaIndex, MultiIndexer, Strategy};
use pivot::prelude::*;

/// Scripted child indexer: records which operations reached it and can be
/// told to fail.
struct MockIndexer {
    name: &'static str,
    dsn: ConnectionString,
    fail: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockIndexer {
    fn new(name: &'static str, fail: bool, calls: Arc<Mutex<Vec<String>>>) -> Arc<dyn Indexer> {
        Arc::new(MockIndexer {
            name,
            dsn: ConnectionString::parse("memory://").unwrap(),
            fail,
            calls,
        })
    }

    fn note(&self, op: &str) {
        self.calls.lock().unwrap().push(format!("{}:{op}", self.name));
    }

    fn outcome(&self) -> pivot::Result<()> {
        if self.fail {
            Err(Error::internal(format!("{} failed", self.name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Indexer for MockIndexer {
    fn index_connection_string(&self) -> &ConnectionString {
        &self.dsn
    }

    async fn index_initialize(&self, _parent: Arc<dyn Backend>) -> pivot::Result<()> {
        self.note("initialize");
        Ok(())
    }

    fn parent(&self) -> Option<Arc<dyn Backend>> {
        None
    }

    async fn index_exists(&self, _collection: &str, _id: &Id) -> bool {
        !self.fail
    }

    async fn index_retrieve(&self, _collection: &str, id: &Id) -> pivot::Result<Record> {
        self.note("retrieve");
        self.outcome()?;
        Ok(Record::new(id.clone()).with_field("served_by", self.name))
    }

    async fn index_remove(&self, _collection: &str, _ids: &[Id]) -> pivot::Result<()> {
        self.note("remove");
        self.outcome()
    }

    async fn index(&self, _collection: &str, _records: &RecordSet) -> pivot::Result<()> {
        self.note("index");
        self.outcome()
    }

    async fn query_func(
        &self,
        _collection: &str,
        _filter: &Filter,
        each: pivot::backend::QueryResultFn<'_>,
    ) -> pivot::Result<()> {
        self.note("query");
        self.outcome()?;
        each(
            Record::new(1i64).with_field("served_by", self.name),
            &pivot::QueryPage::default(),
        )
    }

    async fn list_values(
        &self,
        _collection: &str,
        fields: &[String],
        _filter: &Filter,
    ) -> pivot::Result<BTreeMap<String, Vec<Value>>> {
        self.note("list_values");
        self.outcome()?;
        Ok(fields
            .iter()
            .map(|f| (f.clone(), vec![Value::from(self.name)]))
            .collect())
    }

    async fn delete_query(&self, _collection: &str, _filter: &Filter) -> pivot::Result<()> {
        self.note("delete_query");
        self.outcome()
    }

    async fn flush_index(&self) -> pivot::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn sequential_stops_at_first_success() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let first = MockIndexer::new("first", false, Arc::clone(&calls));
    let second = MockIndexer::new("second", false, Arc::clone(&calls));
    let multi = MultiIndexer::new(vec![first, second]);

    let record = multi.index_retrieve("things", &Id::from(1)).await.unwrap();
    assert_eq!(record.get_value("served_by"), Value::from("first"));
    // The second child was never invoked.
    assert_eq!(calls.lock().unwrap().as_slice(), ["first:retrieve"]);
}

#[tokio::test]
async fn sequential_falls_through_failures() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let first = MockIndexer::new("first", true, Arc::clone(&calls));
    let second = MockIndexer::new("second", false, Arc::clone(&calls));
    let multi = MultiIndexer::new(vec![first, second]);

    let record = multi.index_retrieve("things", &Id::from(1)).await.unwrap();
    assert_eq!(record.get_value("served_by"), Value::from("second"));
    assert_eq!(
        calls.lock().unwrap().as_slice(),
        ["first:retrieve", "second:retrieve"]
    );
}

#[tokio::test]
async fn all_attempts_every_target_and_returns_the_first_error() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let ok_a = MockIndexer::new("a", false, Arc::clone(&calls));
    let failing = MockIndexer::new("b", true, Arc::clone(&calls));
    let ok_c = MockIndexer::new("c", false, Arc::clone(&calls));
    let multi = MultiIndexer::new(vec![ok_a, failing, ok_c]);

    let err = multi
        .index("things", &RecordSet::from(Record::new(1i64)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("b failed"));
    // Every child was attempted despite the failure in the middle.
    assert_eq!(
        calls.lock().unwrap().as_slice(),
        ["a:index", "b:index", "c:index"]
    );
}

#[tokio::test]
async fn all_matches_sequential_effect_when_everything_succeeds() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let a = MockIndexer::new("a", false, Arc::clone(&calls));
    let b = MockIndexer::new("b", false, Arc::clone(&calls));
    let multi = MultiIndexer::new(vec![a, b]);

    multi
        .index("things", &RecordSet::from(Record::new(1i64)))
        .await
        .unwrap();
    assert_eq!(calls.lock().unwrap().as_slice(), ["a:index", "b:index"]);
}

#[tokio::test]
async fn first_and_all_except_first_narrow_the_targets() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let a = MockIndexer::new("a", false, Arc::clone(&calls));
    let b = MockIndexer::new("b", false, Arc::clone(&calls));
    let c = MockIndexer::new("c", false, Arc::clone(&calls));
    let multi = MultiIndexer::new(vec![a, b, c]);

    multi.set_strategy(IndexerOp::Persist, Strategy::First);
    multi
        .index("things", &RecordSet::from(Record::new(1i64)))
        .await
        .unwrap();
    assert_eq!(calls.lock().unwrap().as_slice(), ["a:index"]);

    calls.lock().unwrap().clear();
    multi.set_strategy(IndexerOp::Persist, Strategy::AllExceptFirst);
    multi
        .index("things", &RecordSet::from(Record::new(1i64)))
        .await
        .unwrap();
    assert_eq!(calls.lock().unwrap().as_slice(), ["b:index", "c:index"]);
}

#[tokio::test]
async fn added_indexers_inherit_initialisation() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let a = MockIndexer::new("a", false, Arc::clone(&calls));
    let multi = MultiIndexer::new(vec![a]);

    let parent = MemoryBackend::with_dsn(ConnectionString::parse("memory://").unwrap());
    multi
        .index_initialize(parent as Arc<dyn Backend>)
        .await
        .unwrap();
    assert_eq!(calls.lock().unwrap().as_slice(), ["a:initialize"]);

    let b = MockIndexer::new("b", false, Arc::clone(&calls));
    multi.add_indexer(b).await.unwrap();
    assert_eq!(
        calls.lock().unwrap().as_slice(),
        ["a:initialize", "b:initialize"]
    );
    assert_eq!(multi.len(), 2);
}

async fn join_fixture() -> (Arc<dyn Indexer>, Arc<dyn Indexer>) {
    let backend = MemoryBackend::with_dsn(ConnectionString::parse("memory://").unwrap());
    backend.register_collection(
        Collection::new("users")
            .with_field(Field::identity("id", Kind::Int))
            .with_field(Field::new("name", Kind::String)),
    );
    backend.register_collection(
        Collection::new("posts")
            .with_field(Field::identity("id", Kind::Int))
            .with_field(Field::new("author_id", Kind::Int))
            .with_field(Field::new("title", Kind::String)),
    );
    backend
        .insert(
            "users",
            &mut RecordSet::from_records(vec![
                Record::new(1i64).with_field("name", "A"),
                Record::new(2i64).with_field("name", "B"),
            ]),
        )
        .await
        .unwrap();
    backend
        .insert(
            "posts",
            &mut RecordSet::from_records(vec![
                Record::new(10i64).with_field("author_id", 1).with_field("title", "one"),
                Record::new(11i64).with_field("author_id", 1).with_field("title", "two"),
                Record::new(12i64).with_field("author_id", 2).with_field("title", "three"),
            ]),
        )
        .await
        .unwrap();
    let users_idx = backend.with_search("users").unwrap();
    let posts_idx = backend.with_search("posts").unwrap();
    (users_idx, posts_idx)
}

#[tokio::test]
async fn meta_index_joins_left_and_right() {
    let (users_idx, posts_idx) = join_fixture().await;
    let meta = MetaIndex::new(users_idx, "users", "id", posts_idx, "posts", "author_id");

    // All of user A's posts, keyed [user_id, post_id], carrying both sides.
    let results = meta
        .query("users+posts", &Filter::parse("name/A").unwrap())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    for record in results.iter() {
        assert_eq!(record.id.len(), 2);
        assert_eq!(record.id.values()[0], Value::Int(1));
        assert_eq!(record.get_value("name"), Value::from("A"));
        assert!(!record.get_value("title").is_null());
    }
}

#[tokio::test]
async fn meta_index_is_query_only() {
    let (users_idx, posts_idx) = join_fixture().await;
    let meta = MetaIndex::new(users_idx, "users", "id", posts_idx, "posts", "author_id");

    let err = meta
        .index("users+posts", &RecordSet::from(Record::new(1i64)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented { .. }));
    let err = meta
        .delete_query("users+posts", &Filter::all())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented { .. }));
}

#[tokio::test]
async fn meta_index_list_values_dedupes() {
    let (users_idx, posts_idx) = join_fixture().await;
    let meta = MetaIndex::new(users_idx, "users", "id", posts_idx, "posts", "author_id");

    let values = meta
        .list_values("users+posts", &["name".to_string()], &Filter::all())
        .await
        .unwrap();
    assert_eq!(values["name"], vec![Value::from("A"), Value::from("B")]);
}
