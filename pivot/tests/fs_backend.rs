//! Filesystem backend scenarios over a temporary directory: the persisted
//! layout, schema autoregistration, lock sentinels, and TTL expiry.

use std::sync::Arc;
use std::time::Duration;

use pivot::backend::fs::FsBackend;
use pivot::prelude::*;

fn users() -> Collection {
    Collection::new("users")
        .with_field(Field::identity("id", Kind::String))
        .with_field(Field::new("email", Kind::String).required())
        .with_field(Field::new("age", Kind::Int))
}

fn backend_at(root: &std::path::Path, opts: &str) -> Arc<FsBackend> {
    let dsn = ConnectionString::parse(&format!("fs:///unused{opts}")).unwrap();
    FsBackend::at_root(root, dsn)
}

#[tokio::test]
async fn crud_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_at(dir.path(), "?format=yaml");
    backend.initialize().await.unwrap();
    backend.create_collection(users()).await.unwrap();

    let mut set = RecordSet::from(
        Record::new("u1").with_field("email", "a@b.c").with_field("age", 30),
    );
    backend.insert("users", &mut set).await.unwrap();

    // The persisted layout: <root>/users/schema.yaml + data/u1.yaml.
    assert!(dir.path().join("users/schema.yaml").is_file());
    assert!(dir.path().join("users/data/u1.yaml").is_file());
    // The lock sentinel is gone once the write completes.
    assert!(!dir.path().join("users/data/u1.lock").exists());

    assert!(backend.exists("users", &Id::from("u1")).await);
    let record = backend.retrieve("users", &Id::from("u1"), &[]).await.unwrap();
    assert_eq!(record.get_value("email"), Value::from("a@b.c"));
    assert_eq!(record.get_value("age"), Value::Int(30));

    let mut dup = RecordSet::from(Record::new("u1").with_field("email", "other@b.c"));
    assert!(matches!(
        backend.insert("users", &mut dup).await.unwrap_err(),
        Error::Conflict { .. }
    ));

    let mut change = RecordSet::from(
        Record::new("u1").with_field("email", "a@b.c").with_field("age", 31),
    );
    backend.update("users", &mut change).await.unwrap();
    let record = backend.retrieve("users", &Id::from("u1"), &[]).await.unwrap();
    assert_eq!(record.get_value("age"), Value::Int(31));

    backend.delete("users", &[Id::from("u1")]).await.unwrap();
    assert!(!backend.exists("users", &Id::from("u1")).await);
    assert!(!dir.path().join("users/data/u1.yaml").exists());
}

#[tokio::test]
async fn json_format_option() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_at(dir.path(), "?format=json");
    backend.initialize().await.unwrap();
    backend.create_collection(users()).await.unwrap();

    let mut set = RecordSet::from(Record::new("u2").with_field("email", "j@s.on"));
    backend.insert("users", &mut set).await.unwrap();
    assert!(dir.path().join("users/data/u2.json").is_file());

    let raw = std::fs::read_to_string(dir.path().join("users/data/u2.json")).unwrap();
    assert!(raw.contains("j@s.on"));
}

#[tokio::test]
async fn schemas_autoregister_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let backend = backend_at(dir.path(), "?format=yaml");
        backend.initialize().await.unwrap();
        backend.create_collection(users()).await.unwrap();
        let mut set = RecordSet::from(Record::new("u3").with_field("email", "p@q.r"));
        backend.insert("users", &mut set).await.unwrap();
    }

    // A fresh backend over the same root rediscovers the collection.
    let backend = backend_at(dir.path(), "?format=yaml&autoregister=true");
    backend.initialize().await.unwrap();
    assert_eq!(backend.list_collections(), vec!["users".to_string()]);
    let schema = backend.get_collection("users").unwrap();
    assert_eq!(schema.identity_field, "id");
    assert!(schema.field("email").unwrap().required);

    let record = backend.retrieve("users", &Id::from("u3"), &[]).await.unwrap();
    assert_eq!(record.get_value("email"), Value::from("p@q.r"));
}

#[tokio::test]
async fn queries_filter_sort_and_project() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_at(dir.path(), "?format=yaml");
    backend.initialize().await.unwrap();
    backend.create_collection(users()).await.unwrap();

    let mut set = RecordSet::from_records(vec![
        Record::new("a").with_field("email", "a@x.y").with_field("age", 31),
        Record::new("b").with_field("email", "b@x.y").with_field("age", 24),
        Record::new("c").with_field("email", "c@x.y").with_field("age", 45),
    ]);
    backend.insert("users", &mut set).await.unwrap();

    let indexer = backend.with_search("users").unwrap();
    let results = indexer
        .query("users", &Filter::parse("age/gte:30/sort/-age").unwrap())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results.records[0].get_value("age"), Value::Int(45));

    let values = indexer
        .list_values("users", &["age".to_string()], &Filter::all())
        .await
        .unwrap();
    assert_eq!(values["age"].len(), 3);

    // Count works; richer aggregation declines.
    let aggregator = backend.with_aggregator("users").unwrap();
    assert_eq!(aggregator.count("users", &Filter::all()).await.unwrap(), 3);
    assert!(matches!(
        aggregator.sum("users", "age", &Filter::all()).await.unwrap_err(),
        Error::NotImplemented { .. }
    ));
}

#[tokio::test]
async fn expired_records_read_as_missing_and_vanish() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_at(dir.path(), "?format=yaml");
    backend.initialize().await.unwrap();
    backend
        .create_collection(
            Collection::new("sessions")
                .with_field(Field::identity("id", Kind::String))
                .with_time_to_live(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let mut set = RecordSet::from(Record::new("s1"));
    backend.insert("sessions", &mut set).await.unwrap();
    assert!(backend.exists("sessions", &Id::from("s1")).await);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let err = backend.retrieve("sessions", &Id::from("s1"), &[]).await.unwrap_err();
    assert!(err.is_not_found());
    // The expired file was dropped on read.
    assert!(!dir.path().join("sessions/data/s1.yaml").exists());
}

#[tokio::test]
async fn delete_collection_removes_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_at(dir.path(), "?format=yaml");
    backend.initialize().await.unwrap();
    backend.create_collection(users()).await.unwrap();
    let mut set = RecordSet::from(Record::new("u9").with_field("email", "z@z.z"));
    backend.insert("users", &mut set).await.unwrap();

    backend.delete_collection("users").await.unwrap();
    assert!(!dir.path().join("users").exists());
    assert!(backend.get_collection("users").is_err());
}

#[tokio::test]
async fn lock_sentinel_blocks_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    let backend = backend_at(dir.path(), "?format=yaml");
    backend.initialize().await.unwrap();
    backend.create_collection(users()).await.unwrap();

    // A stale sentinel from a crashed writer makes the write collide.
    std::fs::create_dir_all(dir.path().join("users/data")).unwrap();
    std::fs::write(dir.path().join("users/data/u1.lock"), b"").unwrap();

    let mut set = RecordSet::from(Record::new("u1").with_field("email", "a@b.c"));
    let err = backend.insert("users", &mut set).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}
