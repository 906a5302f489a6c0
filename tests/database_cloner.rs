mod common;

use bson::{doc, Document};
use common::*;
use mongo_initial_sync::cloner::{ClonerState, CollectionCallback};
use mongo_initial_sync::{DatabaseCloner, DatabasesCloner, ErrorCode, Namespace, Result};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Finished = Arc<Mutex<Vec<(String, bool)>>>;

fn start_db_cloner(ctx: &Context, db: &str) -> (DatabaseCloner, Receiver<Result<()>>, Finished) {
    let finished: Finished = Arc::new(Mutex::new(vec![]));
    let record = finished.clone();
    let collection_work: CollectionCallback = Arc::new(move |nss: &Namespace, status: &Result<()>| {
        record.lock().unwrap().push((nss.to_string(), status.is_ok()));
    });
    let (tx, rx) = channel();
    let cloner = DatabaseCloner::new(
        ctx.executor.clone(),
        SOURCE,
        db,
        DatabaseCloner::default_predicate(),
        ctx.storage.clone(),
        collection_work,
        move |status| {
            let _ = tx.send(status);
        },
    );
    cloner.startup().unwrap();
    (cloner, rx, finished)
}

fn list_collections_reply(infos: Vec<Document>) -> Document {
    doc! {
        "cursor": {"id": 0_i64, "ns": "db.$cmd.listCollections", "firstBatch": infos},
        "ok": 1,
    }
}

#[test]
fn test_clone_collections_one_at_a_time() {
    let ctx = Context::new();
    for name in ["a", "b", "c"] {
        ctx.source
            .add_collection("db", name, FakeCollection::with_docs(vec![doc! {"_id": name}]));
    }
    let (cloner, rx, finished) = start_db_cloner(&ctx, "db");
    rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    cloner.join();

    assert_eq!(
        *finished.lock().unwrap(),
        vec![
            ("db.a".to_string(), true),
            ("db.b".to_string(), true),
            ("db.c".to_string(), true)
        ]
    );
    let counted: Vec<String> = ctx
        .source
        .commands_named("count")
        .iter()
        .map(|cmd| cmd.get_str("count").unwrap().to_string())
        .collect();
    assert_eq!(counted, vec!["a", "b", "c"]);
    assert_eq!(
        cloner.get_collection_namespaces(),
        vec![
            Namespace::new("db", "a"),
            Namespace::new("db", "b"),
            Namespace::new("db", "c")
        ]
    );

    let stats = cloner.get_stats();
    assert_eq!(stats.collections, 3);
    assert_eq!(stats.cloned_collections, 3);
    assert_eq!(stats.collection_stats.len(), 3);
    for name in ["a", "b", "c"] {
        assert_eq!(
            ctx.storage.collection(&Namespace::new("db", name)).unwrap().docs,
            vec![doc! {"_id": name}]
        );
    }
}

#[test]
fn test_skip_system_and_profile_collections() {
    let ctx = Context::new();
    for name in ["system.profile", "system.indexes", "system.js", "data"] {
        ctx.source
            .add_collection("db", name, FakeCollection::with_docs(vec![]));
    }
    let (cloner, rx, finished) = start_db_cloner(&ctx, "db");
    rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    cloner.join();

    let names: Vec<String> = finished.lock().unwrap().iter().map(|(n, _)| n.clone()).collect();
    assert_eq!(names, vec!["db.data", "db.system.js"]);
}

#[test]
fn test_duplicate_collection_names() {
    let ctx = Context::new();
    ctx.source.script_reply(
        "listCollections",
        list_collections_reply(vec![
            doc! {"name": "a", "options": {}},
            doc! {"name": "a", "options": {}},
        ]),
    );
    let (cloner, rx, finished) = start_db_cloner(&ctx, "db");
    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err();
    cloner.join();

    assert_eq!(err.code(), ErrorCode::BadValue);
    assert!(finished.lock().unwrap().is_empty());
    assert!(ctx.source.commands_named("count").is_empty());
}

#[test]
fn test_invalid_collection_info() {
    let ctx = Context::new();
    ctx.source.script_reply(
        "listCollections",
        list_collections_reply(vec![doc! {"name": "a"}]),
    );
    let (cloner, rx, _) = start_db_cloner(&ctx, "db");
    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err();
    cloner.join();
    assert_eq!(err.code(), ErrorCode::FailedToParse);
}

#[test]
fn test_empty_database() {
    let ctx = Context::new();
    ctx.source.add_database("db");
    let (cloner, rx, finished) = start_db_cloner(&ctx, "db");
    rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    cloner.join();
    assert!(finished.lock().unwrap().is_empty());
    assert_eq!(cloner.state(), ClonerState::Complete);
}

#[test]
fn test_failed_collection_fails_database() {
    let ctx = Context::new();
    for name in ["a", "b"] {
        ctx.source
            .add_collection("db", name, FakeCollection::with_docs(vec![doc! {"_id": 1}]));
    }
    ctx.source
        .fail_next("count", FakeFailure::Reply(ErrorCode::OperationFailed));

    let (cloner, rx, finished) = start_db_cloner(&ctx, "db");
    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err();
    cloner.join();

    assert_eq!(err.code(), ErrorCode::OperationFailed);
    assert_eq!(
        *finished.lock().unwrap(),
        vec![("db.a".to_string(), false), ("db.b".to_string(), true)]
    );
}

#[test]
fn test_clone_all_databases() {
    let ctx = Context::new();
    ctx.source
        .add_collection("admin", "system.version", FakeCollection::with_docs(vec![doc! {"_id": "v"}]));
    ctx.source
        .add_collection("app", "users", FakeCollection::with_docs(vec![doc! {"_id": 1}]));
    ctx.source
        .add_collection("local", "startup_log", FakeCollection::with_docs(vec![doc! {"_id": 1}]));

    let (tx, rx) = channel();
    let cloner = DatabasesCloner::new(
        ctx.executor.clone(),
        SOURCE,
        DatabasesCloner::default_predicate(),
        ctx.storage.clone(),
        move |status| {
            let _ = tx.send(status);
        },
    );
    cloner.startup().unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    cloner.join();

    assert_eq!(cloner.get_database_names(), vec!["admin", "app"]);
    let stats = cloner.get_stats();
    assert_eq!(stats.databases_cloned, 2);
    assert_eq!(stats.database_stats.len(), 2);
    assert!(stats.to_document().contains_key("admin"));

    assert!(ctx
        .storage
        .collection(&Namespace::new("app", "users"))
        .is_some());
    assert!(ctx
        .storage
        .collection(&Namespace::new("local", "startup_log"))
        .is_none());
}

#[test]
fn test_databases_cloner_list_databases_failure() {
    let ctx = Context::new();
    ctx.source
        .fail_next("listDatabases", FakeFailure::Reply(ErrorCode::OperationFailed));
    let (tx, rx) = channel();
    let cloner = DatabasesCloner::new(
        ctx.executor.clone(),
        SOURCE,
        DatabasesCloner::default_predicate(),
        ctx.storage.clone(),
        move |status| {
            let _ = tx.send(status);
        },
    );
    cloner.startup().unwrap();
    let err = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap_err();
    cloner.join();
    assert_eq!(err.code(), ErrorCode::OperationFailed);
    assert!(ctx.source.commands_named("listCollections").is_empty());
}
