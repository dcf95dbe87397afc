//! Drives the sync engine against a live record server on a local port.

use famsync::db::{init_db, SqliteStore};
use famsync::server::{router, ApiKeyEntry, ApiKeyStore, AppState, RecordStorage};
use famsync::sync::{HttpApplier, HttpProbe, HttpReconciler, RemoteClient};
use famsync_core::store::LocalStore;
use famsync_core::{
    ApplierRegistry, ConnectivityConfig, ConnectivityMonitor, ConnectivityState, EntityType,
    MutationStatus, Operation, Payload, SyncEngine,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

struct Server {
    url: String,
    _data: TempDir,
}

async fn start_server() -> Server {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve(listener).await
}

async fn serve(listener: tokio::net::TcpListener) -> Server {
    let data = TempDir::new().unwrap();
    let keys = ApiKeyStore::from_entries([
        ApiKeyEntry {
            key: "alex-key".into(),
            member: "alex".into(),
            family_id: "rivera".into(),
        },
        ApiKeyEntry {
            key: "sam-key".into(),
            member: "sam".into(),
            family_id: "rivera".into(),
        },
    ]);
    let app = router(AppState::new(keys, RecordStorage::new(data.path())));

    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        url: format!("http://{}", addr),
        _data: data,
    }
}

struct Device {
    engine: SyncEngine,
    store: Arc<SqliteStore>,
    _db: TempDir,
}

async fn device(url: &str, key: &str) -> Device {
    let db = TempDir::new().unwrap();
    let pool = init_db(&db.path().join("famsync.db")).await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));

    let client = RemoteClient::new(url, key);
    let monitor = Arc::new(ConnectivityMonitor::new(
        Arc::new(HttpProbe::new(client.clone())),
        ConnectivityConfig::default(),
    ));

    let applier = Arc::new(HttpApplier::new(client.clone()));
    let mut registry = ApplierRegistry::new();
    for entity_type in EntityType::known() {
        registry.register(entity_type, applier.clone());
    }

    let engine = SyncEngine::builder(store.clone(), monitor)
        .registry(registry)
        .reconciler(Arc::new(HttpReconciler::new(client)))
        .build()
        .await
        .unwrap();

    Device {
        engine,
        store,
        _db: db,
    }
}

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

async fn remote_record(url: &str, key: &str, entity: &str, id: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("{}/records/{}/{}", url, entity, id))
        .bearer_auth(key)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_offline_changes_sync_once_server_is_reachable() {
    // Reserve a port, then leave it closed until the server starts.
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let alex = device(&format!("http://{}", addr), "alex-key").await;
    assert_eq!(
        alex.engine.connectivity().check_now().await,
        ConnectivityState::Disconnected
    );
    let id = alex
        .engine
        .enqueue_mutation(
            EntityType::Task,
            Operation::Insert,
            payload(json!({"id": "t1", "title": "Water plants"})),
        )
        .await
        .unwrap();

    let result = alex.engine.force_sync_now().await;
    assert!(!result.success);
    assert_eq!(alex.engine.pending_count().await, 1);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let server = serve(listener).await;
    assert_eq!(
        alex.engine.connectivity().check_now().await,
        ConnectivityState::Connected
    );

    let result = alex.engine.force_sync_now().await;
    assert!(result.success, "{}", result.message);
    assert_eq!(alex.engine.pending_count().await, 0);
    assert_eq!(
        alex.engine.get_mutation(&id).await.unwrap().status,
        MutationStatus::Completed
    );

    let response = remote_record(&server.url, "sam-key", "task", "t1").await;
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["title"], "Water plants");
}

#[tokio::test]
async fn test_duplicate_redemption_settles_on_server_version() {
    let server = start_server().await;
    let sam = device(&server.url, "sam-key").await;
    let alex = device(&server.url, "alex-key").await;
    sam.engine.connectivity().check_now().await;
    alex.engine.connectivity().check_now().await;

    sam.engine
        .enqueue_mutation(
            EntityType::Redemption,
            Operation::Insert,
            payload(json!({"id": "r1", "reward": "movie night", "points": 50})),
        )
        .await
        .unwrap();
    assert!(sam.engine.force_sync_now().await.success);

    let id = alex
        .engine
        .enqueue_mutation(
            EntityType::Redemption,
            Operation::Insert,
            payload(json!({"id": "r1", "reward": "movie night", "points": 40})),
        )
        .await
        .unwrap();
    let result = alex.engine.force_sync_now().await;
    assert!(result.success, "{}", result.message);

    let m = alex.engine.get_mutation(&id).await.unwrap();
    assert_eq!(m.status, MutationStatus::Completed);

    let local = alex.store.get("redemption", "r1").await.unwrap().unwrap();
    assert_eq!(local["points"], 50);

    let body: Value = remote_record(&server.url, "sam-key", "redemption", "r1")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["points"], 50);
    assert_eq!(body["version"], 1);
}

#[tokio::test]
async fn test_task_conflict_parks_then_applies_manual_choice() {
    let server = start_server().await;
    let sam = device(&server.url, "sam-key").await;
    let alex = device(&server.url, "alex-key").await;
    sam.engine.connectivity().check_now().await;
    alex.engine.connectivity().check_now().await;

    sam.engine
        .enqueue_mutation(
            EntityType::Task,
            Operation::Insert,
            payload(json!({"id": "t9", "title": "Take out trash"})),
        )
        .await
        .unwrap();
    assert!(sam.engine.force_sync_now().await.success);

    let id = alex
        .engine
        .enqueue_mutation(
            EntityType::Task,
            Operation::Insert,
            payload(json!({"id": "t9", "title": "Take out recycling"})),
        )
        .await
        .unwrap();
    let result = alex.engine.force_sync_now().await;
    assert!(!result.success);

    let parked = alex.engine.get_mutation(&id).await.unwrap();
    assert!(parked.needs_manual_resolution);
    assert_eq!(
        parked.remote_snapshot.as_ref().unwrap()["title"],
        "Take out trash"
    );

    alex.engine
        .resolve_manual_conflict(
            &id,
            payload(json!({"id": "t9", "title": "Take out trash and recycling"})),
        )
        .await
        .unwrap();
    let result = alex.engine.force_sync_now().await;
    assert!(result.success, "{}", result.message);

    let body: Value = remote_record(&server.url, "sam-key", "task", "t9")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["title"], "Take out trash and recycling");
    assert_eq!(body["version"], 2);
}

#[tokio::test]
async fn test_reconcile_pulls_other_members_records() {
    let server = start_server().await;
    let sam = device(&server.url, "sam-key").await;
    let alex = device(&server.url, "alex-key").await;
    sam.engine.connectivity().check_now().await;
    alex.engine.connectivity().check_now().await;

    for (id, title) in [("t1", "Homework"), ("t2", "Walk dog")] {
        sam.engine
            .enqueue_mutation(
                EntityType::Task,
                Operation::Insert,
                payload(json!({"id": id, "title": title})),
            )
            .await
            .unwrap();
    }
    sam.engine
        .enqueue_mutation(
            EntityType::User,
            Operation::Update,
            payload(json!({"id": "u-sam", "name": "Sam", "theme": "dark"})),
        )
        .await
        .unwrap();
    assert!(sam.engine.force_sync_now().await.success);

    let report = alex.engine.reconcile_now().await.unwrap().unwrap();
    assert_eq!(report.records_updated, 3);
    assert_eq!(alex.store.count("task").await.unwrap(), 2);

    let user = alex.store.get("user", "u-sam").await.unwrap().unwrap();
    assert_eq!(user["theme"], "dark");

    let statistics = alex.engine.statistics().await;
    assert!(statistics.last_reconciled_at.is_some());
}

#[tokio::test]
async fn test_delete_of_missing_record_completes() {
    let server = start_server().await;
    let alex = device(&server.url, "alex-key").await;
    alex.engine.connectivity().check_now().await;

    let id = alex
        .engine
        .enqueue_mutation(
            EntityType::NotificationRead,
            Operation::Delete,
            payload(json!({"id": "n1"})),
        )
        .await
        .unwrap();
    assert!(alex.engine.force_sync_now().await.success);
    assert_eq!(
        alex.engine.get_mutation(&id).await.unwrap().status,
        MutationStatus::Completed
    );
}
