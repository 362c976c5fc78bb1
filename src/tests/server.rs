//! Record server tests against a real listener.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::config::{Config, SyncSettings};
use crate::errors::SyncError;
use crate::models::{ChangeKind, Client as ClientRecord, Table};
use crate::remote::{Filter, HttpRemote, RemoteStore, SelectQuery, SqliteStore};
use crate::session::{SyncClient, SyncOptions};
use crate::storage::MemoryStore;
use crate::{create_router, AppState};

const API_KEY: &str = "test-api-key";

/// Test fixture for integration tests.
struct TestFixture {
    client: Client,
    base_url: String,
    _temp_dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_psk(Some(API_KEY.to_string())).await
    }

    async fn with_psk(psk: Option<String>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.sqlite");

        let store = Arc::new(SqliteStore::open(&db_path).await.expect("Failed to init DB"));

        let config = Config {
            api_psk: psk.clone(),
            db_path,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "warn".to_string(),
            sync: SyncSettings::default(),
        };

        let app = create_router(AppState {
            store,
            config: Arc::new(config),
        });

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut client_builder = Client::builder();
        if let Some(key) = psk {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert("x-api-key", key.parse().unwrap());
            client_builder = client_builder.default_headers(headers);
        }

        TestFixture {
            client: client_builder.build().unwrap(),
            base_url,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn remote(&self) -> HttpRemote {
        HttpRemote::new(self.base_url.clone(), Some(API_KEY.to_string()))
    }

    async fn insert(&self, user: &str, table: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/api/{}", table)))
            .header("x-user-id", user)
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_auth_missing_psk() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .post(fixture.url("/api/clients/query"))
        .header("x-user-id", "u-1")
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_auth_missing_user() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .post(fixture.url("/api/clients/query"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_open_server_without_psk() {
    let fixture = TestFixture::with_psk(None).await;

    let resp = fixture.insert("u-1", "drivers", json!({ "name": "Ana" })).await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_record_crud() {
    let fixture = TestFixture::new().await;

    // Create
    let resp = fixture
        .insert(
            "u-1",
            "clients",
            json!({ "name": "Transportes Silva", "city": "Santos", "unknown": 1 }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["user_id"], "u-1");
    assert_eq!(body["data"]["sync_version"], 1);
    assert!(body["data"].get("unknown").is_none());

    // Patch
    let resp = fixture
        .client
        .patch(fixture.url(&format!("/api/clients/{}", id)))
        .header("x-user-id", "u-1")
        .json(&json!({ "data": { "city": "Campinas" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["name"], "Transportes Silva");
    assert_eq!(body["data"]["city"], "Campinas");
    assert_eq!(body["data"]["sync_version"], 2);

    // Query
    let resp = fixture
        .client
        .post(fixture.url("/api/clients/query"))
        .header("x-user-id", "u-1")
        .json(&json!({ "filters": [{ "column": "city", "value": "Campinas" }] }))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // Delete
    let resp = fixture
        .client
        .delete(fixture.url(&format!("/api/clients/{}", id)))
        .header("x-user-id", "u-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = fixture
        .client
        .delete(fixture.url(&format!("/api/clients/{}", id)))
        .header("x-user-id", "u-1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_owner_isolation() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .insert("u-1", "drivers", json!({ "id": "d-1", "name": "Ana" }))
        .await;
    assert_eq!(resp.status(), 200);

    let resp = fixture
        .client
        .post(fixture.url("/api/drivers/query"))
        .header("x-user-id", "u-2")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"], json!([]));

    let resp = fixture
        .client
        .patch(fixture.url("/api/drivers/d-1"))
        .header("x-user-id", "u-2")
        .json(&json!({ "data": { "name": "Mallory" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_version_conflict() {
    let fixture = TestFixture::new().await;

    fixture
        .insert("u-1", "freights", json!({ "id": "f-1", "origin": "Santos" }))
        .await;

    let patch = |version: i64| {
        fixture
            .client
            .patch(fixture.url("/api/freights/f-1"))
            .header("x-user-id", "u-1")
            .json(&json!({ "data": { "status": "in_transit" }, "expectedVersion": version }))
            .send()
    };

    assert_eq!(patch(1).await.unwrap().status(), 200);

    let resp = patch(1).await.unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "VERSION_MISMATCH");
    assert_eq!(body["error"]["details"]["currentVersion"], 2);
}

#[tokio::test]
async fn test_rejected_payloads() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .insert("u-1", "freights", json!({ "weight_kg": "heavy" }))
        .await;
    assert_eq!(resp.status(), 422);

    let resp = fixture.insert("u-1", "invoices", json!({})).await;
    assert_eq!(resp.status(), 400);

    let resp = fixture
        .insert("u-1", "quotations", json!({ "client_name": "Acme" }))
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_http_remote_round_trip() {
    let fixture = TestFixture::new().await;
    let remote = fixture.remote();

    let created = remote
        .insert(
            Table::Freights,
            "u-1",
            json!({ "id": "f-1", "status": "pending", "value": 1200.0 }),
        )
        .await
        .unwrap();
    assert_eq!(created["sync_version"], 1);

    remote
        .insert(
            Table::Freights,
            "u-1",
            json!({ "id": "f-2", "status": "delivered", "value": 800.0 }),
        )
        .await
        .unwrap();

    let pending = remote
        .select(
            Table::Freights,
            "u-1",
            &SelectQuery::new().filter(Filter::eq("status", "pending")),
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["id"], "f-1");

    let err = remote
        .update(Table::Freights, "u-1", "f-1", json!({ "value": 1.0 }), Some(7))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Conflict { current_version: 1, .. }));

    let err = remote.delete(Table::Freights, "u-2", "f-1").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));

    remote.delete(Table::Freights, "u-1", "f-1").await.unwrap();
}

#[tokio::test]
async fn test_http_remote_reports_unreachable_server() {
    let remote = HttpRemote::new("http://127.0.0.1:9", None);
    let err = remote
        .select(Table::Clients, "u-1", &SelectQuery::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_change_feed() {
    let fixture = TestFixture::new().await;
    let remote = fixture.remote();

    let mut feed = remote.subscribe(Table::Clients, "u-1").await.unwrap();

    fixture
        .insert("u-2", "clients", json!({ "id": "c-other", "name": "Not mine" }))
        .await;
    fixture
        .insert("u-1", "clients", json!({ "id": "c-1", "name": "Mine" }))
        .await;

    let change = tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .expect("no change delivered")
        .expect("feed closed");
    assert_eq!(change.event_type, ChangeKind::Insert);
    assert_eq!(change.table, Table::Clients);
    assert_eq!(change.new.unwrap()["id"], "c-1");
}

#[tokio::test]
async fn test_offline_session_syncs_over_http() {
    let fixture = TestFixture::new().await;
    let client = SyncClient::new(
        Arc::new(fixture.remote()),
        Arc::new(MemoryStore::new()),
        SyncOptions {
            reconnect_delay: Duration::from_millis(50),
            initially_online: false,
            ..SyncOptions::default()
        },
    );
    let session = client.login("u-1").await;

    let saved = session
        .collection::<ClientRecord>()
        .save(ClientRecord {
            name: Some("Offline Co".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(session.state().pending_count(), 1);

    client.set_online(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state().has_pending_operations() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue was not drained");

    let rows = fixture
        .remote()
        .select(
            Table::Clients,
            "u-1",
            &SelectQuery::new().filter(Filter::eq("id", saved.id.clone())),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], "Offline Co");
    assert!(session.state().last_sync_at.is_some());
}
