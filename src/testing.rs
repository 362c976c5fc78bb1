//! In-memory remote store for tests, with failure injection and a call log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::connectivity::ConnectivityMonitor;
use crate::errors::SyncError;
use crate::models::{ChangeKind, ChangeNotification, Table};
use crate::notify::Notifier;
use crate::queue::OfflineQueue;
use crate::remote::{ChangeStream, RemoteStore, SelectQuery};
use crate::storage::MemoryStore;
use crate::sync::{ConflictPolicy, SyncOrchestrator};

const MANAGED: [&str; 5] = ["id", "user_id", "sync_version", "created_at", "updated_at"];

pub struct MemoryRemote {
    rows: Mutex<HashMap<(Table, String), Value>>,
    failures: Mutex<HashMap<String, SyncError>>,
    calls: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    down: AtomicBool,
    changes: broadcast::Sender<ChangeNotification>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            rows: Mutex::default(),
            failures: Mutex::default(),
            calls: Mutex::default(),
            delay: Mutex::default(),
            down: AtomicBool::new(false),
            changes,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

impl MemoryRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every write touching `id` fails with `error` until healed.
    pub fn fail_on(&self, id: &str, error: SyncError) {
        lock(&self.failures).insert(id.to_string(), error);
    }

    pub fn heal(&self, id: &str) {
        lock(&self.failures).remove(id);
    }

    /// Every call fails with a connectivity error while down.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delay applied to every write.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Writes issued so far, as `"<op> <table>/<id>"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn row(&self, table: Table, id: &str) -> Option<Value> {
        lock(&self.rows).get(&(table, id.to_string())).cloned()
    }

    /// Store a row as if another device had written it, without a change event.
    pub fn seed(&self, table: Table, user_id: &str, mut row: Value) {
        let id = row["id"].as_str().unwrap().to_string();
        row["user_id"] = Value::from(user_id);
        row["sync_version"] = Value::from(1);
        lock(&self.rows).insert((table, id), row);
    }

    async fn before_write(&self, op: &str, table: Table, id: &str) -> Result<(), SyncError> {
        lock(&self.calls).push(format!("{} {}/{}", op, table, id));
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::Connectivity("remote is down".to_string()));
        }
        match lock(&self.failures).get(id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn publish(&self, event_type: ChangeKind, table: Table, new: Option<Value>, old: Option<Value>) {
        let _ = self.changes.send(ChangeNotification {
            event_type,
            table,
            new,
            old,
        });
    }

    fn owned(&self, table: Table, user_id: &str, id: &str) -> Result<Value, SyncError> {
        lock(&self.rows)
            .get(&(table, id.to_string()))
            .filter(|row| row["user_id"] == user_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("{}/{} not found", table, id)))
    }
}

fn domain_fields(value: Value) -> Map<String, Value> {
    let mut map = match value {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for field in MANAGED {
        map.remove(field);
    }
    map
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(
        &self,
        table: Table,
        user_id: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Value>, SyncError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::Connectivity("remote is down".to_string()));
        }
        let mut rows: Vec<Value> = lock(&self.rows)
            .iter()
            .filter(|((t, _), row)| *t == table && row["user_id"] == user_id)
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        Ok(query.apply(rows))
    }

    async fn insert(&self, table: Table, user_id: &str, record: Value) -> Result<Value, SyncError> {
        let id = record["id"].as_str().unwrap_or_default().to_string();
        self.before_write("insert", table, &id).await?;

        let mut row = domain_fields(record);
        row.insert("id".to_string(), Value::from(id.clone()));
        row.insert("user_id".to_string(), Value::from(user_id));
        row.insert("sync_version".to_string(), Value::from(1));
        let row = Value::Object(row);

        {
            let mut rows = lock(&self.rows);
            if rows.contains_key(&(table, id.clone())) {
                return Err(SyncError::Conflict {
                    message: format!("{}/{} exists", table, id),
                    current_version: 0,
                });
            }
            rows.insert((table, id), row.clone());
        }
        self.publish(ChangeKind::Insert, table, Some(row.clone()), None);
        Ok(row)
    }

    async fn update(
        &self,
        table: Table,
        user_id: &str,
        id: &str,
        patch: Value,
        expected_version: Option<i64>,
    ) -> Result<Value, SyncError> {
        self.before_write("update", table, id).await?;

        let old = self.owned(table, user_id, id)?;
        let current_version = old["sync_version"].as_i64().unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current_version {
                return Err(SyncError::Conflict {
                    message: "Version mismatch".to_string(),
                    current_version,
                });
            }
        }

        let mut new = old.clone();
        for (key, value) in domain_fields(patch) {
            new[key.as_str()] = value;
        }
        new["sync_version"] = Value::from(current_version + 1);
        lock(&self.rows).insert((table, id.to_string()), new.clone());
        self.publish(ChangeKind::Update, table, Some(new.clone()), Some(old));
        Ok(new)
    }

    async fn delete(&self, table: Table, user_id: &str, id: &str) -> Result<(), SyncError> {
        self.before_write("delete", table, id).await?;

        let old = self.owned(table, user_id, id)?;
        lock(&self.rows).remove(&(table, id.to_string()));
        self.publish(ChangeKind::Delete, table, None, Some(old));
        Ok(())
    }

    async fn subscribe(&self, table: Table, user_id: &str) -> Result<ChangeStream, SyncError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::Connectivity("remote is down".to_string()));
        }
        let owner = user_id.to_string();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |item| {
            let keep = item
                .ok()
                .filter(|change| change.table == table && change.owner() == Some(owner.as_str()));
            futures_util::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}

/// Orchestrator over `remote` and `storage` with its own connectivity monitor.
pub fn orchestrator(
    remote: Arc<MemoryRemote>,
    storage: &MemoryStore,
    online: bool,
    policy: ConflictPolicy,
) -> SyncOrchestrator {
    let notifier = Notifier::new();
    SyncOrchestrator::new(
        remote,
        OfflineQueue::new(Arc::new(storage.clone())),
        ConnectivityMonitor::new(online, notifier.clone(), None),
        notifier,
        policy,
    )
}
