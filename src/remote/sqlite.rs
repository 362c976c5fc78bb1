//! SQLite-backed remote store with an in-process change feed.

use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{ChangeStream, RemoteStore, SelectQuery};
use crate::db::{init_database, Repository};
use crate::errors::SyncError;
use crate::models::{ChangeKind, ChangeNotification, Table};

/// Capacity of the change hub; slow subscribers skip what they miss.
const CHANGE_BUFFER: usize = 256;

/// The authoritative record store used by the HTTP server.
#[derive(Clone)]
pub struct SqliteStore {
    repo: Repository,
    changes: broadcast::Sender<ChangeNotification>,
}

impl SqliteStore {
    pub fn new(repo: Repository) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self { repo, changes }
    }

    /// Open (or create) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        let pool = init_database(path).await?;
        Ok(Self::new(Repository::new(pool)))
    }

    fn publish(&self, event_type: ChangeKind, table: Table, new: Option<Value>, old: Option<Value>) {
        // No receivers is fine; nobody is listening yet.
        let _ = self.changes.send(ChangeNotification {
            event_type,
            table,
            new,
            old,
        });
    }
}

#[async_trait]
impl RemoteStore for SqliteStore {
    async fn select(
        &self,
        table: Table,
        user_id: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Value>, SyncError> {
        self.repo.select(table, user_id, query).await
    }

    async fn insert(&self, table: Table, user_id: &str, record: Value) -> Result<Value, SyncError> {
        let created = self.repo.insert(table, user_id, record).await?;
        tracing::debug!("Inserted {}/{}", table, created["id"]);
        self.publish(ChangeKind::Insert, table, Some(created.clone()), None);
        Ok(created)
    }

    async fn update(
        &self,
        table: Table,
        user_id: &str,
        id: &str,
        patch: Value,
        expected_version: Option<i64>,
    ) -> Result<Value, SyncError> {
        let (old, new) = self
            .repo
            .update(table, user_id, id, patch, expected_version)
            .await?;
        tracing::debug!("Updated {}/{} to version {}", table, id, new["sync_version"]);
        self.publish(ChangeKind::Update, table, Some(new.clone()), Some(old));
        Ok(new)
    }

    async fn delete(&self, table: Table, user_id: &str, id: &str) -> Result<(), SyncError> {
        let old = self.repo.delete(table, user_id, id).await?;
        tracing::debug!("Deleted {}/{}", table, id);
        self.publish(ChangeKind::Delete, table, None, Some(old));
        Ok(())
    }

    async fn subscribe(&self, table: Table, user_id: &str) -> Result<ChangeStream, SyncError> {
        let owner = user_id.to_string();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(change) if change.table == table && change.owner() == Some(owner.as_str()) => {
                    Some(change)
                }
                Ok(_) => None,
                Err(lagged) => {
                    tracing::warn!("Change subscriber for {} fell behind: {}", table, lagged);
                    None
                }
            };
            futures_util::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}
