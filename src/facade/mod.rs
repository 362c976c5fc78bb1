//! Per-entity data access for the UI layer.
//!
//! A [`Collection`] keeps an in-memory snapshot of one table for the signed-in
//! user. Synced entities write through the [`SyncOrchestrator`]; local-only
//! entities live in device storage and never reach the remote store.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::errors::SyncError;
use crate::models::{
    ChangeKind, Entity, EntityRecord, OperationKind, PendingOperation, RealtimeEvent, StorageMode,
};
use crate::realtime::RealtimeListener;
use crate::remote::SelectQuery;
use crate::storage::KeyValueStore;
use crate::sync::{MutationOutcome, SyncOrchestrator};

/// Typed CRUD over one entity table.
pub struct Collection<E: Entity> {
    user_id: String,
    orchestrator: SyncOrchestrator,
    storage: Arc<dyn KeyValueStore>,
    snapshot: Arc<Mutex<Vec<E>>>,
}

impl<E: Entity> Clone for Collection<E> {
    fn clone(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            orchestrator: self.orchestrator.clone(),
            storage: Arc::clone(&self.storage),
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

impl<E: Entity> Collection<E> {
    pub fn new(
        user_id: impl Into<String>,
        orchestrator: SyncOrchestrator,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            orchestrator,
            storage,
            snapshot: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Reload the snapshot.
    ///
    /// Synced entities are fetched from the remote store when online, with
    /// still-queued local writes laid on top. Offline, the current snapshot
    /// is kept.
    pub async fn refresh(&self) -> Result<Vec<E>, SyncError> {
        let records = match E::STORAGE {
            StorageMode::LocalOnly => self.read_local()?,
            StorageMode::Synced => {
                if !self.orchestrator.connectivity().is_online() {
                    return Ok(self.snapshot());
                }
                let rows = self
                    .orchestrator
                    .remote()
                    .select(E::TABLE, &self.user_id, &SelectQuery::new())
                    .await?;
                let mut records = rows
                    .into_iter()
                    .map(decode::<E>)
                    .collect::<Result<Vec<_>, _>>()?;
                let pending = self.orchestrator.state(&self.user_id).pending_operations;
                overlay_pending(&mut records, &pending)?;
                records
            }
        };

        tracing::debug!("Loaded {} {} records", records.len(), E::TABLE);
        *self.lock() = records.clone();
        Ok(records)
    }

    /// Records matching `query`.
    pub fn list(&self, query: &SelectQuery) -> Result<Vec<E>, SyncError> {
        let records = match E::STORAGE {
            StorageMode::LocalOnly => self.read_local()?,
            StorageMode::Synced => self.snapshot(),
        };
        let values = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        query.apply(values).into_iter().map(decode::<E>).collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<E>, SyncError> {
        let records = match E::STORAGE {
            StorageMode::LocalOnly => self.read_local()?,
            StorageMode::Synced => self.snapshot(),
        };
        Ok(records.into_iter().find(|record| record.id() == id))
    }

    /// Current in-memory snapshot.
    pub fn snapshot(&self) -> Vec<E> {
        self.lock().clone()
    }

    /// Create (empty id) or update a record.
    pub async fn save(&self, record: E) -> Result<E, SyncError> {
        let result = match E::STORAGE {
            StorageMode::LocalOnly => self.save_local(record).map(|saved| (saved, false)),
            StorageMode::Synced => self.save_synced(record).await,
        };

        let notifier = self.orchestrator.notifier();
        match result {
            Ok((saved, queued)) => {
                let description = queued.then(|| {
                    "Saved on this device; it will sync when the connection returns.".to_string()
                });
                notifier.success("Record saved", description);
                Ok(saved)
            }
            Err(e) => {
                tracing::warn!("Saving {} record failed: {}", E::TABLE, e);
                notifier.error("Could not save record", Some(e.message()));
                Err(e)
            }
        }
    }

    async fn save_synced(&self, record: E) -> Result<(E, bool), SyncError> {
        let kind = if record.id().is_empty() {
            OperationKind::Insert
        } else {
            OperationKind::Update
        };
        let outcome = self
            .orchestrator
            .apply_mutation(&self.user_id, kind, record.into_record())
            .await?;
        let queued = outcome.is_queued();

        let saved = match outcome {
            MutationOutcome::Applied(confirmed) => {
                let confirmed = from_record::<E>(confirmed)?;
                self.replace(confirmed.clone());
                confirmed
            }
            MutationOutcome::Queued(optimistic) => {
                let optimistic = from_record::<E>(optimistic)?;
                self.merge(optimistic)?
            }
        };
        Ok((saved, queued))
    }

    fn save_local(&self, mut record: E) -> Result<E, SyncError> {
        if record.id().is_empty() {
            record.set_id(uuid::Uuid::new_v4().to_string());
        }
        record.set_user_id(self.user_id.clone());

        let mut records = self.read_local()?;
        match records.iter_mut().find(|r| r.id() == record.id()) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_local(&records)?;
        *self.lock() = records;
        Ok(record)
    }

    /// Delete a record by id.
    pub async fn delete(&self, id: &str) -> Result<(), SyncError> {
        let result = match E::STORAGE {
            StorageMode::LocalOnly => self.delete_local(id).map(|_| false),
            StorageMode::Synced => {
                self.remove(id);
                self.orchestrator
                    .apply_mutation(
                        &self.user_id,
                        OperationKind::Delete,
                        EntityRecord::reference(E::TABLE, id, &self.user_id),
                    )
                    .await
                    .map(|outcome| outcome.is_queued())
            }
        };

        let notifier = self.orchestrator.notifier();
        match result {
            Ok(queued) => {
                let description = queued.then(|| {
                    "Removed on this device; it will sync when the connection returns.".to_string()
                });
                notifier.success("Record deleted", description);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Deleting {}/{} failed: {}", E::TABLE, id, e);
                notifier.error("Could not delete record", Some(e.message()));
                Err(e)
            }
        }
    }

    fn delete_local(&self, id: &str) -> Result<(), SyncError> {
        let mut records = self.read_local()?;
        records.retain(|r| r.id() != id);
        self.write_local(&records)?;
        *self.lock() = records;
        Ok(())
    }

    /// Overwrite the snapshot with a remote change. Returns false when the
    /// event is not for this collection.
    pub fn apply_realtime(&self, event: &RealtimeEvent) -> bool {
        if event.table != E::TABLE || event.user_id != self.user_id {
            return false;
        }
        match event.operation {
            ChangeKind::Delete => self.remove(event.data.id()),
            ChangeKind::Insert | ChangeKind::Update => {
                match E::from_record(event.data.clone()) {
                    Some(record) => self.replace(record),
                    None => return false,
                }
            }
        }
        true
    }

    /// Keep the snapshot in step with `listener` until the task is aborted.
    pub fn follow(&self, listener: &RealtimeListener) -> JoinHandle<()> {
        let mut events = listener.subscribe();
        let collection = self.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        collection.apply_realtime(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "{} collection missed {} realtime events, reloading",
                            E::TABLE,
                            skipped
                        );
                        if let Err(e) = collection.refresh().await {
                            tracing::warn!("Reloading {} failed: {}", E::TABLE, e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn replace(&self, record: E) {
        let mut snapshot = self.lock();
        match snapshot.iter_mut().find(|r| r.id() == record.id()) {
            Some(existing) => *existing = record,
            None => snapshot.push(record),
        }
    }

    fn merge(&self, partial: E) -> Result<E, SyncError> {
        let mut snapshot = self.lock();
        let merged = match snapshot.iter_mut().find(|r| r.id() == partial.id()) {
            Some(existing) => {
                let merged = merge_records(existing, &partial)?;
                *existing = merged.clone();
                merged
            }
            None => {
                snapshot.push(partial.clone());
                partial
            }
        };
        Ok(merged)
    }

    fn remove(&self, id: &str) {
        self.lock().retain(|r| r.id() != id);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<E>> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn local_key(&self) -> String {
        format!("local_{}_{}", E::TABLE, self.user_id)
    }

    fn read_local(&self) -> Result<Vec<E>, SyncError> {
        let Some(raw) = self.storage.get(&self.local_key())? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!("Discarding unreadable local {} data: {}", E::TABLE, e);
                Ok(Vec::new())
            }
        }
    }

    fn write_local(&self, records: &[E]) -> Result<(), SyncError> {
        self.storage
            .set(&self.local_key(), &serde_json::to_string(records)?)
    }
}

fn decode<E: Entity>(value: Value) -> Result<E, SyncError> {
    from_record(EntityRecord::from_value(E::TABLE, value)?)
}

fn from_record<E: Entity>(record: EntityRecord) -> Result<E, SyncError> {
    let table = record.table();
    E::from_record(record).ok_or_else(|| {
        SyncError::Internal(format!("Expected a {} record, got {}", E::TABLE, table))
    })
}

/// Lay the fields set in `partial` over `base`. Versions stay with the base.
fn merge_records<E: Entity>(base: &E, partial: &E) -> Result<E, SyncError> {
    let mut merged = as_object(serde_json::to_value(base)?);
    for (key, value) in as_object(serde_json::to_value(partial)?) {
        if key != "sync_version" && !value.is_null() {
            merged.insert(key, value);
        }
    }
    Ok(serde_json::from_value(Value::Object(merged))?)
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Apply queued writes of this table to freshly fetched records.
fn overlay_pending<E: Entity>(
    records: &mut Vec<E>,
    pending: &[PendingOperation],
) -> Result<(), SyncError> {
    for operation in pending.iter().filter(|op| op.table() == E::TABLE) {
        let id = operation.data.id();
        match operation.operation {
            OperationKind::Delete => records.retain(|r| r.id() != id),
            OperationKind::Insert | OperationKind::Update => {
                let partial = from_record::<E>(operation.data.clone())?;
                match records.iter_mut().find(|r| r.id() == id) {
                    Some(existing) => *existing = merge_records(existing, &partial)?,
                    None => records.push(partial),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Client;

    #[test]
    fn merging_keeps_unset_fields_and_the_base_version() {
        let base = Client {
            id: "c-1".to_string(),
            user_id: "u-1".to_string(),
            name: Some("Acme".to_string()),
            city: Some("Santos".to_string()),
            sync_version: 4,
            ..Default::default()
        };
        let partial = Client {
            id: "c-1".to_string(),
            user_id: "u-1".to_string(),
            city: Some("Campinas".to_string()),
            ..Default::default()
        };

        let merged = merge_records(&base, &partial).unwrap();
        assert_eq!(merged.name.as_deref(), Some("Acme"));
        assert_eq!(merged.city.as_deref(), Some("Campinas"));
        assert_eq!(merged.sync_version, 4);
    }

    #[test]
    fn queued_writes_are_laid_over_fetched_rows() {
        let fetched = vec![
            Client {
                id: "c-1".to_string(),
                user_id: "u-1".to_string(),
                name: Some("Acme".to_string()),
                ..Default::default()
            },
            Client {
                id: "c-2".to_string(),
                user_id: "u-1".to_string(),
                name: Some("Old Co".to_string()),
                ..Default::default()
            },
        ];
        let pending = vec![
            PendingOperation::new(
                OperationKind::Update,
                EntityRecord::Client(Client {
                    id: "c-1".to_string(),
                    user_id: "u-1".to_string(),
                    phone: Some("11 5555-0000".to_string()),
                    ..Default::default()
                }),
            ),
            PendingOperation::new(
                OperationKind::Delete,
                EntityRecord::reference(crate::models::Table::Clients, "c-2", "u-1"),
            ),
        ];

        let mut records = fetched;
        overlay_pending(&mut records, &pending).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("Acme"));
        assert_eq!(records[0].phone.as_deref(), Some("11 5555-0000"));
    }
}
