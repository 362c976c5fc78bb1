//! Durable per-user queue of operations waiting for the remote store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::errors::SyncError;
use crate::models::PendingOperation;
use crate::storage::KeyValueStore;

const QUEUE_KEY_PREFIX: &str = "offline_queue_";

/// FIFO of pending operations, persisted per user.
///
/// Every read-modify-write goes through one lock so that an append racing a
/// `remove_completed` is never lost.
pub struct OfflineQueue {
    storage: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Pending operations for `user_id`, oldest first.
    ///
    /// Unreadable or corrupt data yields an empty queue; invalid entries are
    /// dropped individually.
    pub fn load(&self, user_id: &str) -> Vec<PendingOperation> {
        let _guard = self.guard();
        self.read(user_id)
    }

    /// Append one operation and persist before returning.
    pub fn append(&self, user_id: &str, operation: PendingOperation) -> Result<(), SyncError> {
        let _guard = self.guard();
        let mut operations = self.read(user_id);
        tracing::debug!(
            "Queueing {} on {} ({}) for user {}",
            operation.operation.as_str(),
            operation.table(),
            operation.data.id(),
            user_id
        );
        operations.push(operation);
        self.write(user_id, &operations)
    }

    /// Drop the given operation ids and persist the remaining sequence.
    pub fn remove_completed(
        &self,
        user_id: &str,
        completed: &HashSet<String>,
    ) -> Result<Vec<PendingOperation>, SyncError> {
        let _guard = self.guard();
        let mut operations = self.read(user_id);
        if completed.is_empty() {
            return Ok(operations);
        }
        operations.retain(|op| !completed.contains(&op.id));
        self.write(user_id, &operations)?;
        Ok(operations)
    }

    /// Forget every pending operation of `user_id`.
    pub fn clear(&self, user_id: &str) -> Result<(), SyncError> {
        let _guard = self.guard();
        self.storage.remove(&queue_key(user_id))
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self, user_id: &str) -> Vec<PendingOperation> {
        let raw = match self.storage.get(&queue_key(user_id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read offline queue for {}: {}", user_id, e);
                return Vec::new();
            }
        };

        let entries: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    "Offline queue for {} is corrupt, treating it as empty: {}",
                    user_id,
                    e
                );
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry) {
                Ok(op) => Some(op),
                Err(e) => {
                    tracing::warn!("Dropping invalid queued operation for {}: {}", user_id, e);
                    None
                }
            })
            .collect()
    }

    fn write(&self, user_id: &str, operations: &[PendingOperation]) -> Result<(), SyncError> {
        let key = queue_key(user_id);
        if operations.is_empty() {
            return self.storage.remove(&key);
        }
        let raw = serde_json::to_string(operations)
            .map_err(|e| SyncError::Storage(format!("Failed to encode offline queue: {}", e)))?;
        self.storage.set(&key, &raw)
    }
}

fn queue_key(user_id: &str) -> String {
    format!("{}{}", QUEUE_KEY_PREFIX, user_id)
}
