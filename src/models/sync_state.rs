//! Observable sync status.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PendingOperation;

/// Derived view of the sync layer for one user. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_operations: Vec<PendingOperation>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn has_pending_operations(&self) -> bool {
        !self.pending_operations.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_operations.len()
    }
}
