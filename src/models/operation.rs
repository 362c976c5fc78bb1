//! Pending operations held by the offline queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityRecord, Table};
use crate::errors::SyncError;

/// Kind of write carried by a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// A mutation that still has to be applied to the remote store.
///
/// On the wire this is `{id, table, operation, data, timestamp}`; `data` is
/// validated against the table's shape whenever an operation is decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub struct PendingOperation {
    pub id: String,
    pub operation: OperationKind,
    pub data: EntityRecord,
    pub timestamp: DateTime<Utc>,
}

impl PendingOperation {
    pub fn new(operation: OperationKind, data: EntityRecord) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn table(&self) -> Table {
        self.data.table()
    }

    /// Identity of the entity this operation writes to.
    pub fn entity_key(&self) -> (Table, &str) {
        (self.data.table(), self.data.id())
    }
}

#[derive(Serialize, Deserialize)]
struct RawOperation {
    id: String,
    table: Table,
    operation: OperationKind,
    data: Value,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawOperation> for PendingOperation {
    type Error = SyncError;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        if raw.id.is_empty() {
            return Err(SyncError::Validation(
                "Pending operation without id".to_string(),
            ));
        }
        let data = EntityRecord::from_value(raw.table, raw.data)?;
        if data.id().is_empty() {
            return Err(SyncError::Validation(format!(
                "Pending {} on {} does not reference an entity",
                raw.operation.as_str(),
                raw.table
            )));
        }
        Ok(Self {
            id: raw.id,
            operation: raw.operation,
            data,
            timestamp: raw.timestamp,
        })
    }
}

impl From<PendingOperation> for RawOperation {
    fn from(op: PendingOperation) -> Self {
        // Entity structs only hold plain serde types, so this never fails.
        let data = op.data.to_value().unwrap_or(Value::Null);
        Self {
            id: op.id,
            table: op.data.table(),
            operation: op.operation,
            data,
            timestamp: op.timestamp,
        }
    }
}
