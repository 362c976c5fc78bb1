//! Change notifications pushed by the remote store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityRecord, Table};

/// Row-level event type, as emitted by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A server-originated change to a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub event_type: ChangeKind,
    pub table: Table,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl ChangeNotification {
    /// Owner of the changed row, taken from whichever image is present.
    pub fn owner(&self) -> Option<&str> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .and_then(|row| row.get("user_id"))
            .and_then(Value::as_str)
    }
}

/// A remote change re-published to local consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    pub table: Table,
    pub operation: ChangeKind,
    pub data: EntityRecord,
    pub user_id: String,
}
