//! The remote store contract and its implementations.
//!
//! The remote store is the source of truth. Every call is scoped by the
//! owning user id; rows of other users are invisible.

mod http;
mod sqlite;

pub use http::HttpRemote;
pub use sqlite::SqliteStore;

use std::cmp::Ordering;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::SyncError;
use crate::models::{ChangeNotification, Table};

/// Stream of row changes for one table and owner.
pub type ChangeStream = BoxStream<'static, ChangeNotification>;

/// Equality filter on a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &Value) -> bool {
        record.get(&self.column) == Some(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default = "default_ascending")]
    pub ascending: bool,
}

fn default_ascending() -> bool {
    true
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
        }
    }

    /// Compare two records by this ordering. Missing values sort first.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ordering = compare_values(a.get(&self.column), b.get(&self.column));
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Filtered select: equality filters plus an optional ordering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    /// Apply the query to records already in memory.
    pub fn apply(&self, records: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut matching: Vec<Value> = records
            .into_iter()
            .filter(|record| self.filters.iter().all(|f| f.matches(record)))
            .collect();
        if let Some(order) = &self.order_by {
            matching.sort_by(|a, b| order.compare(a, b));
        }
        matching
    }
}

/// Backend holding the authoritative copy of every synced record.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Records of `table` owned by `user_id` that match `query`.
    async fn select(
        &self,
        table: Table,
        user_id: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Value>, SyncError>;

    /// Create a record; returns it as stored.
    async fn insert(&self, table: Table, user_id: &str, record: Value)
        -> Result<Value, SyncError>;

    /// Merge `patch` into an owned record. With `expected_version` set, the
    /// write is rejected unless the stored `sync_version` matches.
    async fn update(
        &self,
        table: Table,
        user_id: &str,
        id: &str,
        patch: Value,
        expected_version: Option<i64>,
    ) -> Result<Value, SyncError>;

    /// Delete an owned record.
    async fn delete(&self, table: Table, user_id: &str, id: &str) -> Result<(), SyncError>;

    /// Row changes of `table` that belong to `user_id`.
    async fn subscribe(&self, table: Table, user_id: &str) -> Result<ChangeStream, SyncError>;
}
