//! Owner-scoped record repository.
//!
//! Uses bound parameters for every value and conditional updates keyed on
//! `sync_version` to detect concurrent writers.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::errors::SyncError;
use crate::models::Table;
use crate::remote::SelectQuery;

/// Fields owned by the store; clients cannot write them.
const MANAGED_FIELDS: [&str; 5] = ["id", "user_id", "sync_version", "created_at", "updated_at"];

/// Attempts for a last-write-wins update that keeps losing the version race.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Database repository for all record operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// List owned records matching the query.
    pub async fn select(
        &self,
        table: Table,
        user_id: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Value>, SyncError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, user_id, data, sync_version, created_at, updated_at FROM records WHERE table_name = ",
        );
        builder.push_bind(table.as_str());
        builder.push(" AND user_id = ");
        builder.push_bind(user_id.to_string());

        for filter in &query.filters {
            builder.push(" AND ");
            push_column(&mut builder, &filter.column)?;
            match &filter.value {
                Value::Null => {
                    builder.push(" IS NULL");
                }
                Value::Bool(b) => {
                    builder.push(" = ");
                    builder.push_bind(*b as i64);
                }
                Value::Number(n) => {
                    builder.push(" = ");
                    match n.as_i64() {
                        Some(i) => builder.push_bind(i),
                        None => builder.push_bind(n.as_f64().unwrap_or_default()),
                    };
                }
                Value::String(s) => {
                    builder.push(" = ");
                    builder.push_bind(s.clone());
                }
                other => {
                    builder.push(" = ");
                    builder.push_bind(other.to_string());
                }
            }
        }

        match &query.order_by {
            Some(order) => {
                builder.push(" ORDER BY ");
                push_column(&mut builder, &order.column)?;
                builder.push(if order.ascending { " ASC" } else { " DESC" });
                builder.push(", rowid ASC");
            }
            None => {
                builder.push(" ORDER BY created_at ASC, rowid ASC");
            }
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    /// Get an owned record by ID.
    pub async fn get(
        &self,
        table: Table,
        user_id: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, SyncError> {
        let row = sqlx::query(
            "SELECT id, user_id, data, sync_version, created_at, updated_at FROM records WHERE table_name = ? AND id = ? AND user_id = ?",
        )
        .bind(table.as_str())
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(stored_from_row))
    }

    /// Create a record. A client-supplied id is kept, otherwise one is generated.
    pub async fn insert(
        &self,
        table: Table,
        user_id: &str,
        record: Value,
    ) -> Result<Value, SyncError> {
        let mut data = into_object(table, record)?;
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        strip_managed(&mut data);

        let now = Utc::now().to_rfc3339();
        let data_json = Value::Object(data.clone()).to_string();

        let result = sqlx::query(
            "INSERT INTO records (table_name, id, user_id, data, sync_version, created_at, updated_at) VALUES (?, ?, ?, ?, 1, ?, ?) ON CONFLICT(table_name, id) DO NOTHING",
        )
        .bind(table.as_str())
        .bind(&id)
        .bind(user_id)
        .bind(&data_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Only reveal the version when the caller owns the existing row.
            let current = self.get(table, user_id, &id).await?;
            return Err(SyncError::Conflict {
                message: format!("Record {} already exists in {}", id, table),
                current_version: current.map(|r| r.sync_version).unwrap_or(0),
            });
        }

        Ok(StoredRecord {
            id,
            user_id: user_id.to_string(),
            data,
            sync_version: 1,
            created_at: now.clone(),
            updated_at: now,
        }
        .into_value())
    }

    /// Merge `patch` into an owned record, returning the previous and new images.
    pub async fn update(
        &self,
        table: Table,
        user_id: &str,
        id: &str,
        patch: Value,
        expected_version: Option<i64>,
    ) -> Result<(Value, Value), SyncError> {
        let mut patch = into_object(table, patch)?;
        strip_managed(&mut patch);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let existing = self
                .get(table, user_id, id)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("Record {} not found in {}", id, table)))?;

            // Check version for optimistic concurrency
            if let Some(expected) = expected_version {
                if existing.sync_version != expected {
                    return Err(SyncError::Conflict {
                        message: format!(
                            "Version mismatch: expected {}, current {}",
                            expected, existing.sync_version
                        ),
                        current_version: existing.sync_version,
                    });
                }
            }

            let now = Utc::now().to_rfc3339();
            let new_version = existing.sync_version + 1;
            let mut data = existing.data.clone();
            for (key, value) in &patch {
                data.insert(key.clone(), value.clone());
            }
            let data_json = Value::Object(data.clone()).to_string();

            // Conditional UPDATE with version check to prevent lost updates
            let result = sqlx::query(
                "UPDATE records SET data = ?, sync_version = ?, updated_at = ? WHERE table_name = ? AND id = ? AND user_id = ? AND sync_version = ?",
            )
            .bind(&data_json)
            .bind(new_version)
            .bind(&now)
            .bind(table.as_str())
            .bind(id)
            .bind(user_id)
            .bind(existing.sync_version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                if expected_version.is_some() {
                    let current = self.get(table, user_id, id).await?;
                    return Err(SyncError::Conflict {
                        message: "Concurrent modification detected".to_string(),
                        current_version: current.map(|r| r.sync_version).unwrap_or(0),
                    });
                }
                tracing::debug!("Lost version race on {}/{}, retrying", table, id);
                continue;
            }

            let updated = StoredRecord {
                id: id.to_string(),
                user_id: user_id.to_string(),
                data,
                sync_version: new_version,
                created_at: existing.created_at.clone(),
                updated_at: now,
            };
            return Ok((existing.into_value(), updated.into_value()));
        }

        Err(SyncError::Conflict {
            message: format!("Record {} in {} kept changing, giving up", id, table),
            current_version: 0,
        })
    }

    /// Delete an owned record, returning its last image.
    pub async fn delete(&self, table: Table, user_id: &str, id: &str) -> Result<Value, SyncError> {
        let existing = self
            .get(table, user_id, id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("Record {} not found in {}", id, table)))?;

        let result =
            sqlx::query("DELETE FROM records WHERE table_name = ? AND id = ? AND user_id = ?")
                .bind(table.as_str())
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!(
                "Record {} not found in {}",
                id, table
            )));
        }

        Ok(existing.into_value())
    }
}

/// A row as stored: managed columns plus the domain fields.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: String,
    pub user_id: String,
    pub data: Map<String, Value>,
    pub sync_version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl StoredRecord {
    /// Flatten into the record shape clients see.
    pub fn into_value(self) -> Value {
        let mut object = self.data;
        object.insert("id".to_string(), Value::String(self.id));
        object.insert("user_id".to_string(), Value::String(self.user_id));
        object.insert("sync_version".to_string(), Value::from(self.sync_version));
        object.insert("created_at".to_string(), Value::String(self.created_at));
        object.insert("updated_at".to_string(), Value::String(self.updated_at));
        Value::Object(object)
    }
}

// Helper functions for row conversion

fn push_column(builder: &mut QueryBuilder<'_, Sqlite>, column: &str) -> Result<(), SyncError> {
    if column.is_empty()
        || !column
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SyncError::BadRequest(format!(
            "Invalid column name: {:?}",
            column
        )));
    }
    if MANAGED_FIELDS.contains(&column) {
        builder.push(column);
    } else {
        builder.push("json_extract(data, ");
        builder.push_bind(format!("$.{}", column));
        builder.push(")");
    }
    Ok(())
}

fn into_object(table: Table, value: Value) -> Result<Map<String, Value>, SyncError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SyncError::Validation(format!(
            "{} payload must be an object",
            table
        ))),
    }
}

fn strip_managed(data: &mut Map<String, Value>) {
    for field in MANAGED_FIELDS {
        data.remove(field);
    }
}

fn stored_from_row(row: &sqlx::sqlite::SqliteRow) -> StoredRecord {
    let data_str: String = row.get("data");
    StoredRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        data: serde_json::from_str(&data_str).unwrap_or_default(),
        sync_version: row.get("sync_version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Value {
    stored_from_row(row).into_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use crate::remote::{Filter, OrderBy};
    use serde_json::json;
    use tempfile::TempDir;

    async fn repository() -> (Repository, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("records.sqlite"))
            .await
            .unwrap();
        (Repository::new(pool), dir)
    }

    #[tokio::test]
    async fn insert_keeps_client_ids_and_strips_managed_fields() {
        let (repo, _dir) = repository().await;
        let created = repo
            .insert(
                Table::Clients,
                "u-1",
                json!({ "id": "c-1", "user_id": "someone-else", "sync_version": 40, "name": "Acme" }),
            )
            .await
            .unwrap();

        assert_eq!(created["id"], "c-1");
        assert_eq!(created["user_id"], "u-1");
        assert_eq!(created["sync_version"], 1);
        assert_eq!(created["name"], "Acme");

        let err = repo
            .insert(Table::Clients, "u-1", json!({ "id": "c-1" }))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::Conflict {
                message: "Record c-1 already exists in clients".to_string(),
                current_version: 1
            }
        );
    }

    #[tokio::test]
    async fn update_merges_and_bumps_version() {
        let (repo, _dir) = repository().await;
        repo.insert(
            Table::Freights,
            "u-1",
            json!({ "id": "f-1", "origin": "Santos", "destination": "Campinas" }),
        )
        .await
        .unwrap();

        let (old, new) = repo
            .update(Table::Freights, "u-1", "f-1", json!({ "destination": "Jundiaí" }), None)
            .await
            .unwrap();

        assert_eq!(old["destination"], "Campinas");
        assert_eq!(new["origin"], "Santos");
        assert_eq!(new["destination"], "Jundiaí");
        assert_eq!(new["sync_version"], 2);
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_versions() {
        let (repo, _dir) = repository().await;
        repo.insert(Table::Drivers, "u-1", json!({ "id": "d-1", "name": "Ana" }))
            .await
            .unwrap();
        repo.update(Table::Drivers, "u-1", "d-1", json!({ "name": "Ana Paula" }), Some(1))
            .await
            .unwrap();

        let err = repo
            .update(Table::Drivers, "u-1", "d-1", json!({ "name": "Stale" }), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { current_version: 2, .. }));
    }

    #[tokio::test]
    async fn other_owners_cannot_see_or_touch_records() {
        let (repo, _dir) = repository().await;
        repo.insert(Table::Clients, "u-1", json!({ "id": "c-1", "name": "Acme" }))
            .await
            .unwrap();

        let visible = repo
            .select(Table::Clients, "u-2", &SelectQuery::new())
            .await
            .unwrap();
        assert!(visible.is_empty());

        let err = repo
            .update(Table::Clients, "u-2", "c-1", json!({ "name": "Hijacked" }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let err = repo.delete(Table::Clients, "u-2", "c-1").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn select_filters_and_orders_on_json_fields() {
        let (repo, _dir) = repository().await;
        for (id, status, value) in [
            ("f-1", "pending", 500.0),
            ("f-2", "delivered", 900.0),
            ("f-3", "pending", 120.5),
        ] {
            repo.insert(
                Table::Freights,
                "u-1",
                json!({ "id": id, "status": status, "value": value }),
            )
            .await
            .unwrap();
        }

        let query = SelectQuery::new()
            .filter(Filter::eq("status", "pending"))
            .order_by(OrderBy::asc("value"));
        let rows = repo.select(Table::Freights, "u-1", &query).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["f-3", "f-1"]);

        let bad = SelectQuery::new().filter(Filter::eq("status') OR 1=1 --", "x"));
        assert!(matches!(
            repo.select(Table::Freights, "u-1", &bad).await,
            Err(SyncError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn delete_returns_the_last_image() {
        let (repo, _dir) = repository().await;
        repo.insert(Table::Profiles, "u-1", json!({ "id": "p-1", "full_name": "Joana" }))
            .await
            .unwrap();

        let old = repo.delete(Table::Profiles, "u-1", "p-1").await.unwrap();
        assert_eq!(old["full_name"], "Joana");
        assert!(repo.get(Table::Profiles, "u-1", "p-1").await.unwrap().is_none());
    }
}
