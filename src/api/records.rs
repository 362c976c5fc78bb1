//! Record API endpoints, generic over the synced tables.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{success, ApiResult};
use crate::auth::Owner;
use crate::errors::SyncError;
use crate::models::{EntityRecord, Table};
use crate::remote::{RemoteStore, SelectQuery};
use crate::AppState;

/// Request body for PATCH /api/{table}/{id}.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRecordRequest {
    pub data: Value,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

fn synced_table(name: &str) -> Result<Table, SyncError> {
    match name.parse::<Table>() {
        Ok(table) if Table::SYNCED.contains(&table) => Ok(table),
        Ok(table) => Err(SyncError::BadRequest(format!(
            "Table {} is kept on the device only",
            table
        ))),
        Err(e) => Err(SyncError::BadRequest(e)),
    }
}

/// Decode through the table's shape so that unknown or mistyped fields never reach storage.
fn normalize(table: Table, payload: Value) -> Result<Value, SyncError> {
    EntityRecord::from_value(table, payload)?.to_value()
}

/// POST /api/{table}/query - List owned records.
pub async fn query_records(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(table): Path<String>,
    Json(query): Json<SelectQuery>,
) -> ApiResult<Vec<Value>> {
    let table = synced_table(&table)?;
    let records = state.store.select(table, &user_id, &query).await?;
    success(records)
}

/// POST /api/{table} - Create a record.
pub async fn insert_record(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(table): Path<String>,
    Json(record): Json<Value>,
) -> ApiResult<Value> {
    let table = synced_table(&table)?;
    let record = normalize(table, record)?;
    let created = state.store.insert(table, &user_id, record).await?;
    success(created)
}

/// PATCH /api/{table}/{id} - Merge a partial record.
pub async fn update_record(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path((table, id)): Path<(String, String)>,
    Json(request): Json<UpdateRecordRequest>,
) -> ApiResult<Value> {
    let table = synced_table(&table)?;
    let patch = normalize(table, request.data)?;
    let updated = state
        .store
        .update(table, &user_id, &id, patch, request.expected_version)
        .await?;
    success(updated)
}

/// DELETE /api/{table}/{id} - Delete a record.
pub async fn delete_record(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path((table, id)): Path<(String, String)>,
) -> ApiResult<Value> {
    let table = synced_table(&table)?;
    state.store.delete(table, &user_id, &id).await?;
    success(json!({ "id": id }))
}

/// GET /api/{table}/changes - Server-Sent-Events feed of the caller's row changes.
pub async fn record_changes(
    State(state): State<AppState>,
    Owner(user_id): Owner,
    Path(table): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, SyncError> {
    let table = synced_table(&table)?;
    let changes = state.store.subscribe(table, &user_id).await?;
    tracing::info!("Change feed opened for {} on {}", user_id, table);

    let events = changes.filter_map(|change| async move {
        match Event::default().event("change").json_data(&change) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!("Failed to encode change event: {}", e);
                None
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
