//! HTTP client for the record server.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{ChangeStream, RemoteStore, SelectQuery};
use crate::auth::{API_KEY_HEADER, USER_ID_HEADER};
use crate::errors::{ErrorDetails, SyncError};
use crate::models::{ChangeNotification, Table};

/// Upper bound for a single CRUD round trip. The change feed has none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`RemoteStore`] implementation talking to `freight-sync-server`.
#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, api_key)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: Method, path: &str, user_id: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(USER_ID_HEADER, user_id);
        if let Some(key) = &self.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
    }

    async fn call<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, SyncError> {
        let response = builder.timeout(REQUEST_TIMEOUT).send().await?;
        read_envelope(response).await
    }
}

/// Unwrap `{success, data}` or turn `{success: false, error}` back into a [`SyncError`].
async fn read_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SyncError> {
    let status = response.status();
    let body: Value = response.json().await?;

    if body.get("success").and_then(Value::as_bool) == Some(true) {
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        return Ok(serde_json::from_value(data)?);
    }

    match body
        .get("error")
        .cloned()
        .map(serde_json::from_value::<ErrorDetails>)
    {
        Some(Ok(details)) => Err(SyncError::from_details(&details)),
        _ => Err(SyncError::Internal(format!(
            "Unexpected response from record server (status {})",
            status
        ))),
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn select(
        &self,
        table: Table,
        user_id: &str,
        query: &SelectQuery,
    ) -> Result<Vec<Value>, SyncError> {
        let path = format!("/api/{}/query", table);
        self.call(self.request(Method::POST, &path, user_id).json(query))
            .await
    }

    async fn insert(&self, table: Table, user_id: &str, record: Value) -> Result<Value, SyncError> {
        let path = format!("/api/{}", table);
        self.call(self.request(Method::POST, &path, user_id).json(&record))
            .await
    }

    async fn update(
        &self,
        table: Table,
        user_id: &str,
        id: &str,
        patch: Value,
        expected_version: Option<i64>,
    ) -> Result<Value, SyncError> {
        let path = format!("/api/{}/{}", table, id);
        let body = json!({ "data": patch, "expectedVersion": expected_version });
        self.call(self.request(Method::PATCH, &path, user_id).json(&body))
            .await
    }

    async fn delete(&self, table: Table, user_id: &str, id: &str) -> Result<(), SyncError> {
        let path = format!("/api/{}/{}", table, id);
        let _: Value = self.call(self.request(Method::DELETE, &path, user_id)).await?;
        Ok(())
    }

    async fn subscribe(&self, table: Table, user_id: &str) -> Result<ChangeStream, SyncError> {
        let path = format!("/api/{}/changes", table);
        let response = self
            .request(Method::GET, &path, user_id)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(read_envelope::<Value>(response)
                .await
                .err()
                .unwrap_or_else(|| SyncError::Internal("Change feed refused".to_string())));
        }

        tracing::debug!("Change feed for {} opened", table);
        Ok(sse_changes(response.bytes_stream().boxed(), table))
    }
}

struct SseReader {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    table: Table,
}

/// Turn a `text/event-stream` body into change notifications.
fn sse_changes(body: BoxStream<'static, reqwest::Result<Bytes>>, table: Table) -> ChangeStream {
    let reader = SseReader {
        body,
        buffer: Vec::new(),
        table,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(end) = frame_end(&reader.buffer) {
                let frame: Vec<u8> = reader.buffer.drain(..end).collect();
                if let Some(change) = parse_frame(&String::from_utf8_lossy(&frame)) {
                    return Some((change, reader));
                }
                continue;
            }

            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    tracing::warn!("Change feed for {} broke: {}", reader.table, e);
                    return None;
                }
                None => {
                    tracing::debug!("Change feed for {} closed by server", reader.table);
                    return None;
                }
            }
        }
    })
    .boxed()
}

/// Byte offset just past the first blank-line frame terminator.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn parse_frame(frame: &str) -> Option<ChangeNotification> {
    let mut event = None;
    let mut data = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() || !matches!(event, None | Some("change")) {
        return None;
    }

    match serde_json::from_str(&data.join("\n")) {
        Ok(change) => Some(change),
        Err(e) => {
            tracing::warn!("Skipping malformed change event: {}", e);
            None
        }
    }
}
