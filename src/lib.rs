//! Freight Sync
//!
//! Offline-first synchronization for the freight management app: a local
//! durable queue, connectivity tracking, realtime change delivery and an
//! orchestrator that reconciles local writes with the record backend.
//! The same crate hosts that backend, an SQLite record store served over HTTP.

pub mod api;
pub mod auth;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod errors;
pub mod facade;
pub mod models;
pub mod notify;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod session;
pub mod storage;
pub mod sync;
pub mod worker;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use remote::SqliteStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub config: Arc<Config>,
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Clone PSK for the auth layer
    let psk = state.config.api_psk.clone();

    let api_routes = Router::new()
        .route("/{table}", post(api::insert_record))
        .route("/{table}/query", post(api::query_records))
        .route("/{table}/changes", get(api::record_changes))
        .route(
            "/{table}/{id}",
            axum::routing::patch(api::update_record).delete(api::delete_record),
        )
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;
