//! Configuration for the record backend and the sync client.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::ConflictPolicy;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for API authentication (required in production)
    pub api_psk: Option<String>,
    /// Path to SQLite database file backing the record store
    pub db_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Client-side sync settings
    pub sync: SyncSettings,
}

/// Settings consumed by the offline-first client.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Base URL of the record backend
    pub remote_url: String,
    /// Directory holding the persisted offline queues
    pub queue_dir: PathBuf,
    /// Stabilization delay between an online transition and the drain
    pub reconnect_delay: Duration,
    /// Delay before the first drain of a fresh session
    pub initial_sync_delay: Duration,
    /// Upper bound for background worker acknowledgments
    pub worker_ack_timeout: Duration,
    /// How concurrent writers to the same record are reconciled
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_url: "http://127.0.0.1:8080".to_string(),
            queue_dir: PathBuf::from("./data/queue"),
            reconnect_delay: Duration::from_millis(1000),
            initial_sync_delay: Duration::from_millis(2000),
            worker_ack_timeout: Duration::from_millis(10_000),
            conflict_policy: ConflictPolicy::LastWriteWins,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let api_psk = env::var("FREIGHT_API_PSK").ok();

        let db_path = env::var("FREIGHT_DB_PATH")
            .unwrap_or_else(|_| "./data/records.sqlite".to_string())
            .into();

        let bind_addr = parse_var("FREIGHT_BIND_ADDR", || {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        });

        let log_level = env::var("FREIGHT_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let defaults = SyncSettings::default();
        let sync = SyncSettings {
            remote_url: env::var("FREIGHT_REMOTE_URL").unwrap_or(defaults.remote_url),
            queue_dir: env::var("FREIGHT_QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.queue_dir),
            reconnect_delay: parse_millis("FREIGHT_RECONNECT_DELAY_MS", defaults.reconnect_delay),
            initial_sync_delay: parse_millis(
                "FREIGHT_INITIAL_SYNC_DELAY_MS",
                defaults.initial_sync_delay,
            ),
            worker_ack_timeout: parse_millis(
                "FREIGHT_WORKER_ACK_TIMEOUT_MS",
                defaults.worker_ack_timeout,
            ),
            conflict_policy: parse_var("FREIGHT_CONFLICT_POLICY", || defaults.conflict_policy),
        };

        Self {
            api_psk,
            db_path,
            bind_addr,
            log_level,
            sync,
        }
    }
}

/// Parse an environment variable, falling back to a default on absence or error.
fn parse_var<T: FromStr>(name: &str, default: impl FnOnce() -> T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}, using default", name, raw);
                default()
            }
        },
        Err(_) => default(),
    }
}

fn parse_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(parse_var(name, || default.as_millis() as u64))
}
