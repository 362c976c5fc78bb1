//! Message channel to the background worker.
//!
//! The worker is an external collaborator (asset caching, push, background
//! sync). The app talks to it with typed messages and waits for its
//! acknowledgments for a bounded time only.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Messages sent from the app to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    OnlineStatus { online: bool },
    CacheImages,
    CacheScreenshots { urls: Vec<String> },
    SkipWaiting,
    AppClosing,
}

/// Messages sent from the worker to the app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    /// Milliseconds since the Unix epoch
    SyncCompleted { timestamp: i64 },
    CacheImagesComplete { success: bool },
    CacheComplete { success: bool },
}

/// App side of the worker channel.
#[derive(Clone)]
pub struct WorkerBridge {
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    events: broadcast::Sender<WorkerEvent>,
    ack_timeout: Duration,
}

/// Worker side of the channel: receives messages, posts events back.
pub struct WorkerPort {
    inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    events: broadcast::Sender<WorkerEvent>,
}

impl WorkerBridge {
    /// Create a connected bridge/port pair.
    pub fn channel(ack_timeout: Duration) -> (WorkerBridge, WorkerPort) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(32);
        (
            WorkerBridge {
                outbound,
                events: events.clone(),
                ack_timeout,
            },
            WorkerPort { inbound, events },
        )
    }

    /// Post a message without waiting. Returns false when no worker is attached.
    pub fn post(&self, message: WorkerMessage) -> bool {
        match self.outbound.send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Background worker unavailable, dropped {:?}", e.0);
                false
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn notify_online(&self, online: bool) -> bool {
        self.post(WorkerMessage::OnlineStatus { online })
    }

    pub fn skip_waiting(&self) -> bool {
        self.post(WorkerMessage::SkipWaiting)
    }

    /// Best-effort shutdown notice.
    pub fn app_closing(&self) -> bool {
        self.post(WorkerMessage::AppClosing)
    }

    /// Ask the worker to pre-cache images; false on failure or timeout.
    pub async fn cache_images(&self) -> bool {
        self.request(WorkerMessage::CacheImages, |event| match event {
            WorkerEvent::CacheImagesComplete { success } => Some(*success),
            _ => None,
        })
        .await
        .unwrap_or(false)
    }

    /// Ask the worker to cache specific assets; false on failure or timeout.
    pub async fn cache_screenshots(&self, urls: Vec<String>) -> bool {
        self.request(WorkerMessage::CacheScreenshots { urls }, |event| match event {
            WorkerEvent::CacheComplete { success } => Some(*success),
            _ => None,
        })
        .await
        .unwrap_or(false)
    }

    /// Wait for the worker to report a finished background sync.
    pub async fn wait_for_background_sync(&self) -> Option<i64> {
        let mut events = self.events.subscribe();
        wait_for(&mut events, self.ack_timeout, |event| match event {
            WorkerEvent::SyncCompleted { timestamp } => Some(*timestamp),
            _ => None,
        })
        .await
    }

    async fn request<T>(
        &self,
        message: WorkerMessage,
        matcher: impl Fn(&WorkerEvent) -> Option<T>,
    ) -> Option<T> {
        // Subscribe before posting so a fast reply cannot be missed.
        let mut events = self.events.subscribe();
        if !self.post(message) {
            return None;
        }
        wait_for(&mut events, self.ack_timeout, matcher).await
    }
}

async fn wait_for<T>(
    events: &mut broadcast::Receiver<WorkerEvent>,
    limit: Duration,
    matcher: impl Fn(&WorkerEvent) -> Option<T>,
) -> Option<T> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(value) = matcher(&event) {
                        return Some(value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Worker event receiver lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };

    match tokio::time::timeout(limit, wait).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Background worker did not answer within {:?}", limit);
            None
        }
    }
}

impl WorkerPort {
    pub async fn recv(&mut self) -> Option<WorkerMessage> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WorkerMessage> {
        self.inbound.try_recv().ok()
    }

    pub fn reply(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }
}
