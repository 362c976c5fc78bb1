//! User-visible notifications ("toasts").

use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Fan-out of notifications to whatever UI is listening.
///
/// Sending never fails: with nobody subscribed the notification is dropped.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn success(&self, title: impl Into<String>, description: Option<String>) {
        self.send(NotificationLevel::Success, title.into(), description);
    }

    pub fn info(&self, title: impl Into<String>, description: Option<String>) {
        self.send(NotificationLevel::Info, title.into(), description);
    }

    pub fn warning(&self, title: impl Into<String>, description: Option<String>) {
        self.send(NotificationLevel::Warning, title.into(), description);
    }

    pub fn error(&self, title: impl Into<String>, description: Option<String>) {
        self.send(NotificationLevel::Error, title.into(), description);
    }

    fn send(&self, level: NotificationLevel, title: String, description: Option<String>) {
        tracing::debug!("Notification ({:?}): {}", level, title);
        let _ = self.tx.send(Notification {
            level,
            title,
            description,
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
