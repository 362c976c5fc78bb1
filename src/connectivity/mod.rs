//! Network reachability tracking.
//!
//! The platform feeds its native online/offline signal into
//! [`ConnectivityMonitor::set_online`]; the monitor turns it into
//! de-duplicated transition events. There is no polling.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use crate::notify::Notifier;
use crate::worker::WorkerBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Shared handle to the current reachability state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    status: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
    notifier: Notifier,
    worker: Option<WorkerBridge>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, notifier: Notifier, worker: Option<WorkerBridge>) -> Self {
        let (status, _) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                status,
                events,
                notifier,
                worker,
            }),
        }
    }

    /// Current reachability.
    pub fn is_online(&self) -> bool {
        *self.inner.status.borrow()
    }

    /// Feed the native signal. Emits an event only when the value changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }

        if let Some(worker) = &self.inner.worker {
            worker.notify_online(online);
        }

        let event = if online {
            tracing::info!("Connectivity restored");
            self.inner.notifier.success(
                "Back online",
                Some("Pending changes will be synchronized shortly.".to_string()),
            );
            ConnectivityEvent::Online
        } else {
            tracing::warn!("Connectivity lost, continuing in local-only mode");
            self.inner.notifier.warning(
                "You are offline",
                Some("Changes are saved on this device and synced when the connection returns.".to_string()),
            );
            ConnectivityEvent::Offline
        };
        let _ = self.inner.events.send(event);
    }

    /// Transition events, one per change.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Latest value, for consumers that only care about the current state.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.status.subscribe()
    }
}
