//! Realtime change listener.
//!
//! Holds one remote subscription per synced table for the signed-in user
//! and re-publishes each change as a [`RealtimeEvent`].

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::{ChangeKind, ChangeNotification, EntityRecord, RealtimeEvent, Table};
use crate::remote::{ChangeStream, RemoteStore};

#[derive(Clone)]
pub struct RealtimeListener {
    inner: Arc<Inner>,
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    events: broadcast::Sender<RealtimeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl RealtimeListener {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                remote,
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to every synced table for `user_id`, replacing earlier subscriptions.
    ///
    /// Tables that cannot be subscribed are logged and left out.
    pub async fn start(&self, user_id: &str) {
        self.stop();

        let mut started = Vec::new();
        for table in Table::SYNCED {
            match self.inner.remote.subscribe(table, user_id).await {
                Ok(changes) => {
                    started.push(tokio::spawn(forward(
                        changes,
                        table,
                        user_id.to_string(),
                        self.inner.events.clone(),
                    )));
                }
                Err(e) => {
                    tracing::warn!("Could not subscribe to {} changes: {}", table, e);
                }
            }
        }

        tracing::info!(
            "Realtime listening on {} tables for {}",
            started.len(),
            user_id
        );
        self.tasks().extend(started);
    }

    /// Tear down every subscription.
    pub fn stop(&self) {
        let mut tasks = self.tasks();
        if !tasks.is_empty() {
            tracing::debug!("Stopping {} realtime subscriptions", tasks.len());
        }
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.events.subscribe()
    }

    /// Whether any subscription is still delivering.
    pub fn is_active(&self) -> bool {
        self.tasks().iter().any(|task| !task.is_finished())
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn forward(
    mut changes: ChangeStream,
    table: Table,
    user_id: String,
    events: broadcast::Sender<RealtimeEvent>,
) {
    while let Some(change) = changes.next().await {
        if let Some(event) = to_event(change, &user_id) {
            tracing::debug!(
                "Remote {:?} on {}/{}",
                event.operation,
                event.table,
                event.data.id()
            );
            let _ = events.send(event);
        }
    }
    tracing::debug!("Realtime feed for {} ended", table);
}

fn to_event(change: ChangeNotification, user_id: &str) -> Option<RealtimeEvent> {
    if change.owner().is_some_and(|owner| owner != user_id) {
        return None;
    }

    let image = match change.event_type {
        ChangeKind::Delete => change.old.or(change.new),
        ChangeKind::Insert | ChangeKind::Update => change.new.or(change.old),
    }?;

    match EntityRecord::from_value(change.table, image) {
        Ok(data) => Some(RealtimeEvent {
            table: change.table,
            operation: change.event_type,
            data,
            user_id: user_id.to_string(),
        }),
        Err(e) => {
            tracing::warn!("Ignoring undecodable {} change: {}", change.table, e);
            None
        }
    }
}
