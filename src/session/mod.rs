//! Client wiring: one [`SyncClient`] per device, one [`UserSession`] per
//! signed-in user.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{Config, SyncSettings};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::errors::SyncError;
use crate::facade::Collection;
use crate::models::{Entity, SyncState};
use crate::notify::Notifier;
use crate::queue::OfflineQueue;
use crate::realtime::RealtimeListener;
use crate::remote::{HttpRemote, RemoteStore};
use crate::storage::{FileStore, KeyValueStore};
use crate::sync::{ConflictPolicy, DrainOutcome, SyncOrchestrator, SyncScheduler};
use crate::worker::{WorkerBridge, WorkerEvent, WorkerPort};

/// Tunables of a [`SyncClient`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub reconnect_delay: Duration,
    pub initial_sync_delay: Duration,
    pub conflict_policy: ConflictPolicy,
    /// Reachability before the platform reports anything
    pub initially_online: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SyncOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay,
            initial_sync_delay: settings.initial_sync_delay,
            conflict_policy: settings.conflict_policy,
            initially_online: true,
        }
    }
}

/// Long-lived sync components of one device.
pub struct SyncClient {
    storage: Arc<dyn KeyValueStore>,
    notifier: Notifier,
    connectivity: ConnectivityMonitor,
    orchestrator: SyncOrchestrator,
    remote: Arc<dyn RemoteStore>,
    worker: Option<WorkerBridge>,
    options: SyncOptions,
}

impl SyncClient {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        storage: Arc<dyn KeyValueStore>,
        options: SyncOptions,
    ) -> Self {
        Self::build(remote, storage, options, None)
    }

    /// Like [`SyncClient::new`], with a background worker attached.
    pub fn with_worker(
        remote: Arc<dyn RemoteStore>,
        storage: Arc<dyn KeyValueStore>,
        options: SyncOptions,
        worker: WorkerBridge,
    ) -> Self {
        Self::build(remote, storage, options, Some(worker))
    }

    /// Client talking to the configured record server, with its queue under
    /// `sync.queue_dir`. The returned port belongs to the background worker.
    pub fn from_config(config: &Config) -> Result<(Self, WorkerPort), SyncError> {
        let settings = &config.sync;
        let remote = HttpRemote::new(settings.remote_url.clone(), config.api_psk.clone());
        let storage = FileStore::open(&settings.queue_dir)?;
        let (bridge, port) = WorkerBridge::channel(settings.worker_ack_timeout);

        let client = Self::with_worker(
            Arc::new(remote),
            Arc::new(storage),
            SyncOptions::from(settings),
            bridge,
        );
        Ok((client, port))
    }

    fn build(
        remote: Arc<dyn RemoteStore>,
        storage: Arc<dyn KeyValueStore>,
        options: SyncOptions,
        worker: Option<WorkerBridge>,
    ) -> Self {
        let notifier = Notifier::new();
        let connectivity =
            ConnectivityMonitor::new(options.initially_online, notifier.clone(), worker.clone());
        let orchestrator = SyncOrchestrator::new(
            Arc::clone(&remote),
            OfflineQueue::new(Arc::clone(&storage)),
            connectivity.clone(),
            notifier.clone(),
            options.conflict_policy,
        );

        Self {
            storage,
            notifier,
            connectivity,
            orchestrator,
            remote,
            worker,
            options,
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn worker(&self) -> Option<&WorkerBridge> {
        self.worker.as_ref()
    }

    /// Feed the platform's online/offline signal.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Start syncing for `user_id`. Each session listens for realtime changes
    /// on its own, so sessions of different users never share subscriptions.
    pub async fn login(&self, user_id: &str) -> UserSession {
        tracing::info!("Starting sync session for {}", user_id);

        let scheduler = SyncScheduler::start(
            self.orchestrator.clone(),
            user_id.to_string(),
            self.options.reconnect_delay,
            self.options.initial_sync_delay,
        );

        let realtime = RealtimeListener::new(Arc::clone(&self.remote));
        let mut background = vec![self.spawn_realtime_keeper(&realtime, user_id)];
        if let Some(worker) = &self.worker {
            background.push(self.spawn_worker_forwarder(worker, user_id));
        }

        if self.connectivity.is_online() {
            realtime.start(user_id).await;
        }

        UserSession {
            user_id: user_id.to_string(),
            orchestrator: self.orchestrator.clone(),
            realtime,
            storage: Arc::clone(&self.storage),
            scheduler,
            background,
        }
    }

    /// Re-establish realtime subscriptions whenever connectivity returns.
    fn spawn_realtime_keeper(
        &self,
        realtime: &RealtimeListener,
        user_id: &str,
    ) -> JoinHandle<()> {
        let mut events = self.connectivity.subscribe();
        let realtime = realtime.clone();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectivityEvent::Online) => realtime.start(&user_id).await,
                    Ok(ConnectivityEvent::Offline) => realtime.stop(),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Surface background syncs finished by the worker.
    fn spawn_worker_forwarder(&self, worker: &WorkerBridge, user_id: &str) -> JoinHandle<()> {
        let mut events = worker.subscribe();
        let notifier = self.notifier.clone();
        let orchestrator = self.orchestrator.clone();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WorkerEvent::SyncCompleted { timestamp }) => {
                        let at = DateTime::from_timestamp_millis(timestamp)
                            .map(|t| t.format("%H:%M:%S").to_string());
                        notifier.info(
                            "Background sync finished",
                            at.map(|t| format!("Completed at {} UTC.", t)),
                        );
                        orchestrator.refresh_state(&user_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Explicitly drop the offline queue of `user_id`.
    pub fn clear_cache(&self, user_id: &str) -> Result<(), SyncError> {
        self.orchestrator.clear_cache(user_id)
    }

    /// Best-effort notice to the worker that the app is going away.
    pub fn shutdown(&self) {
        if let Some(worker) = &self.worker {
            worker.app_closing();
        }
    }
}

/// Sync activity of one signed-in user. Everything stops when dropped.
pub struct UserSession {
    user_id: String,
    orchestrator: SyncOrchestrator,
    realtime: RealtimeListener,
    storage: Arc<dyn KeyValueStore>,
    scheduler: SyncScheduler,
    background: Vec<JoinHandle<()>>,
}

impl UserSession {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// A fresh collection for `E`; call [`Collection::refresh`] to load it.
    pub fn collection<E: Entity>(&self) -> Collection<E> {
        Collection::new(
            self.user_id.clone(),
            self.orchestrator.clone(),
            Arc::clone(&self.storage),
        )
    }

    pub async fn sync_now(&self) -> DrainOutcome {
        self.orchestrator.sync_now(&self.user_id).await
    }

    pub fn state(&self) -> SyncState {
        self.orchestrator.state(&self.user_id)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.orchestrator.subscribe_state(&self.user_id)
    }

    pub fn realtime(&self) -> &RealtimeListener {
        &self.realtime
    }

    pub fn clear_cache(&self) -> Result<(), SyncError> {
        self.orchestrator.clear_cache(&self.user_id)
    }

    /// End the session. Queued operations stay persisted for the next login.
    pub fn logout(self) {
        tracing::info!("Ending sync session for {}", self.user_id);
    }
}

impl Drop for UserSession {
    fn drop(&mut self) {
        self.scheduler.stop();
        for task in self.background.drain(..) {
            task.abort();
        }
        self.realtime.stop();
    }
}
