//! Sync orchestrator: applies local mutations and drains the offline queue.
//!
//! Online mutations go straight to the remote store; anything that cannot be
//! applied is queued and replayed in order by [`SyncOrchestrator::drain_queue`].
//! Drains are single-flight per user within one orchestrator.

mod scheduler;

pub use scheduler::SyncScheduler;

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::connectivity::ConnectivityMonitor;
use crate::errors::SyncError;
use crate::models::{EntityRecord, OperationKind, PendingOperation, SyncState, Table};
use crate::notify::Notifier;
use crate::queue::OfflineQueue;
use crate::remote::RemoteStore;

/// How concurrent writers to the same record are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Updates carry no expected version; the last write to arrive wins.
    #[default]
    LastWriteWins,
    /// Updates carry the record's `sync_version` and are rejected on mismatch.
    CompareAndSwap,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriteWins => "last_write_wins",
            ConflictPolicy::CompareAndSwap => "compare_and_swap",
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last_write_wins" | "lww" => Ok(ConflictPolicy::LastWriteWins),
            "compare_and_swap" | "cas" => Ok(ConflictPolicy::CompareAndSwap),
            other => Err(format!("unknown conflict policy: {}", other)),
        }
    }
}

/// Result of [`SyncOrchestrator::apply_mutation`].
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The remote store accepted the write; holds the confirmed record.
    Applied(EntityRecord),
    /// The write was queued; holds the optimistic record.
    Queued(EntityRecord),
}

impl MutationOutcome {
    pub fn record(&self) -> &EntityRecord {
        match self {
            MutationOutcome::Applied(record) | MutationOutcome::Queued(record) => record,
        }
    }

    pub fn into_record(self) -> EntityRecord {
        match self {
            MutationOutcome::Applied(record) | MutationOutcome::Queued(record) => record,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued(_))
    }
}

/// Counters for one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Left queued behind an earlier failure on the same record
    pub skipped: usize,
    /// Operations still queued after the pass
    pub remaining: usize,
    /// The pass stopped because connectivity was lost
    pub interrupted: bool,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && !self.interrupted
    }
}

/// Result of [`SyncOrchestrator::drain_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain for the same user is running.
    AlreadySyncing,
    Offline,
    /// Nothing was queued.
    Empty,
    Completed(DrainReport),
}

/// Owns the offline queue and every write to the remote store.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    remote: Arc<dyn RemoteStore>,
    queue: OfflineQueue,
    connectivity: ConnectivityMonitor,
    notifier: Notifier,
    policy: ConflictPolicy,
    draining: Mutex<HashSet<String>>,
    last_sync: Mutex<HashMap<String, DateTime<Utc>>>,
    states: Mutex<HashMap<String, watch::Sender<SyncState>>>,
}

/// Marks a user's drain as running until dropped.
struct DrainGuard<'a> {
    draining: &'a Mutex<HashSet<String>>,
    user_id: String,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        lock(self.draining).remove(&self.user_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyncOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        queue: OfflineQueue,
        connectivity: ConnectivityMonitor,
        notifier: Notifier,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                queue,
                connectivity,
                notifier,
                policy,
                draining: Mutex::new(HashSet::new()),
                last_sync: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.inner.policy
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.remote
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Apply a mutation remotely, or queue it when that is not possible.
    ///
    /// Errors only when the record is invalid or cannot be persisted locally.
    pub async fn apply_mutation(
        &self,
        user_id: &str,
        kind: OperationKind,
        record: EntityRecord,
    ) -> Result<MutationOutcome, SyncError> {
        let record = prepare(user_id, kind, record)?;
        let table = record.table();
        let queued = self.inner.queue.load(user_id);

        // Under CAS a write queued behind others expects the version they leave.
        let mut data = record.clone();
        if kind == OperationKind::Update && self.inner.policy == ConflictPolicy::CompareAndSwap {
            if let Some(version) = version_after(&queued, table, record.id()) {
                data.set_sync_version(version);
            }
        }
        let operation = PendingOperation::new(kind, data);
        let (table, id) = operation.entity_key();

        if !self.inner.connectivity.is_online() {
            tracing::debug!("Offline, queueing {} on {}/{}", kind.as_str(), table, id);
            return self.enqueue(user_id, operation, record);
        }

        // Earlier queued writes to this record must land first.
        if queued.iter().any(|pending| pending.entity_key() == (table, id)) {
            tracing::debug!("{}/{} has queued writes, queueing behind them", table, id);
            return self.enqueue(user_id, operation, record);
        }

        match self.apply_remote(user_id, &operation, None).await {
            Ok(confirmed) => {
                tracing::debug!("Applied {} on {}/{}", kind.as_str(), table, id);
                Ok(MutationOutcome::Applied(confirmed.unwrap_or(record)))
            }
            Err(e) => {
                tracing::warn!(
                    "Remote {} on {}/{} failed, queueing: {}",
                    kind.as_str(),
                    table,
                    id,
                    e
                );
                self.enqueue(user_id, operation, record)
            }
        }
    }

    fn enqueue(
        &self,
        user_id: &str,
        operation: PendingOperation,
        record: EntityRecord,
    ) -> Result<MutationOutcome, SyncError> {
        self.inner.queue.append(user_id, operation)?;
        self.refresh_state(user_id);
        Ok(MutationOutcome::Queued(record))
    }

    /// Issue one operation against the remote store.
    ///
    /// `confirmed` is the record version the remote store reported for an
    /// earlier write in the same pass; it overrides the queued version.
    async fn apply_remote(
        &self,
        user_id: &str,
        operation: &PendingOperation,
        confirmed: Option<i64>,
    ) -> Result<Option<EntityRecord>, SyncError> {
        let remote = &self.inner.remote;
        let (table, id) = operation.entity_key();

        match operation.operation {
            OperationKind::Insert => {
                let created = remote
                    .insert(table, user_id, operation.data.to_value()?)
                    .await?;
                Ok(Some(EntityRecord::from_value(table, created)?))
            }
            OperationKind::Update => {
                let expected_version = match self.inner.policy {
                    ConflictPolicy::LastWriteWins => None,
                    ConflictPolicy::CompareAndSwap => {
                        Some(confirmed.unwrap_or_else(|| operation.data.sync_version()))
                    }
                };
                let updated = remote
                    .update(
                        table,
                        user_id,
                        id,
                        operation.data.to_value()?,
                        expected_version,
                    )
                    .await?;
                Ok(Some(EntityRecord::from_value(table, updated)?))
            }
            OperationKind::Delete => match remote.delete(table, user_id, id).await {
                Ok(()) => Ok(None),
                Err(SyncError::NotFound(_)) => {
                    tracing::debug!("{}/{} already gone remotely", table, id);
                    Ok(None)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Replay the queued operations of `user_id` in order.
    pub async fn drain_queue(&self, user_id: &str) -> DrainOutcome {
        if !self.inner.connectivity.is_online() {
            return DrainOutcome::Offline;
        }
        let Some(guard) = self.begin_drain(user_id) else {
            tracing::debug!("Drain for {} already running", user_id);
            return DrainOutcome::AlreadySyncing;
        };

        let pending = self.inner.queue.load(user_id);
        if pending.is_empty() {
            return DrainOutcome::Empty;
        }

        self.refresh_state(user_id);
        tracing::info!("Syncing {} pending operations for {}", pending.len(), user_id);

        let mut report = DrainReport::default();
        let mut completed = HashSet::new();
        let mut blocked: HashSet<(Table, &str)> = HashSet::new();
        let mut versions: HashMap<(Table, &str), i64> = HashMap::new();

        for operation in &pending {
            if !self.inner.connectivity.is_online() {
                tracing::warn!("Connectivity lost, stopping sync for {}", user_id);
                report.interrupted = true;
                break;
            }

            let key = operation.entity_key();
            if blocked.contains(&key) {
                tracing::debug!(
                    "Skipping {} on {}/{} behind an earlier failure",
                    operation.operation.as_str(),
                    key.0,
                    key.1
                );
                report.skipped += 1;
                continue;
            }

            let confirmed = versions.get(&key).copied();
            match self.apply_remote(user_id, operation, confirmed).await {
                Ok(record) => {
                    match record {
                        Some(record) => versions.insert(key, record.sync_version()),
                        None => versions.remove(&key),
                    };
                    completed.insert(operation.id.clone());
                    report.succeeded += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to sync {} on {}/{}: {}",
                        operation.operation.as_str(),
                        key.0,
                        key.1,
                        e
                    );
                    blocked.insert(key);
                    report.failed += 1;
                }
            }
        }

        report.remaining = match self.inner.queue.remove_completed(user_id, &completed) {
            Ok(remaining) => remaining.len(),
            Err(e) => {
                tracing::error!("Failed to persist sync progress for {}: {}", user_id, e);
                pending.len()
            }
        };

        if report.is_clean() {
            lock(&self.inner.last_sync).insert(user_id.to_string(), Utc::now());
        }

        drop(guard);
        self.refresh_state(user_id);

        tracing::info!(
            "Sync pass for {} finished: {} applied, {} failed, {} still queued",
            user_id,
            report.succeeded,
            report.failed,
            report.remaining
        );
        DrainOutcome::Completed(report)
    }

    fn begin_drain(&self, user_id: &str) -> Option<DrainGuard<'_>> {
        if !lock(&self.inner.draining).insert(user_id.to_string()) {
            return None;
        }
        Some(DrainGuard {
            draining: &self.inner.draining,
            user_id: user_id.to_string(),
        })
    }

    /// Manual sync; reports the outcome to the user.
    pub async fn sync_now(&self, user_id: &str) -> DrainOutcome {
        let outcome = self.drain_queue(user_id).await;
        let notifier = &self.inner.notifier;

        match &outcome {
            DrainOutcome::Offline => notifier.warning(
                "Cannot sync while offline",
                Some("Your changes stay on this device until the connection returns.".to_string()),
            ),
            DrainOutcome::AlreadySyncing => notifier.info("Sync already in progress", None),
            DrainOutcome::Empty => notifier.success("Everything is up to date", None),
            DrainOutcome::Completed(report) if report.is_clean() => notifier.success(
                "Sync complete",
                Some(format!("{} changes synchronized.", report.succeeded)),
            ),
            DrainOutcome::Completed(report) => notifier.error(
                "Sync incomplete",
                Some(format!(
                    "{} changes could not be synchronized and remain pending.",
                    report.remaining
                )),
            ),
        }

        outcome
    }

    /// Current sync state of `user_id`.
    pub fn state(&self, user_id: &str) -> SyncState {
        SyncState {
            is_online: self.inner.connectivity.is_online(),
            is_syncing: lock(&self.inner.draining).contains(user_id),
            pending_operations: self.inner.queue.load(user_id),
            last_sync_at: lock(&self.inner.last_sync).get(user_id).copied(),
        }
    }

    /// Follow the sync state of `user_id`.
    pub fn subscribe_state(&self, user_id: &str) -> watch::Receiver<SyncState> {
        let mut states = lock(&self.inner.states);
        match states.get(user_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = watch::channel(self.state(user_id));
                states.insert(user_id.to_string(), sender);
                receiver
            }
        }
    }

    /// Push a fresh snapshot to state subscribers of `user_id`.
    pub fn refresh_state(&self, user_id: &str) {
        if !lock(&self.inner.states).contains_key(user_id) {
            return;
        }
        let state = self.state(user_id);
        if let Some(sender) = lock(&self.inner.states).get(user_id) {
            sender.send_replace(state);
        }
    }

    /// Drop every queued operation of `user_id`. Explicit user action only.
    pub fn clear_cache(&self, user_id: &str) -> Result<(), SyncError> {
        self.inner.queue.clear(user_id)?;
        lock(&self.inner.last_sync).remove(user_id);
        tracing::info!("Cleared offline queue for {}", user_id);
        self.refresh_state(user_id);
        Ok(())
    }
}

/// Remote version of `table/id` once every queued write to it has landed.
fn version_after(queued: &[PendingOperation], table: Table, id: &str) -> Option<i64> {
    queued
        .iter()
        .filter(|operation| operation.entity_key() == (table, id))
        .fold(None, |_, operation| match operation.operation {
            OperationKind::Insert => Some(1),
            OperationKind::Update => Some(operation.data.sync_version() + 1),
            OperationKind::Delete => None,
        })
}

/// Stamp and check the record before it crosses the queue boundary.
fn prepare(
    user_id: &str,
    kind: OperationKind,
    mut record: EntityRecord,
) -> Result<EntityRecord, SyncError> {
    let table = record.table();
    if Table::SYNCED.iter().all(|synced| *synced != table) {
        return Err(SyncError::Validation(format!(
            "{} records are kept on the device and never synced",
            table
        )));
    }

    if record.user_id().is_empty() {
        record.set_user_id(user_id.to_string());
    } else if record.user_id() != user_id {
        return Err(SyncError::Validation(format!(
            "Record {} belongs to another user",
            record.id()
        )));
    }

    if record.id().is_empty() {
        if kind != OperationKind::Insert {
            return Err(SyncError::Validation(format!(
                "{} on {} requires a record id",
                kind.as_str(),
                table
            )));
        }
        record.set_id(uuid::Uuid::new_v4().to_string());
    }

    Ok(record)
}
