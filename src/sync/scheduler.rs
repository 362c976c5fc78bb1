//! Background triggers for queue drains.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{DrainOutcome, SyncOrchestrator};
use crate::connectivity::ConnectivityEvent;

/// Drains a user's queue shortly after session start and after every
/// reconnect. Stops when dropped.
pub struct SyncScheduler {
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn start(
        orchestrator: SyncOrchestrator,
        user_id: String,
        reconnect_delay: Duration,
        initial_delay: Duration,
    ) -> Self {
        let connectivity = orchestrator.connectivity().clone();
        // Subscribe here so a transition right after start is not missed.
        let mut events = connectivity.subscribe();

        let handle = tokio::spawn(async move {
            let initial = tokio::time::sleep(initial_delay);
            tokio::pin!(initial);
            let mut initial_pending = true;

            loop {
                tokio::select! {
                    _ = &mut initial, if initial_pending => {
                        initial_pending = false;
                        if connectivity.is_online() {
                            log_outcome(&user_id, orchestrator.drain_queue(&user_id).await);
                        }
                    }
                    event = events.recv() => match event {
                        Ok(ConnectivityEvent::Online) => {
                            orchestrator.refresh_state(&user_id);
                            // Let the connection settle before replaying.
                            tokio::time::sleep(reconnect_delay).await;
                            if connectivity.is_online() {
                                log_outcome(&user_id, orchestrator.drain_queue(&user_id).await);
                            }
                        }
                        Ok(ConnectivityEvent::Offline) => orchestrator.refresh_state(&user_id),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!("Scheduler missed {} connectivity events", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });

        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn log_outcome(user_id: &str, outcome: DrainOutcome) {
    match outcome {
        DrainOutcome::Completed(report) if !report.is_clean() => tracing::warn!(
            "Automatic sync for {} left {} operations queued",
            user_id,
            report.remaining
        ),
        other => tracing::debug!("Automatic sync for {}: {:?}", user_id, other),
    }
}
