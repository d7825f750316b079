//! Background upload of locally recorded notes
//!
//! A pass uploads every unsynced note independently and marks each one as
//! soon as the server acknowledges it. Passes run on a fixed interval, when
//! nudged after a new note, and sooner with backoff after a pass that left
//! work behind.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::store::NoteStore;

/// Result of one sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing left unsynced
    Success,
    /// Some notes are still unsynced; try again later
    Retry,
}

/// Upload all unsynced notes once
pub async fn run_sync_pass(store: &NoteStore) -> SyncOutcome {
    let unsynced = match store.get_unsynced_logs() {
        Ok(notes) => notes,
        Err(e) => {
            error!(error = %e, "failed to read unsynced notes");
            return SyncOutcome::Retry;
        }
    };

    if unsynced.is_empty() {
        debug!("no unsynced notes");
        return SyncOutcome::Success;
    }

    info!(count = unsynced.len(), "uploading unsynced notes");

    // Each acknowledged note is marked before the next upload starts, so a
    // cancelled pass never leaves an uploaded note unsynced
    let mut uploaded = Vec::with_capacity(unsynced.len());
    let mut failed = 0usize;
    for note in &unsynced {
        if !store.upload_to_remote(note).await {
            failed += 1;
            continue;
        }
        if let Err(e) = store.mark_synced(&[note.id]) {
            // The upload went through but stays unsynced locally
            error!(local_id = note.id, error = %e, "failed to mark uploaded note as synced");
            return SyncOutcome::Retry;
        }
        uploaded.push(note.id);
    }

    if failed > 0 {
        warn!(uploaded = uploaded.len(), failed, "sync pass incomplete, will retry");
        SyncOutcome::Retry
    } else {
        info!(uploaded = uploaded.len(), "sync pass complete");
        SyncOutcome::Success
    }
}

/// Cheap handle for asking the scheduler to sync soon
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    notify: Arc<Notify>,
}

impl SyncHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass as soon as the scheduler is free
    pub fn request(&self) {
        self.notify.notify_one();
    }
}

/// Timing of the periodic trigger
#[derive(Debug, Clone, Copy)]
pub struct SyncSchedule {
    pub interval: Duration,
    /// First delay after a `Retry`, doubled on each further `Retry`
    pub retry_base: Duration,
}

impl SyncSchedule {
    /// Delay before the next pass
    pub fn next_delay(&self, consecutive_retries: u32) -> Duration {
        if consecutive_retries == 0 {
            return self.interval;
        }
        let factor = 2u32.saturating_pow(consecutive_retries - 1);
        self.retry_base
            .saturating_mul(factor)
            .min(self.interval)
    }
}

/// Drives sync passes until shutdown
pub struct SyncScheduler {
    store: Arc<NoteStore>,
    schedule: SyncSchedule,
    handle: SyncHandle,
}

impl SyncScheduler {
    pub fn new(store: Arc<NoteStore>, schedule: SyncSchedule, handle: SyncHandle) -> Self {
        Self {
            store,
            schedule,
            handle,
        }
    }

    /// Run a pass, skipping it when the server is unreachable
    async fn trigger(&self) -> SyncOutcome {
        if !self.store.api().is_reachable().await {
            debug!("server unreachable, skipping sync pass");
            return SyncOutcome::Retry;
        }
        run_sync_pass(&self.store).await
    }

    /// Loop until a shutdown message arrives
    ///
    /// Shutdown also cancels a pass that is still uploading; notes it did not
    /// mark stay unsynced for the next run.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(interval_secs = self.schedule.interval.as_secs(), "sync scheduler started");

        // The first pass picks up anything left over from a previous run
        let mut retries = 0u32;
        loop {
            let outcome = tokio::select! {
                outcome = self.trigger() => outcome,
                _ = shutdown_rx.recv() => {
                    debug!("sync pass cancelled by shutdown");
                    break;
                }
            };
            retries = match outcome {
                SyncOutcome::Success => 0,
                SyncOutcome::Retry => retries.saturating_add(1),
            };

            let deadline = Instant::now() + self.schedule.next_delay(retries);

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("periodic sync trigger");
                }
                _ = self.handle.notify.notified() => {
                    debug!("sync requested");
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("sync scheduler stopped");
    }
}
