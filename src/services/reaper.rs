//! Periodic removal of expired drops and their blobs.

use super::{
    object_store::{ObjectStore, StoreResult, unix_now},
    periodic::PeriodicTask,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Default spacing between sweeps.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Minimum age of a file before the orphan scan may remove it.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(10 * 60);

/// Aggregate counts for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    pub expired: usize,
    pub blob_failures: usize,
    pub orphans_removed: usize,
    pub orphan_failures: usize,
}

#[derive(Clone)]
pub struct Reaper {
    store: ObjectStore,
    orphan_grace: Duration,
    // Serializes ticks when tests or callers drive `tick` alongside the
    // scheduled task.
    running: Arc<Mutex<()>>,
}

impl Reaper {
    pub fn new(store: ObjectStore) -> Self {
        Self::with_orphan_grace(store, ORPHAN_GRACE)
    }

    pub fn with_orphan_grace(store: ObjectStore, orphan_grace: Duration) -> Self {
        Self {
            store,
            orphan_grace,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// One sweep at the current time.
    pub async fn tick(&self) -> StoreResult<ReapReport> {
        self.tick_at(unix_now()).await
    }

    /// Delete expired rows, then their blobs, then reconcile orphans.
    ///
    /// A failing blob delete is counted and the batch continues. Only a
    /// failure of the metadata sweep itself is returned as an error.
    pub async fn tick_at(&self, now: i64) -> StoreResult<ReapReport> {
        let _guard = self.running.lock().await;
        let mut report = ReapReport::default();

        let ids = self.store.sweep_expired(now).await?;
        report.expired = ids.len();
        for id in &ids {
            if let Err(err) = self.store.remove_blob(id).await {
                warn!(id = %id, error = %err, "failed to remove expired blob");
                report.blob_failures += 1;
            }
        }

        match self.store.reconcile_orphans(self.orphan_grace).await {
            Ok(orphans) => {
                report.orphans_removed = orphans.removed;
                report.orphan_failures = orphans.failed;
            }
            Err(err) => {
                warn!(error = %err, "orphan reconciliation failed");
                report.orphan_failures += 1;
            }
        }

        Ok(report)
    }

    /// Schedule `tick` every `every` until the returned task is stopped.
    pub fn start(self, every: Duration) -> PeriodicTask {
        PeriodicTask::spawn("reaper", every, move || {
            let reaper = self.clone();
            async move {
                match reaper.tick().await {
                    Ok(report) if report != ReapReport::default() => {
                        info!(
                            expired = report.expired,
                            blob_failures = report.blob_failures,
                            orphans_removed = report.orphans_removed,
                            orphan_failures = report.orphan_failures,
                            "reaper sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "reaper sweep failed"),
                }
            }
        })
    }
}
