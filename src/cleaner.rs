//! Retention cleaner.
//!
//! Deletes results older than the retention period in bounded batches so
//! one cycle never holds a long transaction, yielding between batches to
//! keep the store available to live writers.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task;
use tokio::time::MissedTickBehavior;

use crate::db::Store;

pub struct ResultsCleaner {
    store: Arc<dyn Store>,
    cleanup_interval: Duration,
    retention_period: i64,
    batch_size: usize,
}

impl ResultsCleaner {
    pub fn new(
        store: Arc<dyn Store>,
        cleanup_interval: Duration,
        retention_period: i64,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            cleanup_interval,
            retention_period,
            batch_size,
        }
    }

    /// Run until the stop channel fires.
    pub async fn run(self, mut stop: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.cleanup_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The immediate first tick would race agent startup for no benefit.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => self.run_cycle().await,
            }
        }

        tracing::debug!("results cleaner stopped");
    }

    /// One full cleanup cycle: delete in batches until a short batch.
    pub async fn run_cycle(&self) {
        let cutoff = Utc::now().timestamp() - self.retention_period;
        let mut total = 0usize;

        loop {
            let store = self.store.clone();
            let batch_size = self.batch_size;
            let deleted =
                match task::spawn_blocking(move || store.delete_results_older_than(cutoff, batch_size))
                    .await
                {
                    Ok(Ok(deleted)) => deleted,
                    Ok(Err(err)) => {
                        // Back off until the next cycle.
                        tracing::error!("cleaner: failed to delete expired results: {err}");
                        return;
                    }
                    Err(err) => {
                        tracing::error!("cleaner: delete task failed: {err}");
                        return;
                    }
                };

            total += deleted;
            if deleted < self.batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        if total > 0 {
            tracing::info!(deleted = total, "cleaned up expired check results");
        }
    }
}
