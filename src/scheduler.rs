//! Poll scheduler.
//!
//! A long-lived loop that selects due checks from the store and hands the
//! batch to the bus. The bus runs the handler on a worker task, so a slow
//! batch never delays the next poll. The scheduler itself never decides
//! what to run; due-ness is fully derived from `next_check_time`.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task;
use tokio::time::MissedTickBehavior;

use crate::bus::{Command, MessageBus};
use crate::db::Store;

/// Upper bound on one poll's batch; bounds runner fan-out per tick.
pub const DUE_BATCH_LIMIT: usize = 500;

pub struct Scheduler {
    store: Arc<dyn Store>,
    bus: Arc<MessageBus>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, bus: Arc<MessageBus>, poll_interval: Duration) -> Self {
        Self {
            store,
            bus,
            poll_interval,
        }
    }

    /// Run until the stop channel fires.
    pub async fn run(self, mut stop: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // tokio intervals fire immediately; the loop waits one poll first.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => self.poll().await,
            }
        }

        tracing::debug!("scheduler stopped");
    }

    async fn poll(&self) {
        let store = self.store.clone();
        let now = Utc::now().timestamp();

        let due = match task::spawn_blocking(move || store.list_due(now, DUE_BATCH_LIMIT)).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(err)) => {
                // Back off one poll interval on store failures.
                tracing::error!("scheduler: failed to select due checks: {err}");
                return;
            }
            Err(err) => {
                tracing::error!("scheduler: due-check selection task failed: {err}");
                return;
            }
        };

        if due.is_empty() {
            return;
        }

        tracing::debug!(count = due.len(), "dispatching due checks");
        self.bus.dispatch(Command::ExecuteChecks(due)).await;
    }
}
