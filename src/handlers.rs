//! Domain handlers.
//!
//! `ExecuteChecksHandler` owns the write path for one batch: run the
//! checks, persist each outcome together with the schedule advance,
//! recompute derived status and emit transition events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::bus::Event;
use crate::db::{Check, CheckResult, ResultStatus, Store, StoreError};
use crate::runner::{CheckRunner, ResultSink};
use crate::status::{self, DerivedStatus, STATUS_WINDOW};

/// Handler for the `ExecuteChecks` command.
pub struct ExecuteChecksHandler {
    store: Arc<dyn Store>,
    runner: CheckRunner,
}

impl ExecuteChecksHandler {
    pub fn new(store: Arc<dyn Store>, runner: CheckRunner) -> Self {
        Self { store, runner }
    }

    /// Run the batch and return the transition events it produced.
    ///
    /// A failed store write drops that outcome: the schedule advance did
    /// not happen, so the check is simply re-selected on a later poll.
    pub async fn handle(&self, checks: Vec<Check>) -> Vec<Event> {
        let recorder = Arc::new(OutcomeRecorder {
            store: self.store.clone(),
            checks: checks
                .iter()
                .map(|check| (check.check_id, check.clone()))
                .collect(),
            events: Mutex::new(Vec::new()),
        });

        if let Err(err) = self.runner.run_batch(checks, recorder.clone()).await {
            tracing::error!("check batch aborted: {err}");
        }

        recorder.take_events()
    }
}

/// Persists one outcome at a time on a worker thread.
struct OutcomeRecorder {
    store: Arc<dyn Store>,
    checks: HashMap<i64, Check>,
    events: Mutex<Vec<Event>>,
}

impl ResultSink for OutcomeRecorder {
    fn on_outcome(&self, outcome: CheckResult) {
        match self.record(outcome) {
            Ok(mut events) => self.events.lock().unwrap().append(&mut events),
            Err(err) => tracing::error!("dropping check outcome: {err}"),
        }
    }
}

impl OutcomeRecorder {
    fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn record(&self, outcome: CheckResult) -> Result<Vec<Event>, StoreError> {
        let Some(check) = self.checks.get(&outcome.check_id) else {
            tracing::warn!(
                check_id = outcome.check_id,
                "outcome for a check not in this batch; ignoring"
            );
            return Ok(Vec::new());
        };

        let previous = self.store.recent_results(check.check_id, STATUS_WINDOW)?;
        let previous_status = status::check_status(&result_statuses(&previous));

        let now = Utc::now().timestamp();
        let stored = self
            .store
            .record_execution(&outcome, now + check.interval_seconds)?;

        let mut window = vec![stored.status];
        window.extend(
            previous
                .iter()
                .take(STATUS_WINDOW - 1)
                .map(|result| result.status),
        );
        let new_status = status::check_status(&window);

        let mut events = Vec::new();
        if new_status != previous_status {
            tracing::info!(
                check = %check.name,
                from = %previous_status,
                to = %new_status,
                "check status changed"
            );

            if new_status == DerivedStatus::Failed {
                events.push(Event::CheckFailed {
                    check: check.clone(),
                    result: stored.clone(),
                });
            }

            let (service_before, service_after) =
                self.service_transition(check, previous_status, new_status)?;
            if service_before != service_after {
                let service = self.store.get_service(check.service_id)?;
                events.push(Event::ServiceStatusChanged {
                    service,
                    status: service_after,
                });
            }
        }

        Ok(events)
    }

    /// Aggregate the service status with the current check's old and new
    /// derived status substituted in.
    fn service_transition(
        &self,
        check: &Check,
        previous: DerivedStatus,
        new: DerivedStatus,
    ) -> Result<(DerivedStatus, DerivedStatus), StoreError> {
        let siblings = self.store.list_checks_for_service(check.service_id)?;
        let mut before = Vec::with_capacity(siblings.len());
        let mut after = Vec::with_capacity(siblings.len());

        for sibling in siblings {
            if sibling.check_id == check.check_id {
                before.push(previous);
                after.push(new);
            } else {
                let window = self.store.recent_results(sibling.check_id, STATUS_WINDOW)?;
                let sibling_status = status::check_status(&result_statuses(&window));
                before.push(sibling_status);
                after.push(sibling_status);
            }
        }

        Ok((
            status::service_status(&before),
            status::service_status(&after),
        ))
    }
}

fn result_statuses(results: &[CheckResult]) -> Vec<ResultStatus> {
    results.iter().map(|result| result.status).collect()
}
