//! Concurrent check runner.
//!
//! Fans a batch of due checks out to their executors and streams each
//! outcome back to a synchronous sink exactly once. Executors never error
//! through this boundary; the only failure the runner surfaces upward is a
//! panicked probe task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};

use crate::db::{Check, CheckKind, CheckResult};
use crate::executor::{BatchResources, Executor, ExecutorRegistry};

/// Outcomes in flight between probe tasks and the sink consumer.
const OUTCOME_BUFFER: usize = 100;

/// Receives each outcome of a batch exactly once, on a thread where
/// blocking store I/O is safe.
pub trait ResultSink: Send + Sync {
    fn on_outcome(&self, outcome: CheckResult);
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to build batch resources: {0}")]
    Resources(#[from] reqwest::Error),
    #[error("probe task panicked: {0}")]
    TaskPanicked(String),
}

/// Dispatches batches of checks to registered executors.
pub struct CheckRunner {
    registry: ExecutorRegistry,
}

impl CheckRunner {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self { registry }
    }

    /// Execute every check of the batch concurrently, delivering each
    /// outcome to `sink` exactly once. Shared resources and executors are
    /// closed on every exit path.
    pub async fn run_batch(
        &self,
        checks: Vec<Check>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<(), RunnerError> {
        if checks.is_empty() {
            return Ok(());
        }

        let kinds: HashSet<CheckKind> = checks.iter().map(|c| c.kind.clone()).collect();
        let resources = BatchResources::for_kinds(&kinds)?;

        let mut executors: HashMap<CheckKind, Arc<dyn Executor>> = HashMap::new();
        for kind in &kinds {
            if let Ok(executor) = self.registry.build(kind, &resources) {
                executors.insert(kind.clone(), executor);
            }
            // Unregistered kinds become unknown_kind outcomes per check.
        }

        let (tx, mut rx) = mpsc::channel::<CheckResult>(OUTCOME_BUFFER);
        let mut probes = JoinSet::new();

        for check in checks {
            let tx = tx.clone();
            match executors.get(&check.kind).cloned() {
                Some(executor) => {
                    probes.spawn(async move {
                        let outcome = executor.execute(&check).await;
                        let _ = tx.send(outcome).await;
                    });
                }
                None => {
                    probes.spawn(async move {
                        let _ = tx.send(unknown_kind_outcome(&check)).await;
                    });
                }
            }
        }
        drop(tx);

        // The consumer drains the queue while probes are still running; the
        // channel closes once every probe task has dropped its sender.
        let consumer = tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                let sink = sink.clone();
                if let Err(err) = task::spawn_blocking(move || sink.on_outcome(outcome)).await {
                    tracing::error!("result sink task failed: {err}");
                }
            }
        });

        let mut failure: Option<RunnerError> = None;
        while let Some(joined) = probes.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() && failure.is_none() {
                    failure = Some(RunnerError::TaskPanicked(err.to_string()));
                    probes.abort_all();
                }
            }
        }

        if let Err(err) = consumer.await {
            tracing::error!("outcome consumer failed: {err}");
        }

        for executor in executors.values() {
            executor.close().await;
        }
        drop(resources);

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn unknown_kind_outcome(check: &Check) -> CheckResult {
    CheckResult::error(
        check.check_id,
        serde_json::json!({
            "error_type": "unknown_kind",
            "error_msg": format!("no executor registered for check kind '{}'", check.kind),
        }),
    )
}
