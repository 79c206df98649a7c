//! Command and event dispatch.
//!
//! Commands have exactly one handler; the exhaustive match on the command
//! enum is what enforces it, and an unknown command cannot be constructed.
//! Events fan out to every listener; a failing listener is logged and never
//! stops the others. Handler-produced events drain FIFO per dispatch.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::db::{Check, CheckResult, Service};
use crate::handlers::ExecuteChecksHandler;
use crate::status::DerivedStatus;

#[derive(Debug)]
pub enum Command {
    /// Run a batch of due checks and persist their outcomes.
    ExecuteChecks(Vec<Check>),
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A check's derived status transitioned into `failed`.
    CheckFailed { check: Check, result: CheckResult },
    /// A service's aggregate status changed.
    ServiceStatusChanged {
        service: Service,
        status: DerivedStatus,
    },
}

/// An event consumer, e.g. a notifier sink.
#[async_trait]
pub trait EventListener: Send + Sync {
    fn name(&self) -> &'static str;
    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Synchronous-contract dispatcher between the scheduler, the domain
/// handlers and the notifier listeners.
pub struct MessageBus {
    handler: Arc<ExecuteChecksHandler>,
    listeners: Vec<Arc<dyn EventListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MessageBus {
    pub fn new(handler: Arc<ExecuteChecksHandler>, listeners: Vec<Arc<dyn EventListener>>) -> Self {
        Self {
            handler,
            listeners,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Hand a command to its handler on a worker task. Never blocks on the
    /// handler itself, so a long batch cannot delay the caller's loop.
    pub async fn dispatch(&self, command: Command) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!("bus is closed; dropping {command:?}");
            return;
        }

        let handler = self.handler.clone();
        let listeners = self.listeners.clone();
        let task = tokio::spawn(async move {
            let events = match command {
                Command::ExecuteChecks(checks) => handler.handle(checks).await,
            };

            let mut queue: VecDeque<Event> = events.into();
            while let Some(event) = queue.pop_front() {
                for listener in &listeners {
                    if let Err(err) = listener.on_event(&event).await {
                        tracing::error!(
                            listener = listener.name(),
                            "event listener failed: {err:#}"
                        );
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Wait for every in-flight command task to finish without closing the
    /// bus.
    pub async fn drain(&self) {
        let mut handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles.iter_mut() {
            let _ = handle.await;
        }
    }

    /// Stop accepting commands and wait up to `grace` for in-flight
    /// batches; whatever is still running afterwards is aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);

        let mut handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }

        let wait_all = async {
            for handle in handles.iter_mut() {
                let _ = handle.await;
            }
        };

        if timeout(grace, wait_all).await.is_err() {
            tracing::warn!("shutdown grace period elapsed; aborting in-flight batches");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}
