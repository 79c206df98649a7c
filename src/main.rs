//! Agent entrypoint.

use anyhow::{anyhow, Context};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil::bus::{self, MessageBus};
use vigil::cleaner::ResultsCleaner;
use vigil::config::AgentConfig;
use vigil::db::{SqliteStore, Store};
use vigil::executor::ExecutorRegistry;
use vigil::handlers::ExecuteChecksHandler;
use vigil::notify::{LogNotifier, TelegramNotifier};
use vigil::runner::CheckRunner;
use vigil::scheduler::Scheduler;

/// How long in-flight batches may run after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

enum AgentError {
    /// Bad configuration or environment; exit code 1.
    Startup(anyhow::Error),
    /// Irrecoverable error while running; exit code 2.
    Runtime(anyhow::Error),
}

fn main() -> ExitCode {
    let config = AgentConfig::parse();

    if let Err(err) = init_tracing(&config.log_level) {
        eprintln!("failed to initialize logging: {err:#}");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(AgentError::Startup(err)) => {
            tracing::error!("startup failed: {err:#}");
            ExitCode::from(1)
        }
        Err(AgentError::Runtime(err)) => {
            tracing::error!("irrecoverable runtime error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(log_level: &str) -> anyhow::Result<()> {
    let directive = format!("vigil={log_level}")
        .parse()
        .with_context(|| format!("invalid log level '{log_level}'"))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();
    Ok(())
}

async fn run(config: AgentConfig) -> Result<(), AgentError> {
    if !config.db.exists() {
        return Err(AgentError::Startup(anyhow!(
            "database file not found: {}",
            config.db.display()
        )));
    }

    tracing::info!("starting vigil with database {}", config.db.display());
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.db)
            .map_err(|e| AgentError::Startup(anyhow!(e).context("failed to open store")))?,
    );

    // Reconciliation: checks left in `processing` belong to a run that died
    // before completing; make them selectable again.
    let reclaimed = store
        .reset_processing_checks()
        .map_err(|e| AgentError::Startup(anyhow!(e).context("startup reconciliation failed")))?;
    if reclaimed > 0 {
        tracing::info!(count = reclaimed, "reset checks stuck in processing");
    }

    let registry = ExecutorRegistry::with_default_kinds();
    warn_about_unknown_kinds(&store, &registry);

    let handler = Arc::new(ExecuteChecksHandler::new(
        store.clone(),
        CheckRunner::new(registry),
    ));

    let mut listeners: Vec<Arc<dyn bus::EventListener>> = vec![Arc::new(LogNotifier)];
    if config.enable_telegram {
        listeners.push(Arc::new(
            TelegramNotifier::from_env().map_err(AgentError::Startup)?,
        ));
        tracing::info!("telegram notifications enabled");
    }

    let bus = Arc::new(MessageBus::new(handler, listeners));
    let (stop_tx, _) = broadcast::channel(1);

    let scheduler = Scheduler::new(
        store.clone(),
        bus.clone(),
        Duration::from_secs(config.interval),
    );
    let mut scheduler_task = tokio::spawn(scheduler.run(stop_tx.subscribe()));
    tracing::info!(interval = config.interval, "check scheduler started");

    let mut cleaner_task = if config.disable_cleaner {
        tracing::info!("results cleaner is disabled");
        None
    } else {
        let cleaner = ResultsCleaner::new(
            store.clone(),
            Duration::from_secs(config.cleanup_interval),
            config.retention_period as i64,
            config.batch_size,
        );
        tracing::info!(
            interval = config.cleanup_interval,
            retention = config.retention_period,
            "results cleaner started"
        );
        Some(tokio::spawn(cleaner.run(stop_tx.subscribe())))
    };

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        joined = &mut scheduler_task => {
            return Err(AgentError::Runtime(anyhow!(
                "scheduler task exited unexpectedly: {joined:?}"
            )));
        }
        joined = wait_optional(&mut cleaner_task) => {
            return Err(AgentError::Runtime(anyhow!(
                "cleaner task exited unexpectedly: {joined:?}"
            )));
        }
    }

    // Stop the loops, refuse new commands and let in-flight batches finish
    // up to the grace period.
    let _ = stop_tx.send(());
    bus.shutdown(SHUTDOWN_GRACE).await;
    let _ = scheduler_task.await;
    if let Some(task) = cleaner_task.take() {
        let _ = task.await;
    }

    tracing::info!("vigil stopped");
    Ok(())
}

/// Resolves when the cleaner task finishes, or never if there is none.
async fn wait_optional(
    task: &mut Option<tokio::task::JoinHandle<()>>,
) -> Result<(), tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn warn_about_unknown_kinds(store: &Arc<dyn Store>, registry: &ExecutorRegistry) {
    match store.list_checks() {
        Ok(checks) => {
            for check in checks {
                if !registry.contains(&check.kind) {
                    tracing::warn!(
                        check = %check.name,
                        kind = %check.kind,
                        "no executor registered for this check kind; it will record unknown_kind errors"
                    );
                }
            }
        }
        Err(err) => tracing::warn!("could not validate check kinds at startup: {err}"),
    }
}
