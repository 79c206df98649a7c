//! Check executors, one per check kind.
//!
//! An executor converts every internal failure into an `error` result;
//! nothing propagates through the runner boundary. Each kind owns the
//! schema of its `check.data` blob via a typed config struct validated at
//! execution time.

pub mod dns;
pub mod http;
pub mod imap;
pub mod json_metrics;
pub mod smtp;
pub mod ssh;
pub mod tcp;
pub mod thresholds;

use crate::db::{Check, CheckKind, CheckResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A single check executor.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Perform the probe. May suspend on network I/O; must honor the
    /// check's configured timeout and never panic on bad input.
    async fn execute(&self, check: &Check) -> CheckResult;

    /// Release any resources owned by this instance. Called once per batch.
    async fn close(&self) {}
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no executor registered for check kind '{0}'")]
    UnknownKind(String),
}

/// Resources shared by all executors of one batch.
///
/// The HTTP client pool is only built when the batch actually contains an
/// HTTP-flavored kind; it is dropped at batch end.
pub struct BatchResources {
    pub http: Option<reqwest::Client>,
}

impl BatchResources {
    pub fn for_kinds(kinds: &HashSet<CheckKind>) -> Result<Self, reqwest::Error> {
        let http = if kinds.iter().any(CheckKind::uses_http_pool) {
            Some(
                reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self { http })
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self { http: None }
    }
}

/// An HTTP client that is either borrowed from the batch pool or created
/// lazily and owned by one executor instance.
pub(crate) struct LazyHttpClient {
    shared: Option<reqwest::Client>,
    owned: tokio::sync::Mutex<Option<reqwest::Client>>,
}

impl LazyHttpClient {
    pub(crate) fn new(shared: Option<reqwest::Client>) -> Self {
        Self {
            shared,
            owned: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn get(&self) -> Result<reqwest::Client, reqwest::Error> {
        if let Some(client) = &self.shared {
            return Ok(client.clone());
        }
        let mut owned = self.owned.lock().await;
        match owned.as_ref() {
            Some(client) => Ok(client.clone()),
            None => {
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()?;
                *owned = Some(client.clone());
                Ok(client)
            }
        }
    }

    pub(crate) async fn close(&self) {
        self.owned.lock().await.take();
    }
}

type ExecutorFactory = Box<dyn Fn(&BatchResources) -> Arc<dyn Executor> + Send + Sync>;

/// Registry mapping check kinds to executor factories.
///
/// The factory seam is how new kinds are added; neither the runner nor the
/// handlers ever switch on `kind` themselves.
pub struct ExecutorRegistry {
    factories: HashMap<CheckKind, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every built-in kind wired up.
    pub fn with_default_kinds() -> Self {
        let mut registry = Self::new();
        registry.register(CheckKind::Http, |res| {
            Arc::new(http::HttpExecutor::new(res.http.clone()))
        });
        registry.register(CheckKind::JsonHttp, |res| {
            Arc::new(json_metrics::JsonMetricsExecutor::reachability(
                res.http.clone(),
            ))
        });
        registry.register(CheckKind::JsonMetrics, |res| {
            Arc::new(json_metrics::JsonMetricsExecutor::strict(res.http.clone()))
        });
        registry.register(CheckKind::Dns, |_| Arc::new(dns::DnsExecutor::new()));
        registry.register(CheckKind::Tcp, |_| Arc::new(tcp::TcpExecutor::new()));
        registry.register(CheckKind::Smtp, |_| Arc::new(smtp::SmtpExecutor::new()));
        registry.register(CheckKind::Imap, |_| Arc::new(imap::ImapExecutor::new()));
        registry.register(CheckKind::CustomSshJson, |_| {
            Arc::new(ssh::SshJsonExecutor::new())
        });
        registry
    }

    pub fn register<F>(&mut self, kind: CheckKind, factory: F)
    where
        F: Fn(&BatchResources) -> Arc<dyn Executor> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    /// Build an executor instance for `kind` with the batch resources.
    pub fn build(
        &self,
        kind: &CheckKind,
        resources: &BatchResources,
    ) -> Result<Arc<dyn Executor>, RegistryError> {
        match self.factories.get(kind) {
            Some(factory) => Ok(factory(resources)),
            None => Err(RegistryError::UnknownKind(kind.as_str().to_string())),
        }
    }

    pub fn contains(&self, kind: &CheckKind) -> bool {
        self.factories.contains_key(kind)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_default_kinds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_all_builtin_kinds() {
        let registry = ExecutorRegistry::with_default_kinds();
        for kind in [
            CheckKind::Http,
            CheckKind::JsonHttp,
            CheckKind::Dns,
            CheckKind::Tcp,
            CheckKind::Smtp,
            CheckKind::Imap,
            CheckKind::JsonMetrics,
            CheckKind::CustomSshJson,
        ] {
            assert!(registry.contains(&kind), "missing executor for {kind}");
        }
    }

    #[test]
    fn unknown_kind_fails_the_lookup() {
        let registry = ExecutorRegistry::with_default_kinds();
        let resources = BatchResources::empty();
        let err = match registry.build(&CheckKind::Other("carrier-pigeon".into()), &resources) {
            Err(err) => err,
            Ok(_) => panic!("expected an unknown-kind error"),
        };
        assert!(err.to_string().contains("carrier-pigeon"));
    }
}
