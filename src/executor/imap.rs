//! IMAP check executor.
//!
//! Logs into a mailbox and searches for a recent message by subject,
//! typically the correlation message sent by an SMTP check. The protocol
//! session is blocking and runs on the worker-thread pool; the async side
//! only ever waits on the join handle.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tokio::task;
use tokio::time::timeout;

use super::Executor;
use crate::db::{Check, CheckResult};

fn default_folder() -> String {
    "INBOX".to_string()
}

fn default_port() -> u16 {
    993
}

fn default_tls_mode() -> ImapTls {
    ImapTls::Implicit
}

fn default_max_age_minutes() -> i64 {
    30
}

fn default_delete_after_check() -> bool {
    true
}

fn default_timeout() -> f64 {
    30.0
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay() -> f64 {
    10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImapTls {
    None,
    Starttls,
    Implicit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapConfig {
    #[serde(default)]
    pub host: Option<String>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_secret: Option<String>,
    pub search_subject: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tls_mode")]
    pub tls_mode: ImapTls,
    #[serde(default = "default_max_age_minutes")]
    pub max_age_minutes: i64,
    #[serde(default = "default_delete_after_check")]
    pub delete_after_check: bool,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

impl ImapConfig {
    fn from_data(data: &Value) -> Result<Self, String> {
        let config: ImapConfig = serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
        if config.username.is_empty() {
            return Err("username is required".to_string());
        }
        if config.resolved_password().is_none() {
            return Err("password or password_secret is required".to_string());
        }
        if config.search_subject.is_empty() {
            return Err("search_subject is required".to_string());
        }
        if config.max_age_minutes <= 0 {
            return Err("max_age_minutes must be positive".to_string());
        }
        if config.timeout <= 0.0 {
            return Err("timeout must be positive".to_string());
        }
        Ok(config)
    }

    fn resolved_password(&self) -> Option<&str> {
        self.password
            .as_deref()
            .or(self.password_secret.as_deref())
            .filter(|p| !p.is_empty())
    }
}

/// Quote a subject for the IMAP SEARCH grammar: wrap in DQUOTE and escape
/// backslashes and embedded quotes.
pub fn quote_search_literal(subject: &str) -> String {
    let escaped = subject.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

struct MailboxFindings {
    matched_uids: Vec<String>,
    latest_internaldate: Option<String>,
}

struct ImapProbeError {
    error_type: &'static str,
    message: String,
    transient: bool,
}

impl ImapProbeError {
    fn new(error_type: &'static str, message: String, transient: bool) -> Self {
        Self {
            error_type,
            message,
            transient,
        }
    }
}

fn classify(err: imap::error::Error) -> ImapProbeError {
    match err {
        imap::error::Error::Io(io) => {
            ImapProbeError::new("connection_error", io.to_string(), true)
        }
        imap::error::Error::ConnectionLost => {
            ImapProbeError::new("connection_error", "connection lost".to_string(), true)
        }
        imap::error::Error::No(msg) => {
            ImapProbeError::new("execution_error", format!("server said NO: {msg}"), false)
        }
        imap::error::Error::Bad(msg) => {
            ImapProbeError::new("execution_error", format!("server said BAD: {msg}"), false)
        }
        other => ImapProbeError::new("execution_error", other.to_string(), false),
    }
}

fn run_session(host: &str, config: &ImapConfig) -> Result<MailboxFindings, ImapProbeError> {
    let tls = native_tls::TlsConnector::builder().build().map_err(|e| {
        ImapProbeError::new(
            "tls_handshake_error",
            format!("failed to build TLS connector: {e}"),
            false,
        )
    })?;
    let username = config.username.as_str();
    let password = config.resolved_password().unwrap_or_default();

    match config.tls_mode {
        ImapTls::Implicit => {
            let client = imap::connect((host, config.port), host, &tls).map_err(classify)?;
            let mut session = client.login(username, password).map_err(|(e, _)| classify(e))?;
            let findings = inspect_mailbox(&mut session, config);
            let _ = session.logout();
            findings
        }
        ImapTls::Starttls => {
            let client =
                imap::connect_starttls((host, config.port), host, &tls).map_err(classify)?;
            let mut session = client.login(username, password).map_err(|(e, _)| classify(e))?;
            let findings = inspect_mailbox(&mut session, config);
            let _ = session.logout();
            findings
        }
        ImapTls::None => {
            let stream = TcpStream::connect((host, config.port)).map_err(|e| {
                ImapProbeError::new("connection_error", e.to_string(), true)
            })?;
            stream
                .set_read_timeout(Some(Duration::from_secs_f64(config.timeout)))
                .ok();
            let mut client = imap::Client::new(stream);
            client.read_greeting().map_err(classify)?;
            let mut session = client.login(username, password).map_err(|(e, _)| classify(e))?;
            let findings = inspect_mailbox(&mut session, config);
            let _ = session.logout();
            findings
        }
    }
}

fn inspect_mailbox<T: Read + Write>(
    session: &mut imap::Session<T>,
    config: &ImapConfig,
) -> Result<MailboxFindings, ImapProbeError> {
    session.select(&config.folder).map_err(classify)?;

    let query = format!(
        "NOT DELETED HEADER SUBJECT {}",
        quote_search_literal(&config.search_subject)
    );
    let ids = session.search(&query).map_err(classify)?;
    if ids.is_empty() {
        return Ok(MailboxFindings {
            matched_uids: Vec::new(),
            latest_internaldate: None,
        });
    }

    let mut sorted: Vec<u32> = ids.into_iter().collect();
    sorted.sort_unstable();
    let sequence = sorted
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let fetches = session.fetch(&sequence, "(INTERNALDATE)").map_err(classify)?;
    let cutoff = Utc::now() - ChronoDuration::minutes(config.max_age_minutes);

    let mut matched: Vec<(u32, DateTime<Utc>)> = fetches
        .iter()
        .filter_map(|fetch| {
            fetch
                .internal_date()
                .map(|date| (fetch.message, date.with_timezone(&Utc)))
        })
        .filter(|(_, date)| *date >= cutoff)
        .collect();
    matched.sort_by_key(|(_, date)| *date);

    if matched.is_empty() {
        return Ok(MailboxFindings {
            matched_uids: Vec::new(),
            latest_internaldate: None,
        });
    }

    if config.delete_after_check {
        let delete_sequence = matched
            .iter()
            .map(|(id, _)| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        session
            .store(&delete_sequence, "+FLAGS (\\Deleted)")
            .map_err(classify)?;
        session.expunge().map_err(classify)?;
    }

    let latest = matched.last().map(|(_, date)| date.to_rfc3339());
    Ok(MailboxFindings {
        matched_uids: matched.iter().map(|(id, _)| id.to_string()).collect(),
        latest_internaldate: latest,
    })
}

/// Executor for IMAP mailbox checks.
pub struct ImapExecutor;

impl ImapExecutor {
    pub fn new() -> Self {
        Self
    }

    fn normalize_host(host: &str) -> String {
        let stripped = host.split("://").last().unwrap_or(host);
        stripped
            .split('/')
            .next()
            .unwrap_or(stripped)
            .to_string()
    }
}

impl Default for ImapExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ImapExecutor {
    async fn execute(&self, check: &Check) -> CheckResult {
        let config = match ImapConfig::from_data(&check.data) {
            Ok(config) => config,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let raw_host = config
            .host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| check.target.clone());
        if raw_host.is_empty() {
            return CheckResult::error(
                check.check_id,
                json!({
                    "error_type": "configuration_error",
                    "error_msg": "host is required (set check target or data.host)",
                }),
            );
        }
        let host = Self::normalize_host(&raw_host);

        let attempts = config.retries + 1;
        for attempt in 1..=attempts {
            let session_config = config.clone();
            let session_host = host.clone();
            let handle =
                task::spawn_blocking(move || run_session(&session_host, &session_config));

            // The blocking session enforces its own socket timeouts; the
            // outer deadline just bounds how long this task waits.
            let deadline = Duration::from_secs_f64(config.timeout) + Duration::from_secs(5);
            let outcome = match timeout(deadline, handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join_err)) => Err(ImapProbeError::new(
                    "execution_error",
                    format!("session task failed: {join_err}"),
                    false,
                )),
                Err(_) => Err(ImapProbeError::new(
                    "timeout",
                    format!("IMAP session to {host} timed out"),
                    false,
                )),
            };

            match outcome {
                Ok(findings) => {
                    if findings.matched_uids.is_empty() {
                        return CheckResult::error(
                            check.check_id,
                            json!({
                                "error_type": "no_recent_message",
                                "error_msg": format!(
                                    "no messages with subject '{}' within {} minutes",
                                    config.search_subject, config.max_age_minutes
                                ),
                                "attempts": attempt,
                            }),
                        );
                    }
                    return CheckResult::ok(
                        check.check_id,
                        json!({
                            "matched_uids": findings.matched_uids,
                            "latest_internaldate": findings.latest_internaldate,
                            "attempts": attempt,
                        }),
                    );
                }
                Err(err) => {
                    if err.transient && attempt < attempts {
                        tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                        continue;
                    }
                    return CheckResult::error(
                        check.check_id,
                        json!({
                            "error_type": err.error_type,
                            "error_msg": err.message,
                            "attempts": attempt,
                        }),
                    );
                }
            }
        }

        CheckResult::error(
            check.check_id,
            json!({
                "error_type": "execution_error",
                "error_msg": "exhausted retries without producing a result",
                "attempts": attempts,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckKind, ResultStatus};

    fn imap_check(data: Value) -> Check {
        Check {
            check_id: 6,
            kind: CheckKind::Imap,
            target: "imap.example".to_string(),
            data,
            ..Default::default()
        }
    }

    #[test]
    fn search_subjects_are_quoted() {
        assert_eq!(quote_search_literal("hello"), r#""hello""#);
        assert_eq!(
            quote_search_literal(r#"probe "alpha""#),
            r#""probe \"alpha\"""#
        );
        assert_eq!(quote_search_literal(r"a\b"), r#""a\\b""#);
    }

    #[test]
    fn config_requires_credentials_and_subject() {
        let err = ImapConfig::from_data(&json!({"username": "probe"})).unwrap_err();
        assert!(err.contains("search_subject") || err.contains("missing field"));

        let err = ImapConfig::from_data(&json!({
            "username": "probe",
            "search_subject": "[vigil]",
        }))
        .unwrap_err();
        assert!(err.contains("password"));
    }

    #[test]
    fn config_defaults() {
        let config = ImapConfig::from_data(&json!({
            "username": "probe",
            "password": "pw",
            "search_subject": "[vigil]",
        }))
        .unwrap();
        assert_eq!(config.folder, "INBOX");
        assert_eq!(config.port, 993);
        assert_eq!(config.tls_mode, ImapTls::Implicit);
        assert_eq!(config.max_age_minutes, 30);
        assert!(config.delete_after_check);
    }

    #[test]
    fn host_normalization() {
        assert_eq!(
            ImapExecutor::normalize_host("imaps://mail.example/inbox"),
            "mail.example"
        );
        assert_eq!(ImapExecutor::normalize_host("mail.example"), "mail.example");
    }

    #[tokio::test]
    async fn invalid_config_is_configuration_error() {
        let executor = ImapExecutor::new();
        let result = executor
            .execute(&imap_check(json!({"username": "", "password": "pw"})))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "configuration_error");
    }
}
