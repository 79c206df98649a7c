//! SMTP check executor.
//!
//! Sends one correlation message through the configured relay. Transient
//! (4xx) responses are retried to ride out greylisting; permanent failures,
//! auth errors and timeouts fail fast. The subject carries a token the IMAP
//! executor can search for on the receiving side.

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::Executor;
use crate::db::{Check, CheckResult};

fn default_port() -> u16 {
    587
}

fn default_tls() -> SmtpTls {
    SmtpTls::Starttls
}

fn default_subject_prefix() -> String {
    "[vigil]".to_string()
}

fn default_timeout() -> f64 {
    30.0
}

fn default_retries() -> u32 {
    2
}

fn default_retry_delay() -> f64 {
    5.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    None,
    Starttls,
    Implicit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tls")]
    pub tls: SmtpTls,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_secret: Option<String>,
    #[serde(default)]
    pub from_addr: String,
    #[serde(default)]
    pub to_addr: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

impl SmtpConfig {
    fn from_data(data: &Value) -> Result<Self, String> {
        let config: SmtpConfig = serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
        if config.host.is_empty() {
            return Err("host is required".to_string());
        }
        if config.port == 0 {
            return Err("port must be positive".to_string());
        }
        if config.from_addr.is_empty() {
            return Err("from_addr is required".to_string());
        }
        if config.to_addr.is_empty() {
            return Err("to_addr is required".to_string());
        }
        if config.subject_prefix.is_empty() {
            return Err("subject_prefix is required".to_string());
        }
        if config.timeout <= 0.0 {
            return Err("timeout must be positive".to_string());
        }
        if config.username.is_some() && config.resolved_password().is_none() {
            return Err("password or password_secret is required when username is set".to_string());
        }
        Ok(config)
    }

    fn resolved_password(&self) -> Option<&str> {
        self.password
            .as_deref()
            .or(self.password_secret.as_deref())
    }
}

/// Compose the probe subject: prefix, UTC timestamp, 6-char hex token.
pub fn build_subject(prefix: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let bytes: [u8; 3] = rand::random();
    let token = format!("{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2]);
    (format!("{prefix} {timestamp} {token}"), token)
}

/// Executor for SMTP round-trip checks.
pub struct SmtpExecutor;

impl SmtpExecutor {
    pub fn new() -> Self {
        Self
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
        let mut builder = match config.tls {
            SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| format!("failed to configure TLS relay: {e}"))?,
            SmtpTls::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .map_err(|e| format!("failed to configure STARTTLS relay: {e}"))?
            }
            SmtpTls::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };

        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs_f64(config.timeout)));

        if let Some(username) = &config.username {
            let password = config.resolved_password().unwrap_or_default();
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.to_string(),
            ));
        }

        Ok(builder.build())
    }

    fn build_message(
        config: &SmtpConfig,
        subject: &str,
        token: &str,
    ) -> Result<Message, String> {
        let from: Mailbox = config
            .from_addr
            .parse()
            .map_err(|e| format!("invalid from_addr '{}': {e}", config.from_addr))?;
        let to: Mailbox = config
            .to_addr
            .parse()
            .map_err(|e| format!("invalid to_addr '{}': {e}", config.to_addr))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(format!(
                "Vigil SMTP health check. Correlation token: {token}. Safe to delete."
            ))
            .map_err(|e| format!("failed to build message: {e}"))
    }

    fn classify(err: &lettre::transport::smtp::Error) -> (&'static str, bool) {
        if err.is_timeout() {
            ("timeout", false)
        } else if err.is_transient() {
            ("temporary_failure", true)
        } else if err.is_permanent() {
            ("smtp_error", false)
        } else {
            ("connection_error", false)
        }
    }
}

impl Default for SmtpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for SmtpExecutor {
    async fn execute(&self, check: &Check) -> CheckResult {
        let config = match SmtpConfig::from_data(&check.data) {
            Ok(config) => config,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let (subject, token) = build_subject(&config.subject_prefix);
        let message = match Self::build_message(&config, &subject, &token) {
            Ok(message) => message,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let transport = match Self::build_transport(&config) {
            Ok(transport) => transport,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let attempts = config.retries + 1;
        for attempt in 1..=attempts {
            match transport.send(message.clone()).await {
                Ok(response) => {
                    return CheckResult::ok(
                        check.check_id,
                        json!({
                            "response_code": response.code().to_string(),
                            "attempts": attempt,
                            "subject": subject,
                            "token": token,
                            "from": config.from_addr,
                            "to": config.to_addr,
                        }),
                    );
                }
                Err(err) => {
                    let (error_type, retryable) = Self::classify(&err);
                    if retryable && attempt < attempts {
                        tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                        continue;
                    }
                    let mut payload = json!({
                        "error_type": error_type,
                        "error_msg": err.to_string(),
                        "attempts": attempt,
                    });
                    if let Some(code) = err.status() {
                        payload["smtp_code"] = json!(code.to_string());
                    }
                    return CheckResult::error(check.check_id, payload);
                }
            }
        }

        CheckResult::error(
            check.check_id,
            json!({
                "error_type": "smtp_error",
                "error_msg": "exhausted retries without producing a result",
                "attempts": attempts,
            }),
        )
    }
}
