//! TCP check executor with TLS negotiation and certificate expiry checks.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use super::Executor;
use crate::db::{Check, CheckResult};

const MAX_PORT: u16 = 65535;

fn default_tls_mode() -> TlsMode {
    TlsMode::None
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_handshake_timeout() -> f64 {
    10.0
}

fn default_retries() -> u32 {
    1
}

fn default_min_cert_days() -> i64 {
    14
}

fn default_starttls_command() -> String {
    "STARTTLS\r\n".to_string()
}

fn default_verify() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    None,
    Starttls,
    Implicit,
}

impl TlsMode {
    fn as_str(&self) -> &'static str {
        match self {
            TlsMode::None => "none",
            TlsMode::Starttls => "starttls",
            TlsMode::Implicit => "implicit",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_tls_mode")]
    pub tls_mode: TlsMode,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    #[serde(default = "default_handshake_timeout")]
    pub tls_handshake_timeout: f64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay: f64,
    #[serde(default)]
    pub check_cert_expiry: bool,
    #[serde(default = "default_min_cert_days")]
    pub min_cert_days: i64,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default = "default_starttls_command")]
    pub starttls_command: String,
    #[serde(default = "default_verify")]
    pub verify: bool,
}

impl TcpConfig {
    fn from_data(data: &Value) -> Result<Self, String> {
        let config: TcpConfig = serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
        if config.port == 0 || config.port > MAX_PORT {
            return Err("port must be between 1 and 65535".to_string());
        }
        if config.connect_timeout <= 0.0 {
            return Err("connect_timeout must be positive".to_string());
        }
        if config.tls_handshake_timeout <= 0.0 {
            return Err("tls_handshake_timeout must be positive".to_string());
        }
        if config.retry_delay < 0.0 {
            return Err("retry_delay must be zero or positive".to_string());
        }
        if config.min_cert_days < 0 {
            return Err("min_cert_days must be zero or positive".to_string());
        }
        if config.tls_mode == TlsMode::Starttls && config.starttls_command.is_empty() {
            return Err("starttls_command is required for starttls mode".to_string());
        }
        Ok(config)
    }
}

/// Structured failure from a single connection attempt.
struct TcpProbeError {
    error_type: &'static str,
    message: String,
    retryable: bool,
    extra: Value,
}

impl TcpProbeError {
    fn new(error_type: &'static str, message: String, retryable: bool) -> Self {
        Self {
            error_type,
            message,
            retryable,
            extra: Value::Null,
        }
    }
}

/// Executor for TCP checks.
pub struct TcpExecutor;

impl TcpExecutor {
    pub fn new() -> Self {
        Self
    }

    fn resolve_host(config: &TcpConfig, target: &str) -> Option<String> {
        if let Some(host) = &config.host {
            if !host.is_empty() {
                return Some(host.clone());
            }
        }
        if target.is_empty() {
            return None;
        }
        // The target may be stored as a URL; strip scheme, path and port.
        let stripped = target.split("://").last().unwrap_or(target);
        let host = stripped.split('/').next().unwrap_or(stripped);
        let host = host.split(':').next().unwrap_or(host);
        if host.is_empty() {
            None
        } else {
            Some(host.to_string())
        }
    }

    async fn attempt_once(
        host: &str,
        config: &TcpConfig,
    ) -> Result<Value, TcpProbeError> {
        let start = Instant::now();
        let connect = TcpStream::connect((host, config.port));
        let mut stream = match timeout(Duration::from_secs_f64(config.connect_timeout), connect)
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(TcpProbeError::new(
                    "connection_error",
                    format!("connection to {host}:{} failed: {err}", config.port),
                    true,
                ));
            }
            Err(_) => {
                return Err(TcpProbeError::new(
                    "timeout",
                    format!("connection to {host}:{} timed out", config.port),
                    true,
                ));
            }
        };
        let connect_time_ms = start.elapsed().as_millis() as u64;

        let mut payload = json!({
            "host": host,
            "port": config.port,
            "tls_mode": config.tls_mode.as_str(),
            "connect_time_ms": connect_time_ms,
        });

        if config.tls_mode == TlsMode::None {
            return Ok(payload);
        }

        if config.tls_mode == TlsMode::Starttls {
            Self::negotiate_starttls(&mut stream, config).await?;
        }

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!config.verify)
            .danger_accept_invalid_hostnames(!config.verify)
            .build()
            .map_err(|err| {
                TcpProbeError::new(
                    "tls_handshake_error",
                    format!("failed to build TLS connector: {err}"),
                    false,
                )
            })?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let hostname = config.sni.as_deref().unwrap_or(host);
        let handshake_start = Instant::now();
        let tls_stream = match timeout(
            Duration::from_secs_f64(config.tls_handshake_timeout),
            connector.connect(hostname, stream),
        )
        .await
        {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(err)) => {
                return Err(TcpProbeError::new(
                    "tls_handshake_error",
                    format!("TLS handshake failed: {err}"),
                    true,
                ));
            }
            Err(_) => {
                return Err(TcpProbeError::new(
                    "timeout",
                    "TLS handshake timed out".to_string(),
                    true,
                ));
            }
        };
        payload["tls_handshake_ms"] = json!(handshake_start.elapsed().as_millis() as u64);

        if config.check_cert_expiry {
            let days = Self::cert_days_remaining(&tls_stream)?;
            payload["cert_days_remaining"] = json!(days);
            if days < config.min_cert_days {
                payload["severity"] = json!("warning");
                payload["error_type"] = json!("cert_expiry");
                payload["error_msg"] = json!(format!("certificate expires in {days} days"));
            }
        }

        Ok(payload)
    }

    async fn negotiate_starttls(
        stream: &mut TcpStream,
        config: &TcpConfig,
    ) -> Result<(), TcpProbeError> {
        let io_timeout = Duration::from_secs_f64(config.tls_handshake_timeout);

        let exchange = async {
            stream
                .write_all(config.starttls_command.as_bytes())
                .await?;
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await?;
            Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf[..n]).trim().to_string())
        };

        let response = match timeout(io_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(TcpProbeError::new(
                    "connection_error",
                    format!("STARTTLS exchange failed: {err}"),
                    true,
                ));
            }
            Err(_) => {
                return Err(TcpProbeError::new(
                    "timeout",
                    "timed out waiting for STARTTLS response".to_string(),
                    true,
                ));
            }
        };

        if !Self::is_positive_starttls_response(&response) {
            let mut err = TcpProbeError::new(
                "starttls_rejected",
                format!(
                    "STARTTLS rejected: {}",
                    if response.is_empty() {
                        "no response"
                    } else {
                        &response
                    }
                ),
                false,
            );
            err.extra = json!({"starttls_response": response});
            return Err(err);
        }
        Ok(())
    }

    fn is_positive_starttls_response(response: &str) -> bool {
        let normalized = response.to_lowercase();
        let code = normalized.split_whitespace().next().unwrap_or("");
        if code.chars().all(|c| c.is_ascii_digit()) && !code.is_empty() {
            return code.starts_with('2');
        }
        normalized.starts_with('2') || normalized.contains("ok")
    }

    fn cert_days_remaining(
        tls_stream: &tokio_native_tls::TlsStream<TcpStream>,
    ) -> Result<i64, TcpProbeError> {
        let cert = tls_stream
            .get_ref()
            .peer_certificate()
            .map_err(|err| {
                TcpProbeError::new(
                    "tls_handshake_error",
                    format!("failed to read peer certificate: {err}"),
                    false,
                )
            })?
            .ok_or_else(|| {
                TcpProbeError::new(
                    "tls_handshake_error",
                    "TLS certificate not available from peer".to_string(),
                    false,
                )
            })?;

        let der = cert.to_der().map_err(|err| {
            TcpProbeError::new(
                "tls_handshake_error",
                format!("failed to encode peer certificate: {err}"),
                false,
            )
        })?;

        let (_, parsed) = X509Certificate::from_der(&der).map_err(|err| {
            TcpProbeError::new(
                "tls_handshake_error",
                format!("failed to parse peer certificate: {err}"),
                false,
            )
        })?;

        let not_after = parsed.validity().not_after.timestamp();
        Ok((not_after - Utc::now().timestamp()) / 86_400)
    }
}

impl Default for TcpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for TcpExecutor {
    async fn execute(&self, check: &Check) -> CheckResult {
        let config = match TcpConfig::from_data(&check.data) {
            Ok(config) => config,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let Some(host) = Self::resolve_host(&config, &check.target) else {
            return CheckResult::error(
                check.check_id,
                json!({
                    "error_type": "configuration_error",
                    "error_msg": "host is required (set check target or data.host)",
                }),
            );
        };

        let attempts = config.retries + 1;
        for attempt in 1..=attempts {
            match Self::attempt_once(&host, &config).await {
                Ok(mut payload) => {
                    payload["attempt"] = json!(attempt);
                    payload["attempts"] = json!(attempts);
                    return CheckResult::ok(check.check_id, payload);
                }
                Err(err) => {
                    if err.retryable && attempt < attempts {
                        tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                        continue;
                    }
                    let mut payload = json!({
                        "error_type": err.error_type,
                        "error_msg": err.message,
                        "host": host,
                        "port": config.port,
                        "tls_mode": config.tls_mode.as_str(),
                        "attempt": attempt,
                        "attempts": attempts,
                    });
                    if let Value::Object(extra) = err.extra {
                        for (key, value) in extra {
                            payload[key] = value;
                        }
                    }
                    return CheckResult::error(check.check_id, payload);
                }
            }
        }

        CheckResult::error(
            check.check_id,
            json!({"error_type": "connection_error", "error_msg": "no attempt executed"}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckKind, ResultStatus};
    use tokio::net::TcpListener;

    fn tcp_check(target: &str, data: Value) -> Check {
        Check {
            check_id: 9,
            kind: CheckKind::Tcp,
            target: target.to_string(),
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_connect_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let executor = TcpExecutor::new();
        let result = executor
            .execute(&tcp_check("127.0.0.1", json!({"port": port})))
            .await;
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.payload["tls_mode"], "none");
        assert_eq!(result.payload["attempts"], 2);
        assert!(result.payload["connect_time_ms"].is_u64());
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let executor = TcpExecutor::new();
        let result = executor
            .execute(&tcp_check(
                "127.0.0.1",
                json!({"port": 9, "retries": 0, "connect_timeout": 2.0}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "connection_error");
        assert_eq!(result.payload["attempt"], 1);
        assert_eq!(result.payload["attempts"], 1);
    }

    #[tokio::test]
    async fn missing_port_is_configuration_error() {
        let executor = TcpExecutor::new();
        let result = executor.execute(&tcp_check("127.0.0.1", json!({}))).await;
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[test]
    fn host_resolution_strips_url_parts() {
        let config = TcpConfig::from_data(&json!({"port": 443})).unwrap();
        assert_eq!(
            TcpExecutor::resolve_host(&config, "https://example.com/path"),
            Some("example.com".to_string())
        );
        assert_eq!(
            TcpExecutor::resolve_host(&config, "example.com:8443"),
            Some("example.com".to_string())
        );
        assert_eq!(TcpExecutor::resolve_host(&config, ""), None);

        let with_host = TcpConfig::from_data(&json!({"port": 443, "host": "db.internal"})).unwrap();
        assert_eq!(
            TcpExecutor::resolve_host(&with_host, "ignored"),
            Some("db.internal".to_string())
        );
    }

    #[test]
    fn starttls_responses() {
        assert!(TcpExecutor::is_positive_starttls_response("220 2.0.0 Ready to start TLS"));
        assert!(TcpExecutor::is_positive_starttls_response("+OK begin TLS"));
        assert!(!TcpExecutor::is_positive_starttls_response("454 TLS not available"));
        assert!(!TcpExecutor::is_positive_starttls_response(""));
    }

    #[test]
    fn invalid_tls_mode_is_rejected() {
        let err = TcpConfig::from_data(&json!({"port": 443, "tls_mode": "opportunistic"}))
            .unwrap_err();
        assert!(err.contains("tls_mode") || err.contains("unknown variant"));
    }
}
