//! JSON metrics executor.
//!
//! Fetches a JSON document over HTTP (optionally with basic auth) and
//! evaluates threshold rules against it. Registered for both the
//! `json-metrics` kind (rules required) and the `json-http` kind (rules
//! optional, making it a plain JSON reachability probe).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::thresholds::{self, ThresholdRule};
use super::{Executor, LazyHttpClient};
use crate::db::{Check, CheckResult};

fn default_timeout() -> f64 {
    10.0
}

fn default_retries() -> u32 {
    1
}

fn default_retry_delay() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonMetricsConfig {
    /// Overrides the check target when set.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub checks: Vec<ThresholdRule>,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub auth: Option<BasicAuth>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

impl JsonMetricsConfig {
    fn from_data(data: &Value, require_rules: bool) -> Result<Self, String> {
        let config: JsonMetricsConfig = match data {
            Value::Null => serde_json::from_value(json!({})),
            other => serde_json::from_value(other.clone()),
        }
        .map_err(|e| e.to_string())?;

        if require_rules && config.checks.is_empty() {
            return Err("checks must contain at least one entry".to_string());
        }
        if config.timeout <= 0.0 {
            return Err("timeout must be positive".to_string());
        }
        Ok(config)
    }
}

/// Executor for threshold-evaluated JSON endpoints.
pub struct JsonMetricsExecutor {
    client: LazyHttpClient,
    require_rules: bool,
}

impl JsonMetricsExecutor {
    /// Rules are mandatory; an empty list is a configuration error.
    pub fn strict(shared: Option<reqwest::Client>) -> Self {
        Self {
            client: LazyHttpClient::new(shared),
            require_rules: true,
        }
    }

    /// Rules are optional; without them the probe just requires parseable
    /// JSON from a non-error response.
    pub fn reachability(shared: Option<reqwest::Client>) -> Self {
        Self {
            client: LazyHttpClient::new(shared),
            require_rules: false,
        }
    }

    fn error(check_id: i64, error_type: &str, msg: String, attempt: u32) -> CheckResult {
        CheckResult::error(
            check_id,
            json!({"error_type": error_type, "error_msg": msg, "attempts": attempt}),
        )
    }
}

#[async_trait]
impl Executor for JsonMetricsExecutor {
    async fn execute(&self, check: &Check) -> CheckResult {
        let config = match JsonMetricsConfig::from_data(&check.data, self.require_rules) {
            Ok(config) => config,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let url = config
            .url
            .clone()
            .unwrap_or_else(|| check.target.clone());
        if url.is_empty() {
            return CheckResult::error(
                check.check_id,
                json!({"error_type": "configuration_error", "error_msg": "url is required"}),
            );
        }

        let client = match self.client.get().await {
            Ok(client) => client,
            Err(err) => {
                return Self::error(check.check_id, "request_error", err.to_string(), 1);
            }
        };

        let timeout = Duration::from_secs_f64(config.timeout);
        let attempts = config.retries + 1;

        for attempt in 1..=attempts {
            let start = Instant::now();
            let mut request = client.get(&url).timeout(timeout);
            if let Some(auth) = &config.auth {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    let error_type = if err.is_timeout() {
                        "timeout"
                    } else {
                        "request_error"
                    };
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                        continue;
                    }
                    return Self::error(check.check_id, error_type, err.to_string(), attempt);
                }
            };

            let code = response.status().as_u16();
            if code >= 400 {
                // Only server-side errors are worth retrying.
                if code >= 500 && attempt < attempts {
                    tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                    continue;
                }
                return Self::error(
                    check.check_id,
                    "http_error",
                    format!("HTTP {code} from {url}"),
                    attempt,
                );
            }

            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(err) => {
                    return Self::error(check.check_id, "json_error", err.to_string(), attempt);
                }
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            let failures = thresholds::evaluate(&body, &config.checks);

            if thresholds::has_critical(&failures) {
                return CheckResult::error(
                    check.check_id,
                    json!({
                        "error_type": "threshold_failed",
                        "failures": failures,
                        "duration_ms": duration_ms,
                        "attempts": attempt,
                    }),
                );
            }

            // Warning-only failures do not flip the result status; they are
            // carried as a severity marker for the dashboard.
            if !failures.is_empty() {
                return CheckResult::ok(
                    check.check_id,
                    json!({
                        "severity": "warning",
                        "failures": failures,
                        "duration_ms": duration_ms,
                        "attempts": attempt,
                    }),
                );
            }

            return CheckResult::ok(
                check.check_id,
                json!({"duration_ms": duration_ms, "attempts": attempt}),
            );
        }

        Self::error(
            check.check_id,
            "request_error",
            "metrics check produced no attempt".to_string(),
            attempts,
        )
    }

    async fn close(&self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckKind, ResultStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn json_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}/metrics")
    }

    fn metrics_check(target: String, data: Value) -> Check {
        Check {
            check_id: 7,
            kind: CheckKind::JsonMetrics,
            target,
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn passing_thresholds_are_ok() {
        let target = json_server(r#"{"load": 0.5, "disk": {"used_pct": 40}}"#).await;
        let executor = JsonMetricsExecutor::strict(None);
        let result = executor
            .execute(&metrics_check(
                target,
                json!({"checks": [
                    {"path": "$.load", "op": "<", "value": 2.0, "severity": "critical"},
                    {"path": "$.disk.used_pct", "op": "<=", "value": 90, "severity": "warning"},
                ]}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Ok);
        assert!(result.payload.get("severity").is_none());
        executor.close().await;
    }

    #[tokio::test]
    async fn critical_failure_is_threshold_failed() {
        let target = json_server(r#"{"load": 9.0}"#).await;
        let executor = JsonMetricsExecutor::strict(None);
        let result = executor
            .execute(&metrics_check(
                target,
                json!({"checks": [
                    {"path": "$.load", "op": "<", "value": 2.0, "severity": "critical"},
                ]}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "threshold_failed");
        assert_eq!(result.payload["failures"].as_array().unwrap().len(), 1);
        executor.close().await;
    }

    #[tokio::test]
    async fn warning_only_failure_stays_ok() {
        let target = json_server(r#"{"disk": {"used_pct": 95}}"#).await;
        let executor = JsonMetricsExecutor::strict(None);
        let result = executor
            .execute(&metrics_check(
                target,
                json!({"checks": [
                    {"path": "$.disk.used_pct", "op": "<", "value": 90, "severity": "warning"},
                ]}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.payload["severity"], "warning");
        assert_eq!(result.payload["failures"].as_array().unwrap().len(), 1);
        executor.close().await;
    }

    #[tokio::test]
    async fn empty_rules_are_rejected_for_metrics_kind() {
        let executor = JsonMetricsExecutor::strict(None);
        let result = executor
            .execute(&metrics_check(
                "http://127.0.0.1:9/metrics".to_string(),
                json!({"checks": []}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "configuration_error");
        executor.close().await;
    }

    #[tokio::test]
    async fn empty_rules_are_allowed_for_json_http_kind() {
        let target = json_server(r#"{"status": "up"}"#).await;
        let executor = JsonMetricsExecutor::reachability(None);
        let result = executor.execute(&metrics_check(target, json!({}))).await;
        assert_eq!(result.status, ResultStatus::Ok);
        executor.close().await;
    }

    #[tokio::test]
    async fn non_json_body_is_json_error() {
        let target = json_server("not json at all").await;
        let executor = JsonMetricsExecutor::reachability(None);
        let result = executor.execute(&metrics_check(target, json!({}))).await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "json_error");
        executor.close().await;
    }

    #[tokio::test]
    async fn invalid_operator_is_configuration_error() {
        let executor = JsonMetricsExecutor::strict(None);
        let result = executor
            .execute(&metrics_check(
                "http://127.0.0.1:9/metrics".to_string(),
                json!({"checks": [
                    {"path": "$.load", "op": "~=", "value": 1, "severity": "critical"},
                ]}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "configuration_error");
        executor.close().await;
    }
}
