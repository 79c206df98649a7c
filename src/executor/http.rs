//! HTTP check executor.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};

use super::{Executor, LazyHttpClient};
use crate::db::{Check, CheckResult};

fn default_timeout() -> f64 {
    10.0
}

fn default_retry_delay() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

impl HttpConfig {
    fn from_data(data: &serde_json::Value) -> Result<Self, String> {
        let config: HttpConfig = match data {
            serde_json::Value::Null => serde_json::from_value(json!({})),
            other => serde_json::from_value(other.clone()),
        }
        .map_err(|e| e.to_string())?;
        if config.timeout <= 0.0 {
            return Err("timeout must be positive".to_string());
        }
        Ok(config)
    }
}

/// Executor for plain HTTP reachability checks.
pub struct HttpExecutor {
    client: LazyHttpClient,
}

impl HttpExecutor {
    pub fn new(shared: Option<reqwest::Client>) -> Self {
        Self {
            client: LazyHttpClient::new(shared),
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, check: &Check) -> CheckResult {
        let config = match HttpConfig::from_data(&check.data) {
            Ok(config) => config,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let client = match self.client.get().await {
            Ok(client) => client,
            Err(err) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "request_error", "error_msg": err.to_string()}),
                );
            }
        };

        let timeout = Duration::from_secs_f64(config.timeout);
        let attempts = config.retries + 1;

        for attempt in 1..=attempts {
            let start = Instant::now();
            let outcome = match client.get(&check.target).timeout(timeout).send().await {
                Ok(response) => {
                    let code = response.status().as_u16();
                    let duration_ms = start.elapsed().as_millis() as u64;
                    if response.status().is_client_error() || response.status().is_server_error() {
                        Attempt::Fatal(CheckResult::error(
                            check.check_id,
                            json!({
                                "error_type": "http_status",
                                "error_msg": format!("HTTP {code} from {}", check.target),
                                "status_code": code,
                                "attempts": attempt,
                            }),
                        ))
                    } else {
                        Attempt::Done(CheckResult::ok(
                            check.check_id,
                            json!({
                                "status_code": code,
                                "duration_ms": duration_ms,
                                "attempts": attempt,
                            }),
                        ))
                    }
                }
                Err(err) => {
                    let error_type = if err.is_timeout() {
                        "timeout"
                    } else {
                        "request_error"
                    };
                    Attempt::Transient(CheckResult::error(
                        check.check_id,
                        json!({
                            "error_type": error_type,
                            "error_msg": err.to_string(),
                            "attempts": attempt,
                        }),
                    ))
                }
            };

            match outcome {
                Attempt::Done(result) | Attempt::Fatal(result) => return result,
                Attempt::Transient(result) => {
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                        continue;
                    }
                    return result;
                }
            }
        }

        // The loop always returns; kept for exhaustiveness.
        CheckResult::error(
            check.check_id,
            json!({"error_type": "request_error", "error_msg": "no attempt executed"}),
        )
    }

    async fn close(&self) {
        self.client.close().await;
    }
}

enum Attempt {
    Done(CheckResult),
    Fatal(CheckResult),
    Transient(CheckResult),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckKind, ResultStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn one_shot_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let body = format!("{status_line}Content-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(body.as_bytes()).await;
            }
        });
        format!("http://{addr}/health")
    }

    fn http_check(target: String, data: serde_json::Value) -> Check {
        Check {
            check_id: 1,
            kind: CheckKind::Http,
            target,
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_response_is_ok() {
        let target = one_shot_server("HTTP/1.1 200 OK\r\n").await;
        let executor = HttpExecutor::new(None);
        let result = executor
            .execute(&http_check(target, serde_json::json!({})))
            .await;
        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.payload["status_code"], 200);
        assert_eq!(result.payload["attempts"], 1);
        executor.close().await;
    }

    #[tokio::test]
    async fn server_error_maps_to_http_status() {
        let target = one_shot_server("HTTP/1.1 500 Internal Server Error\r\n").await;
        let executor = HttpExecutor::new(None);
        let result = executor
            .execute(&http_check(target, serde_json::json!({})))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "http_status");
        assert_eq!(result.payload["status_code"], 500);
        executor.close().await;
    }

    #[tokio::test]
    async fn unreachable_target_is_request_error() {
        // Port from the discard range; nothing listens there.
        let executor = HttpExecutor::new(None);
        let result = executor
            .execute(&http_check(
                "http://127.0.0.1:9/health".to_string(),
                serde_json::json!({"retries": 0, "timeout": 2.0}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "request_error");
        assert_eq!(result.payload["attempts"], 1);
        executor.close().await;
    }

    #[tokio::test]
    async fn invalid_config_is_configuration_error() {
        let executor = HttpExecutor::new(None);
        let result = executor
            .execute(&http_check(
                "http://example.invalid".to_string(),
                serde_json::json!({"timeout": -1}),
            ))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "configuration_error");
        executor.close().await;
    }
}
