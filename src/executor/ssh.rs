//! Custom SSH executor.
//!
//! Runs a command on a remote host over `ssh`, parses its stdout as JSON
//! and evaluates threshold rules against the document, mirroring the JSON
//! metrics executor for hosts that expose no HTTP endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

use super::thresholds::{self, ThresholdRule};
use super::Executor;
use crate::db::{Check, CheckResult};

fn default_ssh_args() -> Vec<String> {
    vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ConnectTimeout=5".to_string(),
    ]
}

fn default_timeout() -> f64 {
    15.0
}

fn default_retry_delay() -> f64 {
    2.0
}

/// The remote command: either a shell line or an argv list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Line(line) => line.is_empty(),
            CommandSpec::Argv(argv) => argv.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshJsonConfig {
    pub command: CommandSpec,
    pub checks: Vec<ThresholdRule>,
    #[serde(default = "default_ssh_args")]
    pub ssh_args: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
}

impl SshJsonConfig {
    fn from_data(data: &Value) -> Result<Self, String> {
        let config: SshJsonConfig =
            serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
        if config.command.is_empty() {
            return Err("command is required".to_string());
        }
        if config.checks.is_empty() {
            return Err("checks must contain at least one entry".to_string());
        }
        if config.timeout <= 0.0 {
            return Err("timeout must be positive".to_string());
        }
        Ok(config)
    }
}

/// Executor for SSH-invoked JSON checks.
pub struct SshJsonExecutor;

impl SshJsonExecutor {
    pub fn new() -> Self {
        Self
    }

    fn build_command(target: &str, config: &SshJsonConfig) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(&config.ssh_args).arg(target).arg("--");
        match &config.command {
            CommandSpec::Line(line) => {
                cmd.arg(line);
            }
            CommandSpec::Argv(argv) => {
                cmd.args(argv);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// The argv that `build_command` produces, exposed for tests.
    fn argv(target: &str, config: &SshJsonConfig) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(config.ssh_args.iter().cloned());
        argv.push(target.to_string());
        argv.push("--".to_string());
        match &config.command {
            CommandSpec::Line(line) => argv.push(line.clone()),
            CommandSpec::Argv(args) => argv.extend(args.iter().cloned()),
        }
        argv
    }
}

impl Default for SshJsonExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for SshJsonExecutor {
    async fn execute(&self, check: &Check) -> CheckResult {
        let config = match SshJsonConfig::from_data(&check.data) {
            Ok(config) => config,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        if check.target.is_empty() {
            return CheckResult::error(
                check.check_id,
                json!({"error_type": "configuration_error", "error_msg": "target is required"}),
            );
        }

        let attempts = config.retries + 1;
        for attempt in 1..=attempts {
            let start = Instant::now();
            let mut cmd = Self::build_command(&check.target, &config);

            let output = match timeout(Duration::from_secs_f64(config.timeout), cmd.output()).await
            {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                        continue;
                    }
                    return CheckResult::error(
                        check.check_id,
                        json!({
                            "error_type": "ssh_error",
                            "error_msg": format!("failed to spawn ssh: {err}"),
                            "attempts": attempt,
                        }),
                    );
                }
                Err(_) => {
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                        continue;
                    }
                    return CheckResult::error(
                        check.check_id,
                        json!({
                            "error_type": "timeout",
                            "error_msg": format!(
                                "ssh command timed out after {}s",
                                config.timeout
                            ),
                            "attempts": attempt,
                        }),
                    );
                }
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let detail = if !stderr.is_empty() { stderr } else { stdout };
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_secs_f64(config.retry_delay)).await;
                    continue;
                }
                return CheckResult::error(
                    check.check_id,
                    json!({
                        "error_type": "ssh_error",
                        "error_msg": detail,
                        "exit_code": output.status.code(),
                        "attempts": attempt,
                    }),
                );
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let payload: Value = match serde_json::from_str(stdout.trim()) {
                Ok(payload) => payload,
                Err(err) => {
                    return CheckResult::error(
                        check.check_id,
                        json!({
                            "error_type": "json_error",
                            "error_msg": err.to_string(),
                            "attempts": attempt,
                        }),
                    );
                }
            };

            let duration_ms = start.elapsed().as_millis() as u64;
            let failures = thresholds::evaluate(&payload, &config.checks);

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

        CheckResult::error(
            check.check_id,
            json!({
                "error_type": "ssh_error",
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

    fn ssh_check(data: Value) -> Check {
        Check {
            check_id: 8,
            kind: CheckKind::CustomSshJson,
            target: "probe@edge-1".to_string(),
            data,
            ..Default::default()
        }
    }

    #[test]
    fn default_ssh_args_use_batch_mode() {
        let config = SshJsonConfig::from_data(&json!({
            "command": "health --json",
            "checks": [{"path": "$.load", "op": "<", "value": 4, "severity": "critical"}],
        }))
        .unwrap();
        assert_eq!(
            SshJsonExecutor::argv("probe@edge-1", &config),
            vec![
                "ssh",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "probe@edge-1",
                "--",
                "health --json",
            ]
        );
    }

    #[test]
    fn argv_commands_stay_split() {
        let config = SshJsonConfig::from_data(&json!({
            "command": ["health", "--json"],
            "checks": [{"path": "$", "op": "!=", "value": null, "severity": "critical"}],
            "ssh_args": ["-p", "2222"],
        }))
        .unwrap();
        let argv = SshJsonExecutor::argv("edge-1", &config);
        assert_eq!(
            argv,
            vec!["ssh", "-p", "2222", "edge-1", "--", "health", "--json"]
        );
    }

    #[tokio::test]
    async fn empty_rule_list_is_configuration_error() {
        let executor = SshJsonExecutor::new();
        let result = executor
            .execute(&ssh_check(json!({"command": "health", "checks": []})))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[tokio::test]
    async fn missing_command_is_configuration_error() {
        let executor = SshJsonExecutor::new();
        let result = executor
            .execute(&ssh_check(json!({
                "checks": [{"path": "$", "op": "==", "value": 1, "severity": "critical"}],
            })))
            .await;
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[tokio::test]
    async fn empty_target_is_configuration_error() {
        let executor = SshJsonExecutor::new();
        let mut check = ssh_check(json!({
            "command": "health",
            "checks": [{"path": "$", "op": "==", "value": 1, "severity": "critical"}],
        }));
        check.target = String::new();
        let result = executor.execute(&check).await;
        assert_eq!(result.payload["error_type"], "configuration_error");
    }
}
