//! DNS check executor.
//!
//! Resolves the check target and compares the answer set against a list of
//! expected IPs, optionally through an explicit resolver and with a bound
//! source address (split-horizon validation).

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::Executor;
use crate::db::{Check, CheckResult};

fn default_query_type() -> String {
    "A".to_string()
}

fn default_timeout() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    pub expected_ips: Vec<String>,
    #[serde(default)]
    pub dns_server: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default = "default_query_type")]
    pub query_type: String,
    #[serde(default = "default_timeout")]
    pub timeout: f64,
}

const VALID_QUERY_TYPES: &[&str] = &["A", "AAAA", "MX", "TXT", "CNAME", "NS", "SOA", "PTR"];

impl DnsConfig {
    fn from_data(data: &serde_json::Value) -> Result<Self, String> {
        let config: DnsConfig = serde_json::from_value(data.clone()).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.expected_ips.is_empty() {
            return Err("expected_ips cannot be empty".to_string());
        }
        if !VALID_QUERY_TYPES.contains(&self.query_type.as_str()) {
            return Err(format!(
                "invalid query_type '{}', must be one of {}",
                self.query_type,
                VALID_QUERY_TYPES.join(", ")
            ));
        }
        if self.timeout <= 0.0 {
            return Err("timeout must be positive".to_string());
        }
        if let Some(server) = &self.dns_server {
            server
                .parse::<IpAddr>()
                .map_err(|_| format!("invalid dns_server '{server}', must be an IP address"))?;
        }
        if let Some(source) = &self.source_ip {
            source
                .parse::<IpAddr>()
                .map_err(|_| format!("invalid source_ip '{source}', must be an IP address"))?;
            if self.dns_server.is_none() {
                return Err("source_ip requires an explicit dns_server".to_string());
            }
        }
        Ok(())
    }

    fn record_type(&self) -> RecordType {
        match self.query_type.as_str() {
            "AAAA" => RecordType::AAAA,
            "MX" => RecordType::MX,
            "TXT" => RecordType::TXT,
            "CNAME" => RecordType::CNAME,
            "NS" => RecordType::NS,
            "SOA" => RecordType::SOA,
            "PTR" => RecordType::PTR,
            _ => RecordType::A,
        }
    }
}

/// Executor for DNS checks.
pub struct DnsExecutor;

impl DnsExecutor {
    pub fn new() -> Self {
        Self
    }

    fn build_resolver(config: &DnsConfig) -> Result<TokioAsyncResolver, ResolveError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs_f64(config.timeout);
        opts.attempts = 1;

        match &config.dns_server {
            Some(server) => {
                // Validated above.
                let ip: IpAddr = server
                    .parse()
                    .map_err(|_| ResolveError::from("dns_server is not an IP address"))?;
                let mut ns = NameServerConfig::new(SocketAddr::new(ip, 53), Protocol::Udp);
                if let Some(source) = &config.source_ip {
                    let bind: IpAddr = source
                        .parse()
                        .map_err(|_| ResolveError::from("source_ip is not an IP address"))?;
                    ns.bind_addr = Some(SocketAddr::new(bind, 0));
                }
                let mut resolver_config = ResolverConfig::new();
                resolver_config.add_name_server(ns);
                Ok(TokioAsyncResolver::tokio(resolver_config, opts))
            }
            None => TokioAsyncResolver::tokio_from_system_conf(),
        }
    }

    fn record_to_string(rdata: &RData) -> String {
        match rdata {
            RData::A(a) => a.to_string(),
            RData::AAAA(aaaa) => aaaa.to_string(),
            RData::MX(mx) => mx.exchange().to_string().trim_end_matches('.').to_string(),
            RData::TXT(txt) => txt.to_string(),
            other => other.to_string(),
        }
    }

    fn classify(err: &ResolveError, bound_source: bool) -> (&'static str, String) {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                if *response_code == ResponseCode::NXDomain {
                    ("nxdomain", err.to_string())
                } else {
                    ("no_answer", err.to_string())
                }
            }
            ResolveErrorKind::Timeout => ("timeout", err.to_string()),
            ResolveErrorKind::Io(_) if bound_source => ("source_bind_failed", err.to_string()),
            _ => ("resolution_error", err.to_string()),
        }
    }
}

impl Default for DnsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for DnsExecutor {
    async fn execute(&self, check: &Check) -> CheckResult {
        let config = match DnsConfig::from_data(&check.data) {
            Ok(config) => config,
            Err(msg) => {
                return CheckResult::error(
                    check.check_id,
                    json!({"error_type": "configuration_error", "error_msg": msg}),
                );
            }
        };

        let resolver = match Self::build_resolver(&config) {
            Ok(resolver) => resolver,
            Err(err) => {
                return CheckResult::error(
                    check.check_id,
                    json!({
                        "error_type": "configuration_error",
                        "error_msg": format!("failed to build resolver: {err}"),
                    }),
                );
            }
        };

        let start = Instant::now();
        let lookup = resolver.lookup(check.target.as_str(), config.record_type());
        let outcome = tokio::time::timeout(Duration::from_secs_f64(config.timeout) + Duration::from_secs(1), lookup).await;
        let query_time_ms = start.elapsed().as_millis() as u64;

        let records: Vec<String> = match outcome {
            Ok(Ok(lookup)) => lookup.iter().map(Self::record_to_string).collect(),
            Ok(Err(err)) => {
                let (error_type, error_msg) =
                    Self::classify(&err, config.source_ip.is_some());
                return CheckResult::error(
                    check.check_id,
                    json!({
                        "error_type": error_type,
                        "error_msg": error_msg,
                        "query_time_ms": query_time_ms,
                    }),
                );
            }
            Err(_) => {
                return CheckResult::error(
                    check.check_id,
                    json!({
                        "error_type": "timeout",
                        "error_msg": format!("DNS query timed out for {}", check.target),
                        "query_time_ms": query_time_ms,
                    }),
                );
            }
        };

        let resolved: HashSet<&str> = records.iter().map(String::as_str).collect();
        let expected: HashSet<&str> = config.expected_ips.iter().map(String::as_str).collect();

        let mut payload = json!({
            "resolved_ips": records,
            "query_time_ms": query_time_ms,
            "dns_server": config.dns_server.clone().unwrap_or_else(|| "system".to_string()),
        });
        if let Some(source) = &config.source_ip {
            payload["source_address"] = json!(source);
        }

        if resolved.intersection(&expected).next().is_some() {
            CheckResult::ok(check.check_id, payload)
        } else {
            payload["error_type"] = json!("resolution_mismatch");
            payload["expected"] = json!(config.expected_ips);
            payload["actual"] = payload["resolved_ips"].clone();
            CheckResult::error(check.check_id, payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CheckKind, ResultStatus};

    fn dns_check(data: serde_json::Value) -> Check {
        Check {
            check_id: 4,
            kind: CheckKind::Dns,
            target: "h.local".to_string(),
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_expected_ips_is_configuration_error() {
        let executor = DnsExecutor::new();
        let result = executor
            .execute(&dns_check(json!({"expected_ips": []})))
            .await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[tokio::test]
    async fn missing_expected_ips_is_configuration_error() {
        let executor = DnsExecutor::new();
        let result = executor.execute(&dns_check(json!({}))).await;
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[tokio::test]
    async fn invalid_query_type_is_rejected() {
        let executor = DnsExecutor::new();
        let result = executor
            .execute(&dns_check(
                json!({"expected_ips": ["10.0.0.1"], "query_type": "ANY"}),
            ))
            .await;
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[tokio::test]
    async fn source_ip_requires_dns_server() {
        let executor = DnsExecutor::new();
        let result = executor
            .execute(&dns_check(
                json!({"expected_ips": ["10.0.0.1"], "source_ip": "192.168.1.50"}),
            ))
            .await;
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[tokio::test]
    async fn malformed_server_address_is_rejected() {
        let executor = DnsExecutor::new();
        let result = executor
            .execute(&dns_check(
                json!({"expected_ips": ["10.0.0.1"], "dns_server": "not-an-ip"}),
            ))
            .await;
        assert_eq!(result.payload["error_type"], "configuration_error");
    }

    #[test]
    fn config_defaults() {
        let config =
            DnsConfig::from_data(&json!({"expected_ips": ["192.168.1.94"]})).unwrap();
        assert_eq!(config.query_type, "A");
        assert_eq!(config.timeout, 5.0);
        assert_eq!(config.record_type(), RecordType::A);
    }
}
