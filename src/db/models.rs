//! Database model types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The probe flavor of a check.
///
/// `Other` carries any kind string the store holds but no executor is
/// registered for, so a misconfigured row still loads and surfaces as an
/// `unknown_kind` result instead of a store failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CheckKind {
    Http,
    JsonHttp,
    Dns,
    Tcp,
    Smtp,
    Imap,
    JsonMetrics,
    CustomSshJson,
    Other(String),
}

impl CheckKind {
    pub fn as_str(&self) -> &str {
        match self {
            CheckKind::Http => "http",
            CheckKind::JsonHttp => "json-http",
            CheckKind::Dns => "dns",
            CheckKind::Tcp => "tcp",
            CheckKind::Smtp => "smtp",
            CheckKind::Imap => "imap",
            CheckKind::JsonMetrics => "json-metrics",
            CheckKind::CustomSshJson => "custom-ssh-json",
            CheckKind::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> CheckKind {
        match s {
            "http" => CheckKind::Http,
            "json-http" => CheckKind::JsonHttp,
            "dns" => CheckKind::Dns,
            "tcp" => CheckKind::Tcp,
            "smtp" => CheckKind::Smtp,
            "imap" => CheckKind::Imap,
            "json-metrics" => CheckKind::JsonMetrics,
            "custom-ssh-json" => CheckKind::CustomSshJson,
            other => CheckKind::Other(other.to_string()),
        }
    }

    /// Kinds that probe over HTTP and share the batch-wide client pool.
    pub fn uses_http_pool(&self) -> bool {
        matches!(
            self,
            CheckKind::Http | CheckKind::JsonHttp | CheckKind::JsonMetrics
        )
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for CheckKind {
    fn from(s: String) -> Self {
        CheckKind::parse(&s)
    }
}

impl From<CheckKind> for String {
    fn from(kind: CheckKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Scheduling state of a check row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Idle,
    Due,
    Processing,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Idle => "idle",
            CheckState::Due => "due",
            CheckState::Processing => "processing",
        }
    }

    pub fn parse(s: &str) -> CheckState {
        match s {
            "processing" => CheckState::Processing,
            "due" => CheckState::Due,
            _ => CheckState::Idle,
        }
    }
}

/// A health check definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub check_id: i64,
    pub service_id: i64,
    pub name: String,
    pub kind: CheckKind,
    /// Kind-specific probe target, typically a URL or host.
    pub target: String,
    pub interval_seconds: i64,
    pub disabled: bool,
    /// Kind-specific configuration; the executor for `kind` owns the schema.
    pub data: Value,
    pub status: CheckState,
    /// Unix timestamp of the next due time; 0 means due now.
    pub next_check_time: i64,
    pub created_at: i64,
}

impl Default for Check {
    fn default() -> Self {
        Self {
            check_id: 0,
            service_id: 0,
            name: String::new(),
            kind: CheckKind::Http,
            target: String::new(),
            interval_seconds: 300,
            disabled: false,
            data: Value::Object(Default::default()),
            status: CheckState::Idle,
            next_check_time: 0,
            created_at: 0,
        }
    }
}

/// Raw outcome status of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Ok => "ok",
            ResultStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> ResultStatus {
        if s == "ok" {
            ResultStatus::Ok
        } else {
            ResultStatus::Error
        }
    }
}

/// An immutable record of one check execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub result_id: i64,
    pub check_id: i64,
    pub status: ResultStatus,
    /// Executor-defined structured data (resolved IPs, error_type, attempts, ...).
    pub payload: Value,
    pub created_at: i64,
}

impl CheckResult {
    pub fn ok(check_id: i64, payload: Value) -> Self {
        Self {
            result_id: 0,
            check_id,
            status: ResultStatus::Ok,
            payload,
            created_at: 0,
        }
    }

    pub fn error(check_id: i64, payload: Value) -> Self {
        Self {
            result_id: 0,
            check_id,
            status: ResultStatus::Error,
            payload,
            created_at: 0,
        }
    }
}

/// A logical grouping of checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub service_id: i64,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_strings() {
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
            assert_eq!(CheckKind::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn unregistered_kind_is_preserved() {
        let kind = CheckKind::parse("carrier-pigeon");
        assert_eq!(kind, CheckKind::Other("carrier-pigeon".to_string()));
        assert_eq!(kind.as_str(), "carrier-pigeon");
    }

    #[test]
    fn http_flavored_kinds_share_the_pool() {
        assert!(CheckKind::Http.uses_http_pool());
        assert!(CheckKind::JsonHttp.uses_http_pool());
        assert!(CheckKind::JsonMetrics.uses_http_pool());
        assert!(!CheckKind::Tcp.uses_http_pool());
        assert!(!CheckKind::CustomSshJson.uses_http_pool());
    }
}
