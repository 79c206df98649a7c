//! Derived status computation.
//!
//! Raw results are binary (ok / error); the user-facing abstraction is a
//! five-valued status computed from the newest window of results per check
//! and aggregated per service.

use crate::db::ResultStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of recent results considered when deriving a check's status.
pub const STATUS_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedStatus {
    Passed,
    Failed,
    Warning,
    Recovering,
    Unknown,
}

impl DerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::Passed => "passed",
            DerivedStatus::Failed => "failed",
            DerivedStatus::Warning => "warning",
            DerivedStatus::Recovering => "recovering",
            DerivedStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DerivedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive a check's status from its newest-first result window.
pub fn check_status(window: &[ResultStatus]) -> DerivedStatus {
    let Some(newest) = window.first() else {
        return DerivedStatus::Unknown;
    };

    if *newest == ResultStatus::Error {
        return DerivedStatus::Failed;
    }

    if window.iter().all(|s| *s == ResultStatus::Ok) {
        return DerivedStatus::Passed;
    }

    if window.iter().skip(1).any(|s| *s == ResultStatus::Error) {
        return DerivedStatus::Recovering;
    }

    DerivedStatus::Warning
}

/// Aggregate the derived statuses of a service's checks.
pub fn service_status(statuses: &[DerivedStatus]) -> DerivedStatus {
    if statuses.is_empty() {
        return DerivedStatus::Unknown;
    }

    if statuses.iter().any(|s| *s == DerivedStatus::Failed) {
        return DerivedStatus::Failed;
    }

    if statuses
        .iter()
        .any(|s| matches!(s, DerivedStatus::Warning | DerivedStatus::Recovering))
    {
        return DerivedStatus::Warning;
    }

    if statuses.iter().all(|s| *s == DerivedStatus::Passed) {
        return DerivedStatus::Passed;
    }

    if statuses.iter().all(|s| *s == DerivedStatus::Unknown) {
        return DerivedStatus::Unknown;
    }

    DerivedStatus::Warning
}
