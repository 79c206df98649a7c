//! Persistent store for checks, results and services.
//!
//! The `Store` trait is the persistence boundary; `SqliteStore` backs it
//! with an embedded SQLite database (file-backed in production, in-memory
//! in tests). All methods block and are expected to be called from worker
//! threads when crossing in from async code.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStore;

use thiserror::Error;

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("not found")]
    NotFound,
}

/// The persistent boundary. Single-process writer model; implementations
/// must be swappable without touching callers.
pub trait Store: Send + Sync {
    /// Atomically select due checks and flip them to `processing`.
    ///
    /// A check is due when it is not disabled, not already processing, and
    /// `next_check_time <= now`. Selection is ordered by ascending
    /// `next_check_time` then `check_id`, and is atomic with respect to
    /// concurrent callers: two overlapping calls return disjoint sets.
    fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Check>, StoreError>;

    /// Append-only insert. Honors a caller-supplied `created_at` when
    /// nonzero; returns the stored row with its assigned id.
    fn add_result(&self, result: &CheckResult) -> Result<CheckResult, StoreError>;

    /// Insert a result and advance the owning check's schedule in one
    /// transaction: `status = idle`, `next_check_time` set. An observer
    /// never sees the result without the schedule advance.
    fn record_execution(
        &self,
        result: &CheckResult,
        next_check_time: i64,
    ) -> Result<CheckResult, StoreError>;

    /// Return the check to `idle` and set its next due time.
    fn update_check_after_execution(
        &self,
        check_id: i64,
        next_check_time: i64,
    ) -> Result<(), StoreError>;

    /// Newest-first window of results for one check.
    fn recent_results(&self, check_id: i64, limit: usize) -> Result<Vec<CheckResult>, StoreError>;

    /// Delete results older than `cutoff` in one bounded batch, never
    /// removing the newest result of any check. Returns the deleted count;
    /// the cleaner loops until the count falls short of `batch_limit`.
    fn delete_results_older_than(
        &self,
        cutoff: i64,
        batch_limit: usize,
    ) -> Result<usize, StoreError>;

    /// Startup reconciliation: any check still marked `processing` belongs
    /// to a run that died before completing. Returns the reset count.
    fn reset_processing_checks(&self) -> Result<usize, StoreError>;

    // Service and check CRUD for the external dashboard.

    fn add_service(&self, service: &mut Service) -> Result<i64, StoreError>;
    fn get_service(&self, service_id: i64) -> Result<Service, StoreError>;
    fn list_services(&self) -> Result<Vec<Service>, StoreError>;
    fn delete_service(&self, service_id: i64) -> Result<(), StoreError>;

    fn add_check(&self, check: &mut Check) -> Result<i64, StoreError>;
    fn get_check(&self, check_id: i64) -> Result<Check, StoreError>;
    fn list_checks(&self) -> Result<Vec<Check>, StoreError>;
    fn list_checks_for_service(&self, service_id: i64) -> Result<Vec<Check>, StoreError>;
    fn update_check(&self, check: &Check) -> Result<(), StoreError>;
    fn delete_check(&self, check_id: i64) -> Result<(), StoreError>;
}
