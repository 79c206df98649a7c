//! vigil - a single-node monitoring agent.
//!
//! Periodically executes configured health checks against external
//! services, persists each outcome, derives per-check status transitions
//! and emits notifications on transitions. The dashboard reads the same
//! store through the `db::Store` contract; only the agent writes.

pub mod bus;
pub mod cleaner;
pub mod config;
pub mod db;
pub mod executor;
pub mod handlers;
pub mod notify;
pub mod runner;
pub mod scheduler;
pub mod status;
