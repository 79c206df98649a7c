//! SQLite store implementation.

use chrono::Utc;
use rusqlite::{params, Connection, Result as SqlResult, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::models::*;
use super::{Store, StoreError};

/// Thread-safe SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a file-backed store, creating the schema if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory store (used by tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| StoreError::Migration(format!("schema init failed: {}", e)))?;
        Ok(())
    }
}

fn row_to_check(row: &Row) -> SqlResult<Check> {
    let kind: String = row.get(3)?;
    let data: String = row.get(7)?;
    let status: String = row.get(8)?;
    Ok(Check {
        check_id: row.get(0)?,
        service_id: row.get(1)?,
        name: row.get(2)?,
        kind: CheckKind::parse(&kind),
        target: row.get(4)?,
        interval_seconds: row.get(5)?,
        disabled: row.get(6)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        status: CheckState::parse(&status),
        next_check_time: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn row_to_result(row: &Row) -> SqlResult<CheckResult> {
    let status: String = row.get(2)?;
    let payload: String = row.get(3)?;
    Ok(CheckResult {
        result_id: row.get(0)?,
        check_id: row.get(1)?,
        status: ResultStatus::parse(&status),
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        created_at: row.get(4)?,
    })
}

const CHECK_COLUMNS: &str = "check_id, service_id, name, kind, target, interval_seconds, \
     disabled, data, status, next_check_time, created_at";

const RESULT_COLUMNS: &str = "result_id, check_id, status, payload, created_at";

impl Store for SqliteStore {
    fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Check>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut due = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {CHECK_COLUMNS} FROM health_check
                 WHERE disabled = 0 AND status != 'processing' AND next_check_time <= ?1
                 ORDER BY next_check_time ASC, check_id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![now, limit as i64], row_to_check)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        {
            let mut mark = tx.prepare(
                "UPDATE health_check SET status = 'processing', processing_started_at = ?1
                 WHERE check_id = ?2",
            )?;
            for check in &mut due {
                mark.execute(params![now, check.check_id])?;
                check.status = CheckState::Processing;
            }
        }

        tx.commit()?;
        Ok(due)
    }

    fn add_result(&self, result: &CheckResult) -> Result<CheckResult, StoreError> {
        let conn = self.conn.lock().unwrap();
        let created_at = if result.created_at > 0 {
            result.created_at
        } else {
            Utc::now().timestamp()
        };
        conn.execute(
            "INSERT INTO check_result (check_id, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                result.check_id,
                result.status.as_str(),
                result.payload.to_string(),
                created_at,
            ],
        )?;
        let mut stored = result.clone();
        stored.result_id = conn.last_insert_rowid();
        stored.created_at = created_at;
        Ok(stored)
    }

    fn record_execution(
        &self,
        result: &CheckResult,
        next_check_time: i64,
    ) -> Result<CheckResult, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let created_at = if result.created_at > 0 {
            result.created_at
        } else {
            Utc::now().timestamp()
        };
        tx.execute(
            "INSERT INTO check_result (check_id, status, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                result.check_id,
                result.status.as_str(),
                result.payload.to_string(),
                created_at,
            ],
        )?;
        let result_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE health_check
             SET status = 'idle', next_check_time = ?1, processing_started_at = 0
             WHERE check_id = ?2",
            params![next_check_time, result.check_id],
        )?;

        tx.commit()?;

        let mut stored = result.clone();
        stored.result_id = result_id;
        stored.created_at = created_at;
        Ok(stored)
    }

    fn update_check_after_execution(
        &self,
        check_id: i64,
        next_check_time: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE health_check
             SET status = 'idle', next_check_time = ?1, processing_started_at = 0
             WHERE check_id = ?2",
            params![next_check_time, check_id],
        )?;
        Ok(())
    }

    fn recent_results(&self, check_id: i64, limit: usize) -> Result<Vec<CheckResult>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM check_result
             WHERE check_id = ?1
             ORDER BY created_at DESC, result_id DESC
             LIMIT ?2"
        ))?;
        let results = stmt
            .query_map(params![check_id, limit as i64], row_to_result)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(results)
    }

    fn delete_results_older_than(
        &self,
        cutoff: i64,
        batch_limit: usize,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        // The newest result per check is exempt: the status window needs at
        // least one anchor even past retention.
        let deleted = conn.execute(
            "DELETE FROM check_result WHERE result_id IN (
                 SELECT result_id FROM check_result
                 WHERE created_at < ?1
                   AND result_id NOT IN (
                       SELECT MAX(result_id) FROM check_result GROUP BY check_id
                   )
                 ORDER BY result_id ASC
                 LIMIT ?2
             )",
            params![cutoff, batch_limit as i64],
        )?;
        Ok(deleted)
    }

    fn reset_processing_checks(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let reset = conn.execute(
            "UPDATE health_check
             SET status = 'idle', processing_started_at = 0
             WHERE status = 'processing'",
            [],
        )?;
        Ok(reset)
    }

    fn add_service(&self, service: &mut Service) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO service (name) VALUES (?1)",
            params![service.name],
        )?;
        service.service_id = conn.last_insert_rowid();
        Ok(service.service_id)
    }

    fn get_service(&self, service_id: i64) -> Result<Service, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT service_id, name FROM service WHERE service_id = ?1",
            params![service_id],
            |row| {
                Ok(Service {
                    service_id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })
    }

    fn list_services(&self) -> Result<Vec<Service>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT service_id, name FROM service ORDER BY service_id")?;
        let services = stmt
            .query_map([], |row| {
                Ok(Service {
                    service_id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(services)
    }

    fn delete_service(&self, service_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM check_result WHERE check_id IN
                 (SELECT check_id FROM health_check WHERE service_id = ?1)",
            params![service_id],
        )?;
        tx.execute(
            "DELETE FROM health_check WHERE service_id = ?1",
            params![service_id],
        )?;
        tx.execute(
            "DELETE FROM service WHERE service_id = ?1",
            params![service_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn add_check(&self, check: &mut Check) -> Result<i64, StoreError> {
        if check.interval_seconds <= 0 {
            check.interval_seconds = 300;
        }
        if check.created_at == 0 {
            check.created_at = Utc::now().timestamp();
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO health_check
                 (service_id, name, kind, target, interval_seconds, disabled, data,
                  status, next_check_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                check.service_id,
                check.name,
                check.kind.as_str(),
                check.target,
                check.interval_seconds,
                check.disabled,
                check.data.to_string(),
                check.status.as_str(),
                check.next_check_time,
                check.created_at,
            ],
        )?;
        check.check_id = conn.last_insert_rowid();
        Ok(check.check_id)
    }

    fn get_check(&self, check_id: i64) -> Result<Check, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {CHECK_COLUMNS} FROM health_check WHERE check_id = ?1"),
            params![check_id],
            row_to_check,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })
    }

    fn list_checks(&self) -> Result<Vec<Check>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("SELECT {CHECK_COLUMNS} FROM health_check ORDER BY check_id"))?;
        let checks = stmt
            .query_map([], row_to_check)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    fn list_checks_for_service(&self, service_id: i64) -> Result<Vec<Check>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECK_COLUMNS} FROM health_check WHERE service_id = ?1 ORDER BY check_id"
        ))?;
        let checks = stmt
            .query_map(params![service_id], row_to_check)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    fn update_check(&self, check: &Check) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let interval = if check.interval_seconds <= 0 {
            300
        } else {
            check.interval_seconds
        };
        conn.execute(
            "UPDATE health_check
             SET service_id = ?1, name = ?2, kind = ?3, target = ?4,
                 interval_seconds = ?5, disabled = ?6, data = ?7, next_check_time = ?8
             WHERE check_id = ?9",
            params![
                check.service_id,
                check.name,
                check.kind.as_str(),
                check.target,
                interval,
                check.disabled,
                check.data.to_string(),
                check.next_check_time,
                check.check_id,
            ],
        )?;
        Ok(())
    }

    fn delete_check(&self, check_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM check_result WHERE check_id = ?1",
            params![check_id],
        )?;
        tx.execute(
            "DELETE FROM health_check WHERE check_id = ?1",
            params![check_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::NamedTempFile;

    fn seeded_store() -> (SqliteStore, i64) {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut service = Service {
            service_id: 0,
            name: "edge".to_string(),
        };
        store.add_service(&mut service).unwrap();
        (store, service.service_id)
    }

    fn due_check(store: &SqliteStore, service_id: i64, name: &str) -> Check {
        let mut check = Check {
            service_id,
            name: name.to_string(),
            kind: CheckKind::Http,
            target: format!("http://{name}.example/health"),
            interval_seconds: 60,
            ..Default::default()
        };
        store.add_check(&mut check).unwrap();
        check
    }

    #[test]
    fn check_crud_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteStore::open(tmp.path()).unwrap();
        let mut service = Service {
            service_id: 0,
            name: "mail".to_string(),
        };
        store.add_service(&mut service).unwrap();

        let mut check = Check {
            service_id: service.service_id,
            name: "relay".to_string(),
            kind: CheckKind::Smtp,
            target: "mail.example".to_string(),
            interval_seconds: 900,
            data: json!({"host": "mail.example", "port": 587}),
            ..Default::default()
        };
        let id = store.add_check(&mut check).unwrap();
        assert!(id > 0);

        let fetched = store.get_check(id).unwrap();
        assert_eq!(fetched.name, "relay");
        assert_eq!(fetched.kind, CheckKind::Smtp);
        assert_eq!(fetched.data, check.data);
        assert!(fetched.created_at > 0);

        let mut updated = fetched;
        updated.name = "relay-primary".to_string();
        updated.disabled = true;
        store.update_check(&updated).unwrap();
        let fetched = store.get_check(id).unwrap();
        assert_eq!(fetched.name, "relay-primary");
        assert!(fetched.disabled);

        store.delete_check(id).unwrap();
        assert!(matches!(store.get_check(id), Err(StoreError::NotFound)));
    }

    #[test]
    fn list_due_selects_and_marks_processing() {
        let (store, service_id) = seeded_store();
        let check = due_check(&store, service_id, "a");

        let due = store.list_due(1000, 100).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].check_id, check.check_id);
        assert_eq!(due[0].status, CheckState::Processing);

        // A processing check is never selected a second time.
        assert!(store.list_due(1000, 100).unwrap().is_empty());

        let row = store.get_check(check.check_id).unwrap();
        assert_eq!(row.status, CheckState::Processing);
    }

    #[test]
    fn list_due_skips_disabled_and_future_checks() {
        let (store, service_id) = seeded_store();
        let mut disabled = due_check(&store, service_id, "off");
        disabled.disabled = true;
        store.update_check(&disabled).unwrap();

        let mut future = due_check(&store, service_id, "later");
        future.next_check_time = 5000;
        store.update_check(&future).unwrap();

        assert!(store.list_due(1000, 100).unwrap().is_empty());
        // A due-now row (next_check_time = 0) is picked up on the next poll.
        due_check(&store, service_id, "now");
        assert_eq!(store.list_due(1000, 100).unwrap().len(), 1);
    }

    #[test]
    fn list_due_orders_by_due_time_then_id() {
        let (store, service_id) = seeded_store();
        let mut late = due_check(&store, service_id, "late");
        late.next_check_time = 900;
        store.update_check(&late).unwrap();
        let early = due_check(&store, service_id, "early");

        let due = store.list_due(1000, 100).unwrap();
        assert_eq!(
            due.iter().map(|c| c.check_id).collect::<Vec<_>>(),
            vec![early.check_id, late.check_id]
        );
    }

    #[test]
    fn concurrent_list_due_returns_disjoint_sets() {
        let (store, service_id) = seeded_store();
        for i in 0..20 {
            due_check(&store, service_id, &format!("c{i}"));
        }

        let a = store.clone();
        let b = store.clone();
        let ta = std::thread::spawn(move || a.list_due(1000, 100).unwrap());
        let tb = std::thread::spawn(move || b.list_due(1000, 100).unwrap());
        let set_a: HashSet<i64> = ta.join().unwrap().iter().map(|c| c.check_id).collect();
        let set_b: HashSet<i64> = tb.join().unwrap().iter().map(|c| c.check_id).collect();

        assert!(set_a.is_disjoint(&set_b));
        assert_eq!(set_a.len() + set_b.len(), 20);
    }

    #[test]
    fn record_execution_inserts_and_reschedules_atomically() {
        let (store, service_id) = seeded_store();
        let check = due_check(&store, service_id, "a");
        store.list_due(1000, 100).unwrap();

        let outcome = CheckResult::ok(check.check_id, json!({"status_code": 200}));
        let stored = store.record_execution(&outcome, 1060).unwrap();
        assert!(stored.result_id > 0);

        let recent = store.recent_results(check.check_id, 1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].result_id, stored.result_id);
        assert_eq!(recent[0].payload, json!({"status_code": 200}));

        let row = store.get_check(check.check_id).unwrap();
        assert_eq!(row.status, CheckState::Idle);
        assert_eq!(row.next_check_time, 1060);
    }

    #[test]
    fn recent_results_are_newest_first() {
        let (store, service_id) = seeded_store();
        let check = due_check(&store, service_id, "a");
        for ts in [100, 200, 300] {
            let mut result = CheckResult::ok(check.check_id, json!({}));
            result.created_at = ts;
            store.add_result(&result).unwrap();
        }

        let recent = store.recent_results(check.check_id, 2).unwrap();
        assert_eq!(
            recent.iter().map(|r| r.created_at).collect::<Vec<_>>(),
            vec![300, 200]
        );
    }

    #[test]
    fn cleanup_respects_batch_limit_and_keeps_newest() {
        let (store, service_id) = seeded_store();
        let check = due_check(&store, service_id, "a");
        for ts in 1..=10 {
            let mut result = CheckResult::ok(check.check_id, json!({}));
            result.created_at = ts;
            store.add_result(&result).unwrap();
        }

        // Everything is older than the cutoff, but deletion is batched and
        // the newest row survives.
        let deleted = store.delete_results_older_than(1_000, 4).unwrap();
        assert_eq!(deleted, 4);
        let deleted = store.delete_results_older_than(1_000, 4).unwrap();
        assert_eq!(deleted, 4);
        let deleted = store.delete_results_older_than(1_000, 4).unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.recent_results(check.check_id, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].created_at, 10);
    }

    #[test]
    fn update_after_execution_returns_check_to_idle() {
        let (store, service_id) = seeded_store();
        let check = due_check(&store, service_id, "a");
        store.list_due(1000, 100).unwrap();

        store
            .update_check_after_execution(check.check_id, 2000)
            .unwrap();
        let row = store.get_check(check.check_id).unwrap();
        assert_eq!(row.status, CheckState::Idle);
        assert_eq!(row.next_check_time, 2000);
    }

    #[test]
    fn service_crud_round_trip() {
        let (store, service_id) = seeded_store();
        assert_eq!(store.get_service(service_id).unwrap().name, "edge");
        assert_eq!(store.list_services().unwrap().len(), 1);

        let check = due_check(&store, service_id, "a");
        store
            .add_result(&CheckResult::ok(check.check_id, json!({})))
            .unwrap();
        assert_eq!(store.list_checks_for_service(service_id).unwrap().len(), 1);

        store.delete_service(service_id).unwrap();
        assert!(matches!(
            store.get_service(service_id),
            Err(StoreError::NotFound)
        ));
        assert!(store.list_checks().unwrap().is_empty());
        assert!(store.recent_results(check.check_id, 10).unwrap().is_empty());
    }

    #[test]
    fn reset_processing_checks_reconciles_stale_rows() {
        let (store, service_id) = seeded_store();
        let a = due_check(&store, service_id, "a");
        due_check(&store, service_id, "b");
        store.list_due(1000, 1).unwrap();

        let reset = store.reset_processing_checks().unwrap();
        assert_eq!(reset, 1);
        assert_eq!(store.get_check(a.check_id).unwrap().status, CheckState::Idle);
        // Both checks are selectable again.
        assert_eq!(store.list_due(1000, 100).unwrap().len(), 2);
    }

    #[test]
    fn delete_check_cascades_to_results() {
        let (store, service_id) = seeded_store();
        let check = due_check(&store, service_id, "a");
        store
            .add_result(&CheckResult::ok(check.check_id, json!({})))
            .unwrap();

        store.delete_check(check.check_id).unwrap();
        assert!(store.recent_results(check.check_id, 10).unwrap().is_empty());
    }
}
