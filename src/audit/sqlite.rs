//! SQLite-backed audit store.
//!
//! One row per record. UPDATE and DELETE are refused by triggers, and every
//! insert is committed with `synchronous = FULL` before it is acknowledged.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::DateTime;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row};

use super::{corrupt, AuditEntry, AuditFilter, AuditRecord, AuditStore, Disposition};
use crate::error::{Error, Result};
use crate::protocol::MessageType;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS audit_records (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id TEXT NOT NULL UNIQUE,
        recorded_at INTEGER NOT NULL,
        message_id TEXT,
        session_id TEXT,
        sender_instance TEXT,
        message_type TEXT,
        disposition TEXT NOT NULL,
        reason TEXT,
        gates TEXT NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audit_message ON audit_records(message_id, sequence);
    CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_records(session_id, sequence);
    CREATE TRIGGER IF NOT EXISTS audit_records_no_update
        BEFORE UPDATE ON audit_records
        BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS audit_records_no_delete
        BEFORE DELETE ON audit_records
        BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
"#;

const COLUMNS: &str = "sequence, entry_id, recorded_at, message_id, session_id, sender_instance, \
                       message_type, disposition, reason, gates, payload";

pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Audit(format!("sqlite open {}: {}", path.display(), e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| Error::Audit(format!("sqlite journal mode: {}", e)))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| Error::Audit(format!("sqlite synchronous: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Audit(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let conn = self.lock();
        let mut record = AuditRecord::new(0, entry);
        let gates = serde_json::to_string(&record.entry.gates)?;
        let payload = serde_json::to_string(&record.entry.payload)?;

        conn.execute(
            "INSERT INTO audit_records (entry_id, recorded_at, message_id, session_id, sender_instance, \
             message_type, disposition, reason, gates, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.entry_id,
                record.recorded_at.timestamp_millis(),
                record.entry.message_id,
                record.entry.session_id,
                record.entry.sender_instance,
                record.entry.message_type.map(|t| t.as_str()),
                record.entry.disposition.as_str(),
                record.entry.reason,
                gates,
                payload,
            ],
        )
        .map_err(|e| Error::Audit(format!("sqlite insert: {}", e)))?;

        record.sequence = conn.last_insert_rowid() as u64;
        Ok(record)
    }

    fn head(&self) -> Result<u64> {
        let conn = self.lock();
        let head: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM audit_records",
            [],
            |row| row.get(0),
        )?;
        Ok(head as u64)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn page(
        &self,
        filter: &AuditFilter,
        after: u64,
        upto: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        let mut sql = format!(
            "SELECT {} FROM audit_records WHERE sequence > ?1 AND sequence <= ?2",
            COLUMNS
        );
        let mut values = vec![Value::Integer(after as i64), Value::Integer(upto as i64)];

        let mut clause = |column: &str, op: &str, value: Value| {
            values.push(value);
            sql.push_str(&format!(" AND {} {} ?{}", column, op, values.len()));
        };
        if let Some(session_id) = &filter.session_id {
            clause("session_id", "=", Value::Text(session_id.clone()));
        }
        if let Some(message_id) = &filter.message_id {
            clause("message_id", "=", Value::Text(message_id.clone()));
        }
        if let Some(disposition) = filter.disposition {
            clause("disposition", "=", Value::Text(disposition.as_str().to_string()));
        }
        if let Some(since) = filter.since {
            clause("recorded_at", ">=", Value::Integer(since.timestamp_millis()));
        }
        if let Some(until) = filter.until {
            clause("recorded_at", "<", Value::Integer(until.timestamp_millis()));
        }
        sql.push_str(&format!(" ORDER BY sequence ASC LIMIT {}", limit));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_record)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn records_for(&self, message_id: &str) -> Result<Vec<AuditRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audit_records WHERE message_id = ?1 ORDER BY sequence ASC",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![message_id], row_to_record)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let sequence: i64 = row.get(0)?;
    let recorded_at: i64 = row.get(2)?;
    let message_type: Option<String> = row.get(6)?;
    let disposition: String = row.get(7)?;
    let gates: String = row.get(9)?;
    let payload: String = row.get(10)?;

    Ok(AuditRecord {
        sequence: sequence as u64,
        entry_id: row.get(1)?,
        recorded_at: DateTime::from_timestamp_millis(recorded_at)
            .ok_or_else(|| conversion(2, corrupt("recorded_at", recorded_at)))?,
        entry: AuditEntry {
            message_id: row.get(3)?,
            session_id: row.get(4)?,
            sender_instance: row.get(5)?,
            message_type: message_type
                .map(|t| {
                    t.parse::<MessageType>()
                        .map_err(|e| conversion(6, corrupt("message_type", e)))
                })
                .transpose()?,
            disposition: disposition
                .parse::<Disposition>()
                .map_err(|e| conversion(7, corrupt("disposition", e)))?,
            reason: row.get(8)?,
            gates: serde_json::from_str(&gates).map_err(|e| conversion(9, e))?,
            payload: serde_json::from_str(&payload).map_err(|e| conversion(10, e))?,
        },
    })
}

fn conversion<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, GateResults};
    use crate::protocol::{AgentIdentity, EnvelopeBuilder, Recipient};
    use std::sync::Arc;

    fn entry(id: &str, session: &str, disposition: Disposition) -> AuditEntry {
        let envelope = EnvelopeBuilder::from(AgentIdentity::new("claude", "claude-1", session))
            .to(Recipient::instance("gpt-4", "gpt4-1", session))
            .message_type(MessageType::Proposal)
            .text("I handle backend, you handle frontend. Agree?")
            .message_id(id)
            .build()
            .unwrap();
        AuditEntry::for_envelope(&envelope, disposition)
    }

    #[test]
    fn test_insert_and_read_back() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        let gates = GateResults {
            recipients: vec!["gpt4-1".to_string()],
            ..Default::default()
        };
        let inserted = store
            .insert(entry("m1", "s1", Disposition::Delivered).with_gates(gates))
            .unwrap();
        assert_eq!(inserted.sequence, 1);

        let read = store.records_for("m1").unwrap();
        assert_eq!(read, vec![inserted]);
        assert_eq!(store.head().unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_page_filters() {
        let store = SqliteAuditStore::open_in_memory().unwrap();
        store.insert(entry("a", "s1", Disposition::Delivered)).unwrap();
        store.insert(entry("b", "s2", Disposition::PendingApproval)).unwrap();
        store.insert(entry("c", "s1", Disposition::RejectedSafety)).unwrap();
        store.insert(entry("d", "s1", Disposition::Delivered)).unwrap();

        let s1 = store.page(&AuditFilter::session("s1"), 0, 4, 10).unwrap();
        assert_eq!(
            s1.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![1, 3, 4]
        );

        let limited = store.page(&AuditFilter::session("s1"), 1, 4, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].sequence, 3);

        let pinned = store.page(&AuditFilter::default(), 0, 2, 10).unwrap();
        assert_eq!(pinned.len(), 2);

        let delivered = store
            .page(&AuditFilter::disposition(Disposition::Delivered), 0, 4, 10)
            .unwrap();
        assert_eq!(delivered.len(), 2);
    }

    #[test]
    fn test_append_only_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let store = SqliteAuditStore::open(&path).unwrap();
        store.insert(entry("m1", "s1", Disposition::Delivered)).unwrap();

        let conn = Connection::open(&path).unwrap();
        assert!(conn
            .execute("UPDATE audit_records SET disposition = 'rejected_safety'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM audit_records", []).is_err());
    }

    #[test]
    fn test_durable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.db");
        {
            let log = AuditLog::open(&path).unwrap();
            log.append(entry("m1", "s1", Disposition::PendingApproval)).unwrap();
        }

        let log = AuditLog::new(Arc::new(SqliteAuditStore::open(&path).unwrap()));
        assert_eq!(log.len().unwrap(), 1);
        let pending = log.pending_envelopes().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.message_id, "m1");
    }
}
