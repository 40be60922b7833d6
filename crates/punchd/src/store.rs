//! Attendance and event persistence.
//!
//! The pipeline only sees the two store traits; `SqliteStore` backs both
//! with a single rusqlite connection.

use crate::events::EventRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// A written attendance row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub log_id: String,
    pub employee_id: String,
    pub employee_name: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: Option<f32>,
    pub status: String,
    pub event_type: String,
}

pub trait AttendanceStore: Send + Sync {
    fn write_attendance(
        &self,
        identity: &str,
        confidence: Option<f32>,
        status: &str,
        event_type: &str,
    ) -> Result<AttendanceRecord, StoreError>;
}

pub trait EventStore: Send + Sync {
    fn write_event(&self, event: &EventRecord) -> Result<(), StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS employees (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS attendance_logs (
    id TEXT PRIMARY KEY,
    employee_id TEXT NOT NULL,
    employee_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    confidence REAL,
    status TEXT NOT NULL,
    event_type TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS event_logs (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    message TEXT NOT NULL,
    image_path TEXT,
    metadata TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_employee_id ON attendance_logs(employee_id);
CREATE INDEX IF NOT EXISTS idx_event_logs_type ON event_logs(event_type);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Register or rename an employee. Roster identities are matched
    /// against both the id and the name.
    pub fn upsert_employee(&self, id: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO employees (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            params![id, name],
        )?;
        Ok(())
    }

    pub fn attendance_count(&self, employee_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attendance_logs WHERE employee_id = ?1",
            params![employee_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn event_count(&self, event_type: &str) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM event_logs WHERE event_type = ?1",
            params![event_type],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

impl AttendanceStore for SqliteStore {
    fn write_attendance(
        &self,
        identity: &str,
        confidence: Option<f32>,
        status: &str,
        event_type: &str,
    ) -> Result<AttendanceRecord, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());

        let (employee_id, employee_name) = conn
            .query_row(
                "SELECT id, name FROM employees WHERE active = 1 AND (id = ?1 OR name = ?1) LIMIT 1",
                params![identity],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
            .unwrap_or_else(|| (identity.to_string(), identity.to_string()));

        let record = AttendanceRecord {
            log_id: uuid::Uuid::new_v4().to_string(),
            employee_id,
            employee_name,
            timestamp: Utc::now(),
            confidence,
            status: status.to_string(),
            event_type: event_type.to_string(),
        };

        conn.execute(
            "INSERT INTO attendance_logs
             (id, employee_id, employee_name, timestamp, confidence, status, event_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.log_id,
                record.employee_id,
                record.employee_name,
                record.timestamp.to_rfc3339(),
                record.confidence.map(f64::from),
                record.status,
                record.event_type,
            ],
        )?;

        tracing::debug!(log_id = %record.log_id, employee_id = %record.employee_id, "attendance row written");
        Ok(record)
    }
}

impl EventStore for SqliteStore {
    fn write_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        conn.execute(
            "INSERT INTO event_logs (id, event_type, message, image_path, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                event.kind.as_str(),
                event.message,
                event.image_ref.as_ref().map(|p| p.to_string_lossy().into_owned()),
                event.metadata.to_string(),
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn test_attendance_falls_back_to_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = store.write_attendance("alice", Some(0.8), "Present", "check-in").unwrap();
        assert_eq!(rec.employee_id, "alice");
        assert_eq!(rec.employee_name, "alice");
        assert_eq!(rec.status, "Present");
        assert_eq!(store.attendance_count("alice").unwrap(), 1);
    }

    #[test]
    fn test_attendance_resolves_employee_by_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_employee("EMP-007", "alice").unwrap();
        let rec = store.write_attendance("alice", None, "Present", "check-in").unwrap();
        assert_eq!(rec.employee_id, "EMP-007");
        assert_eq!(rec.employee_name, "alice");
        assert_eq!(store.attendance_count("EMP-007").unwrap(), 1);
    }

    #[test]
    fn test_log_ids_are_unique() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.write_attendance("bob", None, "Present", "check-in").unwrap();
        let b = store.write_attendance("bob", None, "Present", "check-in").unwrap();
        assert_ne!(a.log_id, b.log_id);
    }

    #[test]
    fn test_write_event() {
        let store = SqliteStore::open_in_memory().unwrap();
        let event = EventRecord {
            kind: EventKind::Detected,
            message: "Detected 1 face(s)".into(),
            image_ref: None,
            metadata: serde_json::json!({ "detected": 1 }),
            timestamp: Utc::now(),
        };
        store.write_event(&event).unwrap();
        assert_eq!(store.event_count("detected").unwrap(), 1);
        assert_eq!(store.event_count("anti_spoof").unwrap(), 0);
    }
}
