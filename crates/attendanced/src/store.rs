//! SQLite-backed identity and attendance storage.
//!
//! One connection behind a mutex serves the engine thread (attendance rows,
//! snapshot reloads) and the D-Bus handlers (enroll, remove, list).

use attendance_core::{
    Embedding, IdentityId, IdentityRecord, IdentityStore, NewIdentity, Role, StoreError,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    roll_number   TEXT NOT NULL,
    department    TEXT NOT NULL,
    role          TEXT NOT NULL,
    face_encoding TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attendance_user ON attendance(user_id);
"#;

/// Operator-facing listing entry. Encodings are never sent back out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub name: String,
    pub roll_number: String,
    pub department: String,
    pub role: String,
    pub created_at: String,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// A `users` row as read, before the encoding and role are parsed.
struct StoredIdentity {
    id: String,
    display_name: String,
    roll_number: String,
    department: String,
    role: String,
    encoding: String,
}

impl StoredIdentity {
    fn into_record(self) -> Result<IdentityRecord, StoreError> {
        let values: Vec<f32> =
            serde_json::from_str(&self.encoding).map_err(|e| StoreError::MalformedEncoding {
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        let role: Role = self
            .role
            .parse()
            .map_err(|e| StoreError::Query(format!("identity {}: {e}", self.id)))?;
        Ok(IdentityRecord {
            id: IdentityId(self.id),
            display_name: self.display_name,
            roll_number: self.roll_number,
            department: self.department,
            role,
            encoding: Embedding::new(values),
        })
    }
}

fn query_err(err: rusqlite::Error) -> StoreError {
    StoreError::Query(err.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteStore {
    /// Open or create the database file, creating its parent directory if missing.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("opening {}: {e}", path.display())))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(query_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list_summaries(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, roll_number, department, role, created_at
                 FROM users ORDER BY created_at, id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IdentitySummary {
                    id: IdentityId(row.get(0)?),
                    name: row.get(1)?,
                    roll_number: row.get(2)?,
                    department: row.get(3)?,
                    role: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .map_err(query_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
    }

    #[cfg(test)]
    pub(crate) fn attendance_rows(&self, id: &IdentityId) -> Vec<String> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT timestamp FROM attendance WHERE user_id = ?1 ORDER BY id")
            .unwrap();
        let rows = stmt.query_map([id.as_str()], |row| row.get::<_, String>(0)).unwrap();
        rows.map(Result::unwrap).collect()
    }
}

impl IdentityStore for SqliteStore {
    fn list_identities(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, roll_number, department, role, face_encoding
                 FROM users ORDER BY created_at, id",
            )
            .map_err(query_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredIdentity {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    roll_number: row.get(2)?,
                    department: row.get(3)?,
                    role: row.get(4)?,
                    encoding: row.get(5)?,
                })
            })
            .map_err(query_err)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(query_err)?.into_record()?);
        }
        Ok(records)
    }

    fn insert_identity(&self, identity: &NewIdentity) -> Result<IdentityId, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let encoding = serde_json::to_string(&identity.encoding.values)
            .map_err(|e| StoreError::Query(format!("encoding serialization: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO users
                     (id, name, roll_number, department, role, face_encoding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    identity.display_name,
                    identity.roll_number,
                    identity.department,
                    identity.role.as_str(),
                    encoding,
                    timestamp(Utc::now()),
                ],
            )
            .map_err(query_err)?;
        tracing::info!(
            id = %id,
            name = %identity.display_name,
            role = %identity.role,
            "identity stored"
        );
        Ok(IdentityId(id))
    }

    /// Attendance rows go with the user through `ON DELETE CASCADE`.
    fn remove_identity(&self, id: &IdentityId) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM users WHERE id = ?1", [id.as_str()])
            .map_err(query_err)?;
        Ok(removed > 0)
    }

    fn insert_attendance(&self, id: &IdentityId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn();
        let known: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE id = ?1", [id.as_str()], |row| row.get(0))
            .optional()
            .map_err(query_err)?;
        if known.is_none() {
            return Err(StoreError::UnknownIdentity(id.clone()));
        }
        conn.execute(
            "INSERT INTO attendance (user_id, timestamp) VALUES (?1, ?2)",
            params![id.as_str(), timestamp(at)],
        )
        .map_err(query_err)?;
        Ok(())
    }
}
