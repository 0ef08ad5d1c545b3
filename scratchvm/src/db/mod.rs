//! Instance registry.
//!
//! One row per provisioned instance: the full record as a JSON blob plus
//! the columns `list` and `destroy` query on.

mod instances;
mod schema;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use scratchvm_shared::errors::{ScratchError, ScratchResult};

pub use instances::{InstanceRecord, InstanceStatus, InstanceStore};

/// Convert rusqlite errors to `ScratchError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| ScratchError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// SQLite database handle, shared behind a `parking_lot::Mutex`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database.
    pub fn open(db_path: &Path) -> ScratchResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        // Two invocations may race on the same home directory.
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=10000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Acquire the database connection.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> ScratchResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        let current_version: Option<i32> = db_err!(
            conn.query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        )?;

        match current_version {
            None => {
                let now = Utc::now().to_rfc3339();
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    rusqlite::params![schema::SCHEMA_VERSION, now],
                ))?;
                tracing::debug!(
                    "Initialized registry schema version {}",
                    schema::SCHEMA_VERSION
                );
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                return Err(ScratchError::Database(format!(
                    "registry schema version {} predates {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(ScratchError::Database(format!(
                    "registry schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_db_open_twice() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("scratchvm.db");
        let _db = Database::open(&db_path).unwrap();
        // Reopening finds the recorded schema version.
        let _db = Database::open(&db_path).unwrap();
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("scratchvm.db");
        {
            let db = Database::open(&db_path).unwrap();
            db.conn()
                .execute("UPDATE schema_version SET version = 999 WHERE id = 1", [])
                .unwrap();
        }
        let err = Database::open(&db_path).err().unwrap();
        assert_eq!(err.kind(), "DatabaseError");
    }
}
