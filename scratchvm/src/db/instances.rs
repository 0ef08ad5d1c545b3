use super::{Database, db_err};
use crate::runtime::options::PortForward;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use scratchvm_shared::errors::{ScratchError, ScratchResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopped,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub status: InstanceStatus,
    /// Stage that failed, when `status` is `Failed`.
    pub failed_stage: Option<String>,
    pub pid: Option<u32>,
    pub base_image: Option<PathBuf>,
    pub disk_path: PathBuf,
    pub seed_path: PathBuf,
    pub forwards: Vec<PortForward>,
    pub display: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(name: &str, disk_path: PathBuf, seed_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            status: InstanceStatus::Provisioning,
            failed_stage: None,
            pid: None,
            base_image: None,
            disk_path,
            seed_path,
            forwards: Vec::new(),
            display: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Instance rows in the registry.
#[derive(Clone)]
pub struct InstanceStore {
    db: Database,
}

impl InstanceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace by name. `created_at` of an existing row is kept.
    pub fn save(&self, record: &InstanceRecord) -> ScratchResult<()> {
        let mut record = record.clone();
        record.updated_at = Utc::now();
        if let Some(existing) = self.get(&record.name)? {
            record.created_at = existing.created_at;
        }
        let blob = serde_json::to_string(&record)
            .map_err(|e| ScratchError::Internal(format!("failed to encode record: {}", e)))?;

        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO instances (name, status, pid, record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                status = excluded.status,
                pid = excluded.pid,
                record = excluded.record,
                updated_at = excluded.updated_at",
            rusqlite::params![
                record.name,
                record.status.as_str(),
                record.pid,
                blob,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        ))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> ScratchResult<Option<InstanceRecord>> {
        let conn = self.db.conn();
        let blob: Option<String> = db_err!(
            conn.query_row(
                "SELECT record FROM instances WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()
        )?;
        blob.map(|b| decode(&b)).transpose()
    }

    /// All records, by name.
    pub fn list(&self) -> ScratchResult<Vec<InstanceRecord>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare("SELECT record FROM instances ORDER BY name"))?;
        let blobs = db_err!(stmt.query_map([], |row| row.get::<_, String>(0)))?;
        let mut records = Vec::new();
        for blob in blobs {
            records.push(decode(&db_err!(blob)?)?);
        }
        Ok(records)
    }

    /// Returns whether a row was deleted.
    pub fn remove(&self, name: &str) -> ScratchResult<bool> {
        let conn = self.db.conn();
        let n = db_err!(conn.execute("DELETE FROM instances WHERE name = ?1", [name]))?;
        Ok(n > 0)
    }
}

fn decode(blob: &str) -> ScratchResult<InstanceRecord> {
    serde_json::from_str(blob)
        .map_err(|e| ScratchError::Database(format!("corrupt instance record: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> InstanceStore {
        InstanceStore::new(Database::open(&dir.path().join("scratchvm.db")).unwrap())
    }

    #[test]
    fn test_save_get_list_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut record = InstanceRecord::new("dev", "/x/disk.qcow2".into(), "/x/seed.img".into());
        store.save(&record).unwrap();
        let created = store.get("dev").unwrap().unwrap().created_at;

        record.status = InstanceStatus::Running;
        record.pid = Some(1234);
        store.save(&record).unwrap();

        let loaded = store.get("dev").unwrap().unwrap();
        assert_eq!(loaded.status, InstanceStatus::Running);
        assert_eq!(loaded.pid, Some(1234));
        assert_eq!(loaded.created_at, created);

        store
            .save(&InstanceRecord::new("alpha", "/a".into(), "/b".into()))
            .unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "dev"]);

        assert!(store.remove("dev").unwrap());
        assert!(!store.remove("dev").unwrap());
        assert!(store.get("dev").unwrap().is_none());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        store(&dir)
            .save(&InstanceRecord::new("dev", "/x".into(), "/y".into()))
            .unwrap();
        assert!(store(&dir).get("dev").unwrap().is_some());
    }
}
