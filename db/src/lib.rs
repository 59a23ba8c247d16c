use models::{FileRecord, UploadStatus};
use rusqlite::{params, Connection, Result};
use serde::Serialize;
use std::path::Path;
use time::OffsetDateTime;

const DB_SCHEMA_VERSION: i32 = 1;

/// The file log: durable per-path record of delivery outcome. One row per
/// absolute file path.
pub struct Db {
    conn: Connection,
}

/// Row view for paths that have accumulated upload errors, used by the
/// status command.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRow {
    pub path: String,
    pub status: Option<UploadStatus>,
    pub error_count: i64,
    pub last_attempt_at: i64,
}

// rusqlite::Connection is !Send by default. We guard access through our own
// synchronization and only use it from controlled contexts, so mark as Send/Sync.
unsafe impl Send for Db {}
unsafe impl Sync for Db {}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Db { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Db { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS file_log (
                file_path       TEXT PRIMARY KEY,
                file_hash       TEXT,
                mod_time        INTEGER,
                file_size       INTEGER,
                status          TEXT,
                last_attempt_at INTEGER,
                tenant_id       TEXT,
                error_count     INTEGER DEFAULT 0
            );
        "#,
        )?;

        let current: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > DB_SCHEMA_VERSION {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISMATCH),
                Some(format!(
                    "db schema version {} is newer than this binary supports (max {})",
                    current, DB_SCHEMA_VERSION
                )),
            ));
        }
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {DB_SCHEMA_VERSION};"))?;
        Ok(())
    }

    /// Read the record for an absolute path; a missing row reads as the
    /// default (empty) record.
    pub fn get_record(&self, path: &Path) -> Result<FileRecord> {
        let mut stmt = self.conn.prepare(
            "SELECT status, mod_time, file_hash, error_count FROM file_log WHERE file_path = ?1",
        )?;
        let res = stmt.query_row(params![path_key(path)], |row| {
            let status: Option<String> = row.get(0)?;
            let mod_time: Option<i64> = row.get(1)?;
            let hash: Option<String> = row.get(2)?;
            let error_count: i64 = row.get(3)?;
            Ok(FileRecord {
                status: status.as_deref().and_then(UploadStatus::parse),
                mod_time: mod_time.unwrap_or_default(),
                file_hash: hash.unwrap_or_default(),
                error_count,
            })
        });
        match res {
            Ok(rec) => Ok(rec),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(FileRecord::default()),
            Err(e) => Err(e),
        }
    }

    /// Upsert the delivery outcome for a path. A conflict overwrites the
    /// status, hash, mod time, size, and attempt timestamp, and zeroes the
    /// error count.
    pub fn update_status(
        &self,
        path: &Path,
        status: UploadStatus,
        hash: &str,
        mod_time: i64,
        size: i64,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO file_log (file_path, file_hash, mod_time, file_size, status, last_attempt_at, error_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
            ON CONFLICT(file_path) DO UPDATE SET
                status = excluded.status,
                file_hash = excluded.file_hash,
                mod_time = excluded.mod_time,
                file_size = excluded.file_size,
                last_attempt_at = excluded.last_attempt_at,
                error_count = 0
            "#,
            params![
                path_key(path),
                hash,
                mod_time,
                size,
                status.as_str(),
                now_ts()
            ],
        )?;
        Ok(())
    }

    /// Bump the error count for a path. A no-op when the row does not exist:
    /// the path never made it past an upload.
    pub fn increment_error(&self, path: &Path) -> Result<()> {
        self.conn.execute(
            "UPDATE file_log SET error_count = error_count + 1, last_attempt_at = ?1 WHERE file_path = ?2",
            params![now_ts(), path_key(path)],
        )?;
        Ok(())
    }

    /// Record an integrity mismatch. Creates the row if the path has never
    /// been logged; preserves the accumulated error count otherwise.
    pub fn mark_corrupt(&self, path: &Path) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO file_log (file_path, status, last_attempt_at, error_count)
            VALUES (?1, ?2, ?3, 0)
            ON CONFLICT(file_path) DO UPDATE SET
                status = excluded.status,
                last_attempt_at = excluded.last_attempt_at
            "#,
            params![path_key(path), UploadStatus::Corrupt.as_str(), now_ts()],
        )?;
        Ok(())
    }

    /// Delete one row, or every row when no path is given. Returns the
    /// number of rows removed.
    pub fn reset_history(&self, path: Option<&Path>) -> Result<usize> {
        let rows = match path {
            Some(p) => self.conn.execute(
                "DELETE FROM file_log WHERE file_path = ?1",
                params![path_key(p)],
            )?,
            None => self.conn.execute("DELETE FROM file_log", [])?,
        };
        Ok(rows)
    }

    /* Status/observability helpers */

    pub fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(status, ''), COUNT(*) FROM file_log GROUP BY status ORDER BY status",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((status, count))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_errors(&self) -> Result<Vec<ErrorRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT file_path, status, error_count, COALESCE(last_attempt_at, 0)
            FROM file_log
            WHERE error_count > 0
            ORDER BY error_count DESC, file_path ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let status: Option<String> = row.get(1)?;
            Ok(ErrorRow {
                path,
                status: status.as_deref().and_then(UploadStatus::parse),
                error_count: row.get(2)?,
                last_attempt_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
