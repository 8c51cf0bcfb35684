//! SQLite index of published versions and the latest-known-good pointer.
//!
//! The bundle directories are the source of truth for content; the index
//! answers "which versions exist" and "which one is latest" without walking
//! the store.

use super::bundle::{BundleMetadata, Verdict};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use vmci_shared::{VmciError, VmciResult};

/// Helper macro to convert rusqlite errors to VmciError.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| VmciError::Database(e.to_string()))
    };
}

const SCHEMA_VERSION: i32 = 1;

const SCHEMAS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        version INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS versions (
        tag TEXT PRIMARY KEY NOT NULL,
        parent_tag TEXT,
        commit_hash TEXT NOT NULL,
        pipeline_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        verdict TEXT NOT NULL,
        created_at TEXT NOT NULL,
        image_digest TEXT,
        metadata_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_versions_created ON versions(created_at)",
    "CREATE TABLE IF NOT EXISTS pointers (
        name TEXT PRIMARY KEY NOT NULL,
        tag TEXT NOT NULL REFERENCES versions(tag),
        updated_at TEXT NOT NULL
    )",
];

/// Summary row of a published version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRow {
    pub tag: String,
    pub parent_tag: Option<String>,
    pub commit: String,
    pub verdict: Verdict,
    pub created_at: String,
}

/// SQLite database handle.
///
/// Thread-safe via `parking_lot::Mutex`.
#[derive(Clone)]
pub struct VersionIndex {
    conn: Arc<Mutex<Connection>>,
}

impl VersionIndex {
    /// Open or create the index.
    pub fn open(db_path: &Path) -> VmciResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;

        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=100000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> VmciResult<()> {
        for sql in SCHEMAS {
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
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    params![SCHEMA_VERSION, Utc::now().to_rfc3339()],
                ))?;
                tracing::info!("Initialized version index schema {}", SCHEMA_VERSION);
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(VmciError::Database(format!(
                    "Version index schema {} is newer than supported {}. Please upgrade vmci.",
                    v, SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }

    /// Record a published version.
    pub fn insert(&self, metadata: &BundleMetadata) -> VmciResult<()> {
        let json = serde_json::to_string(metadata)?;
        let conn = self.conn();
        db_err!(conn.execute(
            "INSERT INTO versions
                (tag, parent_tag, commit_hash, pipeline_id, run_id, verdict, created_at, image_digest, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                metadata.version_tag,
                metadata.parent_tag,
                metadata.commit,
                metadata.pipeline_id,
                metadata.run_id,
                metadata.verdict.as_str(),
                metadata.created_at.to_rfc3339(),
                metadata.image_digest,
                json,
            ],
        ))?;
        Ok(())
    }

    pub fn get(&self, tag: &str) -> VmciResult<Option<BundleMetadata>> {
        let conn = self.conn();
        let json: Option<String> = db_err!(
            conn.query_row(
                "SELECT metadata_json FROM versions WHERE tag = ?1",
                params![tag],
                |row| row.get(0),
            )
            .optional()
        )?;
        json.map(|j| serde_json::from_str(&j).map_err(VmciError::from))
            .transpose()
    }

    /// Point `name` at `tag`.
    pub fn set_pointer(&self, name: &str, tag: &str) -> VmciResult<()> {
        let conn = self.conn();
        db_err!(conn.execute(
            "INSERT INTO pointers (name, tag, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET tag = excluded.tag, updated_at = excluded.updated_at",
            params![name, tag, Utc::now().to_rfc3339()],
        ))?;
        Ok(())
    }

    pub fn pointer(&self, name: &str) -> VmciResult<Option<String>> {
        let conn = self.conn();
        db_err!(
            conn.query_row(
                "SELECT tag FROM pointers WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
        )
    }

    /// Most recent versions first.
    pub fn list(&self, limit: usize) -> VmciResult<Vec<VersionRow>> {
        let conn = self.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT tag, parent_tag, commit_hash, verdict, created_at
             FROM versions ORDER BY created_at DESC, tag DESC LIMIT ?1"
        ))?;
        let rows = db_err!(stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        }))?;

        let mut out = Vec::new();
        for row in rows {
            let (tag, parent_tag, commit, verdict, created_at) = db_err!(row)?;
            out.push(VersionRow {
                tag,
                parent_tag,
                commit,
                verdict: Verdict::parse(&verdict)?,
                created_at,
            });
        }
        Ok(out)
    }
}
