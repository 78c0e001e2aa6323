//! footfall-store — SQLite persistence for visitors and their visits.
//!
//! Embeddings are stored as little-endian `f32` blobs; timestamps as
//! RFC 3339 text. Every write that touches both tables runs in a single
//! transaction so a visitor row never exists without its enrolling visit.

mod migrations;

pub use migrations::{MigrationError, CURRENT_SCHEMA_VERSION};

use chrono::{DateTime, SecondsFormat, Utc};
use footfall_core::{Embedding, StoreError, Visit, Visitor, VisitorId, VisitorStore};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `$XDG_DATA_HOME/footfall/visitors.db`, falling back to `~/.local/share`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("footfall/visitors.db")
}

/// Aggregate counts for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub unique_visitors: u64,
    /// Visitors seen more than once.
    pub returning_visitors: u64,
    pub total_visits: u64,
    /// Visits that matched an existing visitor.
    pub return_visits: u64,
}

/// Classify a SQLite failure. Lock contention and I/O trouble mean the
/// store cannot be reached right now; everything else is a backend fault.
pub fn classify(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::ReadOnly
            | ErrorCode::DiskFull,
        ) => StoreError::Unreachable(e.to_string()),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) => StoreError::Corrupt(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

fn migration_error(e: MigrationError) -> StoreError {
    match e {
        MigrationError::Sql(e) | MigrationError::Step { source: e, .. } => classify(e),
        other => StoreError::Backend(other.to_string()),
    }
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid {field} '{value}': {e}")))
}

/// Fixed-width UTC text so that string order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_count(value: i64, field: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn decode_embedding(id: VisitorId, blob: &[u8], model_version: Option<String>) -> Result<Embedding, StoreError> {
    let mut embedding = Embedding::from_le_bytes(blob)
        .ok_or_else(|| StoreError::Corrupt(format!("visitor {id}: embedding blob of {} bytes", blob.len())))?;
    embedding.model_version = model_version;
    Ok(embedding)
}

/// Raw visitor columns, decoded outside the rusqlite row callback.
struct VisitorRow {
    id: VisitorId,
    embedding: Vec<u8>,
    model_version: Option<String>,
    visit_count: i64,
    first_seen: String,
    last_seen: String,
    sample_image: Option<String>,
}

impl VisitorRow {
    const COLUMNS: &'static str = "id, embedding, model_version, visit_count, first_seen, last_seen, sample_image";

    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            embedding: row.get("embedding")?,
            model_version: row.get("model_version")?,
            visit_count: row.get("visit_count")?,
            first_seen: row.get("first_seen")?,
            last_seen: row.get("last_seen")?,
            sample_image: row.get("sample_image")?,
        })
    }

    fn decode(self) -> Result<Visitor, StoreError> {
        Ok(Visitor {
            id: self.id,
            embedding: decode_embedding(self.id, &self.embedding, self.model_version)?,
            visit_count: to_count(self.visit_count, "visit_count")?,
            first_seen: parse_datetime(&self.first_seen, "first_seen")?,
            last_seen: parse_datetime(&self.last_seen, "last_seen")?,
            sample_image: self.sample_image,
        })
    }
}

/// SQLite-backed [`VisitorStore`].
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unreachable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(classify)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))
            .map_err(classify)?;
        let store = Self::init(conn, Some(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "visitor store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(classify)?, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(classify)?;
        migrations::run_migrations(&mut conn).map_err(migration_error)?;
        Ok(Self { conn, path })
    }

    /// Database file, `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record where the visitor's face crop was saved.
    pub fn attach_sample_image(&mut self, visitor_id: VisitorId, image_path: &str) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE visitors SET sample_image = ?1 WHERE id = ?2",
                params![image_path, visitor_id],
            )
            .map_err(classify)?;
        if changed == 0 {
            return Err(StoreError::VisitorNotFound(visitor_id));
        }
        Ok(())
    }

    pub fn visitor_count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM visitors", [], |r| r.get(0))
            .map_err(classify)?;
        Ok(n.max(0) as u64)
    }

    pub fn summary(&self) -> Result<StoreSummary, StoreError> {
        self.conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM visitors),
                    (SELECT COUNT(*) FROM visitors WHERE visit_count > 1),
                    (SELECT COUNT(*) FROM visits),
                    (SELECT COUNT(*) FROM visits WHERE similarity IS NOT NULL)",
                [],
                |r| {
                    let get = |i: usize| r.get::<_, i64>(i).map(|v| v.max(0) as u64);
                    Ok(StoreSummary {
                        unique_visitors: get(0)?,
                        returning_visitors: get(1)?,
                        total_visits: get(2)?,
                        return_visits: get(3)?,
                    })
                },
            )
            .map_err(classify)
    }

    pub fn visitor(&self, id: VisitorId) -> Result<Option<Visitor>, StoreError> {
        let sql = format!("SELECT {} FROM visitors WHERE id = ?1", VisitorRow::COLUMNS);
        self.conn
            .query_row(&sql, params![id], VisitorRow::read)
            .optional()
            .map_err(classify)?
            .map(VisitorRow::decode)
            .transpose()
    }

    /// Most recently seen visitors first.
    pub fn list_visitors(&self, limit: usize) -> Result<Vec<Visitor>, StoreError> {
        let sql = format!(
            "SELECT {} FROM visitors ORDER BY last_seen DESC, id DESC LIMIT ?1",
            VisitorRow::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(classify)?;
        let rows = stmt
            .query_map(params![limit as i64], VisitorRow::read)
            .map_err(classify)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(classify)?;
        rows.into_iter().map(VisitorRow::decode).collect()
    }

    /// Latest visits first, optionally for one visitor.
    pub fn recent_visits(&self, visitor_id: Option<VisitorId>, limit: usize) -> Result<Vec<Visit>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT visitor_id, session_id, timestamp, similarity FROM visits
                 WHERE ?1 IS NULL OR visitor_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![visitor_id, limit as i64], |r| {
                Ok((
                    r.get::<_, VisitorId>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<f64>>(3)?,
                ))
            })
            .map_err(classify)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(classify)?;

        rows.into_iter()
            .map(|(visitor_id, session_id, timestamp, similarity)| {
                Ok(Visit {
                    visitor_id,
                    timestamp: parse_datetime(&timestamp, "timestamp")?,
                    session_id,
                    similarity: similarity.map(|s| s as f32),
                })
            })
            .collect()
    }
}

impl VisitorStore for SqliteStore {
    fn scan_all(&mut self) -> Result<Vec<(VisitorId, Embedding)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, embedding, model_version FROM visitors ORDER BY id")
            .map_err(classify)?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, VisitorId>(0)?,
                    r.get::<_, Vec<u8>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(classify)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(classify)?;

        rows.into_iter()
            .map(|(id, blob, model)| Ok((id, decode_embedding(id, &blob, model)?)))
            .collect()
    }

    fn insert(&mut self, embedding: &Embedding, session_id: &str, at: DateTime<Utc>) -> Result<VisitorId, StoreError> {
        let ts = timestamp(at);
        let tx = self.conn.transaction().map_err(classify)?;
        tx.execute(
            "INSERT INTO visitors (embedding, model_version, visit_count, first_seen, last_seen)
             VALUES (?1, ?2, 1, ?3, ?3)",
            params![embedding.to_le_bytes(), embedding.model_version, ts],
        )
        .map_err(classify)?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO visits (visitor_id, session_id, timestamp, similarity) VALUES (?1, ?2, ?3, NULL)",
            params![id, session_id, ts],
        )
        .map_err(classify)?;
        tx.commit().map_err(classify)?;
        Ok(id)
    }

    fn update_on_match(
        &mut self,
        visitor_id: VisitorId,
        session_id: &str,
        similarity: f32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ts = timestamp(at);
        let tx = self.conn.transaction().map_err(classify)?;
        let changed = tx
            .execute(
                "UPDATE visitors SET visit_count = visit_count + 1, last_seen = ?1 WHERE id = ?2",
                params![ts, visitor_id],
            )
            .map_err(classify)?;
        if changed == 0 {
            return Err(StoreError::VisitorNotFound(visitor_id));
        }
        tx.execute(
            "INSERT INTO visits (visitor_id, session_id, timestamp, similarity) VALUES (?1, ?2, ?3, ?4)",
            params![visitor_id, session_id, ts, similarity as f64],
        )
        .map_err(classify)?;
        tx.commit().map_err(classify)
    }
}
