//! # Event Store
//!
//! Relational source of truth for footprints. Append-only: rows are inserted by
//! the profile view path and only ever read back here.
//!
//! ## Schema
//!
//! ```sql
//! footprints (id, profile_id, visitor_id, occurred_at)
//! ```
//!
//! `occurred_at` holds nanoseconds since the epoch.
use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params};

use crate::{
    error::StoreError,
    models::{CanonicalVisit, FootprintRecord, UserId, nanos},
};

/// Blocking access to the footprint table. Callers on the runtime wrap calls in
/// `spawn_blocking`.
pub trait EventStore: Send + Sync {
    fn insert(&self, record: &FootprintRecord) -> Result<(), StoreError>;

    /// Unordered full scan. Records are handed to `visit` one at a time so the
    /// caller never has to buffer the table.
    fn scan(&self, visit: &mut dyn FnMut(FootprintRecord)) -> Result<u64, StoreError>;

    /// Canonical view computed straight from the records, for degraded reads.
    fn recent_visitors(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Result<Vec<CanonicalVisit>, StoreError>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS footprints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        profile_id INTEGER NOT NULL,
        visitor_id INTEGER NOT NULL,
        occurred_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS footprints_profile ON footprints (profile_id, visitor_id);
";

pub struct SqliteEventStore {
    connection: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self, StoreError> {
        connection.execute_batch(SCHEMA)?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }
}

impl EventStore for SqliteEventStore {
    fn insert(&self, record: &FootprintRecord) -> Result<(), StoreError> {
        let occurred_at = nanos(record.occurred_at)?;

        let connection = self.connection.lock();
        connection.execute(
            "INSERT INTO footprints (profile_id, visitor_id, occurred_at) VALUES (?1, ?2, ?3)",
            params![record.profile_id, record.visitor_id, occurred_at],
        )?;

        Ok(())
    }

    fn scan(&self, visit: &mut dyn FnMut(FootprintRecord)) -> Result<u64, StoreError> {
        let connection = self.connection.lock();
        let mut statement =
            connection.prepare("SELECT profile_id, visitor_id, occurred_at FROM footprints")?;
        let mut rows = statement.query([])?;

        let mut scanned = 0;
        while let Some(row) = rows.next()? {
            visit(FootprintRecord::new(
                row.get(0)?,
                row.get(1)?,
                from_nanos(row.get(2)?),
            ));
            scanned += 1;
        }

        Ok(scanned)
    }

    fn recent_visitors(
        &self,
        profile_id: UserId,
        limit: usize,
    ) -> Result<Vec<CanonicalVisit>, StoreError> {
        let connection = self.connection.lock();
        let mut statement = connection.prepare(
            "SELECT visitor_id, MAX(occurred_at) AS last_visit_at FROM footprints \
             WHERE profile_id = ?1 GROUP BY visitor_id \
             ORDER BY last_visit_at DESC, visitor_id ASC LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let visits = statement
            .query_map(params![profile_id, limit], canonical_visit)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(visits)
    }
}

fn canonical_visit(row: &Row<'_>) -> rusqlite::Result<CanonicalVisit> {
    Ok(CanonicalVisit::new(row.get(0)?, from_nanos(row.get(1)?)))
}

fn from_nanos(since_epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(since_epoch)
}
