//! Durable event storage.
//!
//! SQLite table keyed by fingerprint. Inserts are idempotent, retention keeps
//! the newest rows, and reads come back newest first. `event_time` is stored
//! as a fixed-width UTC string so lexical order is chronological order.

use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, Row, params};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::models::{Event, time_key};

/// How long SQLite waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Attempts per row when the database reports a transient lock.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Base backoff between write attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS earthquakes (
        fingerprint TEXT PRIMARY KEY,
        event_time  TEXT NOT NULL,
        latitude    REAL NOT NULL,
        longitude   REAL NOT NULL,
        depth_km    REAL,
        magnitude   REAL NOT NULL,
        location    TEXT NOT NULL,
        source      TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_earthquakes_time ON earthquakes (event_time);
";

const COLUMNS: &str = "event_time, latitude, longitude, depth_km, magnitude, location, source, fingerprint";

/// Result of one upsert batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows actually written
    pub inserted: usize,
    /// Rows whose fingerprint was already stored
    pub duplicates: usize,
    /// Rows dropped after errors or exhausted retries
    pub failed: usize,
}

/// Whether a storage error is a lock that may clear on retry.
#[must_use]
pub fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// SQLite-backed event store.
///
/// Holds a single connection, so one store is one writer. Share it behind a
/// mutex when several tasks need it.
#[derive(Debug)]
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open (or create) a store file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema created.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, BUSY_TIMEOUT)
    }

    /// Open a store file, waiting at most `busy_timeout` on a locked database.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema created.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        debug!("opening event store at {}", path.display());
        Self::init(Connection::open(path)?, busy_timeout)
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, BUSY_TIMEOUT)
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert events whose fingerprint is not stored yet.
    ///
    /// Individual row failures are counted, never propagated; only a failure
    /// to open or commit the batch transaction is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be started or committed.
    pub fn upsert(&mut self, events: &[Event]) -> Result<UpsertOutcome> {
        let mut outcome = UpsertOutcome::default();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO earthquakes ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ))?;

            for event in events {
                let key = event.time_key();
                let mut attempt = 1;
                loop {
                    let written = stmt.execute(params![
                        key,
                        event.latitude,
                        event.longitude,
                        event.depth_km,
                        event.magnitude,
                        event.location,
                        event.source,
                        event.fingerprint,
                    ]);
                    match written {
                        Ok(0) => outcome.duplicates += 1,
                        Ok(_) => outcome.inserted += 1,
                        Err(e) if is_transient(&e) && attempt < MAX_WRITE_ATTEMPTS => {
                            debug!("store busy on attempt {attempt}, retrying");
                            thread::sleep(RETRY_BACKOFF * attempt);
                            attempt += 1;
                            continue;
                        }
                        Err(e) => {
                            warn!("dropping event {}: {e}", event.fingerprint);
                            outcome.failed += 1;
                        }
                    }
                    break;
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Delete the oldest rows beyond `max_rows`.
    ///
    /// Equal timestamps are broken by fingerprint, so repeated calls are
    /// deterministic. Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the count or delete statement fails.
    pub fn enforce_capacity(&mut self, max_rows: usize) -> Result<usize> {
        let total = self.count()?;
        if total <= max_rows {
            return Ok(0);
        }
        let excess = i64::try_from(total - max_rows).unwrap_or(i64::MAX);
        let deleted = self.conn.execute(
            "DELETE FROM earthquakes WHERE fingerprint IN (
                 SELECT fingerprint FROM earthquakes
                 ORDER BY event_time ASC, fingerprint ASC
                 LIMIT ?1
             )",
            params![excess],
        )?;
        debug!("retention evicted {deleted} of {total} rows (cap {max_rows})");
        Ok(deleted)
    }

    /// Events with `since <= event_time < until`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored row is corrupt.
    pub fn query_window(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM earthquakes
             WHERE event_time >= ?1 AND event_time < ?2
             ORDER BY event_time DESC, fingerprint ASC"
        ))?;
        let rows = stmt.query_map(params![time_key(since), time_key(until)], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The `limit` most recent events, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored row is corrupt.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM earthquakes
             ORDER BY event_time DESC, fingerprint ASC
             LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of stored events.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM earthquakes", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Number of stored events with `since <= event_time < until`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM earthquakes WHERE event_time >= ?1 AND event_time < ?2",
            params![time_key(since), time_key(until)],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Time of the newest stored event.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn latest_event_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.query_recent(1)?.first().map(|e| e.event_time))
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let raw_time: String = row.get(0)?;
    let event_time = DateTime::parse_from_rfc3339(&raw_time)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    Ok(Event {
        event_time,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        depth_km: row.get(3)?,
        magnitude: row.get(4)?,
        location: row.get(5)?,
        source: row.get(6)?,
        fingerprint: row.get(7)?,
    })
}
