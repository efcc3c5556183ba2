use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::{lock, Error, Result, Value};
use crate::staging::{storable, RowKey, Sample, StagingRow, StagingStore};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS staging (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL,
    value TEXT NOT NULL,
    ts_ns INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS staging_tag_ts ON staging (tag, ts_ns);
CREATE TABLE IF NOT EXISTS staging_rejected (
    id INTEGER PRIMARY KEY,
    tag TEXT NOT NULL,
    value TEXT NOT NULL,
    ts_ns INTEGER NOT NULL,
    reason TEXT NOT NULL
);";

type RawRow = (i64, String, String, i64);

/// Staging on a local SQLite database.
///
/// Values are stored as JSON text so one table holds every datatype. Rows
/// whose value no longer decodes are moved to `staging_rejected` when they
/// are read, so one bad row never blocks the rest of its tag. One connection
/// is shared behind a mutex; SQLite's own locking covers other processes
/// using the same file.
pub struct SqliteStaging {
    conn: Mutex<Connection>,
}

impl SqliteStaging {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn decode_row(key: i64, tag: String, value: &str, ts_ns: i64) -> Result<StagingRow> {
    let value: Value = serde_json::from_str(value)?;
    let key = RowKey::try_from(key).map_err(|_| Error::Corrupt(format!("negative row id {key}")))?;
    Ok(StagingRow {
        key,
        tag,
        value,
        timestamp_ns: ts_ns,
    })
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

/// Move undecodable rows out of `staging`, keeping them for inspection.
fn quarantine(conn: &Connection, rejected: &[(i64, String)]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for (id, reason) in rejected {
        log::warn!("staging row {id} cannot be decoded ({reason}), moved to staging_rejected");
        tx.execute(
            "INSERT OR REPLACE INTO staging_rejected (id, tag, value, ts_ns, reason) \
             SELECT id, tag, value, ts_ns, ?2 FROM staging WHERE id = ?1",
            params![id, reason],
        )?;
        tx.execute("DELETE FROM staging WHERE id = ?1", params![id])?;
    }
    tx.commit()?;
    Ok(())
}

impl StagingStore for SqliteStaging {
    fn insert(&self, samples: &[Sample]) -> Result<usize> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let mut stored = 0;
        {
            let mut stmt = tx.prepare_cached("INSERT INTO staging (tag, value, ts_ns) VALUES (?1, ?2, ?3)")?;
            for sample in storable(samples) {
                let value = serde_json::to_string(&sample.value)?;
                stmt.execute(params![sample.tag, value, sample.timestamp_ns])?;
                stored += 1;
            }
        }
        tx.commit()?;
        Ok(stored)
    }

    fn select(&self, tag: &str, t0_ns: i64, t1_ns: i64) -> Result<Vec<StagingRow>> {
        let conn = lock(&self.conn);
        let raw: Vec<RawRow> = {
            let mut stmt = conn.prepare_cached(
                "SELECT id, tag, value, ts_ns FROM staging \
                 WHERE tag = ?1 AND ts_ns >= ?2 AND ts_ns <= ?3 ORDER BY ts_ns, id",
            )?;
            let rows = stmt.query_map(params![tag, t0_ns, t1_ns], raw_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut rows = Vec::with_capacity(raw.len());
        let mut rejected = Vec::new();
        for (key, tag, value, ts_ns) in raw {
            match decode_row(key, tag, &value, ts_ns) {
                Ok(row) => rows.push(row),
                Err(err) => rejected.push((key, err.to_string())),
            }
        }
        if !rejected.is_empty() {
            quarantine(&conn, &rejected)?;
        }
        Ok(rows)
    }

    fn delete(&self, keys: &[RowKey]) -> Result<usize> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM staging WHERE id = ?1")?;
            for key in keys {
                let Ok(id) = i64::try_from(*key) else {
                    continue;
                };
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn tags(&self) -> Result<Vec<String>> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare_cached("SELECT DISTINCT tag FROM staging ORDER BY tag")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tags = Vec::new();
        for tag in rows {
            tags.push(tag?);
        }
        Ok(tags)
    }

    fn latest(&self, tag: &str) -> Result<Option<StagingRow>> {
        let conn = lock(&self.conn);
        loop {
            let newest: Option<RawRow> = {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, tag, value, ts_ns FROM staging \
                     WHERE tag = ?1 ORDER BY ts_ns DESC, id DESC LIMIT 1",
                )?;
                let newest = stmt.query_row(params![tag], raw_row).optional()?;
                newest
            };
            let Some((key, row_tag, value, ts_ns)) = newest else {
                return Ok(None);
            };
            match decode_row(key, row_tag, &value, ts_ns) {
                Ok(row) => return Ok(Some(row)),
                Err(err) => quarantine(&conn, &[(key, err.to_string())])?,
            }
        }
    }

    fn flush(&self, before_ns: Option<i64>) -> Result<usize> {
        let conn = lock(&self.conn);
        let deleted = match before_ns {
            Some(before) => conn.execute("DELETE FROM staging WHERE ts_ns < ?1", params![before])?,
            None => conn.execute("DELETE FROM staging", [])?,
        };
        Ok(deleted)
    }
}

impl SqliteStaging {
    /// Number of rows moved aside because their value could not be decoded.
    pub fn rejected_count(&self) -> Result<usize> {
        let conn = lock(&self.conn);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM staging_rejected", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
