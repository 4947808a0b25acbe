//! SQLite implementation of [`PulseStore`].
//!
//! Intervals live in a single `pulses` table. A partial unique index on
//! `(meter, start_us)` keeps one row per pulse start, which is what makes
//! every operation safe to repeat.
//!
//! The connection is opened on first use and dropped after any failure, so
//! the next retry starts from a fresh connection.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::event::{MeterId, Timestamp};
use crate::store::{Interval, PulseStore, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pulses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    meter INTEGER NOT NULL,
    start_us INTEGER,
    stop_us INTEGER,
    reset INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS pulses_meter_start
    ON pulses (meter, start_us) WHERE start_us IS NOT NULL;
CREATE INDEX IF NOT EXISTS pulses_meter_id ON pulses (meter, id);
";

fn open_conn(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn micros(ts: Timestamp) -> i64 {
    i64::try_from(ts.as_micros()).unwrap_or(i64::MAX)
}

fn from_micros(value: Option<i64>) -> Option<Timestamp> {
    value.map(|v| Timestamp::from_micros(v.max(0) as u64))
}

fn meter_key(meter: MeterId) -> i64 {
    meter as i64
}

/// Store backed by a SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteStore {
    /// Remember the database path. Nothing is opened until the first call.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the database now and create the schema, surfacing setup errors
    /// before the daemon starts.
    pub fn connect(&mut self) -> StoreResult<()> {
        self.with_conn(|_| Ok(()))
    }

    fn with_conn<T>(
        &mut self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        if self.conn.is_none() {
            let conn = open_conn(&self.path).map_err(|e| {
                StoreError::Unavailable(format!("{}: {e}", self.path.display()))
            })?;
            debug!(db = %self.path.display(), "connected to store");
            self.conn = Some(conn);
        }
        let Some(conn) = self.conn.as_ref() else {
            return Err(StoreError::Unavailable("connection lost".to_string()));
        };
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(db = %self.path.display(), error = %e, "dropping store connection");
                self.conn = None;
                Err(e.into())
            }
        }
    }

    /// Every row for `meter` in insertion order.
    pub fn rows(&mut self, meter: MeterId) -> StoreResult<Vec<Interval>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT start_us, stop_us, reset FROM pulses WHERE meter = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![meter_key(meter)], |row| {
                    Ok(Interval {
                        meter,
                        start: from_micros(row.get(0)?),
                        stop: from_micros(row.get(1)?),
                        reset: row.get::<_, i64>(2)? != 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Interval rows for `meter`, without reset markers.
    pub fn intervals(&mut self, meter: MeterId) -> StoreResult<Vec<Interval>> {
        Ok(self
            .rows(meter)?
            .into_iter()
            .filter(|row| !row.reset)
            .collect())
    }
}

fn set_stop(
    conn: &Connection,
    meter: MeterId,
    start: Timestamp,
    stop: Option<Timestamp>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE pulses SET stop_us = ?3 WHERE meter = ?1 AND start_us = ?2",
        params![meter_key(meter), micros(start), stop.map(micros)],
    )
}

impl PulseStore for SqliteStore {
    fn pulse_on(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()> {
        trace!(meter, %start, "pulse_on");
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO pulses (meter, start_us) VALUES (?1, ?2)",
                params![meter_key(meter), micros(start)],
            )
            .map(drop)
        })
    }

    fn pulse_off(&mut self, meter: MeterId, start: Timestamp, stop: Timestamp) -> StoreResult<()> {
        trace!(meter, %start, %stop, "pulse_off");
        self.with_conn(|conn| set_stop(conn, meter, start, Some(stop)).map(drop))
    }

    fn pulse_on_off(
        &mut self,
        meter: MeterId,
        start: Timestamp,
        stop: Timestamp,
    ) -> StoreResult<()> {
        trace!(meter, %start, %stop, "pulse_on_off");
        self.with_conn(|conn| {
            if set_stop(conn, meter, start, Some(stop))? == 0 {
                conn.execute(
                    "INSERT INTO pulses (meter, start_us, stop_us) VALUES (?1, ?2, ?3)",
                    params![meter_key(meter), micros(start), micros(stop)],
                )?;
            }
            Ok(())
        })
    }

    fn pulse_cancel(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()> {
        trace!(meter, %start, "pulse_cancel");
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM pulses WHERE meter = ?1 AND start_us = ?2",
                params![meter_key(meter), micros(start)],
            )
            .map(drop)
        })
    }

    fn pulse_resume(&mut self, meter: MeterId, start: Timestamp) -> StoreResult<()> {
        trace!(meter, %start, "pulse_resume");
        self.with_conn(|conn| {
            if set_stop(conn, meter, start, None)? == 0 {
                conn.execute(
                    "INSERT INTO pulses (meter, start_us) VALUES (?1, ?2)",
                    params![meter_key(meter), micros(start)],
                )?;
            }
            Ok(())
        })
    }

    fn pulse_reset(&mut self, meter: MeterId) -> StoreResult<()> {
        trace!(meter, "pulse_reset");
        self.with_conn(|conn| {
            let last_reset: Option<i64> = conn
                .query_row(
                    "SELECT reset FROM pulses WHERE meter = ?1 ORDER BY id DESC LIMIT 1",
                    params![meter_key(meter)],
                    |row| row.get(0),
                )
                .optional()?;
            if last_reset != Some(1) {
                conn.execute(
                    "INSERT INTO pulses (meter, reset) VALUES (?1, 1)",
                    params![meter_key(meter)],
                )?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METER: MeterId = 3;

    fn ts(secs: u64, micros: u32) -> Timestamp {
        Timestamp::new(secs, micros)
    }

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("pulses.db"));
        (dir, store)
    }

    #[test]
    fn connects_lazily() {
        let (_dir, mut store) = store();
        assert!(store.conn.is_none());
        store.connect().unwrap();
        assert!(store.conn.is_some());
        assert!(store.path().exists());
    }

    #[test]
    fn open_then_close_interval() {
        let (_dir, mut store) = store();
        store.pulse_on(METER, ts(10, 0)).unwrap();
        store.pulse_on(METER, ts(10, 0)).unwrap();
        store.pulse_off(METER, ts(10, 0), ts(10, 500_010)).unwrap();
        assert_eq!(
            store.intervals(METER).unwrap(),
            vec![Interval::closed(METER, ts(10, 0), ts(10, 500_010))]
        );
    }

    #[test]
    fn on_off_is_an_upsert() {
        let (_dir, mut store) = store();
        store.pulse_on_off(METER, ts(10, 0), ts(11, 0)).unwrap();
        store.pulse_on_off(METER, ts(10, 0), ts(11, 0)).unwrap();
        assert_eq!(store.intervals(METER).unwrap().len(), 1);
    }

    #[test]
    fn resume_reopens_and_cancel_deletes() {
        let (_dir, mut store) = store();
        store.pulse_on_off(METER, ts(10, 0), ts(11, 0)).unwrap();
        store.pulse_resume(METER, ts(10, 0)).unwrap();
        assert_eq!(
            store.intervals(METER).unwrap(),
            vec![Interval::open(METER, ts(10, 0))]
        );
        store.pulse_resume(METER, ts(30, 0)).unwrap();
        store.pulse_cancel(METER, ts(10, 0)).unwrap();
        store.pulse_cancel(METER, ts(10, 0)).unwrap();
        assert_eq!(
            store.intervals(METER).unwrap(),
            vec![Interval::open(METER, ts(30, 0))]
        );
    }

    #[test]
    fn reset_is_not_repeated() {
        let (_dir, mut store) = store();
        store.pulse_reset(METER).unwrap();
        store.pulse_reset(METER).unwrap();
        store.pulse_on(METER, ts(5, 0)).unwrap();
        store.pulse_reset(METER).unwrap();
        let rows = store.rows(METER).unwrap();
        assert_eq!(
            rows,
            vec![
                Interval::reset_marker(METER),
                Interval::open(METER, ts(5, 0)),
                Interval::reset_marker(METER),
            ]
        );
    }

    #[test]
    fn meters_are_independent() {
        let (_dir, mut store) = store();
        store.pulse_on(1, ts(10, 0)).unwrap();
        store.pulse_on(2, ts(10, 0)).unwrap();
        store.pulse_cancel(1, ts(10, 0)).unwrap();
        assert!(store.intervals(1).unwrap().is_empty());
        assert_eq!(store.intervals(2).unwrap().len(), 1);
    }

    #[test]
    fn unreachable_database_is_unavailable_and_stays_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteStore::new(dir.path().join("missing").join("pulses.db"));
        let err = store.pulse_on(METER, ts(1, 0)).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.conn.is_none());
    }

    #[test]
    fn data_survives_reopen() {
        let (dir, mut store) = store();
        store.pulse_on_off(METER, ts(10, 0), ts(11, 0)).unwrap();
        drop(store);
        let mut reopened = SqliteStore::new(dir.path().join("pulses.db"));
        assert_eq!(reopened.intervals(METER).unwrap().len(), 1);
    }
}
