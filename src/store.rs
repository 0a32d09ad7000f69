// SQLite storage shared by the write path (reconciliation) and the read path
//
// Connections come from an r2d2 pool so concurrent provider syncs and readers each get
// their own connection. WAL mode lets readers keep going while a batch is being written.

use std::{path::Path, time::Duration};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const PLAN_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt value in column {column}: {value:?}")]
    Corrupt { column: &'static str, value: String },
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id                   INTEGER PRIMARY KEY,
    provider_name        TEXT    NOT NULL,
    base_event_id        TEXT    NOT NULL,
    title                TEXT    NOT NULL,
    organizer_company_id TEXT,
    ever_online          INTEGER NOT NULL DEFAULT 0,
    first_seen_at        TEXT    NOT NULL,
    last_seen_at         TEXT    NOT NULL,
    UNIQUE (provider_name, base_event_id)
);
CREATE INDEX IF NOT EXISTS idx_events_ever_online ON events (ever_online);

CREATE TABLE IF NOT EXISTS plans (
    id            INTEGER PRIMARY KEY,
    event_id      INTEGER NOT NULL REFERENCES events (id),
    base_plan_id  TEXT    NOT NULL,
    sell_mode     TEXT    NOT NULL CHECK (sell_mode IN ('online', 'offline')),
    starts_at     TEXT    NOT NULL,
    ends_at       TEXT    NOT NULL,
    sell_from     TEXT,
    sell_to       TEXT,
    sold_out      INTEGER NOT NULL DEFAULT 0,
    capacity      INTEGER CHECK (capacity IS NULL OR capacity >= 0),
    first_seen_at TEXT    NOT NULL,
    last_seen_at  TEXT    NOT NULL,
    UNIQUE (event_id, base_plan_id)
);
CREATE INDEX IF NOT EXISTS idx_plans_starts_at ON plans (starts_at);
CREATE INDEX IF NOT EXISTS idx_plans_ends_at ON plans (ends_at);

CREATE TABLE IF NOT EXISTS zones (
    id            INTEGER PRIMARY KEY,
    plan_id       INTEGER NOT NULL REFERENCES plans (id),
    base_zone_id  TEXT    NOT NULL,
    name          TEXT    NOT NULL,
    capacity      INTEGER NOT NULL CHECK (capacity >= 0),
    price         REAL    NOT NULL CHECK (price >= 0),
    numbered      INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT    NOT NULL,
    last_seen_at  TEXT    NOT NULL,
    UNIQUE (plan_id, base_zone_id)
);

CREATE TABLE IF NOT EXISTS provider_sync_state (
    provider_name   TEXT PRIMARY KEY,
    lock_owner      TEXT,
    lock_expires_at TEXT,
    last_started_at TEXT,
    last_success_at TEXT,
    last_failure_at TEXT,
    last_error      TEXT
);
"#;

// Per-connection setup run by the pool on every new connection
fn init_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(Duration::from_secs(5))?;
    // journal_mode answers with a row, so it cannot go through execute_batch
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")
}

/// Durable per-provider sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSyncState {
    pub provider_name: String,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Handle to the event database. Cheap to clone.
#[derive(Clone)]
pub struct EventStore {
    pool: Pool<SqliteConnectionManager>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(init_connection);
        let pool = Pool::builder().max_size(pool_size).build(manager)?;
        let store = Self { pool };
        store.bootstrap()?;
        Ok(store)
    }

    fn bootstrap(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        debug!("event store schema ready");
        Ok(())
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.pool.get()?)
    }

    /// Takes the provider's sync lock for `owner` unless somebody else holds an
    /// unexpired one. Returns whether the lock was acquired.
    pub fn try_acquire_lock(
        &self,
        provider_name: &str,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        let expires_at = now + ttl;
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            INSERT INTO provider_sync_state (provider_name, lock_owner, lock_expires_at, last_started_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (provider_name) DO UPDATE SET
                lock_owner = excluded.lock_owner,
                lock_expires_at = excluded.lock_expires_at,
                last_started_at = excluded.last_started_at
            WHERE provider_sync_state.lock_owner IS NULL
               OR provider_sync_state.lock_expires_at IS NULL
               OR provider_sync_state.lock_expires_at <= excluded.last_started_at
            "#,
            params![
                provider_name,
                owner,
                format_timestamp(expires_at),
                format_timestamp(now)
            ],
        )?;
        Ok(changed == 1)
    }

    /// Releases the lock and marks `now` as the provider's last complete sync.
    ///
    /// Returns `false` without recording anything when `owner` no longer holds the lock.
    pub fn complete_run(
        &self,
        provider_name: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE provider_sync_state
            SET lock_owner = NULL, lock_expires_at = NULL, last_success_at = ?3, last_error = NULL
            WHERE provider_name = ?1 AND lock_owner = ?2
            "#,
            params![provider_name, owner, format_timestamp(now)],
        )?;
        Ok(changed == 1)
    }

    /// Releases the lock and records the failure. `last_success_at` is left untouched.
    ///
    /// Returns `false` when `owner` no longer holds the lock.
    pub fn fail_run(
        &self,
        provider_name: &str,
        owner: &str,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE provider_sync_state
            SET lock_owner = NULL, lock_expires_at = NULL, last_failure_at = ?3, last_error = ?4
            WHERE provider_name = ?1 AND lock_owner = ?2
            "#,
            params![provider_name, owner, format_timestamp(now), error],
        )?;
        Ok(changed == 1)
    }

    pub fn sync_state(&self, provider_name: &str) -> Result<Option<ProviderSyncState>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT provider_name, lock_owner, lock_expires_at, last_started_at,
                       last_success_at, last_failure_at, last_error
                FROM provider_sync_state
                WHERE provider_name = ?1
                "#,
                params![provider_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((provider_name, lock_owner, expires, started, success, failure, last_error)) = row
        else {
            return Ok(None);
        };

        Ok(Some(ProviderSyncState {
            provider_name,
            lock_owner,
            lock_expires_at: parse_optional_timestamp("lock_expires_at", expires)?,
            last_started_at: parse_optional_timestamp("last_started_at", started)?,
            last_success_at: parse_optional_timestamp("last_success_at", success)?,
            last_failure_at: parse_optional_timestamp("last_failure_at", failure)?,
            last_error,
        }))
    }

    /// Row counts of (events, plans, zones).
    pub fn counts(&self) -> Result<(usize, usize, usize), StoreError> {
        let conn = self.conn()?;
        let count = |table: &str| -> Result<usize, StoreError> {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok((count("events")?, count("plans")?, count("zones")?))
    }
}

// Fixed-width UTC timestamps so that string comparison in SQL orders correctly.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| StoreError::Corrupt {
            column,
            value: value.to_string(),
        })
}

pub(crate) fn parse_optional_timestamp(
    column: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(|v| parse_timestamp(column, &v)).transpose()
}

pub(crate) fn format_plan_time(ts: NaiveDateTime) -> String {
    ts.format(PLAN_TIME_FORMAT).to_string()
}

pub(crate) fn parse_plan_time(column: &'static str, value: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(value, PLAN_TIME_FORMAT).map_err(|_| StoreError::Corrupt {
        column,
        value: value.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_timestamp_format_round_trips_and_sorts() {
        let early = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::microseconds(1500);

        assert_eq!(parse_timestamp("t", &format_timestamp(late)).unwrap(), late);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert!(parse_timestamp("t", "yesterday").is_err());
    }

    #[test]
    fn test_lock_is_exclusive_until_released() {
        let temp = temp_store();
        let store = &temp.store;
        let ttl = Duration::from_secs(3600);

        assert!(store.try_acquire_lock("primary", "worker-a", ts(10), ttl).unwrap());
        assert!(!store.try_acquire_lock("primary", "worker-b", ts(10), ttl).unwrap());
        // other providers are independent
        assert!(store.try_acquire_lock("secondary", "worker-b", ts(10), ttl).unwrap());

        assert!(store.complete_run("primary", "worker-a", ts(10)).unwrap());
        assert!(store.try_acquire_lock("primary", "worker-b", ts(11), ttl).unwrap());

        let state = store.sync_state("primary").unwrap().unwrap();
        assert_eq!(state.lock_owner.as_deref(), Some("worker-b"));
        assert_eq!(state.last_success_at, Some(ts(10)));
        assert_eq!(state.last_started_at, Some(ts(11)));
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let temp = temp_store();
        let store = &temp.store;
        let ttl = Duration::from_secs(3600);

        assert!(store.try_acquire_lock("primary", "crashed", ts(8), ttl).unwrap());
        assert!(!store.try_acquire_lock("primary", "fresh", ts(8) + chrono::Duration::minutes(59), ttl).unwrap());
        assert!(store.try_acquire_lock("primary", "fresh", ts(9), ttl).unwrap());
    }

    #[test]
    fn test_failed_run_keeps_last_success() {
        let temp = temp_store();
        let store = &temp.store;
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lock("primary", "w", ts(1), ttl).unwrap());
        assert!(store.complete_run("primary", "w", ts(1)).unwrap());
        assert!(store.try_acquire_lock("primary", "w", ts(2), ttl).unwrap());
        assert!(store.fail_run("primary", "w", ts(2), "connection refused").unwrap());

        let state = store.sync_state("primary").unwrap().unwrap();
        assert_eq!(state.lock_owner, None);
        assert_eq!(state.last_success_at, Some(ts(1)));
        assert_eq!(state.last_failure_at, Some(ts(2)));
        assert_eq!(state.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_release_by_other_owner_is_ignored() {
        let temp = temp_store();
        let store = &temp.store;

        assert!(store.try_acquire_lock("primary", "a", ts(1), Duration::from_secs(60)).unwrap());
        assert!(!store.complete_run("primary", "b", ts(1)).unwrap());
        assert!(!store.fail_run("primary", "b", ts(1), "late").unwrap());

        let state = store.sync_state("primary").unwrap().unwrap();
        assert_eq!(state.lock_owner.as_deref(), Some("a"));
        assert_eq!(state.last_success_at, None);
        assert_eq!(state.last_error, None);
        assert!(store.sync_state("unknown").unwrap().is_none());
    }

    #[test]
    fn test_pooled_connections_use_wal_and_foreign_keys() {
        let temp = temp_store();
        let conn = temp.store.conn().unwrap();

        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        let fks: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fks, 1);
    }
}
