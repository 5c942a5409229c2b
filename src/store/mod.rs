//! The persistent store backing the whole refresh-and-cache machinery
//!
//! Everything that must survive a restart or be shared between workers lives
//! here, in a single sqlite database: the planning catalog, the per-planning
//! event backups and the refresh queue. The store is the single source of
//! truth; in-memory state elsewhere in this crate is advisory only.
//!
//! Operations are split by table:
//! * [`catalog`]: the `plannings` table
//! * [`backup`]: the `planning_backups` table
//! * [`queue`]: the `refresh_queue` table

pub mod backup;
pub mod catalog;
pub mod queue;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Environment variable holding the path of the sqlite file.
pub const DB_PATH_ENV: &str = "PANTRY_DB";
/// Overrides the sqlite busy timeout (milliseconds, default 5000).
pub const BUSY_MS_ENV: &str = "PANTRY_SQLITE_BUSY_MS";

/// Handle to the sqlite database. Cheap to clone; every operation opens its
/// own short-lived connection, so clones can be used from any number of
/// tasks.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Opens (and initializes, on first use) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if parent.as_os_str().is_empty() == false {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("unable to create {:?}", parent))?;
            }
        }

        let store = Self {
            db_path: PathBuf::from(path),
        };
        let conn = store.conn()?;
        // Pragmas tuned for concurrent server usage
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;
        Ok(store)
    }

    /// Opens the database at the path named by `PANTRY_DB`.
    ///
    /// This is the startup entry point for services: a missing variable is a
    /// configuration error and fails fast rather than limping along without
    /// persistence.
    pub fn open_from_env() -> Result<Self> {
        let path = std::env::var(DB_PATH_ENV)
            .map_err(|_| anyhow!("{} is not set; refusing to start without a database", DB_PATH_ENV))?;
        Self::open(Path::new(&path))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        let busy_ms: u64 = std::env::var(BUSY_MS_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        // Cascades from plannings to backups and queue rows rely on this
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS plannings (
              full_id TEXT PRIMARY KEY,
              planning_id TEXT NOT NULL,
              title TEXT NOT NULL,
              url TEXT,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS planning_backups (
              planning_full_id TEXT PRIMARY KEY
                REFERENCES plannings(full_id) ON DELETE CASCADE,
              events TEXT NOT NULL,
              signature TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS refresh_queue (
              planning_full_id TEXT PRIMARY KEY
                REFERENCES plannings(full_id) ON DELETE CASCADE,
              priority INTEGER NOT NULL DEFAULT 0,
              attempts INTEGER NOT NULL DEFAULT 0,
              requested_at TEXT NOT NULL,
              next_attempt_at TEXT NOT NULL,
              locked_at TEXT,
              lock_owner TEXT,
              last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_refresh_queue_due
              ON refresh_queue(next_attempt_at);
            "#,
        )?;
        Ok(())
    }

    /// Offloads a blocking sqlite operation from the async executor.
    pub(crate) async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Store) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(store))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

/// All timestamps are stored as RFC 3339 UTC strings with millisecond
/// precision. With a single producer format, lexicographic comparison in SQL
/// is chronological comparison.
pub(crate) fn to_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

pub(crate) fn parse_rfc3339(text: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid stored timestamp {:?}", text))?;
    Ok(parsed.with_timezone(&Utc))
}
