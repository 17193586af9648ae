//! Run state store for Scrivener
//!
//! Single source of truth for workflow runs (with their embedded per-file
//! results), tenant credit balances, the job queue and the dead-letter table.
//!
//! Every operation takes an explicit `tenant_id` where tenant data is touched.
//! Counters are only ever changed by SQL arithmetic, never read-modify-written in
//! application memory.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scrivener_db::ScrivenerDb;
//!
//! let db = ScrivenerDb::open("~/.scrivener/scrivener.sqlite").await?;
//! let activation = db.activate_run("tenant-1", "run-1").await?;
//! ```

mod error;
mod schema;
mod types;

// Method implementations organized by domain
mod credits;
mod dead_letter;
mod queue;
mod runs;

pub use error::{DbError, Result};
pub use types::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const MAX_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the Scrivener state store.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct ScrivenerDb {
    pool: SqlitePool,
}

impl ScrivenerDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "State store opened");
        Ok(db)
    }

    /// Open a database from a state store URL (`sqlite:<path>`).
    pub async fn open_url(url: &str) -> Result<Self> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| DbError::invalid_state(format!("Unsupported state store URL: {url}")))?;
        Self::open(path).await
    }

    /// Open a private in-memory database (tests and dry runs).
    ///
    /// Uses a single connection so every query sees the same database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Get the underlying connection pool (escape hatch for tests and tooling).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl ScrivenerDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("state").join("scrivener.sqlite");

        let db = ScrivenerDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());

        db.close().await;
    }

    #[tokio::test]
    async fn test_open_url_rejects_unknown_scheme() {
        let result = ScrivenerDb::open_url("postgres://localhost/scrivener").await;
        assert!(matches!(result, Err(DbError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = ScrivenerDb::open_in_memory().await.unwrap();
        db.ensure_schema().await.unwrap();
    }
}
