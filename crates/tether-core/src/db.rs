//! `SQLite` plumbing shared by Tether crates.
//!
//! Provides `DatabaseError`, pool creation helpers, and the conversions
//! between stored unix-second timestamps and `chrono` instants.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// Database errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".into()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Pool over the `SQLite` file at `path`, created along with its parent
/// directory when missing. WAL journaling, enforced foreign keys, 5 s busy timeout.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let url = format!("sqlite:{}?mode=rwc", path.display());
    let options = parse_options(&url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = connect(options, SqlitePoolOptions::new().max_connections(5)).await?;

    info!(path = %path.display(), "Database opened");
    Ok(pool)
}

/// Private in-memory pool for tests.
///
/// One connection that never idles out, so the schema lives as long as the pool.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    let limits = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None);
    connect(parse_options("sqlite::memory:")?, limits).await
}

fn parse_options(url: &str) -> Result<SqliteConnectOptions, DatabaseError> {
    SqliteConnectOptions::from_str(url)
        .map(|o| o.foreign_keys(true))
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

async fn connect(
    options: SqliteConnectOptions,
    limits: SqlitePoolOptions,
) -> Result<Pool<Sqlite>, DatabaseError> {
    limits
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Now, in the unix seconds every table stores.
pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert a stored unix-second timestamp back into an instant.
pub fn to_datetime(secs: i64) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DatabaseError::Corrupt(format!("timestamp {secs} out of range")))
}
