//! Database connection and initialization.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// How long a query waits for a writer holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lookups run one at a time, so a small pool is plenty.
const MAX_CONNECTIONS: u32 = 4;

/// Certificate store errors.
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
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Current time as Unix seconds.
pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// `SQLite` certificate store.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open or create the store at `path` and bring its schema up to date.
    ///
    /// WAL journaling lets lookups proceed while certificates are written.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let db = Self::connect(options, MAX_CONNECTIONS).await?;
        db.run_migrations().await?;

        info!(path = %path.display(), "Certificate database opened");
        Ok(db)
    }

    /// Open an existing store without write access or migrations.
    ///
    /// Used when another service owns the schema and writes certificates.
    pub async fn open_read_only(path: &Path) -> Result<Self, DatabaseError> {
        if !path.exists() {
            return Err(DatabaseError::Io(format!(
                "Certificate database {} does not exist",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(BUSY_TIMEOUT);
        let db = Self::connect(options, MAX_CONNECTIONS).await?;

        info!(path = %path.display(), "Certificate database opened read-only");
        Ok(db)
    }

    /// Open a private in-memory store (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        // Every in-memory connection is its own database, so keep exactly one.
        let options = SqliteConnectOptions::new().in_memory(true);
        let db = Self::connect(options, 1).await?;
        db.run_migrations().await?;
        Ok(db)
    }

    async fn connect(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, DatabaseError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
