use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// SQLite-backed store for the feed cache, the parsed result set and run
/// reports. Cloning shares the pool.
#[derive(Clone, Debug)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    ///
    /// `":memory:"` gives a private in-memory database shared by every
    /// connection of this pool.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` when another process holds the
    /// database lock, `DatabaseError::Migration` when the schema cannot be
    /// applied, and `DatabaseError::Other` otherwise.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        #[cfg(unix)]
        if path != ":memory:" {
            restrict_permissions(std::path::Path::new(path));
        }

        let url = format!("sqlite:{}?mode=rwc", path);
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // Single writer; a handful of connections covers concurrent cache reads
        // during a run.
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let message = e.to_string();
            if DatabaseError::is_lock_message(&message) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(message)
            }
        })?;
        Ok(db)
    }

    /// Waits for in-flight queries and closes every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Applies the schema inside one transaction. Every statement is
    /// idempotent, so re-running on an existing database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // fetched_at is unix milliseconds; status 'ok' carries a ParsedFeed
        // JSON payload, 'failed' carries the failure reason.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_cache (
                feed_url TEXT PRIMARY KEY,
                status TEXT NOT NULL CHECK (status IN ('ok', 'failed')),
                payload TEXT NOT NULL,
                fetched_at INTEGER NOT NULL,
                ttl_seconds INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parsed_results (
                feed_id TEXT PRIMARY KEY,
                feed_url TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('album', 'publisher')),
                payload TEXT NOT NULL,
                parsed_at INTEGER NOT NULL,
                stale INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_parsed_results_position ON parsed_results(position)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parse_runs (
                id INTEGER PRIMARY KEY,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                report TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

/// Pre-creates the database file as 0600, or tightens an existing one.
#[cfg(unix)]
fn restrict_permissions(db_path: &std::path::Path) {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if db_path.exists() {
        if let Err(e) = std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %db_path.display(), error = %e, "Failed to set database file permissions");
        }
    } else if db_path.parent().is_some_and(|p| p.as_os_str().is_empty() || p.exists()) {
        // If this fails SQLite reports the real error on connect.
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(db_path);
    }
}
