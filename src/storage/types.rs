use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::ParsedFeed;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Another process holds the SQLite lock.
    #[error("Another tunefeed process appears to hold the database. Wait for it to finish and try again.")]
    InstanceLocked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if Self::is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }

    /// SQLITE_BUSY, SQLITE_LOCKED and SQLITE_CANTOPEN all mean another
    /// process has the file.
    pub(crate) fn is_lock_message(message: &str) -> bool {
        let message = message.to_lowercase();
        message.contains("database is locked")
            || message.contains("database table is locked")
            || message.contains("sqlite_busy")
            || message.contains("sqlite_locked")
            || message.contains("unable to open database file")
    }
}

// ============================================================================
// Feed cache
// ============================================================================

/// What the cache holds for a URL: a normalized feed or a failure marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedResult {
    Parsed(ParsedFeed),
    Failed { reason: String },
}

/// A cache row as seen by readers. `stale` is computed at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub feed_url: String,
    pub result: CachedResult,
    pub fetched_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub stale: bool,
}

impl CacheEntry {
    /// The cached feed, unless this entry is a failure marker.
    pub fn parsed(&self) -> Option<&ParsedFeed> {
        match &self.result {
            CachedResult::Parsed(feed) => Some(feed),
            CachedResult::Failed { .. } => None,
        }
    }

    pub fn into_parsed(self) -> Option<ParsedFeed> {
        match self.result {
            CachedResult::Parsed(feed) => Some(feed),
            CachedResult::Failed { .. } => None,
        }
    }

    /// A successful entry still inside its TTL.
    pub fn is_fresh(&self) -> bool {
        !self.stale && self.parsed().is_some()
    }
}

/// Aggregate view over the cache table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: i64,
    pub failed_count: i64,
    pub stale_count: i64,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

// ============================================================================
// Result set
// ============================================================================

/// One row of the persisted result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub feed_id: String,
    pub feed_url: String,
    pub parsed_data: ParsedFeed,
    pub parsed_at: DateTime<Utc>,
    /// Carried forward from the cache because this run's fetch failed.
    pub stale: bool,
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
