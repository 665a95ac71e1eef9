use anyhow::{Context, Result};
use chrono::Utc;

use super::schema::Database;
use super::types::{millis_to_datetime, CacheEntry, CacheStats, CachedResult};
use crate::feed::ParsedFeed;

/// Default freshness window for cache entries (1 hour).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;

type CacheRow = (String, String, String, i64, i64);

fn to_entry(row: CacheRow, now_ms: i64) -> Result<CacheEntry> {
    let (feed_url, status, payload, fetched_at, ttl_seconds) = row;
    let result = if status == "ok" {
        let feed: ParsedFeed = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt cache payload for {feed_url}"))?;
        CachedResult::Parsed(feed)
    } else {
        CachedResult::Failed { reason: payload }
    };
    let ttl_seconds = u64::try_from(ttl_seconds).unwrap_or(0);
    let expires_at = fetched_at.saturating_add((ttl_seconds as i64).saturating_mul(1000));
    Ok(CacheEntry {
        feed_url,
        result,
        fetched_at: millis_to_datetime(fetched_at),
        ttl_seconds,
        stale: now_ms >= expires_at,
    })
}

impl Database {
    // ========================================================================
    // Feed Cache Operations
    // ========================================================================

    /// Cached entry for a feed URL. Stale entries are returned, flagged.
    pub async fn cache_get(&self, feed_url: &str) -> Result<Option<CacheEntry>> {
        let row: Option<CacheRow> = sqlx::query_as(
            r#"
            SELECT feed_url, status, payload, fetched_at, ttl_seconds
            FROM feed_cache
            WHERE feed_url = ?
        "#,
        )
        .bind(feed_url)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| to_entry(r, Utc::now().timestamp_millis()))
            .transpose()
    }

    /// Replaces the entry for `feed_url` with a fresh successful result.
    pub async fn cache_put(&self, feed_url: &str, feed: &ParsedFeed, ttl_seconds: u64) -> Result<()> {
        let payload = serde_json::to_string(feed).context("Failed to serialize parsed feed")?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO feed_cache (feed_url, status, payload, fetched_at, ttl_seconds)
            VALUES (?, 'ok', ?, ?, ?)
        "#,
        )
        .bind(feed_url)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .bind(i64::try_from(ttl_seconds).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a failure marker, unless a successful entry already exists.
    ///
    /// Returns whether the marker was written.
    pub async fn cache_record_failure(
        &self,
        feed_url: &str,
        reason: &str,
        ttl_seconds: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO feed_cache (feed_url, status, payload, fetched_at, ttl_seconds)
            VALUES (?, 'failed', ?, ?, ?)
            ON CONFLICT(feed_url) DO UPDATE SET
                payload = excluded.payload,
                fetched_at = excluded.fetched_at,
                ttl_seconds = excluded.ttl_seconds
            WHERE feed_cache.status = 'failed'
        "#,
        )
        .bind(feed_url)
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(i64::try_from(ttl_seconds).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes one entry, or every entry when `feed_url` is `None`.
    ///
    /// Returns the number of entries removed.
    pub async fn cache_invalidate(&self, feed_url: Option<&str>) -> Result<u64> {
        let result = match feed_url {
            Some(url) => {
                sqlx::query("DELETE FROM feed_cache WHERE feed_url = ?")
                    .bind(url)
                    .execute(&self.pool)
                    .await?
            }
            None => sqlx::query("DELETE FROM feed_cache").execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        let now_ms = Utc::now().timestamp_millis();
        let row: (i64, i64, i64, Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(? >= fetched_at + ttl_seconds * 1000), 0),
                MIN(fetched_at),
                MAX(fetched_at)
            FROM feed_cache
        "#,
        )
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            entry_count: row.0,
            failed_count: row.1,
            stale_count: row.2,
            oldest_entry: row.3.map(millis_to_datetime),
            newest_entry: row.4.map(millis_to_datetime),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::feed::{Album, ParsedFeed};
    use crate::storage::{CachedResult, Database};

    const URL: &str = "https://feeds.example.com/album.xml";

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn album(title: &str) -> ParsedFeed {
        ParsedFeed::Album(Album {
            feed_id: "album-1".into(),
            feed_guid: None,
            title: title.into(),
            artist: "Artist".into(),
            description: String::new(),
            cover_art_url: "https://example.com/cover.jpg".into(),
            link: None,
            language: None,
            explicit: false,
            release_date: None,
            tracks: Vec::new(),
            value: None,
            publisher: None,
            podroll: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let db = test_db().await;
        assert!(db.cache_get(URL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_then_get_fresh() {
        let db = test_db().await;
        db.cache_put(URL, &album("First"), 3600).await.unwrap();

        let entry = db.cache_get(URL).await.unwrap().unwrap();
        assert_eq!(entry.feed_url, URL);
        assert_eq!(entry.ttl_seconds, 3600);
        assert!(!entry.stale);
        assert!(entry.is_fresh());
        assert_eq!(entry.parsed().map(|f| f.title()), Some("First"));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_immediately_stale() {
        let db = test_db().await;
        db.cache_put(URL, &album("First"), 0).await.unwrap();
        let entry = db.cache_get(URL).await.unwrap().unwrap();
        assert!(entry.stale);
        assert!(entry.parsed().is_some());
    }

    #[tokio::test]
    async fn test_put_replaces_wholesale() {
        let db = test_db().await;
        db.cache_put(URL, &album("First"), 3600).await.unwrap();
        db.cache_put(URL, &album("Second"), 60).await.unwrap();

        let entry = db.cache_get(URL).await.unwrap().unwrap();
        assert_eq!(entry.parsed().map(|f| f.title()), Some("Second"));
        assert_eq!(entry.ttl_seconds, 60);
        assert_eq!(db.cache_stats().await.unwrap().entry_count, 1);
    }

    #[tokio::test]
    async fn test_failure_never_evicts_success() {
        let db = test_db().await;
        db.cache_put(URL, &album("Good"), 3600).await.unwrap();

        let written = db.cache_record_failure(URL, "HTTP status 404", 3600).await.unwrap();
        assert!(!written);
        let entry = db.cache_get(URL).await.unwrap().unwrap();
        assert_eq!(entry.parsed().map(|f| f.title()), Some("Good"));
    }

    #[tokio::test]
    async fn test_failure_marker_written_when_absent() {
        let db = test_db().await;
        assert!(db.cache_record_failure(URL, "timed out", 3600).await.unwrap());
        assert!(db.cache_record_failure(URL, "HTTP status 500", 3600).await.unwrap());

        let entry = db.cache_get(URL).await.unwrap().unwrap();
        assert_eq!(
            entry.result,
            CachedResult::Failed {
                reason: "HTTP status 500".into()
            }
        );
        assert!(!entry.is_fresh());

        // A later success replaces the marker.
        db.cache_put(URL, &album("Recovered"), 3600).await.unwrap();
        assert!(db.cache_get(URL).await.unwrap().unwrap().is_fresh());
    }

    #[tokio::test]
    async fn test_invalidate_one_and_all() {
        let db = test_db().await;
        db.cache_put(URL, &album("A"), 3600).await.unwrap();
        db.cache_put("https://feeds.example.com/b.xml", &album("B"), 3600)
            .await
            .unwrap();
        db.cache_record_failure("https://feeds.example.com/c.xml", "boom", 3600)
            .await
            .unwrap();

        assert_eq!(db.cache_invalidate(Some(URL)).await.unwrap(), 1);
        assert_eq!(db.cache_invalidate(Some(URL)).await.unwrap(), 0);
        assert!(db.cache_get(URL).await.unwrap().is_none());

        assert_eq!(db.cache_invalidate(None).await.unwrap(), 2);
        assert_eq!(db.cache_stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let db = test_db().await;
        let empty = db.cache_stats().await.unwrap();
        assert_eq!(empty.entry_count, 0);
        assert!(empty.oldest_entry.is_none());

        db.cache_put(URL, &album("A"), 3600).await.unwrap();
        db.cache_put("https://feeds.example.com/b.xml", &album("B"), 0)
            .await
            .unwrap();
        db.cache_record_failure("https://feeds.example.com/c.xml", "boom", 3600)
            .await
            .unwrap();

        let stats = db.cache_stats().await.unwrap();
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.stale_count, 1);
        assert!(stats.oldest_entry.unwrap() <= stats.newest_entry.unwrap());
    }
}
