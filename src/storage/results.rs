use anyhow::{Context, Result};

use super::schema::Database;
use super::types::{millis_to_datetime, StoredResult};
use crate::feed::ParsedFeed;
use crate::pipeline::ParseReport;

type ResultRow = (String, String, String, i64, bool);

fn to_stored(row: ResultRow) -> Result<StoredResult> {
    let (feed_id, feed_url, payload, parsed_at, stale) = row;
    let parsed_data: ParsedFeed = serde_json::from_str(&payload)
        .with_context(|| format!("Corrupt stored result for feed {feed_id}"))?;
    Ok(StoredResult {
        feed_id,
        feed_url,
        parsed_data,
        parsed_at: millis_to_datetime(parsed_at),
        stale,
    })
}

fn kind_of(feed: &ParsedFeed) -> &'static str {
    match feed {
        ParsedFeed::Album(_) => "album",
        ParsedFeed::Publisher(_) => "publisher",
    }
}

impl Database {
    // ========================================================================
    // Result Set Operations
    // ========================================================================

    /// Replaces the whole result set in one transaction.
    ///
    /// Readers see either the previous set or the new one, never a mix.
    pub async fn replace_results(&self, results: &[StoredResult]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM parsed_results")
            .execute(&mut *tx)
            .await?;

        for (position, result) in results.iter().enumerate() {
            let payload = serde_json::to_string(&result.parsed_data)
                .context("Failed to serialize parsed feed")?;
            sqlx::query(
                r#"
                INSERT INTO parsed_results (feed_id, feed_url, kind, payload, parsed_at, stale, position)
                VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&result.feed_id)
            .bind(&result.feed_url)
            .bind(kind_of(&result.parsed_data))
            .bind(payload)
            .bind(result.parsed_at.timestamp_millis())
            .bind(result.stale)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Inserts or replaces a single result, keeping its position when it
    /// already exists and appending otherwise.
    pub async fn upsert_result(&self, result: &StoredResult) -> Result<()> {
        let payload = serde_json::to_string(&result.parsed_data)
            .context("Failed to serialize parsed feed")?;
        sqlx::query(
            r#"
            INSERT INTO parsed_results (feed_id, feed_url, kind, payload, parsed_at, stale, position)
            VALUES (?, ?, ?, ?, ?, ?, (SELECT COALESCE(MAX(position) + 1, 0) FROM parsed_results))
            ON CONFLICT(feed_id) DO UPDATE SET
                feed_url = excluded.feed_url,
                kind = excluded.kind,
                payload = excluded.payload,
                parsed_at = excluded.parsed_at,
                stale = excluded.stale
        "#,
        )
        .bind(&result.feed_id)
        .bind(&result.feed_url)
        .bind(kind_of(&result.parsed_data))
        .bind(payload)
        .bind(result.parsed_at.timestamp_millis())
        .bind(result.stale)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every stored result, in the order the last run produced them.
    pub async fn list_results(&self) -> Result<Vec<StoredResult>> {
        let rows: Vec<ResultRow> = sqlx::query_as(
            r#"
            SELECT feed_id, feed_url, payload, parsed_at, stale
            FROM parsed_results
            ORDER BY position
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(to_stored).collect()
    }

    pub async fn get_result(&self, feed_id: &str) -> Result<Option<StoredResult>> {
        let row: Option<ResultRow> = sqlx::query_as(
            r#"
            SELECT feed_id, feed_url, payload, parsed_at, stale
            FROM parsed_results
            WHERE feed_id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(to_stored).transpose()
    }

    // ========================================================================
    // Run Reports
    // ========================================================================

    /// Appends a finalized run report and returns its row id.
    pub async fn save_report(&self, report: &ParseReport) -> Result<i64> {
        let json = serde_json::to_string(report).context("Failed to serialize parse report")?;
        let result = sqlx::query(
            "INSERT INTO parse_runs (started_at, finished_at, report) VALUES (?, ?, ?)",
        )
        .bind(report.started_at.timestamp_millis())
        .bind(report.finished_at.timestamp_millis())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// The most recently saved run report.
    pub async fn last_report(&self) -> Result<Option<ParseReport>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT report FROM parse_runs ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(json,)| serde_json::from_str(&json).context("Corrupt stored parse report"))
            .transpose()
    }
}
