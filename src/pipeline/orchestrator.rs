//! Batch Orchestrator: runs fetch → extract → normalize for registry feeds.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::report::{FeedStage, ParseReport};
use crate::feed::xml;
use crate::feed::{
    FetchError, Fetcher, MalformedDocumentError, NormalizationError, Normalized, Normalizer,
    ParsedFeed,
};
use crate::registry::{FeedDescriptor, FeedKind, Registry};
use crate::storage::{Database, StoredResult, DEFAULT_CACHE_TTL_SECONDS};

pub const DEFAULT_CONCURRENCY: usize = 10;

/// Why one feed's pipeline stopped.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Malformed(#[from] MalformedDocumentError),
    #[error(transparent)]
    Normalize(#[from] NormalizationError),
}

impl PipelineError {
    /// The stage that was running when the pipeline failed.
    pub fn stage(&self) -> FeedStage {
        match self {
            PipelineError::Fetch(_) => FeedStage::Fetching,
            PipelineError::Malformed(_) => FeedStage::Extracting,
            PipelineError::Normalize(_) => FeedStage::Normalizing,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunOneError {
    #[error("Unknown feed id '{0}'")]
    UnknownFeed(String),

    #[error("Feed {feed_id} failed with no cached result to fall back on: {source}")]
    Failed {
        feed_id: String,
        #[source]
        source: PipelineError,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum feeds in flight at once.
    pub concurrency: usize,
    pub cache_ttl_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
        }
    }
}

enum FeedOutcome {
    Done(Result<Normalized<ParsedFeed>, PipelineError>),
    Skipped,
}

/// Drives registry feeds through the pipeline and owns the cache and
/// result-set writes. Constructed once and shared by reference.
pub struct Orchestrator {
    registry: Arc<Registry>,
    db: Database,
    fetcher: Fetcher,
    normalizer: Normalizer,
    config: OrchestratorConfig,
}

/// Fetches, parses and normalizes one feed. Touches no shared state.
async fn process_feed(
    fetcher: &Fetcher,
    normalizer: &Normalizer,
    feed: &FeedDescriptor,
) -> Result<Normalized<ParsedFeed>, PipelineError> {
    tracing::debug!(feed_id = %feed.id, stage = ?FeedStage::Fetching, url = %feed.original_url, "Feed stage");
    let text = fetcher.fetch(&feed.original_url).await?;

    tracing::debug!(feed_id = %feed.id, stage = ?FeedStage::Extracting, bytes = text.len(), "Feed stage");
    let doc = xml::parse(&text)?;

    tracing::debug!(feed_id = %feed.id, stage = ?FeedStage::Normalizing, elements = doc.element_count(), "Feed stage");
    let normalized = match feed.kind {
        FeedKind::Album => normalizer
            .normalize_album(&doc, &feed.id)?
            .map(ParsedFeed::Album),
        FeedKind::Publisher => normalizer
            .normalize_publisher(&doc, &feed.id)?
            .map(ParsedFeed::Publisher),
    };
    Ok(normalized)
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        db: Database,
        fetcher: Fetcher,
        normalizer: Normalizer,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            db,
            fetcher,
            normalizer,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Runs every active feed once. See [`Orchestrator::run_all_with_cancel`].
    pub async fn run_all(&self) -> anyhow::Result<ParseReport> {
        self.run_all_with_cancel(&CancellationToken::new()).await
    }

    /// Runs every active feed of the registry snapshot once, isolating
    /// per-feed failures.
    ///
    /// Cancelling `cancel` stops dispatch of further feeds; feeds already in
    /// flight finish normally and the rest are reported as skipped.
    ///
    /// Successful results replace their cache entries; failures leave a
    /// failure marker only where nothing better is cached. The persisted
    /// result set is replaced in one transaction and carries forward the
    /// cached result of any feed that failed this time, flagged stale.
    ///
    /// # Errors
    ///
    /// Fails only when the result set or the report cannot be written.
    pub async fn run_all_with_cancel(&self, cancel: &CancellationToken) -> anyhow::Result<ParseReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let snapshot = self.registry.list_active(None).await;
        let mut report = ParseReport::new(started_at);

        tracing::info!(feeds = snapshot.len(), concurrency = self.config.concurrency, "Starting parse run");

        let fetcher = &self.fetcher;
        let normalizer = &self.normalizer;
        let mut outcomes = stream::iter(snapshot.iter().enumerate())
            .map(move |(index, feed)| async move {
                // Checked when the slot opens, so feeds pulled after
                // cancellation are never started.
                if cancel.is_cancelled() {
                    return (index, feed, FeedOutcome::Skipped);
                }
                let result = process_feed(fetcher, normalizer, feed).await;
                (index, feed, FeedOutcome::Done(result))
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut results: Vec<(usize, StoredResult)> = Vec::new();
        while let Some((index, feed, outcome)) = outcomes.next().await {
            match outcome {
                FeedOutcome::Skipped => {
                    tracing::debug!(feed_id = %feed.id, "Skipping feed, run cancelled");
                    report.record_skipped(&feed.id);
                }
                FeedOutcome::Done(Ok(normalized)) => {
                    for warning in &normalized.warnings {
                        tracing::debug!(feed_id = %feed.id, warning = %warning, "Normalization warning");
                    }
                    let parsed = normalized.value;
                    if let Err(e) = self
                        .db
                        .cache_put(&feed.original_url, &parsed, self.config.cache_ttl_seconds)
                        .await
                    {
                        tracing::warn!(feed_id = %feed.id, error = %e, "Failed to cache parsed feed");
                    }
                    report.record_success(&feed.id, &parsed, normalized.warnings);
                    tracing::debug!(feed_id = %feed.id, stage = ?FeedStage::Succeeded, tracks = parsed.track_count(), "Feed stage");
                    results.push((
                        index,
                        StoredResult {
                            feed_id: feed.id.clone(),
                            feed_url: feed.original_url.clone(),
                            parsed_data: parsed,
                            parsed_at: Utc::now(),
                            stale: false,
                        },
                    ));
                }
                FeedOutcome::Done(Err(error)) => {
                    tracing::warn!(feed_id = %feed.id, stage = ?error.stage(), error = %error, "Feed failed");
                    report.record_failure(&feed.id, error.stage(), error.to_string());
                    if let Some(stale) = self.record_failure(feed, &error).await {
                        results.push((index, stale));
                    }
                }
            }
        }
        drop(outcomes);

        // Registry order, so unchanged input gives an identical set.
        results.sort_by_key(|(index, _)| *index);
        let results: Vec<StoredResult> = results.into_iter().map(|(_, r)| r).collect();
        self.db
            .replace_results(&results)
            .await
            .context("Failed to persist result set")?;

        report.finalize(Utc::now(), started.elapsed());
        self.db
            .save_report(&report)
            .await
            .context("Failed to persist parse report")?;

        tracing::info!(
            total = report.total_feeds,
            succeeded = report.successful_parses,
            failed = report.failed_parses,
            skipped = report.skipped.len(),
            tracks = report.total_tracks,
            elapsed_ms = report.parse_time_ms,
            "Parse run finished"
        );
        Ok(report)
    }

    /// Writes the failure marker and returns the previously cached result
    /// as a stale stored result, if there is one.
    async fn record_failure(&self, feed: &FeedDescriptor, error: &PipelineError) -> Option<StoredResult> {
        if let Err(e) = self
            .db
            .cache_record_failure(&feed.original_url, &error.to_string(), self.config.cache_ttl_seconds)
            .await
        {
            tracing::warn!(feed_id = %feed.id, error = %e, "Failed to record feed failure in cache");
        }

        let entry = match self.db.cache_get(&feed.original_url).await {
            Ok(entry) => entry?,
            Err(e) => {
                tracing::warn!(feed_id = %feed.id, error = %e, "Failed to read cache for fallback");
                return None;
            }
        };
        let fetched_at = entry.fetched_at;
        let parsed = entry.into_parsed()?;
        tracing::warn!(feed_id = %feed.id, cached_at = %fetched_at, "Carrying forward stale cached result");
        Some(StoredResult {
            feed_id: feed.id.clone(),
            feed_url: feed.original_url.clone(),
            parsed_data: parsed,
            parsed_at: fetched_at,
            stale: true,
        })
    }

    /// Parses one registered feed on demand.
    ///
    /// A fresh cache entry is returned without fetching unless `force` is
    /// set. When the pipeline fails, the last successful cached result is
    /// returned instead, however old.
    ///
    /// # Errors
    ///
    /// [`RunOneError::UnknownFeed`] for an id the registry does not know,
    /// [`RunOneError::Failed`] when the pipeline fails and nothing is cached.
    pub async fn run_one(&self, feed_id: &str, force: bool) -> Result<ParsedFeed, RunOneError> {
        let feed = self
            .registry
            .get(feed_id)
            .await
            .ok_or_else(|| RunOneError::UnknownFeed(feed_id.to_string()))?;

        let cached = self.db.cache_get(&feed.original_url).await?;
        if !force {
            if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh()) {
                if let Some(parsed) = entry.parsed() {
                    tracing::debug!(feed_id = %feed.id, "Serving fresh cache entry");
                    return Ok(parsed.clone());
                }
            }
        }

        match process_feed(&self.fetcher, &self.normalizer, &feed).await {
            Ok(normalized) => {
                for warning in &normalized.warnings {
                    tracing::debug!(feed_id = %feed.id, warning = %warning, "Normalization warning");
                }
                let parsed = normalized.value;
                self.db
                    .cache_put(&feed.original_url, &parsed, self.config.cache_ttl_seconds)
                    .await?;
                self.db
                    .upsert_result(&StoredResult {
                        feed_id: feed.id.clone(),
                        feed_url: feed.original_url.clone(),
                        parsed_data: parsed.clone(),
                        parsed_at: Utc::now(),
                        stale: false,
                    })
                    .await?;
                Ok(parsed)
            }
            Err(error) => {
                self.db
                    .cache_record_failure(&feed.original_url, &error.to_string(), self.config.cache_ttl_seconds)
                    .await?;
                match cached.and_then(|entry| entry.into_parsed()) {
                    Some(parsed) => {
                        tracing::warn!(feed_id = %feed.id, error = %error, "Feed failed, serving cached result");
                        Ok(parsed)
                    }
                    None => Err(RunOneError::Failed {
                        feed_id: feed.id,
                        source: error,
                    }),
                }
            }
        }
    }
}
