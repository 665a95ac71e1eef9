use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feed::ParsedFeed;

/// Where a single feed's processing is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStage {
    Pending,
    Fetching,
    Extracting,
    Normalizing,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportError {
    pub feed_id: String,
    /// Stage the feed failed in.
    pub stage: FeedStage,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportWarning {
    pub feed_id: String,
    pub message: String,
}

/// Aggregate outcome of one batch run.
///
/// Built privately by the orchestrator and only handed out once finalized.
/// `total_feeds` counts dispatched feeds, so
/// `successful_parses + failed_parses == total_feeds`; feeds never
/// dispatched because of cancellation are listed in `skipped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseReport {
    pub total_feeds: usize,
    pub successful_parses: usize,
    pub failed_parses: usize,
    pub albums_found: usize,
    pub publishers_found: usize,
    pub total_tracks: usize,
    pub parse_time_ms: u64,
    /// Completion order.
    pub errors: Vec<ReportError>,
    pub warnings: Vec<ReportWarning>,
    pub skipped: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ParseReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            total_feeds: 0,
            successful_parses: 0,
            failed_parses: 0,
            albums_found: 0,
            publishers_found: 0,
            total_tracks: 0,
            parse_time_ms: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            skipped: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    pub(crate) fn record_success(&mut self, feed_id: &str, parsed: &ParsedFeed, warnings: Vec<String>) {
        self.total_feeds += 1;
        self.successful_parses += 1;
        match parsed {
            ParsedFeed::Album(album) => {
                self.albums_found += 1;
                self.total_tracks += album.tracks.len();
            }
            ParsedFeed::Publisher(_) => self.publishers_found += 1,
        }
        self.warnings.extend(warnings.into_iter().map(|message| ReportWarning {
            feed_id: feed_id.to_string(),
            message,
        }));
    }

    pub(crate) fn record_failure(&mut self, feed_id: &str, stage: FeedStage, error: String) {
        self.total_feeds += 1;
        self.failed_parses += 1;
        self.errors.push(ReportError {
            feed_id: feed_id.to_string(),
            stage,
            error,
        });
    }

    pub(crate) fn record_skipped(&mut self, feed_id: &str) {
        self.skipped.push(feed_id.to_string());
    }

    pub(crate) fn finalize(&mut self, finished_at: DateTime<Utc>, elapsed: std::time::Duration) {
        self.finished_at = finished_at;
        self.parse_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    /// True when every dispatched feed is accounted for exactly once.
    pub fn is_consistent(&self) -> bool {
        self.successful_parses + self.failed_parses == self.total_feeds
            && self.errors.len() == self.failed_parses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Album, Publisher};

    fn album(tracks: usize) -> ParsedFeed {
        let track = crate::feed::Track {
            guid: "g".into(),
            title: "t".into(),
            track_number: 1,
            duration_seconds: None,
            audio_url: "https://e.com/a.mp3".into(),
            image_url: None,
            published_at: None,
            explicit: false,
            value: None,
        };
        ParsedFeed::Album(Album {
            feed_id: "a".into(),
            feed_guid: None,
            title: "A".into(),
            artist: "B".into(),
            description: String::new(),
            cover_art_url: String::new(),
            link: None,
            language: None,
            explicit: false,
            release_date: None,
            tracks: vec![track; tracks],
            value: None,
            publisher: None,
            podroll: Vec::new(),
        })
    }

    fn publisher() -> ParsedFeed {
        ParsedFeed::Publisher(Publisher {
            feed_id: "p".into(),
            feed_guid: None,
            title: "P".into(),
            artist: "P".into(),
            description: String::new(),
            cover_art_url: String::new(),
            link: None,
            value: None,
            albums: Vec::new(),
        })
    }

    #[test]
    fn test_counts_accumulate_from_successes_only() {
        let mut report = ParseReport::new(Utc::now());
        report.record_success("a", &album(3), vec!["Dropped item 2".into()]);
        report.record_success("p", &publisher(), Vec::new());
        report.record_failure("x", FeedStage::Fetching, "HTTP status 404".into());
        report.record_skipped("y");

        assert_eq!(report.total_feeds, 3);
        assert_eq!(report.successful_parses, 2);
        assert_eq!(report.failed_parses, 1);
        assert_eq!(report.albums_found, 1);
        assert_eq!(report.publishers_found, 1);
        assert_eq!(report.total_tracks, 3);
        assert_eq!(report.warnings[0].feed_id, "a");
        assert_eq!(report.skipped, vec!["y".to_string()]);
        assert!(report.is_consistent());
    }

    #[test]
    fn test_serialized_shape() {
        let mut report = ParseReport::new(Utc::now());
        report.record_failure("x", FeedStage::Extracting, "Malformed document".into());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["failedParses"], 1);
        assert_eq!(json["errors"][0]["feedId"], "x");
        assert_eq!(json["errors"][0]["stage"], "extracting");
        assert!(json.get("parseTimeMs").is_some());
    }
}
