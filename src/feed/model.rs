//! Normalized feed entities produced by the parser.
//!
//! These are closed types with explicit optionality. A parse run always builds
//! fresh values; nothing here is patched in place after normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Value-Split
// ============================================================================

/// Payment network declared by a `podcast:value` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Lightning,
}

/// Lightning addressing method of a value block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueMethod {
    Keysend,
    Lnaddress,
}

/// How a single recipient is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientType {
    Node,
    Lnaddress,
}

/// One entry of a value split.
///
/// `split` is the declared share, kept exactly as the feed states it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRecipient {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: RecipientType,
    pub address: String,
    pub split: u32,
    #[serde(default)]
    pub fee: bool,
    pub custom_key: Option<String>,
    pub custom_value: Option<String>,
}

/// Normalized `podcast:value` declaration.
///
/// Informational only. Splits are never rescaled, so their sum may differ
/// from 100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueSplit {
    #[serde(rename = "type")]
    pub kind: ValueType,
    pub method: ValueMethod,
    pub suggested: Option<String>,
    pub recipients: Vec<ValueRecipient>,
}

impl ValueSplit {
    /// Sum of all declared recipient splits.
    pub fn split_total(&self) -> u64 {
        self.recipients.iter().map(|r| u64::from(r.split)).sum()
    }
}

// ============================================================================
// Cross-feed references
// ============================================================================

/// A `podcast:remoteItem` pointing at another feed. Never resolved eagerly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItem {
    pub feed_url: Option<String>,
    pub feed_guid: Option<String>,
    pub medium: Option<String>,
}

/// Weak reference from an album to its publisher feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherRef {
    pub feed_url: String,
    pub feed_guid: Option<String>,
}

// ============================================================================
// Album / Track / Publisher
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub guid: String,
    pub title: String,
    pub track_number: u32,
    pub duration_seconds: Option<u32>,
    pub audio_url: String,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub explicit: bool,
    /// Track-level split; takes precedence over the album's for this track.
    pub value: Option<ValueSplit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub feed_id: String,
    pub feed_guid: Option<String>,
    pub title: String,
    pub artist: String,
    pub description: String,
    pub cover_art_url: String,
    pub link: Option<String>,
    pub language: Option<String>,
    pub explicit: bool,
    pub release_date: Option<DateTime<Utc>>,
    pub tracks: Vec<Track>,
    pub value: Option<ValueSplit>,
    pub publisher: Option<PublisherRef>,
    pub podroll: Vec<RemoteItem>,
}

impl Album {
    /// The split that applies to a given track: its own, else the album's.
    pub fn effective_value<'a>(&'a self, track: &'a Track) -> Option<&'a ValueSplit> {
        track.value.as_ref().or(self.value.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publisher {
    pub feed_id: String,
    pub feed_guid: Option<String>,
    pub title: String,
    pub artist: String,
    pub description: String,
    pub cover_art_url: String,
    pub link: Option<String>,
    pub value: Option<ValueSplit>,
    pub albums: Vec<RemoteItem>,
}

/// Either normalized entity, tagged as `{"album": ...}` or `{"publisher": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParsedFeed {
    Album(Album),
    Publisher(Publisher),
}

impl ParsedFeed {
    pub fn feed_id(&self) -> &str {
        match self {
            ParsedFeed::Album(a) => &a.feed_id,
            ParsedFeed::Publisher(p) => &p.feed_id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            ParsedFeed::Album(a) => &a.title,
            ParsedFeed::Publisher(p) => &p.title,
        }
    }

    pub fn track_count(&self) -> usize {
        match self {
            ParsedFeed::Album(a) => a.tracks.len(),
            ParsedFeed::Publisher(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(split: u32) -> ValueRecipient {
        ValueRecipient {
            name: None,
            kind: RecipientType::Node,
            address: "03ae9f91a0cb8ff43840e3c322c4c61f019d8c1c3cea15a25cfc425ac605e61a4a".into(),
            split,
            fee: false,
            custom_key: None,
            custom_value: None,
        }
    }

    #[test]
    fn test_split_total_not_rescaled() {
        let value = ValueSplit {
            kind: ValueType::Lightning,
            method: ValueMethod::Lnaddress,
            suggested: None,
            recipients: vec![recipient(60), recipient(50)],
        };
        assert_eq!(value.split_total(), 110);
    }

    #[test]
    fn test_parsed_feed_serializes_with_variant_key() {
        let publisher = Publisher {
            feed_id: "pub-1".into(),
            feed_guid: None,
            title: "Label".into(),
            artist: "Label".into(),
            description: String::new(),
            cover_art_url: String::new(),
            link: None,
            value: None,
            albums: Vec::new(),
        };
        let json = serde_json::to_value(ParsedFeed::Publisher(publisher)).unwrap();
        assert_eq!(json["publisher"]["feedId"], "pub-1");
    }

    #[test]
    fn test_value_split_type_field_name() {
        let value = ValueSplit {
            kind: ValueType::Lightning,
            method: ValueMethod::Keysend,
            suggested: Some("0.00000005000".into()),
            recipients: vec![recipient(100)],
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["type"], "lightning");
        assert_eq!(json["method"], "keysend");
        assert_eq!(json["recipients"][0]["type"], "node");
    }
}
