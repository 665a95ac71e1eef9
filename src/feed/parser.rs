//! Normalizes podcast-namespace feed documents into [`Album`] and [`Publisher`].
//!
//! Every field is resolved through an ordered list of extraction rules; the
//! first rule that yields a value wins. Each rule is a plain function over an
//! [`Element`], so rules stay independently testable and new fallbacks slot
//! into the lists without touching the normalizer itself.
//!
//! Only a missing `channel` element fails normalization. Any narrower gap
//! resolves to a default or to absence, and items that cannot become tracks
//! are dropped with a warning.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use super::model::{
    Album, Publisher, PublisherRef, RecipientType, RemoteItem, Track, ValueMethod, ValueRecipient,
    ValueSplit, ValueType,
};
use super::xml::{Document, Element, Ns};
use crate::util::{single_line, strip_control_chars};

/// Default cover art template; `{title}` is replaced with the URL-encoded title.
pub const DEFAULT_PLACEHOLDER_COVER: &str = "https://placehold.co/600x600?text={title}";

const UNTITLED_ALBUM: &str = "Untitled Album";
const UNTITLED_TRACK: &str = "Untitled Track";
const UNKNOWN_ARTIST: &str = "Unknown Artist";

#[derive(Debug, Error)]
#[error("Failed to normalize feed {feed_id}: {reason}")]
pub struct NormalizationError {
    pub feed_id: String,
    pub reason: String,
}

/// A normalized value plus the non-fatal observations made while building it.
#[derive(Debug, Clone)]
pub struct Normalized<T> {
    pub value: T,
    pub warnings: Vec<String>,
}

impl<T> Normalized<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Normalized<U> {
        Normalized {
            value: f(self.value),
            warnings: self.warnings,
        }
    }
}

/// Named extraction rule over an element.
pub type Rule<T> = (&'static str, fn(Element<'_>) -> Option<T>);

/// Applies `rules` in order and returns the first value produced.
pub fn first_match<T>(el: Element<'_>, rules: &[Rule<T>]) -> Option<T> {
    rules.iter().find_map(|(name, rule)| {
        let value = rule(el)?;
        tracing::trace!(rule = name, "Field resolved");
        Some(value)
    })
}

// ============================================================================
// Channel-level rules
// ============================================================================

fn bare_title(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Bare, "title")
}

fn itunes_title(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Itunes, "title")
}

fn itunes_author(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Itunes, "author")
}

fn bare_author(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Bare, "author")
}

fn podcast_person(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Podcast, "person")
}

fn managing_editor(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Bare, "managingEditor")
}

fn bare_description(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Bare, "description")
}

fn itunes_summary(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Itunes, "summary")
}

fn content_encoded(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Content, "encoded")
}

/// `<podcast:image href>`, or the first URL of `<podcast:images srcset>`.
fn podcast_image(el: Element<'_>) -> Option<String> {
    if let Some(href) = el
        .child(Ns::Podcast, "image")
        .and_then(|img| img.attr_trimmed("href").map(str::to_string).or_else(|| non_empty(img.text())))
    {
        return Some(href);
    }
    let srcset = el.child(Ns::Podcast, "images")?.attr_trimmed("srcset")?;
    srcset
        .split(',')
        .filter_map(|candidate| candidate.split_whitespace().next())
        .map(str::to_string)
        .next()
}

fn itunes_image(el: Element<'_>) -> Option<String> {
    el.children_named(Ns::Itunes, "image")
        .find_map(|img| img.attr_trimmed("href").map(str::to_string))
}

/// Standard RSS `<image><url>`.
fn rss_image_url(el: Element<'_>) -> Option<String> {
    el.child(Ns::Bare, "image")?.child_text(Ns::Any, "url")
}

fn pub_date(el: Element<'_>) -> Option<DateTime<Utc>> {
    el.child_text(Ns::Bare, "pubDate").as_deref().and_then(parse_date)
}

fn last_build_date(el: Element<'_>) -> Option<DateTime<Utc>> {
    el.child_text(Ns::Bare, "lastBuildDate").as_deref().and_then(parse_date)
}

/// `<podcast:publisher><podcast:remoteItem feedUrl=…/></podcast:publisher>`
fn publisher_block(el: Element<'_>) -> Option<PublisherRef> {
    el.child(Ns::Podcast, "publisher")?
        .children_named(Ns::Podcast, "remoteItem")
        .find_map(publisher_ref)
}

/// Channel-level `<podcast:remoteItem medium="publisher" feedUrl=…/>`
fn publisher_remote_item(el: Element<'_>) -> Option<PublisherRef> {
    el.children_named(Ns::Podcast, "remoteItem")
        .filter(|item| {
            item.attr_trimmed("medium")
                .is_some_and(|m| m.eq_ignore_ascii_case("publisher"))
        })
        .find_map(publisher_ref)
}

fn publisher_ref(item: Element<'_>) -> Option<PublisherRef> {
    Some(PublisherRef {
        feed_url: item.attr_trimmed("feedUrl")?.to_string(),
        feed_guid: item.attr_trimmed("feedGuid").map(str::to_string),
    })
}

const TITLE_RULES: &[Rule<String>] = &[("title", bare_title), ("itunes:title", itunes_title)];

const ARTIST_RULES: &[Rule<String>] = &[
    ("itunes:author", itunes_author),
    ("author", bare_author),
    ("podcast:person", podcast_person),
    ("managingEditor", managing_editor),
];

const DESCRIPTION_RULES: &[Rule<String>] = &[
    ("description", bare_description),
    ("itunes:summary", itunes_summary),
    ("content:encoded", content_encoded),
];

const IMAGE_RULES: &[Rule<String>] = &[
    ("podcast:image", podcast_image),
    ("itunes:image", itunes_image),
    ("image/url", rss_image_url),
];

const RELEASE_DATE_RULES: &[Rule<DateTime<Utc>>] =
    &[("pubDate", pub_date), ("lastBuildDate", last_build_date)];

const PUBLISHER_RULES: &[Rule<PublisherRef>] = &[
    ("podcast:publisher", publisher_block),
    ("podcast:remoteItem[medium=publisher]", publisher_remote_item),
];

// ============================================================================
// Item-level rules
// ============================================================================

fn enclosure_url(el: Element<'_>) -> Option<String> {
    el.children_named(Ns::Any, "enclosure")
        .find_map(|e| e.attr_trimmed("url").map(str::to_string))
}

fn media_content_url(el: Element<'_>) -> Option<String> {
    el.children_named(Ns::Media, "content")
        .find_map(|e| e.attr_trimmed("url").map(str::to_string))
}

fn itunes_duration(el: Element<'_>) -> Option<u32> {
    el.child_text(Ns::Itunes, "duration").as_deref().and_then(parse_duration)
}

fn podcast_duration(el: Element<'_>) -> Option<u32> {
    el.child_text(Ns::Podcast, "duration").as_deref().and_then(parse_duration)
}

fn podcast_episode(el: Element<'_>) -> Option<u32> {
    el.child_text(Ns::Podcast, "episode").as_deref().and_then(parse_position)
}

fn itunes_episode(el: Element<'_>) -> Option<u32> {
    el.child_text(Ns::Itunes, "episode").as_deref().and_then(parse_position)
}

fn item_guid(el: Element<'_>) -> Option<String> {
    el.child_text(Ns::Bare, "guid")
}

const AUDIO_URL_RULES: &[Rule<String>] = &[
    ("enclosure", enclosure_url),
    ("media:content", media_content_url),
];

const DURATION_RULES: &[Rule<u32>] = &[
    ("itunes:duration", itunes_duration),
    ("podcast:duration", podcast_duration),
];

const TRACK_NUMBER_RULES: &[Rule<u32>] = &[
    ("podcast:episode", podcast_episode),
    ("itunes:episode", itunes_episode),
];

const ITEM_IMAGE_RULES: &[Rule<String>] =
    &[("podcast:image", podcast_image), ("itunes:image", itunes_image)];

// ============================================================================
// Scalar parsing
// ============================================================================

/// Parses `HH:MM:SS`, `MM:SS` or bare seconds into whole seconds.
///
/// Fractional seconds on the last component are truncated. Returns `None`
/// for anything else, including negative values and more than three parts.
pub fn parse_duration(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
    if parts.len() > 3 {
        return None;
    }

    let mut total: u64 = 0;
    for (i, part) in parts.iter().enumerate() {
        let value = if i + 1 == parts.len() {
            parse_seconds(part)?
        } else {
            part.parse::<u64>().ok()?
        };
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    u32::try_from(total).ok()
}

fn parse_seconds(part: &str) -> Option<u64> {
    if let Ok(whole) = part.parse::<u64>() {
        return Some(whole);
    }
    let value: f64 = part.parse().ok()?;
    (value.is_finite() && value >= 0.0).then(|| value.trunc() as u64)
}

fn parse_position(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|&n| n > 0)
}

/// Best-effort date parsing: RFC 2822, then RFC 3339, then RFC 2822 with
/// the weekday dropped (feeds frequently carry a wrong day name).
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .or_else(|| {
            let (_, rest) = raw.split_once(',')?;
            DateTime::parse_from_rfc2822(rest.trim()).ok()
        })
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_flag(raw: Option<String>) -> bool {
    raw.is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "yes" | "true" | "explicit"))
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Strips control characters and surrounding whitespace from feed text.
fn clean(s: String) -> String {
    strip_control_chars(&s).trim().to_string()
}

/// Like [`clean`], with inner whitespace runs collapsed to one space.
fn line(s: String) -> String {
    single_line(&strip_control_chars(&s))
}

// ============================================================================
// Normalizer
// ============================================================================

/// Turns feed documents into normalized entities.
#[derive(Debug, Clone)]
pub struct Normalizer {
    placeholder_cover: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_PLACEHOLDER_COVER)
    }
}

impl Normalizer {
    pub fn new(placeholder_cover: impl Into<String>) -> Self {
        Self {
            placeholder_cover: placeholder_cover.into(),
        }
    }

    /// Generated cover URL for feeds that declare no image.
    pub fn placeholder_cover(&self, title: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(title.as_bytes()).collect();
        self.placeholder_cover.replace("{title}", &encoded)
    }

    /// Normalizes an album feed.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizationError`] only when the document has no `channel`.
    pub fn normalize_album(
        &self,
        doc: &Document,
        feed_id: &str,
    ) -> Result<Normalized<Album>, NormalizationError> {
        let channel = locate_channel(doc, feed_id)?;
        let mut warnings = Vec::new();

        let title = first_match(channel, TITLE_RULES)
            .map(line)
            .unwrap_or_else(|| UNTITLED_ALBUM.to_string());
        let cover_art_url = first_match(channel, IMAGE_RULES)
            .unwrap_or_else(|| self.placeholder_cover(&title));
        let value = channel_value(channel, &mut warnings);
        let base = base_url(channel);

        let mut tracks = Vec::new();
        for (position, item) in channel.children_named(Ns::Bare, "item").enumerate() {
            match build_track(item, base.as_ref(), tracks.len() + 1, &mut warnings) {
                Some(track) => tracks.push(track),
                None => {
                    let item_title = first_match(item, TITLE_RULES).unwrap_or_default();
                    tracing::warn!(
                        feed_id = %feed_id,
                        position = position + 1,
                        title = %item_title,
                        "Dropping item without a usable audio URL"
                    );
                    warnings.push(format!(
                        "Dropped item {} ('{}'): no usable enclosure URL",
                        position + 1,
                        item_title
                    ));
                }
            }
        }

        let album = Album {
            feed_id: feed_id.to_string(),
            feed_guid: channel.child_text(Ns::Podcast, "guid"),
            artist: first_match(channel, ARTIST_RULES)
                .map(line)
                .unwrap_or_else(|| UNKNOWN_ARTIST.to_string()),
            description: first_match(channel, DESCRIPTION_RULES)
                .map(clean)
                .unwrap_or_default(),
            cover_art_url,
            link: channel.child_text(Ns::Bare, "link"),
            language: channel.child_text(Ns::Bare, "language"),
            explicit: parse_flag(channel.child_text(Ns::Itunes, "explicit")),
            release_date: first_match(channel, RELEASE_DATE_RULES),
            tracks,
            value,
            publisher: first_match(channel, PUBLISHER_RULES),
            podroll: podroll(channel),
            title,
        };

        tracing::debug!(
            feed_id = %feed_id,
            tracks = album.tracks.len(),
            warnings = warnings.len(),
            "Normalized album"
        );
        Ok(Normalized {
            value: album,
            warnings,
        })
    }

    /// Normalizes a publisher feed: channel metadata plus the album feeds it
    /// lists as `podcast:remoteItem`s.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizationError`] only when the document has no `channel`.
    pub fn normalize_publisher(
        &self,
        doc: &Document,
        feed_id: &str,
    ) -> Result<Normalized<Publisher>, NormalizationError> {
        let channel = locate_channel(doc, feed_id)?;
        let mut warnings = Vec::new();

        let title = first_match(channel, TITLE_RULES)
            .map(line)
            .unwrap_or_else(|| UNTITLED_ALBUM.to_string());
        let albums: Vec<RemoteItem> = channel
            .children_named(Ns::Podcast, "remoteItem")
            .filter_map(remote_item)
            .filter(|item| {
                !item
                    .medium
                    .as_deref()
                    .is_some_and(|m| m.eq_ignore_ascii_case("publisher"))
            })
            .collect();

        let publisher = Publisher {
            feed_id: feed_id.to_string(),
            feed_guid: channel.child_text(Ns::Podcast, "guid"),
            artist: first_match(channel, ARTIST_RULES)
                .map(line)
                .unwrap_or_else(|| title.clone()),
            description: first_match(channel, DESCRIPTION_RULES)
                .map(clean)
                .unwrap_or_default(),
            cover_art_url: first_match(channel, IMAGE_RULES)
                .unwrap_or_else(|| self.placeholder_cover(&title)),
            link: channel.child_text(Ns::Bare, "link"),
            value: channel_value(channel, &mut warnings),
            albums,
            title,
        };

        Ok(Normalized {
            value: publisher,
            warnings,
        })
    }
}

fn locate_channel<'a>(doc: &'a Document, feed_id: &str) -> Result<Element<'a>, NormalizationError> {
    let root = doc.root();
    if root.is(Ns::Any, "channel") {
        return Ok(root);
    }
    root.child(Ns::Any, "channel")
        .or_else(|| root.descendant(Ns::Any, "channel"))
        .ok_or_else(|| NormalizationError {
            feed_id: feed_id.to_string(),
            reason: format!("no <channel> element under <{}>", root.local_name()),
        })
}

/// Base for resolving relative enclosure URLs: `atom:link rel="self"`, then
/// the channel `link`.
fn base_url(channel: Element<'_>) -> Option<Url> {
    channel
        .children_named(Ns::Atom, "link")
        .filter(|l| l.attr_trimmed("rel").is_some_and(|r| r.eq_ignore_ascii_case("self")))
        .find_map(|l| l.attr_trimmed("href").and_then(|h| Url::parse(h).ok()))
        .or_else(|| {
            channel
                .child_text(Ns::Bare, "link")
                .and_then(|l| Url::parse(&l).ok())
        })
}

/// Resolves an audio URL to an absolute http(s) URL.
fn resolve_audio_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok()?,
        Err(_) => return None,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

fn build_track(
    item: Element<'_>,
    base: Option<&Url>,
    next_position: usize,
    warnings: &mut Vec<String>,
) -> Option<Track> {
    let audio_url = first_match(item, AUDIO_URL_RULES)
        .and_then(|raw| resolve_audio_url(&raw, base))?;

    let title = first_match(item, TITLE_RULES)
        .map(line)
        .unwrap_or_else(|| UNTITLED_TRACK.to_string());
    let published_at = pub_date(item);
    let track_number = first_match(item, TRACK_NUMBER_RULES)
        .unwrap_or_else(|| u32::try_from(next_position).unwrap_or(u32::MAX));
    let guid = item_guid(item)
        .unwrap_or_else(|| generate_guid(&audio_url, &title, published_at.map(|d| d.timestamp())));
    let value = first_value(item, &format!("track '{title}'"), warnings);

    Some(Track {
        guid,
        track_number,
        duration_seconds: first_match(item, DURATION_RULES),
        audio_url,
        image_url: first_match(item, ITEM_IMAGE_RULES),
        published_at,
        explicit: parse_flag(item.child_text(Ns::Itunes, "explicit")),
        value,
        title,
    })
}

/// Stable identifier for items that carry no `<guid>`.
fn generate_guid(audio_url: &str, title: &str, published: Option<i64>) -> String {
    let input = format!(
        "{}|{}|{}",
        audio_url,
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

fn podroll(channel: Element<'_>) -> Vec<RemoteItem> {
    channel
        .child(Ns::Podcast, "podroll")
        .map(|roll| {
            roll.children_named(Ns::Podcast, "remoteItem")
                .filter_map(remote_item)
                .collect()
        })
        .unwrap_or_default()
}

fn remote_item(el: Element<'_>) -> Option<RemoteItem> {
    let item = RemoteItem {
        feed_url: el.attr_trimmed("feedUrl").map(str::to_string),
        feed_guid: el.attr_trimmed("feedGuid").map(str::to_string),
        medium: el.attr_trimmed("medium").map(str::to_string),
    };
    (item.feed_url.is_some() || item.feed_guid.is_some()).then_some(item)
}

// ============================================================================
// Value-split extraction
// ============================================================================

fn channel_value(channel: Element<'_>, warnings: &mut Vec<String>) -> Option<ValueSplit> {
    first_value(channel, "channel", warnings)
}

/// First `podcast:value` child that normalizes to a usable split.
fn first_value(el: Element<'_>, context: &str, warnings: &mut Vec<String>) -> Option<ValueSplit> {
    el.children_named(Ns::Podcast, "value")
        .find_map(|block| value_split(block, context, warnings))
}

/// Normalizes one `podcast:value` block.
///
/// Blocks for other payment types are skipped. A missing `method` means
/// keysend. Recipients are kept in declared order with their splits
/// untouched; a total other than 100 is reported, never corrected.
pub fn value_split(
    block: Element<'_>,
    context: &str,
    warnings: &mut Vec<String>,
) -> Option<ValueSplit> {
    let kind = match block.attr_trimmed("type").map(str::to_ascii_lowercase).as_deref() {
        Some("lightning") => ValueType::Lightning,
        other => {
            tracing::debug!(context = %context, value_type = ?other, "Skipping non-lightning value block");
            return None;
        }
    };
    let method = match block.attr_trimmed("method").map(str::to_ascii_lowercase).as_deref() {
        None | Some("keysend") => ValueMethod::Keysend,
        Some("lnaddress") => ValueMethod::Lnaddress,
        Some(other) => {
            warnings.push(format!("Ignored {context} value block with unknown method '{other}'"));
            return None;
        }
    };

    let recipients: Vec<ValueRecipient> = block
        .children_named(Ns::Podcast, "valueRecipient")
        .filter_map(|r| value_recipient(r, context, warnings))
        .collect();
    if recipients.is_empty() {
        warnings.push(format!("Ignored {context} value block without valid recipients"));
        return None;
    }

    let value = ValueSplit {
        kind,
        method,
        suggested: block.attr_trimmed("suggested").map(str::to_string),
        recipients,
    };
    let total = value.split_total();
    if total != 100 {
        warnings.push(format!(
            "Value split for {context} totals {total}, not 100 (kept as declared)"
        ));
    }
    Some(value)
}

fn value_recipient(
    el: Element<'_>,
    context: &str,
    warnings: &mut Vec<String>,
) -> Option<ValueRecipient> {
    let name = el.attr_trimmed("name").map(|n| line(n.to_string()));
    let label = name.clone().unwrap_or_else(|| "unnamed".to_string());

    let kind = match el.attr_trimmed("type").map(str::to_ascii_lowercase).as_deref() {
        Some("node") => RecipientType::Node,
        Some("lnaddress") => RecipientType::Lnaddress,
        other => {
            warnings.push(format!(
                "Dropped {context} recipient '{label}': unsupported type {other:?}"
            ));
            return None;
        }
    };
    let Some(address) = el.attr_trimmed("address") else {
        warnings.push(format!("Dropped {context} recipient '{label}': missing address"));
        return None;
    };
    let Some(split) = el.attr_trimmed("split").and_then(|s| s.parse::<u32>().ok()) else {
        warnings.push(format!(
            "Dropped {context} recipient '{label}': split {:?} is not a whole number",
            el.attr("split")
        ));
        return None;
    };

    Some(ValueRecipient {
        name,
        kind,
        address: address.to_string(),
        split,
        fee: parse_flag(el.attr_trimmed("fee").map(str::to_string)),
        custom_key: el.attr_trimmed("customKey").map(str::to_string),
        custom_value: el.attr_trimmed("customValue").map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::xml::parse;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const ALBUM_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd"
     xmlns:podcast="https://podcastindex.org/namespace/1.0">
  <channel>
    <title>Night Drive</title>
    <itunes:author>The Headlights</itunes:author>
    <description>Synth album</description>
    <link>https://headlights.example.com/</link>
    <language>en</language>
    <pubDate>Fri, 01 Mar 2024 12:00:00 GMT</pubDate>
    <podcast:guid>917393e3-1b1e-5cef-ace4-edaa54e1f810</podcast:guid>
    <itunes:image href="https://headlights.example.com/cover.jpg"/>
    <podcast:value type="lightning" method="keysend" suggested="0.00000005000">
      <podcast:valueRecipient name="Band" type="node" address="02abc" split="95"/>
      <podcast:valueRecipient name="Host" type="node" address="03def" split="5" fee="true"/>
    </podcast:value>
    <podcast:publisher>
      <podcast:remoteItem medium="publisher" feedGuid="pub-guid" feedUrl="https://label.example.com/publisher.xml"/>
    </podcast:publisher>
    <item>
      <title>Intro</title>
      <guid>track-1</guid>
      <enclosure url="https://headlights.example.com/01.mp3" type="audio/mpeg" length="1"/>
      <itunes:duration>3:45</itunes:duration>
    </item>
    <item>
      <title>Liner Notes</title>
      <guid>notes</guid>
    </item>
    <item>
      <title>Outro</title>
      <enclosure url="https://headlights.example.com/03.mp3" type="audio/mpeg"/>
      <itunes:duration>1:02:03</itunes:duration>
      <podcast:value type="lightning" method="keysend">
        <podcast:valueRecipient name="Guest" type="node" address="04aaa" split="100"/>
      </podcast:value>
    </item>
  </channel>
</rss>"#;

    fn album(xml: &str) -> Normalized<Album> {
        let doc = parse(xml).unwrap();
        Normalizer::default().normalize_album(&doc, "feed-1").unwrap()
    }

    fn channel_of(doc: &Document) -> Element<'_> {
        doc.find(Ns::Any, "channel").unwrap()
    }

    #[test]
    fn test_duration_formats() {
        assert_eq!(parse_duration("3:45"), Some(225));
        assert_eq!(parse_duration("1:02:03"), Some(3723));
        assert_eq!(parse_duration("90"), Some(90));
        assert_eq!(parse_duration(" 00:04:10 "), Some(250));
        assert_eq!(parse_duration("245.6"), Some(245));
    }

    #[test]
    fn test_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("1:2:3:4"), None);
        assert_eq!(parse_duration("-5"), None);
        assert_eq!(parse_duration(":30"), None);
    }

    proptest! {
        #[test]
        fn prop_hms_duration(h in 0u32..100, m in 0u32..60, s in 0u32..60) {
            let raw = format!("{h}:{m:02}:{s:02}");
            prop_assert_eq!(parse_duration(&raw), Some(h * 3600 + m * 60 + s));
        }

        #[test]
        fn prop_ms_duration(m in 0u32..600, s in 0u32..60) {
            let raw = format!("{m}:{s:02}");
            prop_assert_eq!(parse_duration(&raw), Some(m * 60 + s));
        }

        #[test]
        fn prop_bare_seconds(n in 0u32..1_000_000) {
            prop_assert_eq!(parse_duration(&n.to_string()), Some(n));
        }
    }

    #[test]
    fn test_album_metadata() {
        let result = album(ALBUM_FEED);
        let a = &result.value;
        assert_eq!(a.feed_id, "feed-1");
        assert_eq!(a.title, "Night Drive");
        assert_eq!(a.artist, "The Headlights");
        assert_eq!(a.description, "Synth album");
        assert_eq!(a.cover_art_url, "https://headlights.example.com/cover.jpg");
        assert_eq!(a.language.as_deref(), Some("en"));
        assert_eq!(a.feed_guid.as_deref(), Some("917393e3-1b1e-5cef-ace4-edaa54e1f810"));
        assert_eq!(
            a.release_date.map(|d| d.to_rfc3339()),
            Some("2024-03-01T12:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_item_without_enclosure_dropped_and_renumbered() {
        let result = album(ALBUM_FEED);
        let tracks = &result.value.tracks;
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].title, "Intro");
        assert_eq!(tracks[0].track_number, 1);
        assert_eq!(tracks[1].title, "Outro");
        assert_eq!(tracks[1].track_number, 2);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("Dropped item 2") && w.contains("Liner Notes")));
    }

    #[test]
    fn test_track_durations() {
        let result = album(ALBUM_FEED);
        assert_eq!(result.value.tracks[0].duration_seconds, Some(225));
        assert_eq!(result.value.tracks[1].duration_seconds, Some(3723));
    }

    #[test]
    fn test_track_value_overrides_channel_value() {
        let result = album(ALBUM_FEED);
        let a = &result.value;
        let channel_value = a.value.as_ref().unwrap();
        assert_eq!(channel_value.recipients.len(), 2);
        assert_eq!(channel_value.suggested.as_deref(), Some("0.00000005000"));
        assert!(channel_value.recipients[1].fee);

        assert!(a.tracks[0].value.is_none());
        assert_eq!(a.effective_value(&a.tracks[0]), a.value.as_ref());
        let outro = a.effective_value(&a.tracks[1]).unwrap();
        assert_eq!(outro.recipients[0].name.as_deref(), Some("Guest"));
    }

    #[test]
    fn test_publisher_reference_from_publisher_block() {
        let result = album(ALBUM_FEED);
        assert_eq!(
            result.value.publisher,
            Some(PublisherRef {
                feed_url: "https://label.example.com/publisher.xml".into(),
                feed_guid: Some("pub-guid".into()),
            })
        );
    }

    #[test]
    fn test_publisher_reference_from_channel_remote_item() {
        let xml = r#"<rss><channel><title>A</title>
            <podcast:remoteItem medium="music" feedUrl="https://other.example.com/a.xml"/>
            <podcast:remoteItem medium="publisher" feedUrl="https://label.example.com/p.xml"/>
        </channel></rss>"#;
        let doc = parse(xml).unwrap();
        let found = first_match(channel_of(&doc), PUBLISHER_RULES).unwrap();
        assert_eq!(found.feed_url, "https://label.example.com/p.xml");
    }

    #[test]
    fn test_split_sum_mismatch_preserved() {
        let xml = r#"<rss><channel><title>Split</title>
            <podcast:value type="lightning" method="lnaddress">
              <podcast:valueRecipient name="A" type="lnaddress" address="a@getalby.com" split="60"/>
              <podcast:valueRecipient name="B" type="lnaddress" address="b@getalby.com" split="50"/>
            </podcast:value>
        </channel></rss>"#;
        let result = album(xml);
        let value = result.value.value.unwrap();
        assert_eq!(value.method, ValueMethod::Lnaddress);
        let splits: Vec<u32> = value.recipients.iter().map(|r| r.split).collect();
        assert_eq!(splits, vec![60, 50]);
        assert!(result.warnings.iter().any(|w| w.contains("totals 110")));
    }

    #[test]
    fn test_invalid_recipients_dropped() {
        let xml = r#"<rss><channel>
            <podcast:value type="lightning" method="keysend">
              <podcast:valueRecipient name="Ok" type="node" address="02abc" split="90"/>
              <podcast:valueRecipient name="NoAddr" type="node" split="5"/>
              <podcast:valueRecipient name="Frac" type="node" address="02def" split="2.5"/>
              <podcast:valueRecipient name="Weird" type="wallet" address="x" split="5"/>
            </podcast:value>
        </channel></rss>"#;
        let result = album(xml);
        let value = result.value.value.unwrap();
        assert_eq!(value.recipients.len(), 1);
        assert_eq!(value.recipients[0].name.as_deref(), Some("Ok"));
        assert_eq!(result.warnings.iter().filter(|w| w.starts_with("Dropped channel recipient")).count(), 3);
    }

    #[test]
    fn test_non_lightning_value_block_ignored() {
        let xml = r#"<rss><channel>
            <podcast:value type="hive" method="direct">
              <podcast:valueRecipient type="account" address="x" split="100"/>
            </podcast:value>
        </channel></rss>"#;
        assert!(album(xml).value.value.is_none());
    }

    #[test]
    fn test_image_rules_order() {
        let xml = r#"<rss><channel>
            <image><url>https://example.com/rss.jpg</url></image>
            <itunes:image href="https://example.com/itunes.jpg"/>
            <podcast:image href="https://example.com/podcast.jpg"/>
        </channel></rss>"#;
        let doc = parse(xml).unwrap();
        let channel = channel_of(&doc);
        assert_eq!(first_match(channel, IMAGE_RULES).as_deref(), Some("https://example.com/podcast.jpg"));
        assert_eq!(itunes_image(channel).as_deref(), Some("https://example.com/itunes.jpg"));
        assert_eq!(rss_image_url(channel).as_deref(), Some("https://example.com/rss.jpg"));
    }

    #[test]
    fn test_podcast_images_srcset() {
        let xml = r#"<rss><channel>
            <podcast:images srcset="https://example.com/a.jpg 1500w, https://example.com/b.jpg 600w"/>
        </channel></rss>"#;
        let doc = parse(xml).unwrap();
        assert_eq!(podcast_image(channel_of(&doc)).as_deref(), Some("https://example.com/a.jpg"));
    }

    #[test]
    fn test_missing_image_gets_placeholder() {
        let xml = "<rss><channel><title>No Art Here</title></channel></rss>";
        let result = album(xml);
        assert_eq!(
            result.value.cover_art_url,
            "https://placehold.co/600x600?text=No+Art+Here"
        );
    }

    #[test]
    fn test_missing_fields_default() {
        let result = album("<rss><channel></channel></rss>");
        let a = result.value;
        assert_eq!(a.title, UNTITLED_ALBUM);
        assert_eq!(a.artist, UNKNOWN_ARTIST);
        assert_eq!(a.description, "");
        assert!(a.release_date.is_none());
        assert!(a.value.is_none());
        assert!(a.publisher.is_none());
        assert!(a.tracks.is_empty());
    }

    #[test]
    fn test_explicit_episode_numbers_win() {
        let xml = r#"<rss><channel>
            <item><title>B-side</title><podcast:episode>7</podcast:episode><enclosure url="https://e.com/7.mp3"/></item>
            <item><title>Plain</title><enclosure url="https://e.com/x.mp3"/></item>
        </channel></rss>"#;
        let tracks = album(xml).value.tracks;
        assert_eq!(tracks[0].track_number, 7);
        assert_eq!(tracks[1].track_number, 2);
    }

    #[test]
    fn test_relative_enclosure_resolved_against_self_link() {
        let xml = r#"<rss><channel>
            <atom:link rel="self" href="https://cdn.example.com/feeds/album.xml"/>
            <item><title>Rel</title><enclosure url="audio/01.mp3"/></item>
            <item><title>Ftp</title><enclosure url="ftp://example.com/02.mp3"/></item>
        </channel></rss>"#;
        let result = album(xml);
        assert_eq!(result.value.tracks.len(), 1);
        assert_eq!(result.value.tracks[0].audio_url, "https://cdn.example.com/feeds/audio/01.mp3");
    }

    #[test]
    fn test_generated_guid_is_stable() {
        let xml = r#"<rss><channel><item><title>T</title><enclosure url="https://e.com/t.mp3"/></item></channel></rss>"#;
        let first = album(xml).value.tracks[0].guid.clone();
        let second = album(xml).value.tracks[0].guid.clone();
        assert_eq!(first.len(), 64);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_channel_is_error() {
        let doc = parse(r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>Atom</title></feed>"#).unwrap();
        let err = Normalizer::default().normalize_album(&doc, "atom-1").unwrap_err();
        assert_eq!(err.feed_id, "atom-1");
        assert!(err.to_string().contains("no <channel>"));
    }

    #[test]
    fn test_deep_tree_without_channel_is_error() {
        let levels = crate::feed::xml::MAX_DEPTH - 1;
        let xml = format!("<rss>{}</rss>", "<a>".repeat(levels));
        let doc = parse(&xml).unwrap();
        let err = Normalizer::default().normalize_album(&doc, "deep").unwrap_err();
        assert!(err.to_string().contains("no <channel> element under <rss>"));
    }

    #[test]
    fn test_normalize_publisher() {
        let xml = r#"<rss xmlns:podcast="https://podcastindex.org/namespace/1.0"><channel>
            <title>Indie Label</title>
            <podcast:medium>publisher</podcast:medium>
            <podcast:remoteItem medium="music" feedGuid="g1" feedUrl="https://e.com/a1.xml"/>
            <podcast:remoteItem medium="music" feedGuid="g2" feedUrl="https://e.com/a2.xml"/>
            <podcast:remoteItem medium="publisher" feedUrl="https://e.com/self.xml"/>
            <podcast:remoteItem medium="music"/>
        </channel></rss>"#;
        let doc = parse(xml).unwrap();
        let result = Normalizer::default().normalize_publisher(&doc, "pub-1").unwrap();
        let p = result.value;
        assert_eq!(p.title, "Indie Label");
        assert_eq!(p.artist, "Indie Label");
        assert_eq!(p.albums.len(), 2);
        assert_eq!(p.albums[1].feed_guid.as_deref(), Some("g2"));
    }

    #[test]
    fn test_date_with_wrong_weekday() {
        assert!(parse_date("Mon, 01 Mar 2024 12:00:00 GMT").is_some());
        assert!(parse_date("2024-03-01T12:00:00Z").is_some());
        assert!(parse_date("yesterday").is_none());
    }

    #[test]
    fn test_control_characters_stripped_from_titles() {
        let xml = "<rss><channel><title>Bad\u{1b}[31mTitle</title></channel></rss>";
        assert_eq!(album(xml).value.title, "BadTitle");
    }

    #[test]
    fn test_podroll_collected() {
        let xml = r#"<rss><channel><podcast:podroll>
            <podcast:remoteItem feedGuid="a"/><podcast:remoteItem feedUrl="https://e.com/b.xml"/><podcast:remoteItem/>
        </podcast:podroll></channel></rss>"#;
        assert_eq!(album(xml).value.podroll.len(), 2);
    }
}
