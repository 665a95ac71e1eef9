//! OPML subscription lists, read for bulk feed registration.

use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::util::validate_feed_url;

/// Nesting limit for `<outline>` elements.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),
}

/// One `<outline>` carrying an `xmlUrl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlEntry {
    /// `title`, else `text`, else the URL itself.
    pub title: String,
    pub xml_url: String,
}

/// Reads an OPML file and returns its feed outlines.
///
/// Outlines whose URL fails validation are skipped with a warning.
pub async fn read_opml(path: &std::path::Path, allow_private: bool) -> Result<Vec<OpmlEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_opml(&content, allow_private)
}

/// Parses OPML text. Folder outlines are walked but not returned.
///
/// `quick-xml` never expands `<!ENTITY>` declarations, so custom entities in
/// attribute values surface as errors rather than being resolved.
pub fn parse_opml(content: &str, allow_private: bool) -> Result<Vec<OpmlEntry>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut depth: usize = 0;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?;
        match event {
            Event::Start(e) if e.local_name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                entries.extend(outline_entry(&e, &reader, allow_private)?);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"outline" => {
                entries.extend(outline_entry(&e, &reader, allow_private)?);
            }
            Event::End(e) if e.local_name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

fn outline_entry(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    allow_private: bool,
) -> Result<Option<OpmlEntry>> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;

    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|err| OpmlError::XmlParse(err.to_string()))?;
        match attr.key.local_name().as_ref() {
            b"xmlUrl" => xml_url = Some(value.trim().to_string()),
            b"title" => title = Some(value.trim().to_string()),
            b"text" => text = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let Some(url) = xml_url.filter(|u| !u.is_empty()) else {
        return Ok(None);
    };
    if let Err(err) = validate_feed_url(&url, allow_private) {
        tracing::warn!(url = %url, error = %err, "Skipping invalid feed URL in OPML");
        return Ok(None);
    }

    let title = title
        .filter(|t| !t.is_empty())
        .or(text.filter(|t| !t.is_empty()))
        .unwrap_or_else(|| url.clone());
    Ok(Some(OpmlEntry {
        title,
        xml_url: url,
    }))
}
