//! Permissive XML document tree for real-world feeds.
//!
//! Feeds in the wild are routinely broken: bare `&` in titles, HTML entities
//! like `&nbsp;`, end tags that do not match, namespace prefixes used without
//! an `xmlns` declaration, and documents truncated mid-transfer. The builder
//! here reads `quick-xml` events with end-name checking disabled and keeps
//! whatever tree it managed to assemble. Only input with no usable root
//! element is rejected.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Errors for input that cannot be recovered as an XML document at all.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedDocumentError {
    #[error("Malformed document: response body is empty")]
    Empty,

    #[error("Malformed document: received an HTML page instead of a feed")]
    Html,

    #[error("Malformed document: no root element ({0})")]
    NoRoot(String),

    #[error("Malformed document: nesting depth exceeds maximum of {0} levels")]
    TooDeep(usize),
}

/// Deepest element nesting accepted. Real feeds stay under ten levels.
pub const MAX_DEPTH: usize = 256;

// ============================================================================
// Namespaces
// ============================================================================

/// Namespace filter used by element lookups.
///
/// A named namespace matches an element whose prefix resolves to one of the
/// namespace's known URIs, or whose literal prefix is the conventional one
/// (feeds often forget to declare `xmlns:podcast`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ns {
    /// Match on local name only.
    Any,
    /// Unprefixed elements only.
    Bare,
    Podcast,
    Itunes,
    Atom,
    Media,
    Content,
}

impl Ns {
    fn conventional_prefix(self) -> Option<&'static str> {
        match self {
            Ns::Any | Ns::Bare => None,
            Ns::Podcast => Some("podcast"),
            Ns::Itunes => Some("itunes"),
            Ns::Atom => Some("atom"),
            Ns::Media => Some("media"),
            Ns::Content => Some("content"),
        }
    }

    fn uris(self) -> &'static [&'static str] {
        match self {
            Ns::Any | Ns::Bare => &[],
            Ns::Podcast => &[
                "podcastindex.org/namespace/1.0",
                "github.com/Podcastindex-org/podcast-namespace/blob/main/docs/1.0.md",
            ],
            Ns::Itunes => &["www.itunes.com/dtds/podcast-1.0.dtd"],
            Ns::Atom => &["www.w3.org/2005/Atom"],
            Ns::Media => &["search.yahoo.com/mrss"],
            Ns::Content => &["purl.org/rss/1.0/modules/content"],
        }
    }

    fn matches(self, node: &NodeData) -> bool {
        match self {
            Ns::Any => true,
            Ns::Bare => node.prefix.is_none(),
            ns => {
                let by_uri = node
                    .namespace
                    .as_deref()
                    .map(|uri| ns.uris().iter().any(|known| uri_matches(uri, known)))
                    .unwrap_or(false);
                by_uri || (node.prefix.is_some() && node.prefix.as_deref() == ns.conventional_prefix())
            }
        }
    }
}

/// Compares a declared namespace URI against a scheme-less known URI,
/// ignoring scheme, letter case and a trailing slash.
fn uri_matches(declared: &str, known: &str) -> bool {
    let declared = declared.trim();
    let declared = declared
        .strip_prefix("https://")
        .or_else(|| declared.strip_prefix("http://"))
        .unwrap_or(declared)
        .trim_end_matches('/');
    declared.eq_ignore_ascii_case(known)
}

// ============================================================================
// Tree storage
// ============================================================================

#[derive(Debug)]
struct Attr {
    local: String,
    value: String,
}

#[derive(Debug)]
enum Child {
    Element(usize),
    Text(String),
}

#[derive(Debug)]
struct NodeData {
    prefix: Option<String>,
    local: String,
    namespace: Option<String>,
    attrs: Vec<Attr>,
    children: Vec<Child>,
}

/// A parsed feed document. Immutable once built.
#[derive(Debug)]
pub struct Document {
    nodes: Vec<NodeData>,
    root: usize,
}

/// Borrowed handle to one element of a [`Document`].
#[derive(Clone, Copy)]
pub struct Element<'a> {
    doc: &'a Document,
    idx: usize,
}

impl std::fmt::Debug for Element<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("prefix", &self.prefix())
            .field("local", &self.local_name())
            .finish()
    }
}

impl Document {
    /// The document's root element.
    pub fn root(&self) -> Element<'_> {
        Element {
            doc: self,
            idx: self.root,
        }
    }

    /// First element in document order (root included) matching `ns:local`.
    pub fn find(&self, ns: Ns, local: &str) -> Option<Element<'_>> {
        let root = self.root();
        if root.is(ns, local) {
            return Some(root);
        }
        root.descendant(ns, local)
    }

    /// Number of elements in the tree.
    pub fn element_count(&self) -> usize {
        self.nodes.len()
    }
}

impl<'a> Element<'a> {
    fn data(&self) -> &'a NodeData {
        &self.doc.nodes[self.idx]
    }

    pub fn local_name(&self) -> &'a str {
        &self.data().local
    }

    pub fn prefix(&self) -> Option<&'a str> {
        self.data().prefix.as_deref()
    }

    /// Resolved namespace URI, if the prefix was declared.
    pub fn namespace(&self) -> Option<&'a str> {
        self.data().namespace.as_deref()
    }

    /// True when this element is `local` (ASCII case-insensitive) in `ns`.
    pub fn is(&self, ns: Ns, local: &str) -> bool {
        let data = self.data();
        data.local.eq_ignore_ascii_case(local) && ns.matches(data)
    }

    /// Attribute value by local name, ignoring any prefix.
    pub fn attr(&self, local: &str) -> Option<&'a str> {
        self.data()
            .attrs
            .iter()
            .find(|a| a.local.eq_ignore_ascii_case(local))
            .map(|a| a.value.as_str())
    }

    /// Attribute value trimmed, `None` when missing or blank.
    pub fn attr_trimmed(&self, local: &str) -> Option<&'a str> {
        self.attr(local).map(str::trim).filter(|v| !v.is_empty())
    }

    /// Concatenated text of this element and its descendants, trimmed.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out.trim().to_string()
    }

    fn collect_text(&self, out: &mut String) {
        let mut stack = vec![self.data().children.iter()];
        loop {
            let next = match stack.last_mut() {
                Some(siblings) => siblings.next(),
                None => return,
            };
            match next {
                Some(Child::Text(t)) => out.push_str(t),
                Some(Child::Element(idx)) => stack.push(self.doc.nodes[*idx].children.iter()),
                None => {
                    stack.pop();
                }
            }
        }
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = Element<'a>> + 'a {
        let doc = self.doc;
        self.data().children.iter().filter_map(move |c| match c {
            Child::Element(idx) => Some(Element { doc, idx: *idx }),
            Child::Text(_) => None,
        })
    }

    /// First child matching `ns:local`.
    pub fn child(&self, ns: Ns, local: &str) -> Option<Element<'a>> {
        self.children().find(|c| c.is(ns, local))
    }

    /// All children matching `ns:local`, in document order.
    pub fn children_named<'n>(
        &self,
        ns: Ns,
        local: &'n str,
    ) -> impl Iterator<Item = Element<'a>> + 'n
    where
        'a: 'n,
    {
        self.children().filter(move |c| c.is(ns, local))
    }

    /// Trimmed, non-empty text of the first matching child.
    pub fn child_text(&self, ns: Ns, local: &str) -> Option<String> {
        self.children_named(ns, local)
            .map(|c| c.text())
            .find(|t| !t.is_empty())
    }

    /// First descendant (depth-first, document order) matching `ns:local`.
    pub fn descendant(&self, ns: Ns, local: &str) -> Option<Element<'a>> {
        let doc = self.doc;
        let mut stack = vec![self.data().children.iter()];
        loop {
            let next = match stack.last_mut() {
                Some(siblings) => siblings.next(),
                None => return None,
            };
            match next {
                Some(Child::Element(idx)) => {
                    let element = Element { doc, idx: *idx };
                    if element.is(ns, local) {
                        return Some(element);
                    }
                    stack.push(doc.nodes[*idx].children.iter());
                }
                Some(Child::Text(_)) => {}
                None => {
                    stack.pop();
                }
            }
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses feed XML into a [`Document`], recovering from common defects.
///
/// # Errors
///
/// Returns [`MalformedDocumentError`] when the input is blank, contains no
/// root element, is an HTML page (typical of error responses served with
/// a 200 status), or nests deeper than [`MAX_DEPTH`].
pub fn parse(xml: &str) -> Result<Document, MalformedDocumentError> {
    if xml.trim().is_empty() {
        return Err(MalformedDocumentError::Empty);
    }

    // quick-xml (0.37) never expands <!ENTITY> declarations, so
    // external entities in a hostile feed are inert. Entity references in
    // text are resolved by `unescape_lenient` against a fixed table only.
    let mut reader = Reader::from_str(xml);
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut builder = TreeBuilder::default();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => builder.open(&e)?,
            Ok(Event::Empty(e)) => {
                builder.open(&e)?;
                builder.close_current();
            }
            Ok(Event::End(e)) => builder.close(&String::from_utf8_lossy(e.local_name().as_ref())),
            Ok(Event::Text(t)) => builder.text(&unescape_lenient(&String::from_utf8_lossy(&t))),
            Ok(Event::CData(c)) => builder.text(&String::from_utf8_lossy(&c)),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                if builder.has_root() {
                    tracing::warn!(
                        error = %e,
                        position = reader.buffer_position(),
                        "XML error mid-document, keeping partial tree"
                    );
                    break;
                }
                return Err(MalformedDocumentError::NoRoot(e.to_string()));
            }
        }
        buf.clear();
    }

    builder.finish()
}

/// Decodes a fetched feed body into text.
///
/// UTF-8 (with or without BOM) is used as-is. Documents that declare
/// ISO-8859-1 or Windows-1252 and are not valid UTF-8 are read as Latin-1.
/// Anything else is decoded lossily.
pub fn decode_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) if declares_latin1(bytes) => bytes.iter().map(|&b| char::from(b)).collect(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn declares_latin1(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(200)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    head.starts_with("<?xml")
        && ["iso-8859-1", "windows-1252", "latin1", "latin-1"]
            .iter()
            .any(|enc| head.contains(enc))
}

#[derive(Default)]
struct TreeBuilder {
    nodes: Vec<NodeData>,
    root: Option<usize>,
    /// Open elements, innermost last.
    stack: Vec<usize>,
    /// Namespace declarations introduced by each open element.
    scopes: Vec<Vec<(Option<String>, String)>>,
}

impl TreeBuilder {
    fn has_root(&self) -> bool {
        self.root.is_some()
    }

    fn open(&mut self, e: &BytesStart<'_>) -> Result<(), MalformedDocumentError> {
        // A second top-level element after the root closed is ignored.
        if self.root.is_some() && self.stack.is_empty() {
            return Ok(());
        }
        if self.stack.len() >= MAX_DEPTH {
            return Err(MalformedDocumentError::TooDeep(MAX_DEPTH));
        }

        let (prefix, local) = split_qname(&String::from_utf8_lossy(e.name().as_ref()));
        let mut attrs = Vec::new();
        let mut decls = Vec::new();

        for attr_result in e.attributes().with_checks(false) {
            let attr = match attr_result {
                Ok(attr) => attr,
                Err(err) => {
                    tracing::debug!(element = %local, error = %err, "Skipping malformed attribute");
                    continue;
                }
            };
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = unescape_lenient(&String::from_utf8_lossy(&attr.value)).into_owned();
            match split_qname(&key) {
                (None, name) if name == "xmlns" => decls.push((None, value)),
                (Some(p), name) if p == "xmlns" => decls.push((Some(name), value)),
                (_, name) => attrs.push(Attr { local: name, value }),
            }
        }

        self.scopes.push(decls);
        let namespace = self.resolve(prefix.as_deref());

        let idx = self.nodes.len();
        self.nodes.push(NodeData {
            prefix,
            local,
            namespace,
            attrs,
            children: Vec::new(),
        });

        match self.stack.last() {
            Some(&parent) => self.nodes[parent].children.push(Child::Element(idx)),
            None => self.root = Some(idx),
        }
        self.stack.push(idx);
        Ok(())
    }

    fn resolve(&self, prefix: Option<&str>) -> Option<String> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|decls| decls.iter())
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.clone())
    }

    fn close_current(&mut self) {
        if self.stack.pop().is_some() {
            self.scopes.pop();
        }
    }

    /// Closes the nearest open element named `name`, implicitly closing any
    /// elements opened inside it. Unmatched end tags are ignored.
    fn close(&mut self, name: &str) {
        let Some(pos) = self
            .stack
            .iter()
            .rposition(|&idx| self.nodes[idx].local.eq_ignore_ascii_case(name))
        else {
            tracing::trace!(name = %name, "Ignoring unmatched end tag");
            return;
        };
        while self.stack.len() > pos {
            self.close_current();
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(&current) = self.stack.last() {
            self.nodes[current].children.push(Child::Text(text.to_string()));
        }
    }

    fn finish(self) -> Result<Document, MalformedDocumentError> {
        let root = self
            .root
            .ok_or_else(|| MalformedDocumentError::NoRoot("document contains no elements".into()))?;
        if self.nodes[root].local.eq_ignore_ascii_case("html") {
            return Err(MalformedDocumentError::Html);
        }
        Ok(Document {
            nodes: self.nodes,
            root,
        })
    }
}

fn split_qname(name: &str) -> (Option<String>, String) {
    match name.split_once(':') {
        Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => {
            (Some(prefix.to_string()), local.to_string())
        }
        _ => (None, name.to_string()),
    }
}

/// Resolves entity references, tolerating bare `&` and unknown entities.
///
/// Strict XML unescaping is tried first; on failure a lenient pass resolves
/// the predefined entities, numeric references and a few HTML entities
/// common in feeds, and keeps everything else literally.
pub(crate) fn unescape_lenient(raw: &str) -> Cow<'_, str> {
    if !raw.contains('&') {
        return Cow::Borrowed(raw);
    }
    match quick_xml::escape::unescape(raw) {
        Ok(text) => text,
        Err(_) => Cow::Owned(unescape_manual(raw)),
    }
}

/// Longest entity name considered when scanning for the closing `;`.
const MAX_ENTITY_LEN: usize = 10;

fn unescape_manual(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let entity_end = tail[1..].find(';').filter(|&end| end > 0 && end <= MAX_ENTITY_LEN);
        if let Some(end) = entity_end {
            if let Some(ch) = resolve_entity(&tail[1..=end]) {
                out.push(ch);
                rest = &tail[end + 2..];
                continue;
            }
        }
        out.push('&');
        rest = &tail[1..];
    }

    out.push_str(rest);
    out
}

fn resolve_entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        return char::from_u32(code);
    }
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "copy" => '\u{a9}',
        "reg" => '\u{ae}',
        "hellip" => '\u{2026}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        _ => return None,
    };
    Some(ch)
}
