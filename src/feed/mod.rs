//! Feed handling: fetching, XML extraction, normalization and OPML import.
//!
//! - [`fetcher`] - bounded HTTP retrieval of raw feed documents
//! - [`xml`] - permissive, namespace-aware document tree
//! - [`parser`] - rule-based normalization into [`Album`] / [`Publisher`]
//! - [`opml`] - subscription lists for bulk registration

pub mod fetcher;
pub mod model;
pub mod opml;
pub mod parser;
pub mod xml;

pub use fetcher::{FetchCause, FetchError, Fetcher, FetcherConfig};
pub use model::{
    Album, ParsedFeed, Publisher, PublisherRef, RecipientType, RemoteItem, Track, ValueMethod,
    ValueRecipient, ValueSplit, ValueType,
};
pub use opml::{parse_opml, read_opml, OpmlEntry};
pub use parser::{parse_duration, NormalizationError, Normalized, Normalizer};
pub use xml::{parse, Document, Element, MalformedDocumentError, Ns};
