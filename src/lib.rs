//! tunefeed: ingestion pipeline for podcast-namespace music feeds.
//!
//! Registered feeds are fetched, parsed into a tolerant document tree,
//! normalized into [`feed::Album`] / [`feed::Publisher`] records, cached by
//! URL and persisted as one result set per batch run.

pub mod config;
pub mod feed;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod util;
