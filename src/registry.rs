//! Feed Registry: the declarative list of known feeds.
//!
//! The registry is a JSON document `{ "feeds": [...] }`. Readers get owned
//! snapshots; every mutation validates against the current list, writes the
//! whole document atomically and only then publishes the new list.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::feed::read_opml;
use crate::util::validate_feed_url;

// ============================================================================
// Descriptor types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Album,
    Publisher,
}

/// Processing order only; declaration order is the sort order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Core,
    #[default]
    Extended,
    Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDescriptor {
    pub id: String,
    pub original_url: String,
    #[serde(rename = "type")]
    pub kind: FeedKind,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: FeedStatus,
    #[serde(default)]
    pub title: String,
    pub added_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl FeedDescriptor {
    /// An active descriptor with default priority, stamped now.
    pub fn new(id: impl Into<String>, original_url: impl Into<String>, kind: FeedKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            original_url: original_url.into(),
            kind,
            priority: Priority::default(),
            status: FeedStatus::Active,
            title: String::new(),
            added_at: now,
            last_updated: now,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == FeedStatus::Active
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    feeds: Vec<FeedDescriptor>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Feed URL {url} is already registered as active feed '{existing_id}'")]
    DuplicateFeed { url: String, existing_id: String },

    #[error("Feed id '{0}' already exists")]
    DuplicateId(String),

    #[error("Invalid feed URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Feed id must not be empty")]
    EmptyId,

    #[error("Unknown feed id '{0}'")]
    NotFound(String),

    #[error("Failed to access registry file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of an OPML import.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug)]
pub struct Registry {
    path: Option<PathBuf>,
    allow_private: bool,
    feeds: RwLock<Vec<FeedDescriptor>>,
}

/// Comparison key for URL uniqueness: the parsed, serialized form, so case
/// in the scheme or host and a missing root slash do not create duplicates.
fn url_key(url: &str) -> String {
    url::Url::parse(url.trim())
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.trim().to_string())
}

fn find_active_duplicate<'a>(
    feeds: &'a [FeedDescriptor],
    url: &str,
    except_id: Option<&str>,
) -> Option<&'a FeedDescriptor> {
    let key = url_key(url);
    feeds
        .iter()
        .filter(|f| f.is_active() && Some(f.id.as_str()) != except_id)
        .find(|f| url_key(&f.original_url) == key)
}

impl Registry {
    /// Empty registry that never touches disk.
    pub fn in_memory(allow_private: bool) -> Self {
        Self {
            path: None,
            allow_private,
            feeds: RwLock::new(Vec::new()),
        }
    }

    /// Loads the registry document at `path`. A missing file is an empty
    /// registry; the file is created on the first mutation.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or invalid JSON, and on duplicate ids or duplicate
    /// active URLs inside the document.
    pub async fn load(path: impl Into<PathBuf>, allow_private: bool) -> Result<Self, RegistryError> {
        let path = path.into();
        let feeds = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let doc: RegistryDocument =
                    serde_json::from_str(&content).map_err(|source| RegistryError::Json {
                        path: path.clone(),
                        source,
                    })?;
                doc.feeds
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Registry file not found, starting empty");
                Vec::new()
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };

        for (i, feed) in feeds.iter().enumerate() {
            if feeds[..i].iter().any(|f| f.id == feed.id) {
                return Err(RegistryError::DuplicateId(feed.id.clone()));
            }
            if feed.is_active() {
                if let Some(existing) = find_active_duplicate(&feeds[..i], &feed.original_url, None) {
                    return Err(RegistryError::DuplicateFeed {
                        url: feed.original_url.clone(),
                        existing_id: existing.id.clone(),
                    });
                }
            }
            if let Err(e) = validate_feed_url(&feed.original_url, allow_private) {
                tracing::warn!(feed_id = %feed.id, url = %feed.original_url, error = %e, "Registry entry has an invalid URL, fetches will be refused");
            }
        }

        tracing::debug!(path = %path.display(), feeds = feeds.len(), "Loaded feed registry");
        Ok(Self {
            path: Some(path),
            allow_private,
            feeds: RwLock::new(feeds),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Active descriptors, optionally of one kind, ordered by priority and
    /// then by insertion order.
    pub async fn list_active(&self, kind: Option<FeedKind>) -> Vec<FeedDescriptor> {
        let mut active: Vec<FeedDescriptor> = self
            .feeds
            .read()
            .await
            .iter()
            .filter(|f| f.is_active() && kind.map_or(true, |k| f.kind == k))
            .cloned()
            .collect();
        // Stable sort keeps insertion order within a priority.
        active.sort_by_key(|f| f.priority);
        active
    }

    /// Every descriptor in insertion order, inactive ones included.
    pub async fn all(&self) -> Vec<FeedDescriptor> {
        self.feeds.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<FeedDescriptor> {
        self.feeds.read().await.iter().find(|f| f.id == id).cloned()
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Registers a descriptor.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidUrl`] for a URL that is not absolute http(s)
    /// (or points at a private host when those are disallowed),
    /// [`RegistryError::DuplicateId`] when the id exists, and
    /// [`RegistryError::DuplicateFeed`] when an active descriptor already uses
    /// the URL.
    pub async fn add(&self, descriptor: FeedDescriptor) -> Result<(), RegistryError> {
        let mut descriptor = descriptor;
        descriptor.id = descriptor.id.trim().to_string();
        descriptor.original_url = descriptor.original_url.trim().to_string();
        if descriptor.id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        validate_feed_url(&descriptor.original_url, self.allow_private).map_err(|e| {
            RegistryError::InvalidUrl {
                url: descriptor.original_url.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut feeds = self.feeds.write().await;
        if feeds.iter().any(|f| f.id == descriptor.id) {
            return Err(RegistryError::DuplicateId(descriptor.id));
        }
        if descriptor.is_active() {
            if let Some(existing) = find_active_duplicate(&feeds, &descriptor.original_url, None) {
                return Err(RegistryError::DuplicateFeed {
                    url: descriptor.original_url,
                    existing_id: existing.id.clone(),
                });
            }
        }

        let mut next = feeds.clone();
        tracing::info!(feed_id = %descriptor.id, url = %descriptor.original_url, "Registered feed");
        next.push(descriptor);
        self.persist(&next).await?;
        *feeds = next;
        Ok(())
    }

    /// Removes a descriptor and returns it.
    pub async fn remove(&self, id: &str) -> Result<FeedDescriptor, RegistryError> {
        let mut feeds = self.feeds.write().await;
        let index = feeds
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let mut next = feeds.clone();
        let removed = next.remove(index);
        self.persist(&next).await?;
        *feeds = next;
        tracing::info!(feed_id = %id, "Removed feed");
        Ok(removed)
    }

    /// Activates or deactivates a descriptor.
    ///
    /// Activating fails with [`RegistryError::DuplicateFeed`] when another
    /// active descriptor already uses the same URL.
    pub async fn set_status(&self, id: &str, status: FeedStatus) -> Result<(), RegistryError> {
        let mut feeds = self.feeds.write().await;
        let index = feeds
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if status == FeedStatus::Active {
            if let Some(existing) = find_active_duplicate(&feeds, &feeds[index].original_url, Some(id)) {
                return Err(RegistryError::DuplicateFeed {
                    url: feeds[index].original_url.clone(),
                    existing_id: existing.id.clone(),
                });
            }
        }

        let mut next = feeds.clone();
        next[index].status = status;
        next[index].last_updated = Utc::now();
        self.persist(&next).await?;
        *feeds = next;
        Ok(())
    }

    /// Registers every feed outline of an OPML file as `kind` with `priority`.
    ///
    /// Ids are derived from the URL, so importing the same file twice skips
    /// everything the first import added.
    pub async fn import_opml(
        &self,
        path: &Path,
        kind: FeedKind,
        priority: Priority,
    ) -> anyhow::Result<ImportSummary> {
        let entries = read_opml(path, self.allow_private)
            .await
            .context("Failed to parse OPML file")?;

        let mut summary = ImportSummary::default();
        for entry in entries {
            let id = opml_feed_id(&entry.xml_url);
            let descriptor = FeedDescriptor::new(id.clone(), entry.xml_url.clone(), kind)
                .with_priority(priority)
                .with_title(entry.title);
            match self.add(descriptor).await {
                Ok(()) => summary.added.push(id),
                Err(
                    e @ (RegistryError::DuplicateId(_)
                    | RegistryError::DuplicateFeed { .. }
                    | RegistryError::InvalidUrl { .. }),
                ) => {
                    tracing::debug!(url = %entry.xml_url, error = %e, "Skipping OPML entry");
                    summary.skipped.push(entry.xml_url);
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::info!(
            added = summary.added.len(),
            skipped = summary.skipped.len(),
            "Imported OPML"
        );
        Ok(summary)
    }

    async fn persist(&self, feeds: &[FeedDescriptor]) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = RegistryDocument {
            feeds: feeds.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&doc).map_err(|source| RegistryError::Json {
            path: path.clone(),
            source,
        })?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&target, &json))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r)
            .map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })
    }
}

/// Stable id for an OPML-imported feed: a short digest of its URL.
pub fn opml_feed_id(url: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(url_key(url).as_bytes()));
    format!("opml-{}", &digest[..12])
}

/// Writes `bytes` to `dst` through a uniquely named temp file and a rename,
/// so `dst` is never observed half-written.
fn atomic_write(dst: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", suffix));

    let write_temp = || -> std::io::Result<()> {
        // create_new refuses a pre-planted file or symlink at the temp path
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write_temp() {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    #[cfg(windows)]
    if dst.exists() {
        std::fs::remove_file(dst)?;
    }

    std::fs::rename(&temp_path, dst).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}
