//! Configuration file parser for ~/.config/tunefeed/config.toml.
//!
//! The file is optional; a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::fetcher::{DEFAULT_MAX_FEED_SIZE, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT};
use crate::feed::parser::DEFAULT_PLACEHOLDER_COVER;
use crate::feed::FetcherConfig;
use crate::pipeline::{OrchestratorConfig, DEFAULT_CONCURRENCY};
use crate::storage::DEFAULT_CACHE_TTL_SECONDS;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration
// ============================================================================

const KNOWN_KEYS: &[&str] = &[
    "registry_path",
    "database_path",
    "fetch_timeout_secs",
    "max_feed_size_bytes",
    "concurrency",
    "cache_ttl_seconds",
    "placeholder_cover_url",
    "allow_private_hosts",
    "user_agent",
];

/// Pipeline configuration. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Registry JSON document. Relative paths resolve against the config
    /// directory; defaults to `feeds.json` there.
    pub registry_path: Option<PathBuf>,

    /// SQLite database. Defaults to `tunefeed.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Per-fetch timeout covering connect, headers and body.
    pub fetch_timeout_secs: u64,

    pub max_feed_size_bytes: usize,

    /// Feeds processed at once during a batch run.
    pub concurrency: usize,

    pub cache_ttl_seconds: u64,

    /// Cover art for feeds without an image; `{title}` is replaced by the
    /// URL-encoded feed title.
    pub placeholder_cover_url: String,

    /// Permit feed URLs on loopback and private networks.
    pub allow_private_hosts: bool,

    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_path: None,
            database_path: None,
            fetch_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            max_feed_size_bytes: DEFAULT_MAX_FEED_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            placeholder_cover_url: DEFAULT_PLACEHOLDER_COVER.to_string(),
            allow_private_hosts: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Loads configuration from a TOML file.
    ///
    /// - Missing or blank file → `Ok(Config::default())`
    /// - Invalid TOML or wrong value types → `Err(ConfigError::Parse)`
    /// - Zero timeout or concurrency → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            concurrency = config.concurrency,
            ttl = config.cache_ttl_seconds,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "fetch_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_feed_size_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "max_feed_size_bytes",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn registry_path(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.registry_path.as_deref(), "feeds.json")
    }

    pub fn database_path(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.database_path.as_deref(), "tunefeed.db")
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_size: self.max_feed_size_bytes,
            user_agent: self.user_agent.clone(),
            allow_private_hosts: self.allow_private_hosts,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.concurrency,
            cache_ttl_seconds: self.cache_ttl_seconds,
        }
    }
}

fn resolve(config_dir: &Path, configured: Option<&Path>, default_name: &str) -> PathBuf {
    match configured {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => config_dir.join(p),
        None => config_dir.join(default_name),
    }
}

// ============================================================================
// Tests
// ============================================================================
