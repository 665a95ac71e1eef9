use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tunefeed::config::Config;
use tunefeed::feed::{Fetcher, Normalizer};
use tunefeed::pipeline::{Orchestrator, RunOneError};
use tunefeed::registry::{FeedDescriptor, FeedKind, FeedStatus, Priority, Registry};
use tunefeed::storage::{Database, DatabaseError};

/// Get the config directory path (~/.config/tunefeed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tunefeed"))
}

/// Creates the config directory if needed and restricts it to the owner.
fn prepare_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "tunefeed",
    version,
    about = "Fetch, normalize and cache podcast-namespace music feeds"
)]
struct Args {
    /// Config file (default: ~/.config/tunefeed/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse every active feed and print the run report
    ParseAll,

    /// Parse one feed and print the normalized result
    Parse {
        feed_id: String,
        /// Fetch even when a fresh cache entry exists
        #[arg(long)]
        force: bool,
    },

    /// Inspect or clear the feed cache
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Manage the feed registry
    #[command(subcommand)]
    Feeds(FeedsCommand),

    /// Query the persisted result set
    #[command(subcommand)]
    Results(ResultsCommand),

    /// Show parse run reports
    #[command(subcommand)]
    Reports(ReportsCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    Stats,
    /// Remove one entry, or every entry when no URL is given
    Clear {
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum FeedsCommand {
    /// List active feeds in processing order
    List {
        #[arg(long = "type", value_enum)]
        kind: Option<FeedKind>,
        /// Include inactive feeds
        #[arg(long)]
        all: bool,
    },
    Add {
        id: String,
        url: String,
        #[arg(long = "type", value_enum, default_value = "album")]
        kind: FeedKind,
        #[arg(long, value_enum, default_value = "extended")]
        priority: Priority,
        #[arg(long)]
        title: Option<String>,
    },
    Remove {
        id: String,
    },
    /// Activate or deactivate a feed
    SetStatus {
        id: String,
        #[arg(value_enum)]
        status: FeedStatus,
    },
    /// Register every feed of an OPML subscription list
    Import {
        opml: PathBuf,
        #[arg(long = "type", value_enum, default_value = "album")]
        kind: FeedKind,
        #[arg(long, value_enum, default_value = "extended")]
        priority: Priority,
    },
}

#[derive(Subcommand, Debug)]
enum ResultsCommand {
    List,
    Get { feed_id: String },
}

#[derive(Subcommand, Debug)]
enum ReportsCommand {
    Last,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another tunefeed process appears to be using the database. Wait for it to finish and try again."
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    prepare_config_dir(&config_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let registry = Registry::load(config.registry_path(&config_dir), config.allow_private_hosts)
        .await
        .context("Failed to load feed registry")?;

    match args.command {
        Command::Feeds(cmd) => run_feeds_command(&registry, cmd).await,
        Command::ParseAll => {
            let orchestrator = build_orchestrator(&config, &config_dir, registry).await?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, finishing in-flight feeds");
                    on_signal.cancel();
                }
            });
            let report = orchestrator.run_all_with_cancel(&cancel).await?;
            orchestrator.database().close().await;
            print_json(&report)
        }
        Command::Parse { feed_id, force } => {
            let orchestrator = build_orchestrator(&config, &config_dir, registry).await?;
            let outcome = orchestrator.run_one(&feed_id, force).await;
            orchestrator.database().close().await;
            match outcome {
                Ok(parsed) => print_json(&parsed),
                Err(RunOneError::UnknownFeed(id)) => {
                    eprintln!("Error: No feed with id '{id}' in the registry");
                    std::process::exit(1);
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Cache(cmd) => {
            let db = open_database(&config.database_path(&config_dir)).await?;
            let result = match cmd {
                CacheCommand::Stats => print_json(&db.cache_stats().await?),
                CacheCommand::Clear { url } => {
                    let removed = db.cache_invalidate(url.as_deref()).await?;
                    println!("Removed {removed} cache entries");
                    Ok(())
                }
            };
            db.close().await;
            result
        }
        Command::Results(cmd) => {
            let db = open_database(&config.database_path(&config_dir)).await?;
            let result = match cmd {
                ResultsCommand::List => print_json(&db.list_results().await?),
                ResultsCommand::Get { feed_id } => match db.get_result(&feed_id).await? {
                    Some(result) => print_json(&result),
                    None => {
                        eprintln!("Error: No parsed result for '{feed_id}'");
                        std::process::exit(1);
                    }
                },
            };
            db.close().await;
            result
        }
        Command::Reports(ReportsCommand::Last) => {
            let db = open_database(&config.database_path(&config_dir)).await?;
            let report = db.last_report().await?;
            db.close().await;
            match report {
                Some(report) => print_json(&report),
                None => {
                    println!("No parse runs recorded yet");
                    Ok(())
                }
            }
        }
    }
}

async fn build_orchestrator(
    config: &Config,
    config_dir: &Path,
    registry: Registry,
) -> Result<Orchestrator> {
    let db = open_database(&config.database_path(config_dir)).await?;
    let fetcher = Fetcher::new(config.fetcher_config()).context("Failed to build HTTP client")?;
    let normalizer = Normalizer::new(config.placeholder_cover_url.clone());
    Ok(Orchestrator::new(
        Arc::new(registry),
        db,
        fetcher,
        normalizer,
        config.orchestrator_config(),
    ))
}

async fn run_feeds_command(registry: &Registry, cmd: FeedsCommand) -> Result<()> {
    match cmd {
        FeedsCommand::List { kind, all } => {
            let feeds = if all {
                registry
                    .all()
                    .await
                    .into_iter()
                    .filter(|f| kind.map_or(true, |k| k == f.kind))
                    .collect()
            } else {
                registry.list_active(kind).await
            };
            print_json(&feeds)
        }
        FeedsCommand::Add {
            id,
            url,
            kind,
            priority,
            title,
        } => {
            let mut descriptor = FeedDescriptor::new(id.clone(), url, kind).with_priority(priority);
            if let Some(title) = title {
                descriptor = descriptor.with_title(title);
            }
            registry.add(descriptor).await?;
            println!("Added feed '{id}'");
            Ok(())
        }
        FeedsCommand::Remove { id } => {
            let removed = registry.remove(&id).await?;
            println!("Removed feed '{}' ({})", removed.id, removed.original_url);
            Ok(())
        }
        FeedsCommand::SetStatus { id, status } => {
            registry.set_status(&id, status).await?;
            println!("Feed '{id}' is now {status:?}");
            Ok(())
        }
        FeedsCommand::Import {
            opml,
            kind,
            priority,
        } => {
            let canonical = opml
                .canonicalize()
                .with_context(|| format!("Failed to resolve import file: {}", opml.display()))?;
            if !std::fs::metadata(&canonical)?.is_file() {
                anyhow::bail!("Import path must be a regular file");
            }
            let summary = registry.import_opml(&canonical, kind, priority).await?;
            print_json(&summary)
        }
    }
}
