//! # Lookout CLI (`lkt`)
//!
//! The `lkt` binary drives a local, continuously updated full-text index.
//!
//! ## Usage
//!
//! ```bash
//! lkt --config ./config/lookout.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lkt init` | Create the SQLite index database and its schema |
//! | `lkt sources` | List configured crawl sources and loaders |
//! | `lkt run` | Crawl, watch, and index until interrupted |
//! | `lkt search "<query>"` | Ranked full-text search over the index |
//! | `lkt stats` | Document counts and index freshness |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use lookout::config::{self, Config};
use lookout::crawler::crawler_from_config;
use lookout::engine::IndexingEngine;
use lookout::index::{index_from_config, SearchIndex};
use lookout::loaders::LoaderRegistry;
use lookout::models::Checkpoint;

/// Lookout — a continuously updated full-text search index over local
/// files.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lookout.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lkt",
    about = "Lookout — a continuously updated full-text search index over local files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lookout.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database.
    ///
    /// Creates the SQLite database file, the bookkeeping and FTS5 tables,
    /// and the staleness view. Idempotent.
    Init,

    /// List configured crawl sources and registered loaders.
    Sources,

    /// Crawl the configured sources, watch for changes, and index until
    /// interrupted. Progress is checkpointed so the next run resumes
    /// where this one stopped.
    Run,

    /// Search indexed documents.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results (capped by `search.limit` in config).
        #[arg(long)]
        limit: Option<i64>,

        /// Number of results to skip, for pagination.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Show document counts and index freshness.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await,
        Commands::Sources => run_sources(&cfg),
        Commands::Run => run_engine(&cfg).await,
        Commands::Search {
            query,
            limit,
            offset,
        } => run_search(&cfg, &query, limit, offset).await,
        Commands::Stats => run_stats(&cfg).await,
    }
}

/// Opens every configured index backend, skipping entries whose module is
/// unknown. Opening is what creates the schema.
async fn open_indexes(cfg: &Config) -> Result<Vec<Arc<dyn SearchIndex>>> {
    let mut indexes = Vec::new();
    for entry in &cfg.indexes {
        if let Some(index) = index_from_config(entry, &cfg.search).await? {
            indexes.push(index);
        }
    }
    if indexes.is_empty() {
        bail!("no usable index configured");
    }
    Ok(indexes)
}

async fn run_init(cfg: &Config) -> Result<()> {
    let mut initialized = 0usize;
    for entry in &cfg.indexes {
        let Some(index) = index_from_config(entry, &cfg.search).await? else {
            continue;
        };
        index.close().await?;
        println!("Initialized {} index at {}", entry.module, entry.path.display());
        initialized += 1;
    }
    if initialized == 0 {
        bail!("no usable index configured");
    }
    Ok(())
}

fn run_sources(cfg: &Config) -> Result<()> {
    if cfg.sources.is_empty() {
        println!("No sources configured.");
    }
    for (position, source) in cfg.sources.iter().enumerate() {
        let id = source.source_id(position);
        println!("{} ({})", id, source.module);
        for path in &source.paths {
            let status = if path.exists() { "ok" } else { "missing" };
            println!("    {}  [{}]", path.display(), status);
        }
    }

    let registry = LoaderRegistry::from_config(&cfg.loaders, &cfg.extract);
    println!();
    println!(
        "Loaders cover extensions: {}",
        registry.supported_extensions().join(", ")
    );
    Ok(())
}

async fn run_search(cfg: &Config, query: &str, limit: Option<i64>, offset: i64) -> Result<()> {
    let indexes = open_indexes(cfg).await?;
    let limit = limit.unwrap_or(cfg.search.limit).clamp(1, cfg.search.limit);
    let results = indexes[0].search(query, limit, offset).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        println!("{}. {}  (score {:.2})", offset + i as i64 + 1, result.uri, result.score);
        if !result.snippet.is_empty() {
            println!("    {}", result.snippet.replace('\n', " "));
        }
        println!();
    }
    Ok(())
}

async fn run_stats(cfg: &Config) -> Result<()> {
    for entry in &cfg.indexes {
        let Some(index) = index_from_config(entry, &cfg.search).await? else {
            continue;
        };
        let stats = index.stats().await?;
        println!("{} ({})", entry.path.display(), entry.module);
        println!("    documents: {}", stats.total_documents);
        println!("    bytes indexed: {}", stats.total_size_bytes);
        match stats.last_indexed {
            Some(ts) => match chrono::DateTime::from_timestamp(ts, 0) {
                Some(when) => println!("    last indexed: {}", when.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("    last indexed: {ts}"),
            },
            None => println!("    last indexed: never"),
        }
        let pending = index.needs_reindex().await?;
        println!("    pending reindex: {}", pending.len());
        index.close().await?;
    }
    Ok(())
}

fn load_checkpoints(path: &Path) -> HashMap<String, Checkpoint> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint file, starting fresh");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

fn save_checkpoints(path: &Path, checkpoints: &HashMap<String, Checkpoint>) -> Result<()> {
    let raw = serde_json::to_string_pretty(checkpoints)?;
    std::fs::write(path, raw)
        .with_context(|| format!("writing checkpoints to {}", path.display()))?;
    Ok(())
}

async fn run_engine(cfg: &Config) -> Result<()> {
    let registry = LoaderRegistry::from_config(&cfg.loaders, &cfg.extract);
    let mut engine = IndexingEngine::new(registry, cfg.search.limit);

    for index in open_indexes(cfg).await? {
        engine.add_index(index);
    }

    let mut checkpoints = load_checkpoints(&cfg.crawl.checkpoint_path);
    let mut started = 0usize;
    for (position, source) in cfg.sources.iter().enumerate() {
        let id = source.source_id(position);
        let Some(crawler) = crawler_from_config(source, &cfg.crawl) else {
            continue;
        };
        let resume = checkpoints.remove(&id);
        if let Err(e) = engine.add_crawler(id.clone(), crawler, resume).await {
            warn!(source = %id, error = %e, "source failed to start, skipping");
            continue;
        }
        started += 1;
    }
    if started == 0 {
        bail!("no usable crawl source configured");
    }

    let stopper = engine.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!();
            stopper.stop();
        }
    });

    println!("Indexing; press Ctrl-C to stop.");
    engine.run().await?;
    let final_checkpoints = engine.shutdown().await?;
    save_checkpoints(&cfg.crawl.checkpoint_path, &final_checkpoints)?;
    println!("Stopped. Checkpoints saved to {}.", cfg.crawl.checkpoint_path.display());
    Ok(())
}
