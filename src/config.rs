use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,
    #[serde(default = "default_loaders", rename = "loader")]
    pub loaders: Vec<LoaderConfig>,
    #[serde(default = "default_indexes", rename = "index")]
    pub indexes: Vec<IndexConfig>,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
}

/// Traversal and watch pacing shared by all crawl sources.
#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    /// Delay between dequeues; multiplied by 10 after the first full pass.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Files above this size are skipped (and removed if previously indexed).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Coalescing window for filesystem watch events. Distinct from the
    /// index staleness window; do not conflate the two.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Where the host persists per-source crawl checkpoints across restarts.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            max_file_size: default_max_file_size(),
            debounce_ms: default_debounce_ms(),
            checkpoint_path: default_checkpoint_path(),
        }
    }
}

fn default_delay_ms() -> u64 {
    50
}
fn default_max_file_size() -> u64 {
    128 * 1024 * 1024
}
fn default_debounce_ms() -> u64 {
    250
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./lookout.checkpoints.json")
}

/// One configured origin of files to crawl.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Stable identifier used to key checkpoints; derived from the module
    /// name and position when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub module: String,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl SourceConfig {
    pub fn source_id(&self, position: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.module, position))
    }
}

/// One entry in the prioritized loader registry.
#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    pub module: String,
    pub extensions: Vec<String>,
    #[serde(default = "default_loader_priority")]
    pub priority: i32,
}

fn default_loader_priority() -> i32 {
    100
}

fn loader_entry(module: &str, extensions: &[&str], priority: i32) -> LoaderConfig {
    LoaderConfig {
        module: module.to_string(),
        extensions: extensions.iter().map(|e| e.to_string()).collect(),
        priority,
    }
}

fn default_loaders() -> Vec<LoaderConfig> {
    vec![
        loader_entry("html", &[".html", ".htm", ".xhtml"], 10),
        loader_entry("markdown", &[".md", ".markdown"], 20),
        loader_entry("jupyter", &[".ipynb"], 30),
        loader_entry("text", &[".txt"], 40),
    ]
}

/// One configured search index backend.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_module")]
    pub module: String,
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
    /// Documents indexed longer ago than this are due for forced
    /// re-tokenization even when their content hash is unchanged.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
}

fn default_index_module() -> String {
    "sqlite-fts5".to_string()
}
fn default_index_path() -> PathBuf {
    PathBuf::from("./lookout.db")
}
fn default_tokenizer() -> String {
    // `_` as a word character keeps snake_case identifiers whole.
    "porter unicode61 remove_diacritics 2 tokenchars '_'".to_string()
}
fn default_stale_after_days() -> i64 {
    30
}

fn default_indexes() -> Vec<IndexConfig> {
    vec![IndexConfig {
        module: default_index_module(),
        path: default_index_path(),
        tokenizer: default_tokenizer(),
        stale_after_days: default_stale_after_days(),
    }]
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_result_limit")]
    pub limit: i64,
    #[serde(default = "default_snippet_tokens")]
    pub snippet_tokens: i64,
    #[serde(default = "default_highlight_open")]
    pub highlight_open: String,
    #[serde(default = "default_highlight_close")]
    pub highlight_close: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_result_limit(),
            snippet_tokens: default_snippet_tokens(),
            highlight_open: default_highlight_open(),
            highlight_close: default_highlight_close(),
        }
    }
}

fn default_result_limit() -> i64 {
    50
}
fn default_snippet_tokens() -> i64 {
    10
}
fn default_highlight_open() -> String {
    "<b>".to_string()
}
fn default_highlight_close() -> String {
    "</b>".to_string()
}

/// Weight model for content extraction. Overriding a table replaces it
/// wholesale.
#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_base_weights")]
    pub base_weights: BTreeMap<String, f64>,
    #[serde(default = "default_inline_multipliers")]
    pub inline_multipliers: BTreeMap<String, f64>,
    #[serde(default = "default_context_multipliers")]
    pub context_multipliers: BTreeMap<String, f64>,
    #[serde(default = "default_depth_decay")]
    pub depth_decay: f64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_min_text_length")]
    pub min_text_length: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            base_weights: default_base_weights(),
            inline_multipliers: default_inline_multipliers(),
            context_multipliers: default_context_multipliers(),
            depth_decay: default_depth_decay(),
            max_depth: default_max_depth(),
            min_text_length: default_min_text_length(),
        }
    }
}

fn weight_table(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect()
}

fn default_base_weights() -> BTreeMap<String, f64> {
    weight_table(&[
        ("h1", 4.0),
        ("h2", 3.0),
        ("h3", 2.5),
        ("h4", 2.0),
        ("h5", 1.8),
        ("h6", 1.5),
        ("p", 1.0),
        ("div", 0.8),
        ("span", 0.7),
        ("blockquote", 1.2),
        ("code", 1.1),
        ("pre", 1.3),
        ("li", 0.9),
        ("td", 0.8),
        ("th", 1.2),
        ("article", 1.1),
        ("section", 1.0),
        ("aside", 0.6),
    ])
}

fn default_inline_multipliers() -> BTreeMap<String, f64> {
    weight_table(&[
        ("b", 1.3),
        ("strong", 1.3),
        ("i", 1.1),
        ("em", 1.1),
        ("mark", 1.4),
        ("u", 1.05),
        ("code", 1.2),
    ])
}

fn default_context_multipliers() -> BTreeMap<String, f64> {
    weight_table(&[
        ("blockquote", 1.4),
        ("section", 1.2),
        ("article", 1.3),
        ("header", 1.1),
        ("main", 1.2),
        ("aside", 0.8),
        ("footer", 0.7),
        ("nav", 0.6),
    ])
}

fn default_depth_decay() -> f64 {
    1.05
}
fn default_max_depth() -> usize {
    10
}
fn default_min_text_length() -> usize {
    3
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.crawl.max_file_size == 0 {
        anyhow::bail!("crawl.max_file_size must be > 0");
    }

    if config.search.limit < 1 {
        anyhow::bail!("search.limit must be >= 1");
    }
    if config.search.snippet_tokens < 1 {
        anyhow::bail!("search.snippet_tokens must be >= 1");
    }

    if config.extract.depth_decay < 1.0 {
        anyhow::bail!("extract.depth_decay must be >= 1.0");
    }
    if config.extract.min_text_length == 0 {
        anyhow::bail!("extract.min_text_length must be >= 1");
    }

    for index in &config.indexes {
        if index.stale_after_days < 1 {
            anyhow::bail!("index.stale_after_days must be >= 1");
        }
    }

    for source in &config.sources {
        if source.module == "local-filesystem" && source.paths.is_empty() {
            anyhow::bail!("local-filesystem source requires at least one path");
        }
    }

    Ok(())
}
