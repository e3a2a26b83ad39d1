//! The search index seam and the backend factory.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::config::{IndexConfig, SearchConfig};
use crate::index_fts::SqliteFtsIndex;
use crate::models::{IndexRecord, IndexStats, Indexable, SearchResult};

/// A persistent full-text index. All methods take `&self` so queries can
/// run concurrently with indexing through the same handle.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Inserts or replaces one document atomically.
    async fn index(&self, indexable: &Indexable) -> Result<()>;

    /// Removes one document. Removing an unknown URI is not an error.
    async fn remove(&self, uri: &str) -> Result<()>;

    /// Ranked search, best hits first. An empty query returns no results;
    /// a query the engine cannot parse also returns no results.
    async fn search(&self, query: &str, limit: i64, offset: i64) -> Result<Vec<SearchResult>>;

    /// Bookkeeping row for one URI, if indexed.
    async fn record(&self, uri: &str) -> Result<Option<IndexRecord>>;

    /// True when the URI is unknown, past the retention window, missing
    /// its content row, or recorded without a hash.
    async fn is_stale(&self, uri: &str) -> Result<bool>;

    /// All URIs currently needing (re-)indexing.
    async fn needs_reindex(&self) -> Result<Vec<String>>;

    async fn stats(&self) -> Result<IndexStats>;

    async fn close(&self) -> Result<()>;
}

/// Opens the backend an index entry names. An unknown module is logged
/// and omitted; a backend that fails to open is an error, since a
/// configured store that cannot be reached should not be silently dropped.
pub async fn index_from_config(
    index: &IndexConfig,
    search: &SearchConfig,
) -> Result<Option<Arc<dyn SearchIndex>>> {
    match index.module.as_str() {
        "sqlite-fts5" => {
            let backend = SqliteFtsIndex::open(index, search).await?;
            Ok(Some(Arc::new(backend)))
        }
        other => {
            warn!(module = other, "unknown index module, skipping");
            Ok(None)
        }
    }
}
