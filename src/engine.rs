//! Orchestration: crawlers in, extracted documents out to every index.
//!
//! All payload traffic funnels through one [`StreamMux`]: each crawler's
//! traversal channel is an input, watch callbacks push into the same
//! stream, and `run` consumes the merged output. Per URI the newest
//! observation wins; anything older than what was already processed is
//! dropped. An index that fails a write is marked dead and skipped for the
//! rest of the run instead of poisoning the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, error, info, warn};

use crate::crawler::Crawler;
use crate::index::SearchIndex;
use crate::loaders::LoaderRegistry;
use crate::models::{Checkpoint, FilePayload, Indexable, IndexStats, SearchResult};
use crate::mux::{MuxHandle, MuxStopper, StreamMux};

const MUX_CAPACITY: usize = 256;

#[derive(Clone)]
struct IndexSlot {
    index: Arc<dyn SearchIndex>,
    failed: Arc<AtomicBool>,
}

impl IndexSlot {
    fn live(&self) -> bool {
        !self.failed.load(Ordering::SeqCst)
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

pub struct IndexingEngine {
    crawlers: Vec<(String, Box<dyn Crawler>)>,
    indexes: Vec<IndexSlot>,
    registry: LoaderRegistry,
    mux: StreamMux<FilePayload>,
    result_limit: i64,
}

/// Read-side handle that stays usable while [`IndexingEngine::run`] holds
/// the engine. Queries go to the first index still alive.
#[derive(Clone)]
pub struct Searcher {
    slots: Vec<IndexSlot>,
    result_limit: i64,
}

impl Searcher {
    pub async fn search(
        &self,
        query: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SearchResult>> {
        let limit = limit.clamp(1, self.result_limit);
        for slot in &self.slots {
            if slot.live() {
                return slot.index.search(query, limit, offset).await;
            }
        }
        bail!("no live search index")
    }

    /// One stats row per live index, in configuration order.
    pub async fn stats(&self) -> Result<Vec<IndexStats>> {
        let mut all = Vec::new();
        for slot in &self.slots {
            if slot.live() {
                all.push(slot.index.stats().await?);
            }
        }
        Ok(all)
    }
}

impl IndexingEngine {
    pub fn new(registry: LoaderRegistry, result_limit: i64) -> Self {
        Self {
            crawlers: Vec::new(),
            indexes: Vec::new(),
            registry,
            mux: StreamMux::new(MUX_CAPACITY),
            result_limit,
        }
    }

    /// Opens the crawler, wires its watch callback into the shared stream,
    /// and starts its traversal as a mux input.
    pub async fn add_crawler(
        &mut self,
        id: String,
        mut crawler: Box<dyn Crawler>,
        checkpoint: Option<Checkpoint>,
    ) -> Result<()> {
        let pusher = self.mux.handle();
        crawler.on_update(Box::new(move |payload| pusher.blocking_push(payload)));
        crawler.open(checkpoint).await?;
        let rx = crawler.crawl().await?;
        self.mux.add_input(rx);
        info!(source = %id, "crawler started");
        self.crawlers.push((id, crawler));
        Ok(())
    }

    pub fn add_index(&mut self, index: Arc<dyn SearchIndex>) {
        self.indexes.push(IndexSlot {
            index,
            failed: Arc::new(AtomicBool::new(false)),
        });
    }

    /// Direct injection point for payloads that come from neither a
    /// crawler nor a watcher.
    pub fn handle(&self) -> MuxHandle<FilePayload> {
        self.mux.handle()
    }

    pub fn stopper(&self) -> MuxStopper {
        self.mux.stopper()
    }

    pub fn searcher(&self) -> Searcher {
        Searcher {
            slots: self.indexes.clone(),
            result_limit: self.result_limit,
        }
    }

    /// Consumes the merged stream until it is stopped and drained.
    pub async fn run(&mut self) -> Result<()> {
        let mut output = self.mux.output()?;
        let mut last_modified: HashMap<String, i64> = HashMap::new();

        while let Some(payload) = output.next().await {
            if let Some(&seen) = last_modified.get(&payload.uri) {
                if payload.modified < seen {
                    debug!(uri = %payload.uri, "dropping out-of-date observation");
                    continue;
                }
            }
            last_modified.insert(payload.uri.clone(), payload.modified);

            if payload.deleted {
                for slot in &self.indexes {
                    if !slot.live() {
                        continue;
                    }
                    if let Err(e) = slot.index.remove(&payload.uri).await {
                        error!(uri = %payload.uri, error = %e, "index remove failed, disabling index");
                        slot.mark_failed();
                    }
                }
                continue;
            }

            let Some(loader) = self.registry.for_uri(&payload.uri) else {
                continue;
            };

            let mut targets = Vec::new();
            for slot in &self.indexes {
                if !slot.live() {
                    continue;
                }
                match needs_indexing(slot.index.as_ref(), &payload).await {
                    Ok(true) => targets.push(slot.clone()),
                    Ok(false) => {
                        debug!(uri = %payload.uri, "unchanged, skipping");
                    }
                    Err(e) => {
                        error!(uri = %payload.uri, error = %e, "index lookup failed, disabling index");
                        slot.mark_failed();
                    }
                }
            }
            if targets.is_empty() {
                continue;
            }

            let mut indexable = Indexable::from_payload(&payload, loader.name());
            if let Err(e) = loader.extract(&payload, &mut indexable) {
                warn!(uri = %payload.uri, error = %e, "extraction failed, skipping");
                continue;
            }
            for slot in &targets {
                if let Err(e) = slot.index.index(&indexable).await {
                    error!(uri = %payload.uri, error = %e, "index write failed, disabling index");
                    slot.mark_failed();
                }
            }
        }
        info!(documents = last_modified.len(), "indexing stream drained");
        Ok(())
    }

    /// Stops crawlers and closes indexes, returning the final checkpoint
    /// per source for the host to persist.
    pub async fn shutdown(&mut self) -> Result<HashMap<String, Checkpoint>> {
        let mut checkpoints = HashMap::new();
        for (id, crawler) in &mut self.crawlers {
            checkpoints.insert(id.clone(), crawler.checkpoint().await);
            if let Err(e) = crawler.close().await {
                warn!(source = %id, error = %e, "crawler close failed");
            }
        }
        for slot in &self.indexes {
            if let Err(e) = slot.index.close().await {
                warn!(error = %e, "index close failed");
            }
        }
        Ok(checkpoints)
    }
}

/// A document goes to an index when it is unknown there, its content hash
/// changed, or the index reports it stale. Stale-but-unchanged documents
/// are re-extracted so retention refreshes without a content edit.
async fn needs_indexing(index: &dyn SearchIndex, payload: &FilePayload) -> Result<bool> {
    match index.record(&payload.uri).await? {
        Some(record) if record.hash == payload.hash => index.is_stale(&payload.uri).await,
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, IndexConfig, SearchConfig};
    use crate::hash::content_hash;
    use crate::index_fts::SqliteFtsIndex;
    use sqlx::Row;
    use std::path::Path;
    use tempfile::TempDir;

    fn registry() -> LoaderRegistry {
        let config: Config = toml::from_str("").unwrap();
        LoaderRegistry::from_config(&config.loaders, &config.extract)
    }

    async fn engine_with_index() -> (TempDir, IndexingEngine) {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            module: "sqlite-fts5".to_string(),
            path: dir.path().join("index.db"),
            tokenizer: "porter unicode61 remove_diacritics 2 tokenchars '_'".to_string(),
            stale_after_days: 30,
        };
        let index = SqliteFtsIndex::open(&config, &SearchConfig::default())
            .await
            .unwrap();
        let mut engine = IndexingEngine::new(registry(), 50);
        engine.add_index(Arc::new(index));
        (dir, engine)
    }

    fn payload(uri: &str, content: &str, modified: i64) -> FilePayload {
        FilePayload {
            uri: uri.to_string(),
            content: content.as_bytes().to_vec(),
            hash: content_hash(content.as_bytes()),
            metadata: HashMap::new(),
            modified,
            deleted: false,
        }
    }

    async fn raw_pool(dir: &Path) -> sqlx::SqlitePool {
        sqlx::SqlitePool::connect(&format!("sqlite://{}", dir.join("index.db").display()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pushed_payloads_become_searchable() {
        let (_dir, mut engine) = engine_with_index().await;
        let handle = engine.handle();
        let stopper = engine.stopper();
        let searcher = engine.searcher();

        handle
            .push(payload("/d/note.md", "# Greeting\n\nHello indexing world.", 1))
            .await
            .unwrap();
        handle
            .push(payload("/d/skip.bin", "no loader for this", 1))
            .await
            .unwrap();
        stopper.stop();
        engine.run().await.unwrap();

        let hits = searcher.search("indexing", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri, "/d/note.md");
        assert!(searcher.search("loader", 10, 0).await.unwrap().is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn deletions_remove_documents() {
        let (_dir, mut engine) = engine_with_index().await;
        let handle = engine.handle();
        let stopper = engine.stopper();
        let searcher = engine.searcher();

        handle
            .push(payload("/d/gone.txt", "ephemeral words", 1))
            .await
            .unwrap();
        handle
            .push(FilePayload::deleted("/d/gone.txt".to_string(), 2))
            .await
            .unwrap();
        stopper.stop();
        engine.run().await.unwrap();

        assert!(searcher.search("ephemeral", 10, 0).await.unwrap().is_empty());
        let stats = searcher.stats().await.unwrap();
        assert_eq!(stats[0].total_documents, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn newest_observation_wins_per_uri() {
        let (_dir, mut engine) = engine_with_index().await;
        let handle = engine.handle();
        let stopper = engine.stopper();
        let searcher = engine.searcher();

        handle
            .push(payload("/d/doc.txt", "current revision text", 10))
            .await
            .unwrap();
        handle
            .push(payload("/d/doc.txt", "ancient revision text", 5))
            .await
            .unwrap();
        stopper.stop();
        engine.run().await.unwrap();

        assert_eq!(searcher.search("current", 10, 0).await.unwrap().len(), 1);
        assert!(searcher.search("ancient", 10, 0).await.unwrap().is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_documents_are_skipped_until_stale() {
        let (dir, mut engine) = engine_with_index().await;
        let handle = engine.handle();
        let stopper = engine.stopper();

        handle
            .push(payload("/d/doc.txt", "unchanging body", 1))
            .await
            .unwrap();
        stopper.stop();
        engine.run().await.unwrap();

        let pool = raw_pool(dir.path()).await;
        let pick = || async {
            sqlx::query("SELECT last_indexed FROM documents WHERE uri = '/d/doc.txt'")
                .fetch_one(&pool)
                .await
                .unwrap()
                .get::<i64, _>("last_indexed")
        };

        // Recent but distinguishable; a skip must leave it untouched.
        sqlx::query(
            "UPDATE documents SET last_indexed = strftime('%s', 'now', '-100 seconds')
             WHERE uri = '/d/doc.txt'",
        )
        .execute(&pool)
        .await
        .unwrap();
        let before = pick().await;

        let mut engine2 = {
            let index = SqliteFtsIndex::open(
                &IndexConfig {
                    module: "sqlite-fts5".to_string(),
                    path: dir.path().join("index.db"),
                    tokenizer: "porter unicode61 remove_diacritics 2 tokenchars '_'".to_string(),
                    stale_after_days: 30,
                },
                &SearchConfig::default(),
            )
            .await
            .unwrap();
            let mut e = IndexingEngine::new(registry(), 50);
            e.add_index(Arc::new(index));
            e
        };
        let handle = engine2.handle();
        let stopper = engine2.stopper();
        handle
            .push(payload("/d/doc.txt", "unchanging body", 2))
            .await
            .unwrap();
        stopper.stop();
        engine2.run().await.unwrap();
        assert_eq!(pick().await, before, "unchanged document was rewritten");

        // Past retention the same content is re-extracted and refreshed.
        sqlx::query(
            "UPDATE documents SET last_indexed = strftime('%s', 'now', '-40 days')
             WHERE uri = '/d/doc.txt'",
        )
        .execute(&pool)
        .await
        .unwrap();
        let stale = pick().await;
        let mut engine3 = {
            let index = SqliteFtsIndex::open(
                &IndexConfig {
                    module: "sqlite-fts5".to_string(),
                    path: dir.path().join("index.db"),
                    tokenizer: "porter unicode61 remove_diacritics 2 tokenchars '_'".to_string(),
                    stale_after_days: 30,
                },
                &SearchConfig::default(),
            )
            .await
            .unwrap();
            let mut e = IndexingEngine::new(registry(), 50);
            e.add_index(Arc::new(index));
            e
        };
        let handle = engine3.handle();
        let stopper = engine3.stopper();
        handle
            .push(payload("/d/doc.txt", "unchanging body", 3))
            .await
            .unwrap();
        stopper.stop();
        engine3.run().await.unwrap();
        assert!(pick().await > stale, "stale document was not refreshed");
    }

    #[tokio::test]
    async fn searcher_caps_result_limit() {
        let (_dir, mut engine) = engine_with_index().await;
        let handle = engine.handle();
        let stopper = engine.stopper();
        let searcher = engine.searcher();

        for i in 0..4 {
            handle
                .push(payload(&format!("/d/{i}.txt"), "repeated token", i))
                .await
                .unwrap();
        }
        stopper.stop();
        engine.run().await.unwrap();

        let searcher = Searcher {
            result_limit: 2,
            ..searcher
        };
        let hits = searcher.search("repeated", 100, 0).await.unwrap();
        assert_eq!(hits.len(), 2);
        engine.shutdown().await.unwrap();
    }
}
