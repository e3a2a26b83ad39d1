//! The crawler seam and the source factory.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::{CrawlConfig, SourceConfig};
use crate::crawler_fs::LocalFilesystemCrawler;
use crate::models::{Checkpoint, FilePayload};

/// Invoked for every change the crawler's watcher observes after the
/// initial traversal. Callbacks run on the watcher's own thread; they may
/// block (bounded channels push back on the watcher, not the other way
/// around) and a failing callback does not unsubscribe the others.
pub type UpdateCallback = Box<dyn Fn(FilePayload) -> Result<()> + Send + Sync>;

/// A source of file payloads. Implementations own their traversal state
/// and expose it as a [`Checkpoint`] so a host can resume an interrupted
/// pass instead of starting over.
#[async_trait]
pub trait Crawler: Send {
    /// Prepares the source and starts change watching. A checkpoint is
    /// adopted only when it matches the configured roots; otherwise the
    /// crawl starts from scratch.
    async fn open(&mut self, checkpoint: Option<Checkpoint>) -> Result<()>;

    /// Begins emitting payloads on the returned channel. The channel is
    /// bounded; a slow consumer pauses the crawl.
    async fn crawl(&mut self) -> Result<mpsc::Receiver<FilePayload>>;

    /// Subscribes to change notifications observed after `open`.
    fn on_update(&mut self, callback: UpdateCallback);

    /// Snapshot of the current traversal position.
    async fn checkpoint(&self) -> Checkpoint;

    /// Stops traversal and watching. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Instantiates the crawler a source entry names. Unknown modules are
/// logged and omitted so one bad entry cannot take down the rest of the
/// configuration.
pub fn crawler_from_config(
    source: &SourceConfig,
    crawl: &CrawlConfig,
) -> Option<Box<dyn Crawler>> {
    match source.module.as_str() {
        "local-filesystem" => Some(Box::new(LocalFilesystemCrawler::new(
            source.clone(),
            crawl.clone(),
        ))),
        other => {
            warn!(module = other, "unknown crawler module, skipping source");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_modules() {
        let source = SourceConfig {
            id: None,
            module: "s3".to_string(),
            paths: vec![],
            exclude_globs: vec![],
        };
        assert!(crawler_from_config(&source, &CrawlConfig::default()).is_none());
    }

    #[test]
    fn factory_builds_filesystem_crawler() {
        let source = SourceConfig {
            id: None,
            module: "local-filesystem".to_string(),
            paths: vec!["/tmp".into()],
            exclude_globs: vec![],
        };
        assert!(crawler_from_config(&source, &CrawlConfig::default()).is_some());
    }
}
