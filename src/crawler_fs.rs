//! Local filesystem crawler with change watching.
//!
//! Traversal is an explicit work queue rather than a recursive walk so the
//! position can be checkpointed at any moment: directories expand into
//! their entries at the back of the queue, files are read and emitted.
//! When the queue drains the roots are re-seeded and pacing slows by 10x,
//! which turns the first pass into a background re-crawl loop. A notify
//! watcher covers the window between passes; its events are debounced on a
//! bridge thread and delivered to subscribed callbacks.

use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{CrawlConfig, SourceConfig};
use crate::crawler::{Crawler, UpdateCallback};
use crate::hash::content_hash;
use crate::models::{Checkpoint, FilePayload};

/// Skipped everywhere regardless of configuration.
const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Channel capacity between the crawl task and the consumer. Small on
/// purpose so a stalled consumer stalls the crawl.
const CRAWL_CHANNEL_CAPACITY: usize = 64;

struct CrawlState {
    queue: Mutex<VecDeque<PathBuf>>,
    finished_once: AtomicBool,
    stopped: AtomicBool,
}

pub struct LocalFilesystemCrawler {
    source: SourceConfig,
    crawl: CrawlConfig,
    state: Arc<CrawlState>,
    callbacks: Arc<RwLock<Vec<UpdateCallback>>>,
    excludes: Option<Arc<GlobSet>>,
    watcher: Option<RecommendedWatcher>,
}

impl LocalFilesystemCrawler {
    pub fn new(source: SourceConfig, crawl: CrawlConfig) -> Self {
        Self {
            source,
            crawl,
            state: Arc::new(CrawlState {
                queue: Mutex::new(VecDeque::new()),
                finished_once: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            excludes: None,
            watcher: None,
        }
    }

    fn roots(&self) -> Vec<String> {
        self.source
            .paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    fn build_excludes(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(self.source.exclude_globs.iter().map(String::as_str))
        {
            builder.add(
                Glob::new(pattern).with_context(|| format!("bad exclude glob {pattern:?}"))?,
            );
        }
        Ok(builder.build()?)
    }

    fn start_watcher(&mut self) -> Result<()> {
        let (tx, rx) = std_mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |event: notify::Result<notify::Event>| {
                let _ = tx.send(event);
            },
            notify::Config::default(),
        )?;
        for root in &self.source.paths {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("watching {}", root.display()))?;
        }
        self.watcher = Some(watcher);

        let debounce = Duration::from_millis(self.crawl.debounce_ms.max(1));
        let excludes = self.excludes.clone().unwrap_or_default();
        let max_file_size = self.crawl.max_file_size;
        let callbacks = self.callbacks.clone();
        let state = self.state.clone();

        // Exits when the watcher is dropped and the sender disconnects.
        std::thread::spawn(move || {
            while let Ok(first) = rx.recv() {
                let mut paths = match first {
                    Ok(event) => event.paths,
                    Err(e) => {
                        warn!(error = %e, "watch error");
                        continue;
                    }
                };
                // Coalesce the burst an editor save typically produces.
                loop {
                    match rx.recv_timeout(debounce) {
                        Ok(Ok(event)) => paths.extend(event.paths),
                        Ok(Err(e)) => warn!(error = %e, "watch error"),
                        Err(_) => break,
                    }
                }
                if state.stopped.load(Ordering::SeqCst) {
                    break;
                }
                paths.sort();
                paths.dedup();
                for path in paths {
                    deliver_change(&path, &excludes, max_file_size, &callbacks);
                }
            }
        });
        Ok(())
    }
}

/// Turns one watched path into a payload and hands it to every callback.
fn deliver_change(
    path: &Path,
    excludes: &GlobSet,
    max_file_size: u64,
    callbacks: &RwLock<Vec<UpdateCallback>>,
) {
    if excludes.is_match(path) {
        return;
    }
    let uri = path.to_string_lossy().into_owned();
    let payload = match path.symlink_metadata() {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            FilePayload::deleted(uri, now_seconds())
        }
        Err(e) => {
            warn!(%uri, error = %e, "stat failed on watched path");
            return;
        }
        Ok(meta) if meta.file_type().is_dir() || meta.file_type().is_symlink() => return,
        Ok(meta) if meta.len() > max_file_size => {
            // Treat a file that grew past the cap as gone from the corpus.
            FilePayload::deleted(uri, mtime_seconds(&meta))
        }
        Ok(meta) => match fs::read(path) {
            Ok(content) => {
                let hash = content_hash(&content);
                FilePayload {
                    uri,
                    content,
                    hash,
                    metadata: Default::default(),
                    modified: mtime_seconds(&meta),
                    deleted: false,
                }
            }
            Err(e) => {
                warn!(%uri, error = %e, "read failed on watched path");
                return;
            }
        },
    };
    let subscribers = callbacks.read().unwrap_or_else(|e| e.into_inner());
    for callback in subscribers.iter() {
        if let Err(e) = callback(payload.clone()) {
            warn!(uri = %payload.uri, error = %e, "update callback failed");
        }
    }
}

fn mtime_seconds(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(now_seconds)
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl Crawler for LocalFilesystemCrawler {
    async fn open(&mut self, checkpoint: Option<Checkpoint>) -> Result<()> {
        if self.source.paths.is_empty() {
            bail!("source has no paths configured");
        }
        for root in &self.source.paths {
            if !root.exists() {
                bail!("crawl root {} does not exist", root.display());
            }
        }
        self.excludes = Some(Arc::new(self.build_excludes()?));

        let roots = self.roots();
        let mut queue = self.state.queue.lock().unwrap_or_else(|e| e.into_inner());
        match checkpoint {
            Some(cp) if cp.matches_roots(&roots) => {
                debug!(queued = cp.queue.len(), "resuming from checkpoint");
                *queue = cp.queue.iter().map(PathBuf::from).collect();
                self.state
                    .finished_once
                    .store(cp.finished_once, Ordering::SeqCst);
            }
            other => {
                if other.is_some() {
                    warn!("checkpoint roots changed, starting fresh");
                }
                *queue = self.source.paths.iter().cloned().collect();
            }
        }
        drop(queue);

        self.start_watcher()
    }

    async fn crawl(&mut self) -> Result<mpsc::Receiver<FilePayload>> {
        let (tx, rx) = mpsc::channel(CRAWL_CHANNEL_CAPACITY);
        let state = self.state.clone();
        let roots = self.source.paths.clone();
        let excludes = self.excludes.clone().unwrap_or_default();
        let delay_ms = self.crawl.delay_ms;
        let max_file_size = self.crawl.max_file_size;

        tokio::spawn(async move {
            loop {
                if state.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let pacing = if state.finished_once.load(Ordering::SeqCst) {
                    delay_ms * 10
                } else {
                    delay_ms
                };
                tokio::time::sleep(Duration::from_millis(pacing)).await;

                let next = {
                    let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                    match queue.pop_front() {
                        Some(path) => path,
                        None => {
                            state.finished_once.store(true, Ordering::SeqCst);
                            queue.extend(roots.iter().cloned());
                            continue;
                        }
                    }
                };

                let meta = match next.symlink_metadata() {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!(path = %next.display(), error = %e, "stat failed, skipping");
                        continue;
                    }
                };
                if meta.file_type().is_symlink() {
                    continue;
                }
                if meta.is_dir() {
                    let entries = match fs::read_dir(&next) {
                        Ok(entries) => entries,
                        Err(e) => {
                            warn!(path = %next.display(), error = %e, "read_dir failed, skipping");
                            continue;
                        }
                    };
                    let mut children: Vec<PathBuf> =
                        entries.flatten().map(|e| e.path()).collect();
                    children.sort();
                    let mut queue = state.queue.lock().unwrap_or_else(|e| e.into_inner());
                    for child in children {
                        if !excludes.is_match(&child) {
                            queue.push_back(child);
                        }
                    }
                    continue;
                }
                if excludes.is_match(&next) {
                    continue;
                }
                if meta.len() > max_file_size {
                    warn!(path = %next.display(), size = meta.len(), "file over size cap, skipping");
                    continue;
                }
                let content = match fs::read(&next) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(path = %next.display(), error = %e, "read failed, skipping");
                        continue;
                    }
                };
                let hash = content_hash(&content);
                let payload = FilePayload {
                    uri: next.to_string_lossy().into_owned(),
                    content,
                    hash,
                    metadata: Default::default(),
                    modified: mtime_seconds(&meta),
                    deleted: false,
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn on_update(&mut self, callback: UpdateCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    async fn checkpoint(&self) -> Checkpoint {
        let queue = self.state.queue.lock().unwrap_or_else(|e| e.into_inner());
        Checkpoint {
            paths: self.roots(),
            queue: queue
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            finished_once: self.state.finished_once.load(Ordering::SeqCst),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.state.stopped.store(true, Ordering::SeqCst);
        self.watcher = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as test_mpsc;
    use tokio::time::timeout;

    fn crawler_for(dir: &Path, crawl: CrawlConfig) -> LocalFilesystemCrawler {
        LocalFilesystemCrawler::new(
            SourceConfig {
                id: None,
                module: "local-filesystem".to_string(),
                paths: vec![dir.to_path_buf()],
                exclude_globs: vec![],
            },
            crawl,
        )
    }

    fn fast_config() -> CrawlConfig {
        CrawlConfig {
            delay_ms: 1,
            debounce_ms: 20,
            ..CrawlConfig::default()
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<FilePayload>, n: usize) -> Vec<FilePayload> {
        let mut out = Vec::new();
        while out.len() < n {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(payload)) => out.push(payload),
                _ => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn discovers_files_and_recrawls() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.md"), b"beta").unwrap();

        let mut crawler = crawler_for(dir.path(), fast_config());
        crawler.open(None).await.unwrap();
        let mut rx = crawler.crawl().await.unwrap();

        // Two files, then the pass restarts and we see one of them again.
        let seen = collect(&mut rx, 3).await;
        assert_eq!(seen.len(), 3);
        let uris: Vec<&str> = seen.iter().map(|p| p.uri.as_str()).collect();
        assert!(uris[0].ends_with("a.txt"));
        assert!(uris[1].ends_with("b.md"));
        assert!(uris[2].ends_with("a.txt"));
        assert_eq!(seen[0].content, b"alpha");
        assert_eq!(seen[0].hash, content_hash(b"alpha"));
        assert!(!seen[0].deleted);

        crawler.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_rejects_missing_roots() {
        let mut crawler = crawler_for(Path::new("/definitely/not/here"), fast_config());
        assert!(crawler.open(None).await.is_err());
    }

    #[tokio::test]
    async fn checkpoint_adopted_only_for_matching_roots() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let pending = dir.path().join("pending.txt");
        fs::write(&pending, b"queued").unwrap();

        let matching = Checkpoint {
            paths: vec![root.clone()],
            queue: vec![pending.to_string_lossy().into_owned()],
            finished_once: true,
        };
        let mut crawler = crawler_for(dir.path(), fast_config());
        crawler.open(Some(matching.clone())).await.unwrap();
        let cp = crawler.checkpoint().await;
        assert_eq!(cp.queue, matching.queue);
        assert!(cp.finished_once);
        crawler.close().await.unwrap();

        let foreign = Checkpoint {
            paths: vec!["/elsewhere".to_string()],
            queue: vec!["/elsewhere/x.txt".to_string()],
            finished_once: true,
        };
        let mut crawler = crawler_for(dir.path(), fast_config());
        crawler.open(Some(foreign)).await.unwrap();
        let cp = crawler.checkpoint().await;
        assert_eq!(cp.queue, vec![root]);
        assert!(!cp.finished_once);
        crawler.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_and_excluded_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.txt"), vec![b'x'; 64]).unwrap();
        fs::write(dir.path().join("ok.txt"), b"small").unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), b"[core]").unwrap();

        let mut crawler = crawler_for(
            dir.path(),
            CrawlConfig {
                max_file_size: 32,
                ..fast_config()
            },
        );
        crawler.open(None).await.unwrap();
        let mut rx = crawler.crawl().await.unwrap();

        let seen = collect(&mut rx, 2).await;
        assert!(seen.iter().all(|p| p.uri.ends_with("ok.txt")));
        crawler.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"real").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let mut crawler = crawler_for(dir.path(), fast_config());
        crawler.open(None).await.unwrap();
        let mut rx = crawler.crawl().await.unwrap();

        let seen = collect(&mut rx, 2).await;
        assert!(seen.iter().all(|p| p.uri.ends_with("real.txt")));
        crawler.close().await.unwrap();
    }

    #[tokio::test]
    async fn watcher_delivers_updates_to_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let mut crawler = crawler_for(dir.path(), fast_config());
        let (tx, rx) = test_mpsc::channel();
        crawler.on_update(Box::new(move |payload| {
            tx.send(payload).map_err(|e| anyhow::anyhow!(e.to_string()))
        }));
        crawler.open(None).await.unwrap();

        let target = dir.path().join("fresh.txt");
        fs::write(&target, b"fresh content").unwrap();

        let payload = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .expect("watch event delivered");
        assert!(payload.uri.ends_with("fresh.txt"));
        assert!(!payload.deleted);
        assert_eq!(payload.content, b"fresh content");

        crawler.close().await.unwrap();
    }
}
