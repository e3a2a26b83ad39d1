//! SQLite FTS5 search index.
//!
//! Two tables: `documents` holds per-URI bookkeeping (hash, type, indexed
//! time, size, rank weight) and `documents_fts` holds the searchable text
//! split into a `title` column (headline sections) and a `content` column
//! (everything else). A `reindex_queue` view derives staleness directly in
//! SQL; it is recreated at every open so retention changes in config take
//! effect without a migration.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::config::{IndexConfig, SearchConfig};
use crate::index::SearchIndex;
use crate::models::{IndexRecord, IndexStats, Indexable, SearchResult};

/// Section kinds routed into the `title` column; the rest land in `content`.
const TITLE_KINDS: &[&str] = &["title", "header", "h1"];

/// Section kinds kept out of the searchable text entirely. Glossary term
/// sections are indexed through their own bookkeeping, not as body text.
const EXCLUDED_KINDS: &[&str] = &["term"];

/// Rank assigned to an exact-URI hit so it sorts ahead of any BM25 score.
const EXACT_URI_SCORE: f64 = -1.0e9;

pub struct SqliteFtsIndex {
    pool: SqlitePool,
    search: SearchConfig,
}

impl SqliteFtsIndex {
    pub async fn open(index: &IndexConfig, search: &SearchConfig) -> Result<Self> {
        if let Some(parent) = index.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(&index.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening index {}", index.path.display()))?;

        sqlx::query("PRAGMA mmap_size = 268435456")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA temp_store = memory")
            .execute(&pool)
            .await?;

        let built = Self {
            pool,
            search: search.clone(),
        };
        built.ensure_schema(index).await?;
        Ok(built)
    }

    async fn ensure_schema(&self, index: &IndexConfig) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                uri TEXT PRIMARY KEY,
                hash TEXT,
                doc_type TEXT NOT NULL DEFAULT '',
                last_indexed INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                weight REAL NOT NULL DEFAULT 1.0
            )",
        )
        .execute(&self.pool)
        .await?;

        // CREATE VIRTUAL TABLE has no IF NOT EXISTS for fts5; probe first.
        let fts_exists = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'documents_fts'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();
        if !fts_exists {
            let tokenize = index.tokenizer.replace('\'', "''");
            sqlx::query(&format!(
                "CREATE VIRTUAL TABLE documents_fts USING fts5(
                    uri UNINDEXED,
                    title,
                    content,
                    tokenize='{tokenize}'
                )",
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query("DROP VIEW IF EXISTS reindex_queue")
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE VIEW reindex_queue AS
                SELECT d.uri FROM documents d
                LEFT JOIN documents_fts f ON f.uri = d.uri
                WHERE d.hash IS NULL
                   OR d.hash = ''
                   OR f.uri IS NULL
                   OR d.last_indexed < strftime('%s', 'now', '-{} days')",
            index.stale_after_days,
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn split_sections(indexable: &Indexable) -> (String, String) {
    let mut title = Vec::new();
    let mut content = Vec::new();
    for section in &indexable.sections {
        if EXCLUDED_KINDS.contains(&section.kind.as_str()) {
            continue;
        }
        if TITLE_KINDS.contains(&section.kind.as_str()) {
            title.push(section.content.as_str());
        } else {
            content.push(section.content.as_str());
        }
    }
    (title.join(" "), content.join("\n\n"))
}

fn metadata_str<'a>(metadata: &'a HashMap<String, String>, key: &str) -> &'a str {
    metadata.get(key).map(String::as_str).unwrap_or("")
}

#[async_trait]
impl SearchIndex for SqliteFtsIndex {
    async fn index(&self, indexable: &Indexable) -> Result<()> {
        let (title, content) = split_sections(indexable);
        let size_bytes: i64 = metadata_str(&indexable.metadata, "size_bytes")
            .parse()
            .unwrap_or(0);

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO documents
                (uri, hash, doc_type, last_indexed, size_bytes, weight)
             VALUES (?, ?, ?, strftime('%s', 'now'), ?, ?)",
        )
        .bind(&indexable.uri)
        .bind(metadata_str(&indexable.metadata, "hash"))
        .bind(metadata_str(&indexable.metadata, "type"))
        .bind(size_bytes)
        .bind(indexable.weight)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents_fts WHERE uri = ?")
            .bind(&indexable.uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO documents_fts (uri, title, content) VALUES (?, ?, ?)")
            .bind(&indexable.uri)
            .bind(&title)
            .bind(&content)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(uri = %indexable.uri, sections = indexable.sections.len(), "indexed");
        Ok(())
    }

    async fn remove(&self, uri: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents WHERE uri = ?")
            .bind(uri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents_fts WHERE uri = ?")
            .bind(uri)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: i64, offset: i64) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();

        // A query that names an indexed URI outright beats any token match.
        // Only on the first page, so pagination stays consistent.
        if offset == 0 {
            let exact = sqlx::query(
                "SELECT uri, substr(content, 1, 240) AS snippet
                 FROM documents_fts WHERE uri = ?",
            )
            .bind(query)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = exact {
                results.push(SearchResult {
                    uri: row.get("uri"),
                    score: EXACT_URI_SCORE,
                    snippet: row.get("snippet"),
                });
            }
        }

        let matched = sqlx::query(
            "SELECT f.uri AS uri,
                    bm25(documents_fts) * d.weight AS score,
                    snippet(documents_fts, 2, ?, ?, '...', ?) AS snippet
             FROM documents_fts f
             JOIN documents d ON d.uri = f.uri
             WHERE documents_fts MATCH ?
             ORDER BY score ASC
             LIMIT ? OFFSET ?",
        )
        .bind(&self.search.highlight_open)
        .bind(&self.search.highlight_close)
        .bind(self.search.snippet_tokens)
        .bind(query)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await;

        // FTS5 rejects queries it cannot parse; that is the searcher's
        // typo, not a store failure.
        let rows = match matched {
            Ok(rows) => rows,
            Err(e) => {
                warn!(query, error = %e, "unparseable search query");
                return Ok(results);
            }
        };
        for row in rows {
            let uri: String = row.get("uri");
            if results.iter().any(|r| r.uri == uri) {
                continue;
            }
            results.push(SearchResult {
                uri,
                score: row.get("score"),
                snippet: row.get("snippet"),
            });
        }
        results.truncate(limit as usize);
        Ok(results)
    }

    async fn record(&self, uri: &str) -> Result<Option<IndexRecord>> {
        let row = sqlx::query(
            "SELECT uri, COALESCE(hash, '') AS hash, doc_type, last_indexed, size_bytes
             FROM documents WHERE uri = ?",
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| IndexRecord {
            uri: r.get("uri"),
            hash: r.get("hash"),
            doc_type: r.get("doc_type"),
            last_indexed: r.get("last_indexed"),
            size_bytes: r.get("size_bytes"),
        }))
    }

    async fn is_stale(&self, uri: &str) -> Result<bool> {
        let known = sqlx::query("SELECT 1 FROM documents WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !known {
            return Ok(true);
        }
        let queued = sqlx::query("SELECT 1 FROM reindex_queue WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(queued.is_some())
    }

    async fn needs_reindex(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT uri FROM reindex_queue ORDER BY uri")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("uri")).collect())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(size_bytes), 0) AS bytes,
                    MAX(last_indexed) AS last
             FROM documents",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(IndexStats {
            total_documents: row.get("total"),
            total_size_bytes: row.get("bytes"),
            last_indexed: row.get("last"),
        })
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::content_hash;
    use crate::models::Section;
    use tempfile::TempDir;

    async fn open_index(stale_after_days: i64) -> (TempDir, SqliteFtsIndex) {
        let dir = tempfile::tempdir().unwrap();
        let config = IndexConfig {
            module: "sqlite-fts5".to_string(),
            path: dir.path().join("index.db"),
            tokenizer: "porter unicode61 remove_diacritics 2 tokenchars '_'".to_string(),
            stale_after_days,
        };
        let index = SqliteFtsIndex::open(&config, &SearchConfig::default())
            .await
            .unwrap();
        (dir, index)
    }

    fn doc(uri: &str, sections: &[(&str, &str)]) -> Indexable {
        let body: String = sections.iter().map(|(_, c)| *c).collect();
        let mut metadata = HashMap::new();
        metadata.insert("hash".to_string(), content_hash(body.as_bytes()));
        metadata.insert("type".to_string(), "text".to_string());
        metadata.insert("size_bytes".to_string(), body.len().to_string());
        Indexable {
            uri: uri.to_string(),
            sections: sections
                .iter()
                .map(|(kind, content)| Section::new(*kind, *content, 1.0))
                .collect(),
            weight: 1.0,
            modified: 0,
            metadata,
        }
    }

    #[tokio::test]
    async fn index_then_search() {
        let (_dir, index) = open_index(30).await;
        index
            .index(&doc(
                "/d/ownership.md",
                &[
                    ("h1", "Rust ownership guide"),
                    ("p", "The borrow checker enforces aliasing rules."),
                ],
            ))
            .await
            .unwrap();
        index
            .index(&doc("/d/python.md", &[("p", "Reference counting instead.")]))
            .await
            .unwrap();

        let hits = index.search("borrow", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri, "/d/ownership.md");
        assert!(hits[0].score < 0.0);
        assert!(hits[0].snippet.contains("<b>borrow</b>"), "{}", hits[0].snippet);
    }

    #[tokio::test]
    async fn exact_uri_ranks_first() {
        let (_dir, index) = open_index(30).await;
        index
            .index(&doc("/d/a.txt", &[("p", "alpha common words")]))
            .await
            .unwrap();
        index
            .index(&doc("/d/b.txt", &[("p", "beta common words")]))
            .await
            .unwrap();

        let hits = index.search("/d/b.txt", 10, 0).await.unwrap();
        assert_eq!(hits[0].uri, "/d/b.txt");
        assert_eq!(hits[0].score, EXACT_URI_SCORE);

        // Past the first page the shortcut disappears.
        let paged = index.search("/d/b.txt", 10, 1).await.unwrap();
        assert!(paged.iter().all(|h| h.score != EXACT_URI_SCORE));
    }

    #[tokio::test]
    async fn empty_and_unparseable_queries_return_nothing() {
        let (_dir, index) = open_index(30).await;
        index
            .index(&doc("/d/a.txt", &[("p", "plain words")]))
            .await
            .unwrap();
        assert!(index.search("", 10, 0).await.unwrap().is_empty());
        assert!(index.search("   ", 10, 0).await.unwrap().is_empty());
        assert!(index.search("\"unterminated", 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn term_sections_stay_out_of_searchable_text() {
        let (_dir, index) = open_index(30).await;
        index
            .index(&doc(
                "/d/glossary.md",
                &[
                    ("term", "xylocarp definition entry"),
                    ("p", "a hard woody fruit"),
                ],
            ))
            .await
            .unwrap();

        assert!(index.search("xylocarp", 10, 0).await.unwrap().is_empty());
        let hits = index.search("woody", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].uri, "/d/glossary.md");
    }

    #[tokio::test]
    async fn snake_case_identifiers_match_whole() {
        let (_dir, index) = open_index(30).await;
        index
            .index(&doc("/d/code.md", &[("p", "set my_var before calling run")]))
            .await
            .unwrap();
        let hits = index.search("my_var", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        let miss = index.search("var", 10, 0).await.unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (_dir, index) = open_index(30).await;
        index
            .index(&doc("/d/a.txt", &[("p", "something searchable")]))
            .await
            .unwrap();
        index.remove("/d/a.txt").await.unwrap();
        index.remove("/d/a.txt").await.unwrap();
        index.remove("/d/never-indexed.txt").await.unwrap();
        assert!(index.search("searchable", 10, 0).await.unwrap().is_empty());
        assert!(index.record("/d/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn staleness_tracks_retention_and_missing_rows() {
        let (_dir, index) = open_index(30).await;
        index
            .index(&doc("/d/fresh.txt", &[("p", "fresh enough")]))
            .await
            .unwrap();
        assert!(!index.is_stale("/d/fresh.txt").await.unwrap());
        assert!(index.is_stale("/d/unknown.txt").await.unwrap());

        sqlx::query(
            "UPDATE documents SET last_indexed = strftime('%s', 'now', '-40 days')
             WHERE uri = '/d/fresh.txt'",
        )
        .execute(&index.pool)
        .await
        .unwrap();
        assert!(index.is_stale("/d/fresh.txt").await.unwrap());

        // Bookkeeping without a content row means the text never landed.
        sqlx::query(
            "INSERT INTO documents (uri, hash, last_indexed) VALUES ('/d/ghost.txt', 'abc', strftime('%s','now'))",
        )
        .execute(&index.pool)
        .await
        .unwrap();
        assert!(index.is_stale("/d/ghost.txt").await.unwrap());

        let queue = index.needs_reindex().await.unwrap();
        assert_eq!(queue, vec!["/d/fresh.txt", "/d/ghost.txt"]);
    }

    #[tokio::test]
    async fn reindexing_refreshes_without_duplicates() {
        let (_dir, index) = open_index(30).await;
        let d = doc("/d/a.txt", &[("p", "stable content here")]);
        index.index(&d).await.unwrap();
        index.index(&d).await.unwrap();
        let hits = index.search("stable", 10, 0).await.unwrap();
        assert_eq!(hits.len(), 1);
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total_documents, 1);
    }

    #[tokio::test]
    async fn stats_aggregate_bookkeeping() {
        let (_dir, index) = open_index(30).await;
        let empty = index.stats().await.unwrap();
        assert_eq!(empty.total_documents, 0);
        assert_eq!(empty.last_indexed, None);

        index
            .index(&doc("/d/a.txt", &[("p", "first file")]))
            .await
            .unwrap();
        index
            .index(&doc("/d/b.txt", &[("p", "second file, longer")]))
            .await
            .unwrap();
        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total_documents, 2);
        assert!(stats.total_size_bytes > 0);
        assert!(stats.last_indexed.is_some());
    }

    #[tokio::test]
    async fn search_respects_limit() {
        let (_dir, index) = open_index(30).await;
        for i in 0..5 {
            index
                .index(&doc(
                    &format!("/d/{i}.txt"),
                    &[("p", "shared keyword everywhere")],
                ))
                .await
                .unwrap();
        }
        let hits = index.search("keyword", 3, 0).await.unwrap();
        assert_eq!(hits.len(), 3);
        let rest = index.search("keyword", 3, 3).await.unwrap();
        assert_eq!(rest.len(), 2);
    }
}
