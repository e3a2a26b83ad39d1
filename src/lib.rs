//! # Lookout
//!
//! A continuously updated full-text search index over local files.
//!
//! Lookout crawls configured directories, extracts weighted text from the
//! formats it understands (HTML, Markdown, Jupyter notebooks, plain text),
//! and keeps a SQLite FTS5 index in sync with the filesystem. Crawling is
//! resumable via checkpoints and changes observed by a filesystem watcher
//! flow into the same indexing stream as the background re-crawl.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │  Crawlers   │──▶│  StreamMux  │──▶│  Engine   │
//! │ FS + watch  │   │ merge+drain │   │ extract   │
//! └─────────────┘   └─────────────┘   └────┬──────┘
//!                                          │
//!                      ┌───────────────────┤
//!                      ▼                   ▼
//!                 ┌──────────┐       ┌──────────┐
//!                 │   CLI    │       │  SQLite  │
//!                 │  (lkt)   │       │   FTS5   │
//!                 └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lkt init                        # create the index database
//! lkt run                         # crawl, watch, and index until Ctrl-C
//! lkt search "borrow checker"     # ranked full-text search
//! lkt stats                       # index health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`crawler`] | Crawler trait and source factory |
//! | [`crawler_fs`] | Local filesystem crawler with watching |
//! | [`mux`] | Ordered merge of payload streams |
//! | [`loaders`] | Format loaders and the extension registry |
//! | [`extract_html`] | Weighted HTML section extraction |
//! | [`extract_md`] | Weighted Markdown section extraction |
//! | [`index`] | Search index trait and backend factory |
//! | [`index_fts`] | SQLite FTS5 backend |
//! | [`engine`] | Crawl-to-index orchestration |
//! | [`hash`] | Content hashing |

pub mod config;
pub mod crawler;
pub mod crawler_fs;
pub mod engine;
pub mod extract_html;
pub mod extract_md;
pub mod hash;
pub mod index;
pub mod index_fts;
pub mod loaders;
pub mod models;
pub mod mux;
