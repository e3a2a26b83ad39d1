//! Core data models used throughout Lookout.
//!
//! These types represent the file observations, weighted sections, and search
//! results that flow through the crawl → extract → index pipeline.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// One observed file state emitted by a crawler.
///
/// Created each time a file is read or observed as changed/deleted, consumed
/// exactly once by the indexing loop, and not retained afterward.
#[derive(Debug, Clone)]
pub struct FilePayload {
    /// Stable locator (path or URL), unique within a crawl source.
    pub uri: String,
    /// Raw bytes; empty when the event is deletion-only.
    pub content: Vec<u8>,
    /// Hex-encoded SHA-256 of `content`; empty when content is absent.
    pub hash: String,
    /// Free-form source attributes (size etc.).
    pub metadata: HashMap<String, String>,
    /// Originating timestamp, seconds since epoch.
    pub modified: i64,
    /// True means "remove this URI from the index".
    pub deleted: bool,
}

impl FilePayload {
    /// A deletion-only observation carrying no content.
    pub fn deleted(uri: String, modified: i64) -> Self {
        Self {
            uri,
            content: Vec::new(),
            hash: String::new(),
            metadata: HashMap::new(),
            modified,
            deleted: true,
        }
    }
}

/// One unit of extracted, weighted text.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    /// Tag/category label (`h1`, `p`, `meta`, `text`, ...), not free-form.
    pub kind: String,
    /// Extracted plain text, trimmed, non-empty.
    pub content: String,
    /// Relative importance within the document; always positive.
    pub weight: f64,
    /// Small key/value map (heading level, depth, breadcrumb path, ...).
    pub meta: BTreeMap<String, String>,
}

impl Section {
    pub fn new(kind: impl Into<String>, content: impl Into<String>, weight: f64) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
            weight,
            meta: BTreeMap::new(),
        }
    }
}

/// One document's full extraction result, ready for indexing.
#[derive(Debug, Clone)]
pub struct Indexable {
    /// Matches the originating [`FilePayload::uri`].
    pub uri: String,
    /// Extraction order is preserved for snippet context; queries ignore it.
    pub sections: Vec<Section>,
    /// Whole-document multiplier applied at ranking time.
    pub weight: f64,
    /// Propagated from the payload.
    pub modified: i64,
    /// Document-level key/values (hash, detected type, size).
    pub metadata: HashMap<String, String>,
}

impl Indexable {
    /// Builds an empty extraction result for a payload, carrying over the
    /// payload metadata plus hash/type/size bookkeeping keys.
    pub fn from_payload(file: &FilePayload, doc_type: &str) -> Self {
        let mut metadata = file.metadata.clone();
        metadata.insert("hash".to_string(), file.hash.clone());
        metadata.insert("type".to_string(), doc_type.to_string());
        metadata
            .entry("size_bytes".to_string())
            .or_insert_with(|| file.content.len().to_string());

        Self {
            uri: file.uri.clone(),
            sections: Vec::new(),
            weight: 1.0,
            modified: file.modified,
            metadata,
        }
    }
}

/// A ranked hit returned from a search index. Lower scores rank better
/// (BM25 ranks are negative).
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub uri: String,
    pub score: f64,
    pub snippet: String,
}

/// Per-URI bookkeeping row held by a search index.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub uri: String,
    pub hash: String,
    pub doc_type: String,
    pub last_indexed: i64,
    pub size_bytes: i64,
}

/// Aggregate index health, served on demand.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub total_documents: i64,
    pub total_size_bytes: i64,
    pub last_indexed: Option<i64>,
}

/// Serializable snapshot of crawl progress enabling resumable traversal.
///
/// Valid for reuse only if the configured root paths are unchanged
/// (order-independent comparison).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub paths: Vec<String>,
    pub queue: Vec<String>,
    #[serde(default)]
    pub finished_once: bool,
}

impl Checkpoint {
    /// Whether this checkpoint was taken against the same root set.
    pub fn matches_roots(&self, roots: &[String]) -> bool {
        let mut a = self.paths.clone();
        let mut b = roots.to_vec();
        a.sort();
        b.sort();
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_root_comparison_is_order_independent() {
        let cp = Checkpoint {
            paths: vec!["/b".to_string(), "/a".to_string()],
            queue: vec![],
            finished_once: false,
        };
        assert!(cp.matches_roots(&["/a".to_string(), "/b".to_string()]));
        assert!(!cp.matches_roots(&["/a".to_string()]));
        assert!(!cp.matches_roots(&["/a".to_string(), "/c".to_string()]));
    }

    #[test]
    fn indexable_carries_bookkeeping_metadata() {
        let file = FilePayload {
            uri: "/tmp/a.md".to_string(),
            content: b"hello".to_vec(),
            hash: "abc".to_string(),
            metadata: HashMap::new(),
            modified: 42,
            deleted: false,
        };

        let ix = Indexable::from_payload(&file, "markdown");
        assert_eq!(ix.uri, "/tmp/a.md");
        assert_eq!(ix.modified, 42);
        assert_eq!(ix.weight, 1.0);
        assert_eq!(ix.metadata["hash"], "abc");
        assert_eq!(ix.metadata["type"], "markdown");
        assert_eq!(ix.metadata["size_bytes"], "5");
    }
}
