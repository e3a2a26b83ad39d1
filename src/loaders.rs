//! Format loaders and the extension registry.
//!
//! A loader turns one [`FilePayload`] into the weighted sections of an
//! [`Indexable`]. The registry maps file extensions to loaders, built once
//! at startup from prioritized config entries; the first registration per
//! extension wins and unknown module names are warned about and omitted
//! rather than failing startup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{ExtractConfig, LoaderConfig};
use crate::extract_html::HtmlExtractor;
use crate::extract_md::MarkdownExtractor;
use crate::models::{FilePayload, Indexable, Section};

pub trait Loader: Send + Sync {
    /// Short type tag recorded in the index bookkeeping (`html`, `markdown`, ...).
    fn name(&self) -> &'static str;

    /// Populates `indexable.sections` from the payload. Parse failures
    /// produce an empty result, not an error; `Err` is reserved for cases
    /// where the payload itself is unusable.
    fn extract(&self, file: &FilePayload, indexable: &mut Indexable) -> Result<()>;
}

pub struct HtmlLoader {
    extractor: HtmlExtractor,
}

impl HtmlLoader {
    pub fn new(config: ExtractConfig) -> Self {
        Self {
            extractor: HtmlExtractor::new(config),
        }
    }
}

impl Loader for HtmlLoader {
    fn name(&self) -> &'static str {
        "html"
    }

    fn extract(&self, file: &FilePayload, indexable: &mut Indexable) -> Result<()> {
        let html = String::from_utf8_lossy(&file.content);
        indexable.sections.extend(self.extractor.extract(&html));
        Ok(())
    }
}

pub struct MarkdownLoader {
    extractor: MarkdownExtractor,
}

impl MarkdownLoader {
    pub fn new(config: ExtractConfig) -> Self {
        Self {
            extractor: MarkdownExtractor::new(config),
        }
    }
}

impl Loader for MarkdownLoader {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn extract(&self, file: &FilePayload, indexable: &mut Indexable) -> Result<()> {
        let markdown = String::from_utf8_lossy(&file.content);
        indexable
            .sections
            .extend(self.extractor.extract(&markdown));
        Ok(())
    }
}

/// Plain text: blank-line-separated blocks, weight 1.
pub struct TextLoader {
    min_text_length: usize,
}

impl TextLoader {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            min_text_length: config.min_text_length,
        }
    }
}

impl Loader for TextLoader {
    fn name(&self) -> &'static str {
        "text"
    }

    fn extract(&self, file: &FilePayload, indexable: &mut Indexable) -> Result<()> {
        let text = String::from_utf8_lossy(&file.content);
        for block in text.split("\n\n") {
            let block = block.split_whitespace().collect::<Vec<_>>().join(" ");
            if block.len() >= self.min_text_length {
                indexable.sections.push(Section::new("text", block, 1.0));
            }
        }
        Ok(())
    }
}

// Minimal nbformat surface: cells with a type, source lines, and stream
// outputs. Everything else in the notebook is ignored.
#[derive(Deserialize)]
struct Notebook {
    #[serde(default)]
    cells: Vec<NotebookCell>,
}

#[derive(Deserialize)]
struct NotebookCell {
    #[serde(default)]
    cell_type: String,
    #[serde(default)]
    source: SourceLines,
    #[serde(default)]
    outputs: Vec<CellOutput>,
}

#[derive(Deserialize)]
struct CellOutput {
    #[serde(default)]
    output_type: String,
    #[serde(default)]
    text: Option<SourceLines>,
}

/// nbformat stores text either as one string or a list of lines.
#[derive(Deserialize, Default)]
#[serde(untagged)]
enum SourceLines {
    #[default]
    Empty,
    One(String),
    Many(Vec<String>),
}

impl SourceLines {
    fn join(&self) -> String {
        match self {
            SourceLines::Empty => String::new(),
            SourceLines::One(s) => s.clone(),
            SourceLines::Many(lines) => lines.concat(),
        }
    }
}

/// Jupyter notebooks: markdown cells run through the markdown extractor,
/// code cells become `code` sections, stream outputs become `text` sections.
pub struct JupyterLoader {
    markdown: MarkdownExtractor,
    config: ExtractConfig,
}

impl JupyterLoader {
    pub fn new(config: ExtractConfig) -> Self {
        Self {
            markdown: MarkdownExtractor::new(config.clone()),
            config,
        }
    }

    fn push_if_long_enough(&self, indexable: &mut Indexable, kind: &str, text: &str, weight: f64) {
        let text = text.trim();
        if text.len() >= self.config.min_text_length {
            indexable.sections.push(Section::new(kind, text, weight));
        }
    }
}

impl Loader for JupyterLoader {
    fn name(&self) -> &'static str {
        "jupyter"
    }

    fn extract(&self, file: &FilePayload, indexable: &mut Indexable) -> Result<()> {
        let notebook: Notebook = match serde_json::from_slice(&file.content) {
            Ok(nb) => nb,
            Err(e) => {
                warn!(uri = %file.uri, error = %e, "unparseable notebook, skipping");
                return Ok(());
            }
        };

        let code_weight = self
            .config
            .base_weights
            .get("code")
            .copied()
            .unwrap_or(1.0);

        for cell in &notebook.cells {
            match cell.cell_type.as_str() {
                "markdown" => {
                    indexable
                        .sections
                        .extend(self.markdown.extract(&cell.source.join()));
                }
                "code" => {
                    self.push_if_long_enough(indexable, "code", &cell.source.join(), code_weight);
                    for output in &cell.outputs {
                        if output.output_type == "stream" {
                            if let Some(text) = &output.text {
                                self.push_if_long_enough(indexable, "text", &text.join(), 1.0);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Extension → loader map, owned by the engine. No process-wide registry.
pub struct LoaderRegistry {
    by_extension: HashMap<String, Arc<dyn Loader>>,
}

impl LoaderRegistry {
    /// Builds the registry from prioritized config entries. Lower priority
    /// numbers register first; the first loader claiming an extension keeps
    /// it. Unknown modules are logged and omitted.
    pub fn from_config(entries: &[LoaderConfig], extract: &ExtractConfig) -> Self {
        let mut sorted: Vec<&LoaderConfig> = entries.iter().collect();
        sorted.sort_by_key(|e| e.priority);

        let mut by_extension: HashMap<String, Arc<dyn Loader>> = HashMap::new();
        for entry in sorted {
            let loader: Arc<dyn Loader> = match entry.module.as_str() {
                "html" => Arc::new(HtmlLoader::new(extract.clone())),
                "markdown" => Arc::new(MarkdownLoader::new(extract.clone())),
                "jupyter" => Arc::new(JupyterLoader::new(extract.clone())),
                "text" => Arc::new(TextLoader::new(extract)),
                other => {
                    warn!(module = other, "unknown loader module, skipping");
                    continue;
                }
            };

            for extension in &entry.extensions {
                let mut key = extension.to_lowercase();
                if !key.starts_with('.') {
                    key.insert(0, '.');
                }
                by_extension.entry(key).or_insert_with(|| loader.clone());
            }
        }

        Self { by_extension }
    }

    pub fn get(&self, extension: &str) -> Option<&Arc<dyn Loader>> {
        self.by_extension.get(&extension.to_lowercase())
    }

    /// Resolves a loader from a URI's file extension.
    pub fn for_uri(&self, uri: &str) -> Option<&Arc<dyn Loader>> {
        let extension = Path::new(uri)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))?;
        let loader = self.by_extension.get(&extension);
        if loader.is_none() {
            debug!(uri, %extension, "no loader registered for extension");
        }
        loader
    }

    pub fn supported_extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self.by_extension.keys().cloned().collect();
        extensions.sort();
        extensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn payload(uri: &str, content: &[u8]) -> FilePayload {
        FilePayload {
            uri: uri.to_string(),
            content: content.to_vec(),
            hash: crate::hash::content_hash(content),
            metadata: HashMap::new(),
            modified: 0,
            deleted: false,
        }
    }

    fn default_registry() -> LoaderRegistry {
        let config: Config = toml::from_str("").unwrap();
        LoaderRegistry::from_config(&config.loaders, &config.extract)
    }

    #[test]
    fn resolves_loaders_by_extension() {
        let config: Config = toml::from_str("").unwrap();
        let registry = LoaderRegistry::from_config(&config.loaders, &config.extract);
        assert_eq!(registry.for_uri("/docs/a.html").unwrap().name(), "html");
        assert_eq!(registry.for_uri("/docs/b.MD").unwrap().name(), "markdown");
        assert_eq!(registry.for_uri("/docs/c.ipynb").unwrap().name(), "jupyter");
        assert!(registry.for_uri("/docs/d.rs").is_none());
        assert!(registry.for_uri("/docs/noext").is_none());
    }

    #[test]
    fn first_registration_per_extension_wins() {
        let config: Config = toml::from_str("").unwrap();
        let entries = vec![
            LoaderConfig {
                module: "text".to_string(),
                extensions: vec![".md".to_string()],
                priority: 1,
            },
            LoaderConfig {
                module: "markdown".to_string(),
                extensions: vec![".md".to_string()],
                priority: 2,
            },
        ];
        let registry = LoaderRegistry::from_config(&entries, &config.extract);
        assert_eq!(registry.get(".md").unwrap().name(), "text");
    }

    #[test]
    fn unknown_modules_are_omitted() {
        let config: Config = toml::from_str("").unwrap();
        let entries = vec![LoaderConfig {
            module: "pdf".to_string(),
            extensions: vec![".pdf".to_string()],
            priority: 1,
        }];
        let registry = LoaderRegistry::from_config(&entries, &config.extract);
        assert!(registry.get(".pdf").is_none());
    }

    #[test]
    fn text_loader_splits_blocks() {
        let registry = default_registry();
        let file = payload("/n/notes.txt", b"first block here\n\nsecond block here\n\nxy");
        let mut ix = Indexable::from_payload(&file, "text");
        registry
            .for_uri(&file.uri)
            .unwrap()
            .extract(&file, &mut ix)
            .unwrap();
        assert_eq!(ix.sections.len(), 2);
        assert_eq!(ix.sections[0].content, "first block here");
        assert_eq!(ix.sections[0].weight, 1.0);
    }

    #[test]
    fn jupyter_loader_reads_cells() {
        let nb = serde_json::json!({
            "nbformat": 4,
            "cells": [
                { "cell_type": "markdown", "source": ["# Analysis\n", "\n", "Some prose here."] },
                {
                    "cell_type": "code",
                    "source": "import pandas as pd",
                    "outputs": [
                        { "output_type": "stream", "name": "stdout", "text": ["shape: (3, 2)"] }
                    ]
                }
            ]
        });
        let registry = default_registry();
        let file = payload("/n/analysis.ipynb", nb.to_string().as_bytes());
        let mut ix = Indexable::from_payload(&file, "jupyter");
        registry
            .for_uri(&file.uri)
            .unwrap()
            .extract(&file, &mut ix)
            .unwrap();

        let kinds: Vec<&str> = ix.sections.iter().map(|s| s.kind.as_str()).collect();
        assert_eq!(kinds, vec!["h1", "p", "code", "text"]);
        assert_eq!(ix.sections[0].content, "Analysis");
        assert_eq!(ix.sections[2].content, "import pandas as pd");
        assert_eq!(ix.sections[3].content, "shape: (3, 2)");
    }

    #[test]
    fn malformed_notebook_yields_no_sections() {
        let registry = default_registry();
        let file = payload("/n/broken.ipynb", b"not json at all");
        let mut ix = Indexable::from_payload(&file, "jupyter");
        registry
            .for_uri(&file.uri)
            .unwrap()
            .extract(&file, &mut ix)
            .unwrap();
        assert!(ix.sections.is_empty());
    }
}
