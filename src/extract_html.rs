//! Weighted HTML section extraction.
//!
//! Turns markup into a flat list of importance-weighted [`Section`]s. Known
//! `<meta>` tags are lifted first with fixed weights; the body is then
//! walked, classifying every element as content-bearing (emits one section
//! from its direct text), container (recursed into, deepening the context
//! path), or neither (skipped with its subtree). Section weight is
//! `base / depth_decay^depth`, scaled by the context multiplier of every
//! matching ancestor and by the inline-emphasis multiplier of every
//! emphasized descendant, rounded to two decimals.
//!
//! Extraction never fails: unparseable markup yields whatever meta sections
//! were collected before the parse broke, or nothing at all.

use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::config::ExtractConfig;
use crate::models::Section;

const CONTENT_ELEMENTS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "blockquote", "pre", "code", "li", "dt", "dd", "td",
    "th", "figcaption", "caption",
];

const CONTAINER_ELEMENTS: &[&str] = &[
    "div", "section", "article", "aside", "nav", "header", "footer", "main", "ul", "ol", "dl",
    "table", "tbody", "thead", "tr", "figure", "details", "summary",
];

const INLINE_ELEMENTS: &[&str] = &[
    "span", "a", "b", "strong", "i", "em", "u", "mark", "code", "kbd", "samp", "var", "sub",
    "sup", "small",
];

// HTML void elements never carry an end tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Known meta tag names/properties mapped to `(semantic name, fixed weight)`.
/// Unmapped meta tags are ignored; mapped weights are carried verbatim with
/// no depth or context scaling.
const META_MAP: &[(&str, &str, f64)] = &[
    ("description", "description", 20.0),
    ("keywords", "keywords", 200.0),
    ("og:title", "title", 200.0),
    ("og:description", "description", 20.0),
    ("og:type", "type", 1.0),
    ("og:url", "url", 2000.0),
    ("og:image", "image", 1.0),
    ("author", "author", 10.0),
    ("article:published_time", "published_time", 10.0),
];

pub struct HtmlExtractor {
    config: ExtractConfig,
}

/// An in-flight content-bearing element whose direct text is being gathered.
struct Capture {
    tag: String,
    text: String,
    inline_mult: f64,
    /// Nesting inside the captured element; the capture ends when it drops
    /// back to zero.
    elem_depth: usize,
    /// Non-inline descendant nesting; text below a block descendant is not
    /// part of the element's direct text.
    block_depth: usize,
    depth: usize,
    context: Vec<String>,
    id: String,
    classes: String,
}

impl HtmlExtractor {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }

    /// Extracts weighted sections from HTML markup. Pure; never errors.
    pub fn extract(&self, html: &str) -> Vec<Section> {
        let (mut sections, has_body) = self.extract_meta(html);
        match self.walk_body(html, has_body) {
            Ok(body_sections) => sections.extend(body_sections),
            Err(e) => {
                // Meta sections gathered before the failure are still useful.
                debug!(error = %e, "html body walk failed, keeping meta sections only");
            }
        }
        sections
    }

    /// First pass: lift known meta tags and note whether a `<body>` exists.
    /// Independent of the body traversal, so a parse failure later cannot
    /// lose these.
    fn extract_meta(&self, html: &str) -> (Vec<Section>, bool) {
        let mut reader = html_reader(html);
        let mut sections = Vec::new();
        let mut has_body = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let tag = tag_name(&e);
                    if tag == "body" {
                        has_body = true;
                    } else if tag == "meta" {
                        if let Some(section) = meta_section(&e) {
                            sections.push(section);
                        }
                    }
                }
                Ok(Event::Eof) => break,
                Err(_) => break,
                Ok(_) => {}
            }
        }

        (sections, has_body)
    }

    /// Second pass: walk the body tree (or the whole fragment when no body
    /// tag exists) and emit weighted sections.
    fn walk_body(&self, html: &str, has_body: bool) -> Result<Vec<Section>, quick_xml::Error> {
        let mut reader = html_reader(html);
        let mut sections = Vec::new();

        let mut in_body = !has_body;
        let mut context: Vec<String> = Vec::new();
        // Depth of a subtree being skipped (scripts, styles, unclassified
        // elements, containers past max_depth).
        let mut suppress_depth: usize = 0;
        let mut capture: Option<Capture> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let tag = tag_name(&e);
                    if !in_body {
                        if tag == "body" {
                            in_body = true;
                        }
                        continue;
                    }
                    let is_void = VOID_ELEMENTS.contains(&tag.as_str());

                    if let Some(cap) = capture.as_mut() {
                        cap.note_descendant(&tag, is_void, &self.config);
                        continue;
                    }

                    if suppress_depth > 0 {
                        if !is_void {
                            suppress_depth += 1;
                        }
                        continue;
                    }
                    if is_void {
                        continue;
                    }

                    if CONTAINER_ELEMENTS.contains(&tag.as_str()) {
                        if context.len() + 1 > self.config.max_depth {
                            suppress_depth = 1;
                        } else {
                            context.push(tag);
                        }
                    } else if CONTENT_ELEMENTS.contains(&tag.as_str()) {
                        capture = Some(Capture::begin(tag, &e, &context));
                    } else {
                        // Neither content nor container: invisible to the
                        // walk, along with everything beneath it.
                        suppress_depth = 1;
                    }
                }
                Event::Empty(e) => {
                    let tag = tag_name(&e);
                    if !in_body || suppress_depth > 0 {
                        continue;
                    }
                    if let Some(cap) = capture.as_mut() {
                        cap.note_empty(&tag, &self.config);
                    }
                }
                Event::End(e) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                    if !in_body {
                        continue;
                    }
                    if VOID_ELEMENTS.contains(&tag.as_str()) {
                        continue;
                    }

                    if let Some(cap) = capture.as_mut() {
                        if cap.note_end(&tag) {
                            let finished = capture.take().expect("capture present");
                            if let Some(section) = self.finish_capture(finished) {
                                sections.push(section);
                            }
                        }
                        continue;
                    }

                    if suppress_depth > 0 {
                        suppress_depth -= 1;
                    } else if context.last().map(String::as_str) == Some(tag.as_str()) {
                        context.pop();
                    }
                    // Stray end tags are ignored.
                }
                Event::Text(t) => {
                    if !in_body || suppress_depth > 0 {
                        continue;
                    }
                    let text = t
                        .unescape()
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned());

                    if let Some(cap) = capture.as_mut() {
                        if cap.block_depth == 0 {
                            cap.text.push_str(&text);
                        }
                        continue;
                    }

                    // Bare text node inside a container.
                    let trimmed = text.trim();
                    if trimmed.len() >= self.config.min_text_length {
                        let weight = self.weigh("text", context.len(), &context, 1.0);
                        let mut section = Section::new("text", trimmed, weight);
                        section.meta = walk_meta(context.len(), &context);
                        sections.push(section);
                    }
                }
                Event::CData(t) => {
                    if !in_body || suppress_depth > 0 {
                        continue;
                    }
                    if let Some(cap) = capture.as_mut() {
                        if cap.block_depth == 0 {
                            cap.text
                                .push_str(&String::from_utf8_lossy(t.as_ref()));
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(sections)
    }

    fn finish_capture(&self, cap: Capture) -> Option<Section> {
        let text = cap.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.len() < self.config.min_text_length {
            return None;
        }

        let weight = self.weigh(&cap.tag, cap.depth, &cap.context, cap.inline_mult);
        let mut section = Section::new(cap.tag.clone(), text, weight);
        section.meta = walk_meta(cap.depth, &cap.context);
        if cap.tag.starts_with('h') && cap.tag.len() == 2 {
            section.meta.insert("level".to_string(), cap.tag.clone());
            section.meta.insert("id".to_string(), cap.id);
            section.meta.insert("classes".to_string(), cap.classes);
        }
        Some(section)
    }

    /// `base / decay^depth`, times every configured ancestor multiplier,
    /// times the accumulated inline multiplier, rounded to two decimals.
    fn weigh(&self, kind: &str, depth: usize, context: &[String], inline_mult: f64) -> f64 {
        let base = self.config.base_weights.get(kind).copied().unwrap_or(1.0);
        let mut weight = base / self.config.depth_decay.powi(depth as i32);
        for ancestor in context {
            if let Some(mult) = self.config.context_multipliers.get(ancestor) {
                weight *= mult;
            }
        }
        weight *= inline_mult;
        (weight * 100.0).round() / 100.0
    }
}

impl Capture {
    fn begin(tag: String, e: &BytesStart<'_>, context: &[String]) -> Self {
        let (id, classes) = if tag.starts_with('h') {
            (attr_value(e, b"id"), attr_value(e, b"class"))
        } else {
            (String::new(), String::new())
        };
        Self {
            tag,
            text: String::new(),
            inline_mult: 1.0,
            elem_depth: 1,
            block_depth: 0,
            depth: context.len(),
            context: context.to_vec(),
            id,
            classes,
        }
    }

    /// A start tag seen inside the captured element.
    fn note_descendant(&mut self, tag: &str, is_void: bool, config: &ExtractConfig) {
        // Emphasis anywhere in the subtree compounds, block or not.
        if let Some(mult) = config.inline_multipliers.get(tag) {
            self.inline_mult *= mult;
        }
        if is_void {
            if !INLINE_ELEMENTS.contains(&tag) && self.block_depth == 0 {
                self.text.push(' ');
            }
            return;
        }
        self.elem_depth += 1;
        if !INLINE_ELEMENTS.contains(&tag) {
            if self.block_depth == 0 {
                self.text.push(' ');
            }
            self.block_depth += 1;
        }
    }

    fn note_empty(&mut self, tag: &str, config: &ExtractConfig) {
        if let Some(mult) = config.inline_multipliers.get(tag) {
            self.inline_mult *= mult;
        }
        if !INLINE_ELEMENTS.contains(&tag) && self.block_depth == 0 {
            self.text.push(' ');
        }
    }

    /// Returns true when the captured element itself has closed.
    fn note_end(&mut self, tag: &str) -> bool {
        self.elem_depth -= 1;
        if self.elem_depth == 0 {
            return true;
        }
        if !INLINE_ELEMENTS.contains(&tag) {
            self.block_depth = self.block_depth.saturating_sub(1);
        }
        false
    }
}

fn html_reader(html: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_reader(html.as_bytes());
    let config = reader.config_mut();
    config.check_end_names = false;
    config.allow_unmatched_ends = true;
    reader
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_lowercase()
}

fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> String {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
        .unwrap_or_default()
}

fn meta_section(e: &BytesStart<'_>) -> Option<Section> {
    let mut name = String::new();
    for key in [&b"name"[..], b"property", b"http-equiv"] {
        name = attr_value(e, key);
        if !name.is_empty() {
            break;
        }
    }
    let content = attr_value(e, b"content");
    if name.is_empty() || content.trim().is_empty() {
        return None;
    }

    let (semantic, weight) = META_MAP
        .iter()
        .find(|(attr, _, _)| *attr == name)
        .map(|(_, semantic, weight)| (*semantic, *weight))?;

    let mut section = Section::new("meta", content.trim(), weight);
    section
        .meta
        .insert("term".to_string(), semantic.to_string());
    Some(section)
}

fn walk_meta(depth: usize, context: &[String]) -> BTreeMap<String, String> {
    let mut meta = BTreeMap::new();
    meta.insert("depth".to_string(), depth.to_string());
    meta.insert("context".to_string(), context.join(" > "));
    meta
}
