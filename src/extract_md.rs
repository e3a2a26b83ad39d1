//! Line-oriented markdown section extraction.
//!
//! Shares the HTML weight tables: ATX headings map onto `h1`–`h6`, fenced
//! code blocks onto `pre`, quoted lines onto `blockquote`, list items onto
//! `li`, and remaining blank-line-separated blocks onto `p`. Inline
//! emphasis spans (`**bold**`, `*em*`, `` `code` ``) strip their markers and
//! compound the same inline multipliers an HTML element would earn.

use crate::config::ExtractConfig;
use crate::models::Section;

pub struct MarkdownExtractor {
    config: ExtractConfig,
}

impl MarkdownExtractor {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }

    /// Extracts weighted sections from markdown text. Pure; never errors.
    pub fn extract(&self, markdown: &str) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut paragraph: Vec<&str> = Vec::new();
        let mut quote: Vec<String> = Vec::new();
        let mut fence: Option<Vec<&str>> = None;

        for line in markdown.lines() {
            if fence.is_some() {
                if is_fence(line) {
                    let block = fence.take().unwrap_or_default().join("\n");
                    self.push_section(&mut sections, "pre", block.trim(), 1.0);
                } else if let Some(buf) = fence.as_mut() {
                    buf.push(line);
                }
                continue;
            }

            if is_fence(line) {
                self.flush_paragraph(&mut sections, &mut paragraph);
                self.flush_quote(&mut sections, &mut quote);
                fence = Some(Vec::new());
                continue;
            }

            if let Some(rest) = line.strip_prefix('>') {
                self.flush_paragraph(&mut sections, &mut paragraph);
                quote.push(rest.trim_start().to_string());
                continue;
            }
            self.flush_quote(&mut sections, &mut quote);

            let trimmed = line.trim();
            if trimmed.is_empty() {
                self.flush_paragraph(&mut sections, &mut paragraph);
                continue;
            }

            if let Some((level, text)) = heading(trimmed) {
                self.flush_paragraph(&mut sections, &mut paragraph);
                let kind = format!("h{}", level);
                let (clean, mult) = self.strip_inline(text);
                if let Some(section) =
                    self.make_section(&kind, &clean, mult)
                {
                    let mut section = section;
                    section.meta.insert("level".to_string(), kind.clone());
                    sections.push(section);
                }
                continue;
            }

            if let Some(item) = list_item(trimmed) {
                self.flush_paragraph(&mut sections, &mut paragraph);
                let (clean, mult) = self.strip_inline(item);
                self.push_section(&mut sections, "li", &clean, mult);
                continue;
            }

            paragraph.push(trimmed);
        }

        // Trailing state: an unterminated fence is still code.
        if let Some(buf) = fence.take() {
            self.push_section(&mut sections, "pre", buf.join("\n").trim(), 1.0);
        }
        self.flush_paragraph(&mut sections, &mut paragraph);
        self.flush_quote(&mut sections, &mut quote);

        sections
    }

    fn flush_paragraph(&self, sections: &mut Vec<Section>, paragraph: &mut Vec<&str>) {
        if paragraph.is_empty() {
            return;
        }
        let text = paragraph.join(" ");
        paragraph.clear();
        let (clean, mult) = self.strip_inline(&text);
        self.push_section(sections, "p", &clean, mult);
    }

    fn flush_quote(&self, sections: &mut Vec<Section>, quote: &mut Vec<String>) {
        if quote.is_empty() {
            return;
        }
        let text = quote.join(" ");
        quote.clear();
        let (clean, mult) = self.strip_inline(&text);
        self.push_section(sections, "blockquote", &clean, mult);
    }

    fn push_section(&self, sections: &mut Vec<Section>, kind: &str, content: &str, mult: f64) {
        if let Some(section) = self.make_section(kind, content, mult) {
            sections.push(section);
        }
    }

    fn make_section(&self, kind: &str, content: &str, mult: f64) -> Option<Section> {
        let content = content.trim();
        if content.len() < self.config.min_text_length {
            return None;
        }
        let base = self.config.base_weights.get(kind).copied().unwrap_or(1.0);
        let weight = ((base * mult) * 100.0).round() / 100.0;
        Some(Section::new(kind, content, weight))
    }

    /// Strips inline emphasis markers, compounding the configured multiplier
    /// once per span, mirroring the HTML inline rules.
    fn strip_inline(&self, text: &str) -> (String, f64) {
        let mut mult = 1.0;
        let mut current = text.to_string();
        // Underscore emphasis is deliberately not handled: snake_case
        // identifiers would be mangled, and those matter for code corpora.
        for (delim, tag) in [("`", "code"), ("**", "strong"), ("*", "em")] {
            let (stripped, count) = strip_delimited(&current, delim);
            if count > 0 {
                if let Some(m) = self.config.inline_multipliers.get(tag) {
                    mult *= m.powi(count as i32);
                }
            }
            current = stripped;
        }
        (current, mult)
    }
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    rest.strip_prefix(' ').map(|text| (hashes, text.trim()))
}

fn list_item(line: &str) -> Option<&str> {
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    // Ordered lists: "1. item"
    let digits = line.bytes().take_while(|b| b.is_ascii_digit()).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix(". ") {
            return Some(rest.trim());
        }
    }
    None
}

/// Removes paired `delim` markers, returning the cleaned text and the number
/// of complete spans found.
fn strip_delimited(text: &str, delim: &str) -> (String, usize) {
    let mut out = String::new();
    let mut rest = text;
    let mut count = 0;
    while let Some(start) = rest.find(delim) {
        let after = &rest[start + delim.len()..];
        match after.find(delim) {
            Some(end) if end > 0 => {
                out.push_str(&rest[..start]);
                out.push_str(&after[..end]);
                rest = &after[end + delim.len()..];
                count += 1;
            }
            _ => break,
        }
    }
    out.push_str(rest);
    (out, count)
}
