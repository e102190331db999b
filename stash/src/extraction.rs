//! Turns fetched HTML into a title and a plain-text body.
//!
//! The body is built from paragraph elements only. Which paragraphs count as
//! article text is decided by a [`BoilerplateFilter`]; the default keeps
//! paragraphs longer than 50 characters, which drops most navigation links,
//! captions and cookie banners.

use common::ExtractionConfig;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

pub const MIN_PARAGRAPH_CHARS: usize = 50;
pub const MAX_BODY_CHARS: usize = 20_000;

const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Extracted page content handed to the summarizer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDocument {
    pub url: String,
    pub title: String,
    pub body: String,
}

/// Decides whether a (trimmed) paragraph is article text.
pub trait BoilerplateFilter: Send + Sync {
    fn keep(&self, paragraph: &str) -> bool;
}

/// Keeps paragraphs strictly longer than `min_chars` characters.
#[derive(Debug, Clone, Copy)]
pub struct MinLengthFilter {
    pub min_chars: usize,
}

impl Default for MinLengthFilter {
    fn default() -> Self {
        Self {
            min_chars: MIN_PARAGRAPH_CHARS,
        }
    }
}

impl BoilerplateFilter for MinLengthFilter {
    fn keep(&self, paragraph: &str) -> bool {
        paragraph.chars().count() > self.min_chars
    }
}

pub struct Extractor {
    filter: Box<dyn BoilerplateFilter>,
    max_body_chars: usize,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(MinLengthFilter::default(), MAX_BODY_CHARS)
    }
}

impl Extractor {
    pub fn new(filter: impl BoilerplateFilter + 'static, max_body_chars: usize) -> Self {
        Self {
            filter: Box::new(filter),
            max_body_chars,
        }
    }

    pub fn from_config(cfg: &ExtractionConfig) -> Self {
        Self::new(
            MinLengthFilter {
                min_chars: cfg.min_paragraph_chars.unwrap_or(MIN_PARAGRAPH_CHARS),
            },
            cfg.max_body_chars.unwrap_or(MAX_BODY_CHARS),
        )
    }

    /// Parse `html` (fetched from `url`) into a [`SourceDocument`].
    ///
    /// Malformed markup is tolerated by the parser; a page without paragraphs
    /// yields an empty body.
    pub fn extract(&self, url: &str, html: &str) -> SourceDocument {
        let document = Html::parse_document(html);

        let title = select_title(&document);

        let mut paragraphs: Vec<String> = Vec::new();
        if let Ok(selector) = Selector::parse("p") {
            for element in document.select(&selector) {
                let text = element_text(element);
                let text = text.trim();
                if self.filter.keep(text) {
                    paragraphs.push(text.to_string());
                }
            }
        }

        let body = truncate_chars(paragraphs.join(PARAGRAPH_SEPARATOR), self.max_body_chars);

        SourceDocument {
            url: url.to_string(),
            title,
            body,
        }
    }
}

/// `<title>` when it has text, otherwise the first `<h1>`, otherwise empty.
fn select_title(document: &Html) -> String {
    for css in ["title", "h1"] {
        if let Ok(selector) = Selector::parse(css) {
            if let Some(element) = document.select(&selector).next() {
                let text = element_text(element);
                let text = text.trim();
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }
    String::new()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect()
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text,
    }
}
