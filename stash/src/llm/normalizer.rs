//! Recovers a [`SummaryResult`] from free-form model text.
//!
//! Decoding happens in two independent steps: [`strip_wrappers`] removes
//! markdown code fences the model likes to add, then [`decode_summary`]
//! parses the JSON object. [`normalize`] never fails; text that does not
//! decode is kept verbatim as the summary.

use thiserror::Error;
use tracing::warn;

use super::{SummaryFidelity, SummaryResult};

const FENCE: &str = "```";

#[derive(Debug, Error)]
#[error("model output is not a summary object: {reason}")]
pub struct MalformedModelOutput {
    pub reason: String,
}

/// Remove a markdown code fence wrapped around the whole reply.
///
/// Only a leading fence line (with its optional language tag) and a trailing
/// fence are removed; fence markers inside the text are kept.
pub fn strip_wrappers(text: &str) -> String {
    let mut inner = text.trim();
    if let Some(rest) = inner.strip_prefix(FENCE) {
        inner = match rest.find('\n') {
            Some(newline) if is_language_tag(&rest[..newline]) => &rest[newline + 1..],
            _ => rest,
        };
    }
    if let Some(rest) = inner.strip_suffix(FENCE) {
        inner = rest;
    }
    inner.trim().to_string()
}

fn is_language_tag(tag: &str) -> bool {
    tag.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+' || c == '_')
}

/// Strict parse of `{"summary": ..., "tags": [...]}`.
///
/// When the text carries prose around the object, the outermost `{...}` span
/// is tried as well.
pub fn decode_summary(text: &str) -> Result<SummaryResult, MalformedModelOutput> {
    let first_error = match serde_json::from_str::<SummaryResult>(text) {
        Ok(result) => return Ok(result),
        Err(e) => e,
    };

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        let is_inner_span = start < end && (start > 0 || end + 1 < text.len());
        if is_inner_span {
            if let Ok(result) = serde_json::from_str::<SummaryResult>(&text[start..=end]) {
                return Ok(result);
            }
        }
    }

    Err(MalformedModelOutput {
        reason: first_error.to_string(),
    })
}

/// Like [`normalize`], also reporting which tier produced the result.
pub fn normalize_with_fidelity(raw: &str) -> (SummaryResult, SummaryFidelity) {
    let unwrapped = strip_wrappers(raw);
    match decode_summary(&unwrapped) {
        Ok(result) => (result, SummaryFidelity::Structured),
        Err(e) => {
            warn!("keeping raw model text as summary: {}", e);
            (SummaryResult::raw_text(unwrapped), SummaryFidelity::RawText)
        }
    }
}

pub fn normalize(raw: &str) -> SummaryResult {
    normalize_with_fidelity(raw).0
}
