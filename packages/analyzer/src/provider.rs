//! Document provider collaborator and pre-prompt text slicing.
//!
//! Conversion of a fetched document to plain text is an external capability
//! consumed through a single trait call. The agent loop treats a
//! [`ConversionError`] as "no text available this round" and moves on.

use crate::error::ConversionError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Trait for document-to-text conversion backends (to allow mocking).
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    /// Convert the document behind `locator` to plain text.
    async fn extract_text(&self, locator: &str) -> Result<String, ConversionError>;
}

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    text: Option<String>,
    error: Option<String>,
}

/// Client for the document-conversion service.
///
/// The service fetches the document behind the locator itself and returns
/// plain text, so announcement PDFs never pass through this process.
pub struct HttpDocumentProvider {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpDocumentProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ConversionError> {
        let endpoint = endpoint.into();
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConversionError {
                locator: endpoint.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http_client,
            endpoint,
        })
    }
}

#[async_trait]
impl DocumentProvider for HttpDocumentProvider {
    async fn extract_text(&self, locator: &str) -> Result<String, ConversionError> {
        let err = |message: String| ConversionError {
            locator: locator.to_string(),
            message,
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "url": locator }))
            .send()
            .await
            .map_err(|e| err(e.to_string()))?
            .error_for_status()
            .map_err(|e| err(e.to_string()))?;

        let body: ConvertResponse = response
            .json()
            .await
            .map_err(|e| err(format!("malformed conversion response: {e}")))?;

        match body.text {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(err(body
                .error
                .unwrap_or_else(|| "conversion returned no text".to_string()))),
        }
    }
}

/// Keywords that mark passages worth keeping when a document exceeds the
/// per-round length budget.
const SLICE_KEYWORDS: &[&str] = &[
    "置换", "比例", "换股", "合并", "预案", "方案", "终止上市", "退市", "摘牌", "决议", "通过",
];

/// Bytes of context kept on each side of a keyword hit.
const CONTEXT_BYTES: usize = 500;

/// Reduce a converted document to its relevant passages.
///
/// Documents under `max_len` pass through unchanged. Longer ones are cut to
/// windows around keyword hits, overlapping windows merged, joined with
/// ellipsis markers. With no hits at all, the head of the document is kept.
pub fn slice_by_keywords(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }

    let mut positions: Vec<usize> = SLICE_KEYWORDS
        .iter()
        .flat_map(|kw| text.match_indices(kw).map(|(i, _)| i))
        .collect();
    positions.sort_unstable();
    positions.dedup();

    if positions.is_empty() {
        return truncate_at_char_boundary(text, max_len).to_string();
    }

    // Merge overlapping context windows.
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for pos in positions {
        let start = floor_char_boundary(text, pos.saturating_sub(CONTEXT_BYTES));
        let end = floor_char_boundary(text, (pos + CONTEXT_BYTES).min(text.len()));
        match spans.last_mut() {
            Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
            _ => spans.push((start, end)),
        }
    }

    let joined = spans
        .iter()
        .map(|&(start, end)| &text[start..end])
        .collect::<Vec<_>>()
        .join("\n...\n");

    truncate_at_char_boundary(&joined, max_len).to_string()
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    &s[..floor_char_boundary(s, max_bytes)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_passes_through() {
        let text = "短文档，无需切片。";
        assert_eq!(slice_by_keywords(text, 6_000), text);
    }

    #[test]
    fn test_keyword_windows_are_kept() {
        let filler = "无关内容。".repeat(500);
        let text = format!("{filler}本公司换股比例为1:0.1339。{filler}");

        let sliced = slice_by_keywords(&text, 6_000);
        assert!(sliced.len() <= 6_000);
        assert!(sliced.contains("换股比例为1:0.1339"));
    }

    #[test]
    fn test_adjacent_hits_merge_into_one_window() {
        let filler = "无关内容。".repeat(500);
        let text = format!("{filler}董事会决议通过换股合并方案。{filler}");

        let sliced = slice_by_keywords(&text, 6_000);
        // Overlapping windows around 决议/通过/换股/合并/方案 collapse;
        // no ellipsis marker inside the merged span.
        assert_eq!(sliced.matches("\n...\n").count(), 0);
    }

    #[test]
    fn test_no_hits_keeps_document_head() {
        let text = "A".repeat(10_000);
        let sliced = slice_by_keywords(&text, 100);
        assert_eq!(sliced.len(), 100);
    }

    #[test]
    fn test_respects_utf8_boundaries() {
        let text = "汉".repeat(5_000);
        let sliced = slice_by_keywords(&text, 1_000);
        assert!(sliced.len() <= 1_000);
        // Must not panic and must remain valid UTF-8 (implied by String).
        assert!(sliced.chars().all(|c| c == '汉'));
    }
}
