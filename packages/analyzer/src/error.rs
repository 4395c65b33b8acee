//! Pipeline error taxonomy.
//!
//! Fetch-layer failures are fatal for the company being fetched and are
//! localized per task item by the batch driver. Completion failures drive
//! model failover before escalating. Validation failures are not errors at
//! all; they feed the correction branch of the agent loop.

use thiserror::Error;

/// Failures raised by the reconciling fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The deduplicated record count never matched the maximum total-count
    /// hint within the pass budget. Completeness cannot be guaranteed, so
    /// the whole fetch fails.
    #[error(
        "integrity failure for {company}: {unique} unique records vs max hint {max_hint} after {passes} passes"
    )]
    Integrity {
        company: String,
        unique: usize,
        max_hint: usize,
        passes: usize,
    },

    /// A single page request failed after its own retry budget. Skipping the
    /// page would silently violate completeness, so this is fatal for the
    /// company.
    #[error("page {page_num} fetch failed for {company}: {source}")]
    Page {
        company: String,
        page_num: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The source returned a response that does not match the declared
    /// contract (missing fields, wrong types).
    #[error("malformed source response: {0}")]
    Contract(String),
}

/// Failures raised by the completion client.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// Transport or server failure after exhausting backoff retries.
    #[error("backend failure on model {model}: {message}")]
    Backend { model: String, message: String },

    /// The response could not be salvaged into structured data even after
    /// the repair pass.
    #[error("unparseable response from model {model}: {message}")]
    Parse { model: String, message: String },

    /// No model on the roster is currently available.
    #[error("no available models on the roster")]
    NoModels,
}

/// Failure from the external document-conversion collaborator.
///
/// The agent loop treats this as "no text available for this round".
#[derive(Debug, Error)]
#[error("document conversion failed for {locator}: {message}")]
pub struct ConversionError {
    pub locator: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_error_display() {
        let err = FetchError::Integrity {
            company: "600001".into(),
            unique: 1315,
            max_hint: 1322,
            passes: 10,
        };
        let text = err.to_string();
        assert!(text.contains("600001"));
        assert!(text.contains("1315"));
        assert!(text.contains("1322"));
    }
}
